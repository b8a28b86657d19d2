//! Typing relay
//!
//! Typing flags go to the other party only and are never stored. Each
//! (room, role) flag carries an expiry timer; a fresh `true` restarts it, a
//! `false` cancels it, and if it fires the room hears `typing: false`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use deskline_shared::{BrokerError, BrokerResult, RoomId, SenderRole, SessionStatus};

use super::{Broker, Party};
use crate::websocket::connection::ConnectionId;
use crate::websocket::events::ServerEvent;
use crate::websocket::room::RoomManager;

struct TypingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

type TimerKey = (RoomId, SenderRole);

#[derive(Clone)]
pub struct TypingRelay {
    timers: Arc<Mutex<HashMap<TimerKey, TypingTimer>>>,
    generation: Arc<AtomicU64>,
    timeout: Duration,
}

impl TypingRelay {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            timeout,
        }
    }

    /// Start or restart the expiry timer for a typing flag
    async fn arm(&self, rooms: Arc<RoomManager>, room_id: RoomId, sender: SenderRole, origin: ConnectionId) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let key: TimerKey = (room_id.clone(), sender);
        let timers = Arc::clone(&self.timers);
        let timeout = self.timeout;
        let task_key = key.clone();

        // Hold the lock across spawn so the task cannot look up its entry
        // before it is inserted.
        let mut guard = self.timers.lock().await;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            {
                let mut timers = timers.lock().await;
                match timers.get(&task_key) {
                    Some(timer) if timer.generation == generation => {
                        timers.remove(&task_key);
                    }
                    _ => return,
                }
            }

            tracing::debug!(room_id = %room_id, sender = %sender, "Typing flag expired");
            rooms
                .broadcast_except(
                    &room_id,
                    ServerEvent::UserTyping {
                        room_id: room_id.clone(),
                        sender,
                        typing: false,
                    },
                    origin,
                )
                .await;
        });

        if let Some(previous) = guard.insert(key, TypingTimer { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancel the expiry timer for a flag that was explicitly cleared
    async fn disarm(&self, room_id: &RoomId, sender: SenderRole) {
        let mut timers = self.timers.lock().await;
        if let Some(timer) = timers.remove(&(room_id.clone(), sender)) {
            timer.handle.abort();
        }
    }

    /// Drop every timer for a closed room
    pub async fn clear_room(&self, room_id: &RoomId) {
        let mut timers = self.timers.lock().await;
        timers.retain(|(room, _), timer| {
            if room == room_id {
                timer.handle.abort();
                false
            } else {
                true
            }
        });
    }

    pub async fn pending(&self) -> usize {
        self.timers.lock().await.len()
    }
}

impl Broker {
    /// Relay a typing flag to the other party of an active room
    pub async fn set_typing(
        &self,
        party: Party,
        room_id: &RoomId,
        sender: SenderRole,
        typing: bool,
        origin: ConnectionId,
    ) -> BrokerResult<()> {
        let session = self
            .sessions
            .get(room_id)
            .await
            .ok_or_else(|| BrokerError::NotFound(format!("room {}", room_id)))?;
        if !session.involves(party) || sender != party.role() {
            return Err(BrokerError::Unauthorized);
        }
        if session.status != SessionStatus::Active {
            return Err(BrokerError::invalid_state(room_id, session.status));
        }

        self.ws
            .rooms
            .broadcast_except(
                room_id,
                ServerEvent::UserTyping {
                    room_id: room_id.clone(),
                    sender,
                    typing,
                },
                origin,
            )
            .await;

        if typing {
            self.typing
                .arm(Arc::clone(&self.ws.rooms), room_id.clone(), sender, origin)
                .await;
        } else {
            self.typing.disarm(room_id, sender).await;
        }
        Ok(())
    }
}
