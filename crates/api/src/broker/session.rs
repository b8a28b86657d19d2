//! Session lifecycle
//!
//! Created -> Active -> Ended | Abandoned. Nothing leaves a terminal state.
//! The in-memory table is the fast path for validation; every transition is
//! mirrored to the record store before anyone hears about it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::Instant;

use deskline_shared::{
    Availability, BrokerError, BrokerResult, CustomerId, DeliveryStatus, MessageId, RoomId,
    SenderRole, SessionRecord, SessionStatus, SessionTransition, WorkerId,
};

use super::disconnect::AbandonCause;
use super::{Broker, Party, WorkerPresence};
use crate::websocket::connection::{Connection, ConnectionId};
use crate::websocket::events::ServerEvent;

struct LiveSession {
    room_id: RoomId,
    customer_id: CustomerId,
    worker_id: WorkerId,
    worker_name: String,
    status: SessionStatus,
    created: Instant,
    ended: Option<Instant>,
    customer_joined: bool,
    worker_joined: bool,
    next_message_id: i64,
    /// Sender role and delivery status of every message in the room
    messages: HashMap<MessageId, (SenderRole, DeliveryStatus)>,
}

impl LiveSession {
    fn involves(&self, party: Party) -> bool {
        match party {
            Party::Worker(id) => id == self.worker_id,
            Party::Customer(id) => id == self.customer_id,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            room_id: self.room_id.clone(),
            customer_id: self.customer_id,
            worker_id: self.worker_id,
            worker_name: self.worker_name.clone(),
            status: self.status,
            customer_joined: self.customer_joined,
            worker_joined: self.worker_joined,
        }
    }
}

/// Read-only view of a live session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub room_id: RoomId,
    pub customer_id: CustomerId,
    pub worker_id: WorkerId,
    pub worker_name: String,
    pub status: SessionStatus,
    pub customer_joined: bool,
    pub worker_joined: bool,
}

impl SessionSnapshot {
    pub fn involves(&self, party: Party) -> bool {
        match party {
            Party::Worker(id) => id == self.worker_id,
            Party::Customer(id) => id == self.customer_id,
        }
    }
}

/// Result of a party joining its room
#[derive(Debug, Clone)]
pub(super) struct JoinOutcome {
    pub snapshot: SessionSnapshot,
    /// This join completed the pair and moved the room to active
    pub activated: bool,
}

/// In-memory session state, keyed by room
#[derive(Clone, Default)]
pub struct SessionTable {
    sessions: Arc<RwLock<HashMap<RoomId, LiveSession>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, record: &SessionRecord, worker_name: String) -> SessionSnapshot {
        let live = LiveSession {
            room_id: record.id.clone(),
            customer_id: record.customer_id,
            worker_id: record.worker_id,
            worker_name,
            status: record.status,
            created: Instant::now(),
            ended: None,
            customer_joined: false,
            worker_joined: false,
            next_message_id: 1,
            messages: HashMap::new(),
        };
        let snapshot = live.snapshot();
        self.sessions.write().await.insert(record.id.clone(), live);
        snapshot
    }

    pub async fn get(&self, room_id: &RoomId) -> Option<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        sessions.get(room_id).map(LiveSession::snapshot)
    }

    /// The customer's non-terminal session, if any
    pub async fn live_for_customer(&self, customer_id: CustomerId) -> Option<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .find(|s| s.customer_id == customer_id && !s.status.is_terminal())
            .map(LiveSession::snapshot)
    }

    pub async fn live_for_worker(&self, worker_id: WorkerId) -> Option<RoomId> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .find(|s| s.worker_id == worker_id && !s.status.is_terminal())
            .map(|s| s.room_id.clone())
    }

    pub async fn live_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.values().filter(|s| !s.status.is_terminal()).count()
    }

    /// Apply a transition if valid from the current status; returns the
    /// status it replaced.
    pub(super) async fn transition(
        &self,
        room_id: &RoomId,
        transition: SessionTransition,
    ) -> BrokerResult<SessionStatus> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(room_id)
            .ok_or_else(|| BrokerError::NotFound(format!("room {}", room_id)))?;

        let previous = session.status;
        let next = previous
            .apply(transition)
            .ok_or_else(|| BrokerError::invalid_state(room_id, previous))?;
        session.status = next;
        if next.is_terminal() {
            session.ended = Some(Instant::now());
        }
        Ok(previous)
    }

    /// Undo `previous -> applied` after the store refused it. A room that
    /// has since moved on, e.g. abandoned meanwhile, is left alone.
    pub(super) async fn revert(&self, room_id: &RoomId, applied: SessionStatus, previous: SessionStatus) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(room_id).filter(|s| s.status == applied) {
            session.status = previous;
            if !previous.is_terminal() {
                session.ended = None;
            }
        }
    }

    /// Record a party's join; activates the room when both have joined
    pub(super) async fn mark_joined(&self, room_id: &RoomId, party: Party) -> BrokerResult<JoinOutcome> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(room_id)
            .ok_or_else(|| BrokerError::NotFound(format!("room {}", room_id)))?;

        if !session.involves(party) {
            return Err(BrokerError::Unauthorized);
        }
        if session.status.is_terminal() {
            return Err(BrokerError::invalid_state(room_id, session.status));
        }

        match party {
            Party::Worker(_) => session.worker_joined = true,
            Party::Customer(_) => session.customer_joined = true,
        }

        let activated = session.customer_joined
            && session.worker_joined
            && session.status == SessionStatus::Created;
        if activated {
            session.status = SessionStatus::Active;
        }

        Ok(JoinOutcome {
            snapshot: session.snapshot(),
            activated,
        })
    }

    /// Allocate the next message id for a sender in an active room
    pub(super) async fn next_message_id(&self, room_id: &RoomId, party: Party) -> BrokerResult<MessageId> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(room_id)
            .ok_or_else(|| BrokerError::NotFound(format!("room {}", room_id)))?;

        if !session.involves(party) {
            return Err(BrokerError::Unauthorized);
        }
        if session.status != SessionStatus::Active {
            return Err(BrokerError::invalid_state(room_id, session.status));
        }

        let id = MessageId(session.next_message_id);
        session.next_message_id += 1;
        session.messages.insert(id, (party.role(), DeliveryStatus::Sent));
        Ok(id)
    }

    pub(super) async fn forget_message(&self, room_id: &RoomId, message_id: MessageId) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(room_id) {
            session.messages.remove(&message_id);
        }
    }

    pub(super) async fn message_status(
        &self,
        room_id: &RoomId,
        message_id: MessageId,
    ) -> Option<(SenderRole, DeliveryStatus)> {
        let sessions = self.sessions.read().await;
        sessions
            .get(room_id)
            .and_then(|s| s.messages.get(&message_id).copied())
    }

    /// Move a message forward; false if it is unknown or already at or past `to`
    pub(super) async fn advance_message(&self, room_id: &RoomId, message_id: MessageId, to: DeliveryStatus) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some((_, status)) = sessions
            .get_mut(room_id)
            .and_then(|s| s.messages.get_mut(&message_id))
        else {
            return false;
        };

        match status.advance(to) {
            Some(next) => {
                *status = next;
                true
            }
            None => false,
        }
    }

    /// Rooms still waiting for both parties after `older_than`
    pub(super) async fn stale_created(&self, older_than: Duration) -> Vec<RoomId> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.status == SessionStatus::Created && s.created.elapsed() >= older_than)
            .map(|s| s.room_id.clone())
            .collect()
    }

    /// Drop terminal sessions that ended more than `older_than` ago
    pub(super) async fn purge_terminal(&self, older_than: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| match s.ended {
            Some(ended) => ended.elapsed() < older_than,
            None => true,
        });
        before - sessions.len()
    }
}

impl Broker {
    /// Write the durable record for a freshly reserved pairing and start
    /// tracking it. Only matching calls this.
    pub(super) async fn create_session(
        &self,
        customer_id: CustomerId,
        reserved: &WorkerPresence,
    ) -> BrokerResult<SessionSnapshot> {
        let room_id = reserved
            .room_id
            .clone()
            .ok_or_else(|| BrokerError::conflict("reservation without a room"))?;

        let record = SessionRecord {
            id: room_id,
            customer_id,
            worker_id: reserved.worker_id,
            status: SessionStatus::Created,
            created_at: OffsetDateTime::now_utc(),
            ended_at: None,
            message_count: 0,
        };
        self.store.create_session(&record).await?;

        let snapshot = self.sessions.insert(&record, reserved.display_name.clone()).await;
        tracing::info!(
            room_id = %record.id,
            customer_id = %customer_id,
            worker_id = %reserved.worker_id,
            "Session created"
        );
        Ok(snapshot)
    }

    /// Join a party's transport to its room. The second join activates it.
    pub async fn join(&self, room_id: &RoomId, party: Party, conn: &Arc<Connection>) -> BrokerResult<SessionSnapshot> {
        let outcome = self.sessions.mark_joined(room_id, party).await?;
        self.ws.rooms.join(room_id, Arc::clone(conn)).await;

        if outcome.activated {
            let persisted = self
                .store
                .update_session_status(room_id, SessionStatus::Created, SessionStatus::Active, None)
                .await;
            match persisted {
                Ok(true) => {}
                Ok(false) => {
                    self.sessions
                        .revert(room_id, SessionStatus::Active, SessionStatus::Created)
                        .await;
                    tracing::warn!(room_id = %room_id, "Stored session no longer created; activation refused");
                    return Err(BrokerError::conflict(format!("room {} not in created state", room_id)));
                }
                Err(e) => {
                    self.sessions
                        .revert(room_id, SessionStatus::Active, SessionStatus::Created)
                        .await;
                    tracing::error!(room_id = %room_id, error = %e, "Failed to persist session activation");
                    return Err(e);
                }
            }

            tracing::info!(room_id = %room_id, "Session active");
            self.ws
                .rooms
                .broadcast(room_id, ServerEvent::ChatActive { room_id: room_id.clone() })
                .await;
        } else if outcome.snapshot.status == SessionStatus::Active {
            // Rejoin after reconnect
            let _ = conn.send(ServerEvent::ChatActive {
                room_id: room_id.clone(),
            });
        }

        Ok(outcome.snapshot)
    }

    /// Graceful close by one of the participants. Valid only while active.
    pub async fn end(&self, room_id: &RoomId, initiator: Party, origin: Option<ConnectionId>) -> BrokerResult<()> {
        let snapshot = self
            .sessions
            .get(room_id)
            .await
            .ok_or_else(|| BrokerError::NotFound(format!("room {}", room_id)))?;
        if !snapshot.involves(initiator) {
            return Err(BrokerError::Unauthorized);
        }

        let previous = self.sessions.transition(room_id, SessionTransition::End).await?;
        let persisted = self
            .store
            .update_session_status(room_id, previous, SessionStatus::Ended, Some(OffsetDateTime::now_utc()))
            .await;
        match persisted {
            Ok(true) => {}
            Ok(false) => {
                self.sessions.revert(room_id, SessionStatus::Ended, previous).await;
                return Err(BrokerError::conflict(format!("stored room {} is not {}", room_id, previous)));
            }
            Err(e) => {
                self.sessions.revert(room_id, SessionStatus::Ended, previous).await;
                tracing::error!(room_id = %room_id, error = %e, "Failed to persist session end");
                return Err(e);
            }
        }

        tracing::info!(room_id = %room_id, initiator = %initiator.role(), "Session ended");
        self.release_worker(snapshot.worker_id, room_id).await;

        let message = match initiator {
            Party::Worker(_) => "The agent has ended the chat.",
            Party::Customer(_) => "The customer has ended the chat.",
        };
        let notice = ServerEvent::ChatEnded {
            room_id: room_id.clone(),
            message: message.to_string(),
        };
        match origin {
            Some(origin) => self.ws.rooms.broadcast_except(room_id, notice, origin).await,
            None => self.ws.rooms.broadcast(room_id, notice).await,
        };

        self.close_room(room_id).await;
        Ok(())
    }

    /// Close a room whose party dropped before a graceful end
    pub(crate) async fn abandon(&self, room_id: &RoomId, cause: AbandonCause) -> BrokerResult<()> {
        let snapshot = self
            .sessions
            .get(room_id)
            .await
            .ok_or_else(|| BrokerError::NotFound(format!("room {}", room_id)))?;

        self.sessions.transition(room_id, SessionTransition::Abandon).await?;
        // The stored status may still lag an in-flight activation
        let persisted = self
            .store
            .abandon_session(room_id, OffsetDateTime::now_utc())
            .await;
        match persisted {
            Ok(true) => {}
            Ok(false) => tracing::warn!(room_id = %room_id, "Stored session already terminal"),
            Err(e) => tracing::error!(room_id = %room_id, error = %e, "Failed to persist abandoned session"),
        }

        tracing::info!(room_id = %room_id, cause = ?cause, "Session abandoned");
        self.ws.rooms.broadcast(room_id, cause.notice(room_id)).await;
        self.release_worker(snapshot.worker_id, room_id).await;
        self.close_room(room_id).await;
        Ok(())
    }

    /// Return a worker to the pool after its room closed. A worker that went
    /// offline or already moved on is left alone.
    async fn release_worker(&self, worker_id: WorkerId, room_id: &RoomId) {
        let holds_room = self
            .presence
            .get(worker_id)
            .await
            .map(|p| p.availability == Availability::Busy && p.room_id.as_ref() == Some(room_id))
            .unwrap_or(false);
        if !holds_room {
            tracing::debug!(worker_id = %worker_id, room_id = %room_id, "Worker no longer holds room; not released");
            return;
        }

        match self
            .store
            .compare_and_set_availability(worker_id, Availability::Busy, Availability::Available, None)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(worker_id = %worker_id, "Stored availability was not busy on release"),
            Err(e) => tracing::error!(worker_id = %worker_id, error = %e, "Failed to persist worker release"),
        }

        match self.presence.mark_available(worker_id, room_id).await {
            Ok(presence) => self.publish_worker_state(&presence).await,
            Err(e) => tracing::debug!(worker_id = %worker_id, error = %e, "Worker not released"),
        }
    }

    async fn close_room(&self, room_id: &RoomId) {
        self.typing.clear_room(room_id).await;
        self.ws.rooms.close_room(room_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::matching::Admission;
    use crate::broker::testing::harness;
    use deskline_shared::RecordStore;

    #[tokio::test]
    async fn test_second_join_activates() {
        let h = harness();
        let (worker, mut worker_conn) = h.online_worker("ada").await;

        let Admission::Connected { customer_id, room_id, .. } = h.broker.admit_customer(None).await.unwrap() else {
            panic!("expected a match");
        };
        assert_eq!(
            h.broker.sessions().get(&room_id).await.unwrap().status,
            SessionStatus::Created
        );
        assert!(worker_conn.names().contains(&"new-chat"));

        let mut customer_conn = h.connect(None).await;
        h.broker.customer_join(customer_id, &room_id, &customer_conn.conn).await.unwrap();

        let snapshot = h.broker.sessions().get(&room_id).await.unwrap();
        assert_eq!(snapshot.status, SessionStatus::Active);
        assert_eq!(snapshot.worker_id, worker);
        assert!(customer_conn.names().contains(&"chat-active"));
        assert!(worker_conn.names().contains(&"chat-active"));

        let stored = h.store.get_session(&room_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_end_requires_active_and_participant() {
        let h = harness();
        let (worker, _worker_conn) = h.online_worker("ada").await;
        let Admission::Connected { room_id, .. } = h.broker.admit_customer(None).await.unwrap() else {
            panic!("expected a match");
        };

        // Still created: the customer has not joined
        assert!(matches!(
            h.broker.end(&room_id, Party::Worker(worker), None).await,
            Err(BrokerError::InvalidSessionState { .. })
        ));

        // A stranger cannot end someone else's room
        assert!(matches!(
            h.broker.end(&room_id, Party::Worker(WorkerId::new()), None).await,
            Err(BrokerError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_end_releases_worker_and_notifies_other_party() {
        let h = harness();
        let (worker, mut worker_conn) = h.online_worker("ada").await;
        let Admission::Connected { customer_id, room_id, .. } = h.broker.admit_customer(None).await.unwrap() else {
            panic!("expected a match");
        };
        let mut customer_conn = h.connect(None).await;
        h.broker.customer_join(customer_id, &room_id, &customer_conn.conn).await.unwrap();
        worker_conn.drain();
        customer_conn.drain();

        h.broker
            .end(&room_id, Party::Worker(worker), Some(worker_conn.conn.id))
            .await
            .unwrap();

        assert!(customer_conn.names().contains(&"chat-ended"));
        assert!(!worker_conn.names().contains(&"chat-ended"));

        let presence = h.broker.presence().get(worker).await.unwrap();
        assert_eq!(presence.availability, Availability::Available);
        let stored = h.store.get_worker(worker).await.unwrap().unwrap();
        assert_eq!(stored.availability, Availability::Available);

        let session = h.store.get_session(&room_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Ended);
        assert!(session.ended_at.is_some());

        // Terminal: a second end is rejected
        assert!(matches!(
            h.broker.end(&room_id, Party::Worker(worker), None).await,
            Err(BrokerError::InvalidSessionState { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_during_slow_activation_stays_abandoned() {
        let h = harness();
        let (_worker, worker_conn) = h.online_worker("ada").await;
        let Admission::Connected { customer_id, room_id, .. } = h.broker.admit_customer(None).await.unwrap() else {
            panic!("expected a match");
        };
        h.store.set_activation_delay(Duration::from_millis(50));

        let customer_conn = h.connect(None).await;
        let joining = {
            let broker = h.broker.clone();
            let room_id = room_id.clone();
            let conn = Arc::clone(&customer_conn.conn);
            tokio::spawn(async move { broker.customer_join(customer_id, &room_id, &conn).await })
        };

        // Worker drops while the activation write is still in flight
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.disconnect(&worker_conn).await;

        let joined = joining.await.unwrap();
        assert!(matches!(joined, Err(BrokerError::Conflict(_))));

        let live = h.broker.sessions().get(&room_id).await.unwrap();
        let stored = h.store.get_session(&room_id).await.unwrap().unwrap();
        assert_eq!(live.status, SessionStatus::Abandoned);
        assert_eq!(stored.status, SessionStatus::Abandoned);
        assert!(stored.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_purge_terminal_keeps_live_sessions() {
        let h = harness();
        let (_worker, _conn) = h.online_worker("ada").await;
        let Admission::Connected { room_id, .. } = h.broker.admit_customer(None).await.unwrap() else {
            panic!("expected a match");
        };

        assert_eq!(h.broker.sessions().purge_terminal(Duration::ZERO).await, 0);
        h.broker.abandon(&room_id, AbandonCause::JoinTimeout).await.unwrap();
        assert_eq!(h.broker.sessions().purge_terminal(Duration::ZERO).await, 1);
        assert!(h.broker.sessions().get(&room_id).await.is_none());
    }
}
