//! Presence registry
//!
//! Single in-memory source of truth for which worker can take work. All
//! availability writes are compare-and-set against the expected prior state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use deskline_shared::{Availability, BrokerError, BrokerResult, RoomId, WorkerId};

use crate::websocket::connection::ConnectionId;

/// Presence entry for one worker
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPresence {
    pub worker_id: WorkerId,
    pub display_name: String,
    pub availability: Availability,
    pub room_id: Option<RoomId>,
    #[serde(skip)]
    pub connection: Option<ConnectionId>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active_at: OffsetDateTime,
    /// Logical time of the last transition to available; lowest idles longest
    #[serde(skip)]
    idle_since: u64,
}

/// Outcome of binding a transport to a worker
#[derive(Debug, Clone)]
pub struct Registration {
    pub presence: WorkerPresence,
    /// Availability moved from offline to available
    pub came_online: bool,
    /// Transport this one replaced, if any
    pub superseded: Option<ConnectionId>,
}

#[derive(Clone, Default)]
pub struct PresenceRegistry {
    workers: Arc<RwLock<HashMap<WorkerId, WorkerPresence>>>,
    clock: Arc<AtomicU64>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Bind a transport to a worker, bringing it online if it was offline.
    ///
    /// A worker that is already busy keeps its room; only the transport moves.
    pub async fn register_connection(
        &self,
        worker_id: WorkerId,
        display_name: &str,
        connection: ConnectionId,
    ) -> Registration {
        let now = OffsetDateTime::now_utc();
        let tick = self.tick();
        let mut workers = self.workers.write().await;
        let entry = workers.entry(worker_id).or_insert_with(|| WorkerPresence {
            worker_id,
            display_name: display_name.to_string(),
            availability: Availability::Offline,
            room_id: None,
            connection: None,
            last_active_at: now,
            idle_since: tick,
        });

        let superseded = entry.connection.replace(connection).filter(|prev| *prev != connection);
        let came_online = entry.availability == Availability::Offline;
        if came_online {
            entry.availability = Availability::Available;
            entry.room_id = None;
            entry.idle_since = tick;
        }
        entry.display_name = display_name.to_string();
        entry.last_active_at = now;

        Registration {
            presence: entry.clone(),
            came_online,
            superseded,
        }
    }

    /// Busy in `room_id` -> available. Fails if the worker went offline or
    /// was moved to another room in the meantime.
    pub async fn mark_available(&self, worker_id: WorkerId, room_id: &RoomId) -> BrokerResult<WorkerPresence> {
        let tick = self.tick();
        let mut workers = self.workers.write().await;
        let entry = workers
            .get_mut(&worker_id)
            .ok_or_else(|| BrokerError::NotFound(format!("worker {}", worker_id)))?;

        if entry.availability != Availability::Busy || entry.room_id.as_ref() != Some(room_id) {
            return Err(BrokerError::conflict(format!(
                "worker {} is {} in {:?}, expected busy in {}",
                worker_id, entry.availability, entry.room_id, room_id
            )));
        }
        entry.availability = Availability::Available;
        entry.room_id = None;
        entry.idle_since = tick;
        entry.last_active_at = OffsetDateTime::now_utc();
        Ok(entry.clone())
    }

    /// Select the longest idle available worker and reserve it in the same
    /// critical section. `room_for` names the room from the chosen worker.
    ///
    /// This is the only way a worker becomes busy: the available -> busy
    /// compare-and-set runs on the chosen entry under the selection guard,
    /// so there is no separate mark-busy step to race against.
    pub async fn reserve_longest_idle<F>(
        &self,
        exclude: &HashSet<WorkerId>,
        room_for: F,
    ) -> BrokerResult<WorkerPresence>
    where
        F: FnOnce(WorkerId) -> RoomId,
    {
        let mut workers = self.workers.write().await;
        let chosen = workers
            .values_mut()
            .filter(|w| w.availability == Availability::Available)
            .filter(|w| w.connection.is_some() && !exclude.contains(&w.worker_id))
            .min_by_key(|w| w.idle_since)
            .ok_or(BrokerError::NoWorkerAvailable)?;

        chosen.availability = Availability::Busy;
        chosen.room_id = Some(room_for(chosen.worker_id));
        chosen.last_active_at = OffsetDateTime::now_utc();
        Ok(chosen.clone())
    }

    /// Undo a reservation that could not be completed, keeping the worker's
    /// place in the idle ordering.
    pub async fn rollback_reservation(&self, reserved: &WorkerPresence) {
        let mut workers = self.workers.write().await;
        if let Some(entry) = workers.get_mut(&reserved.worker_id) {
            if entry.availability == Availability::Busy && entry.room_id == reserved.room_id {
                entry.availability = Availability::Available;
                entry.room_id = None;
                entry.idle_since = reserved.idle_since;
            }
        }
    }

    /// The worker's current transport, which may have replaced the one it
    /// was reserved on
    pub async fn lookup_transport(&self, worker_id: WorkerId) -> Option<ConnectionId> {
        let workers = self.workers.read().await;
        workers.get(&worker_id).and_then(|w| w.connection)
    }

    /// Clear the transport binding and take the worker offline, whatever its
    /// session state. Only acts when `connection` is still the bound
    /// transport; returns the presence as it was before.
    pub async fn unregister(&self, worker_id: WorkerId, connection: ConnectionId) -> Option<WorkerPresence> {
        let mut workers = self.workers.write().await;
        let entry = workers.get_mut(&worker_id)?;
        if entry.connection != Some(connection) {
            return None;
        }

        let previous = entry.clone();
        entry.connection = None;
        entry.availability = Availability::Offline;
        entry.room_id = None;
        entry.last_active_at = OffsetDateTime::now_utc();
        Some(previous)
    }

    pub async fn get(&self, worker_id: WorkerId) -> Option<WorkerPresence> {
        let workers = self.workers.read().await;
        workers.get(&worker_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<WorkerPresence> {
        let workers = self.workers.read().await;
        let mut all: Vec<WorkerPresence> = workers.values().cloned().collect();
        all.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        all
    }

    /// (available, busy)
    pub async fn counts(&self) -> (usize, usize) {
        let workers = self.workers.read().await;
        workers.values().fold((0, 0), |(a, b), w| match w.availability {
            Availability::Available => (a + 1, b),
            Availability::Busy => (a, b + 1),
            Availability::Offline => (a, b),
        })
    }
}
