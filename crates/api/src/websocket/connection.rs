//! WebSocket connection management
//!
//! Represents an active transport with its bound party and joined rooms.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use deskline_shared::{RoomId, WorkerId};

use super::events::ServerEvent;
use crate::broker::Party;

/// Transport handle identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Represents an active WebSocket connection
#[derive(Debug)]
pub struct Connection {
    /// Unique id for this connection
    pub id: ConnectionId,

    /// Worker identity proven by the upgrade token, if any
    pub authenticated_worker: Option<WorkerId>,

    /// Channel to send events to this connection
    pub sender: mpsc::UnboundedSender<ServerEvent>,

    /// Who this connection speaks for, once it has joined
    party: Arc<RwLock<Option<Party>>>,

    /// Rooms this connection has joined
    rooms: Arc<RwLock<HashSet<RoomId>>>,
}

impl Connection {
    /// Create a new connection
    pub fn new(sender: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            id: ConnectionId::new(),
            authenticated_worker: None,
            sender,
            party: Arc::new(RwLock::new(None)),
            rooms: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Create a connection whose upgrade carried a valid worker token
    pub fn authenticated(worker_id: WorkerId, sender: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            authenticated_worker: Some(worker_id),
            ..Self::new(sender)
        }
    }

    /// Send an event to this connection
    ///
    /// Returns Ok(()) if sent successfully, Err if connection is closed
    #[allow(clippy::result_large_err)] // Error type is from tokio mpsc, containing the failed event
    pub fn send(&self, event: ServerEvent) -> Result<(), mpsc::error::SendError<ServerEvent>> {
        self.sender.send(event)
    }

    pub async fn party(&self) -> Option<Party> {
        *self.party.read().await
    }

    pub async fn bind_party(&self, party: Party) {
        *self.party.write().await = Some(party);
        tracing::debug!(connection_id = %self.id, party = ?party, "Connection bound to party");
    }

    /// Record that this connection joined a room
    pub async fn enter_room(&self, room_id: RoomId) {
        let mut rooms = self.rooms.write().await;
        rooms.insert(room_id);
    }

    /// Forget a room this connection was in
    pub async fn exit_room(&self, room_id: &RoomId) {
        let mut rooms = self.rooms.write().await;
        rooms.remove(room_id);
    }

    pub async fn is_in_room(&self, room_id: &RoomId) -> bool {
        let rooms = self.rooms.read().await;
        rooms.contains(room_id)
    }

    pub async fn get_rooms(&self) -> HashSet<RoomId> {
        let rooms = self.rooms.read().await;
        rooms.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskline_shared::CustomerId;

    #[tokio::test]
    async fn test_connection_rooms() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Connection::new(tx);
        let room = RoomId::from("room_a");

        assert!(!conn.is_in_room(&room).await);

        conn.enter_room(room.clone()).await;
        assert!(conn.is_in_room(&room).await);
        assert_eq!(conn.get_rooms().await.len(), 1);

        conn.exit_room(&room).await;
        assert!(!conn.is_in_room(&room).await);
    }

    #[tokio::test]
    async fn test_party_binding() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Connection::new(tx);
        assert!(conn.party().await.is_none());

        let customer = CustomerId::new();
        conn.bind_party(Party::Customer(customer)).await;
        assert_eq!(conn.party().await, Some(Party::Customer(customer)));
    }

    #[test]
    fn test_authenticated_connection() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let worker = WorkerId::new();
        let conn = Connection::authenticated(worker, tx);
        assert_eq!(conn.authenticated_worker, Some(worker));
    }
}
