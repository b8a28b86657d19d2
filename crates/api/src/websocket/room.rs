//! Chat room fan-out
//!
//! A room holds every transport joined to one session. Fan-out preserves the
//! order in which events are handed to each connection's channel.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use deskline_shared::RoomId;

use super::connection::{Connection, ConnectionId};
use super::events::ServerEvent;

/// Manages chat rooms for broadcasting events
pub struct RoomManager {
    /// Map of room_id -> joined connections
    rooms: Arc<RwLock<HashMap<RoomId, Vec<Arc<Connection>>>>>,
}

impl RoomManager {
    /// Create a new room manager
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add a connection to a room. Joining twice is a no-op.
    pub async fn join(&self, room_id: &RoomId, conn: Arc<Connection>) {
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room_id.clone()).or_default();
        if members.iter().any(|c| c.id == conn.id) {
            return;
        }
        members.push(Arc::clone(&conn));
        let room_size = members.len();
        drop(rooms);

        conn.enter_room(room_id.clone()).await;

        tracing::debug!(
            room_id = %room_id,
            connection_id = %conn.id,
            room_size,
            "Connection joined room"
        );
    }

    /// Remove a connection from a room
    pub async fn leave(&self, room_id: &RoomId, connection_id: ConnectionId) {
        let mut rooms = self.rooms.write().await;
        if let Some(conns) = rooms.get_mut(room_id) {
            conns.retain(|c| c.id != connection_id);

            if conns.is_empty() {
                rooms.remove(room_id);
                tracing::debug!(room_id = %room_id, "Removed empty room");
            }
        }
    }

    /// Broadcast an event to all connections in a room
    ///
    /// Returns the number of connections the event was handed to. Send errors
    /// are ignored; closed connections are cleaned up by their handler.
    pub async fn broadcast(&self, room_id: &RoomId, event: ServerEvent) -> usize {
        self.fan_out(room_id, event, None).await
    }

    /// Broadcast to everyone in a room except one connection
    pub async fn broadcast_except(
        &self,
        room_id: &RoomId,
        event: ServerEvent,
        except: ConnectionId,
    ) -> usize {
        self.fan_out(room_id, event, Some(except)).await
    }

    async fn fan_out(&self, room_id: &RoomId, event: ServerEvent, except: Option<ConnectionId>) -> usize {
        let rooms = self.rooms.read().await;
        let Some(conns) = rooms.get(room_id) else {
            tracing::debug!(
                room_id = %room_id,
                event = event.name(),
                "No connections in room"
            );
            return 0;
        };

        let mut success_count = 0;
        let mut failed_count = 0;
        for conn in conns.iter().filter(|c| Some(c.id) != except) {
            match conn.send(event.clone()) {
                Ok(()) => success_count += 1,
                Err(_) => {
                    failed_count += 1;
                    tracing::warn!(
                        connection_id = %conn.id,
                        "Failed to send event to connection (likely closed)"
                    );
                }
            }
        }

        tracing::debug!(
            room_id = %room_id,
            event = event.name(),
            recipients = success_count,
            failed = failed_count,
            "Broadcast event to room"
        );
        success_count
    }

    /// Drop a room entirely, detaching every member
    pub async fn close_room(&self, room_id: &RoomId) {
        let removed = {
            let mut rooms = self.rooms.write().await;
            rooms.remove(room_id)
        };
        if let Some(conns) = removed {
            for conn in &conns {
                conn.exit_room(room_id).await;
            }
            tracing::debug!(room_id = %room_id, members = conns.len(), "Closed room");
        }
    }

    /// Remove a connection from all rooms
    pub async fn remove_connection(&self, connection_id: ConnectionId) {
        let mut rooms = self.rooms.write().await;
        let mut removed_from = 0;

        for conns in rooms.values_mut() {
            let before_len = conns.len();
            conns.retain(|c| c.id != connection_id);
            if conns.len() < before_len {
                removed_from += 1;
            }
        }

        rooms.retain(|_, conns| !conns.is_empty());

        if removed_from > 0 {
            tracing::debug!(
                connection_id = %connection_id,
                room_count = removed_from,
                "Removed connection from rooms"
            );
        }
    }

    /// Number of connections joined to a room
    pub async fn get_room_size(&self, room_id: &RoomId) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(|v| v.len()).unwrap_or(0)
    }

    /// Get total number of active rooms
    pub async fn get_room_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.len()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_room_join_and_leave() {
        let room_manager = RoomManager::new();
        let room = RoomId::from("room_1");

        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(tx));

        assert_eq!(room_manager.get_room_size(&room).await, 0);

        room_manager.join(&room, Arc::clone(&conn)).await;
        room_manager.join(&room, Arc::clone(&conn)).await;
        assert_eq!(room_manager.get_room_size(&room).await, 1);
        assert!(conn.is_in_room(&room).await);

        room_manager.leave(&room, conn.id).await;
        assert_eq!(room_manager.get_room_size(&room).await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_except_skips_origin() {
        let room_manager = RoomManager::new();
        let room = RoomId::from("room_1");

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let conn1 = Arc::new(Connection::new(tx1));
        let conn2 = Arc::new(Connection::new(tx2));

        room_manager.join(&room, Arc::clone(&conn1)).await;
        room_manager.join(&room, conn2).await;

        assert_eq!(room_manager.broadcast(&room, ServerEvent::Pong).await, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());

        let sent = room_manager.broadcast_except(&room, ServerEvent::Pong, conn1.id).await;
        assert_eq!(sent, 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_close_room_detaches_members() {
        let room_manager = RoomManager::new();
        let room = RoomId::from("room_1");
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(tx));

        room_manager.join(&room, Arc::clone(&conn)).await;
        room_manager.close_room(&room).await;

        assert_eq!(room_manager.get_room_count().await, 0);
        assert!(!conn.is_in_room(&room).await);
        assert_eq!(room_manager.broadcast(&room, ServerEvent::Pong).await, 0);
    }

    #[tokio::test]
    async fn test_remove_connection_from_all_rooms() {
        let room_manager = RoomManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(tx));

        room_manager.join(&RoomId::from("room_1"), Arc::clone(&conn)).await;
        room_manager.join(&RoomId::from("room_2"), Arc::clone(&conn)).await;
        assert_eq!(room_manager.get_room_count().await, 2);

        room_manager.remove_connection(conn.id).await;
        assert_eq!(room_manager.get_room_count().await, 0);
    }
}
