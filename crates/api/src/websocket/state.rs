//! Global WebSocket state management
//!
//! Maintains every open transport and the chat rooms they have joined.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::connection::{Connection, ConnectionId};
use super::events::ServerEvent;
use super::room::RoomManager;
use crate::broker::Party;

/// Global WebSocket state shared across all connections
#[derive(Clone)]
pub struct WebSocketState {
    /// All active connections indexed by connection id
    pub connections: Arc<RwLock<HashMap<ConnectionId, Arc<Connection>>>>,

    /// Room manager for session fan-out
    pub rooms: Arc<RoomManager>,
}

impl WebSocketState {
    /// Create new WebSocket state
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            rooms: Arc::new(RoomManager::new()),
        }
    }

    /// Add a connection
    pub async fn add_connection(&self, conn: Connection) -> Arc<Connection> {
        let conn = Arc::new(conn);
        let mut connections = self.connections.write().await;
        connections.insert(conn.id, Arc::clone(&conn));

        tracing::info!(
            connection_id = %conn.id,
            worker_token = conn.authenticated_worker.is_some(),
            total_connections = connections.len(),
            "WebSocket connection added"
        );

        conn
    }

    /// Remove a connection and detach it from every room
    pub async fn remove_connection(&self, connection_id: ConnectionId) {
        let mut connections = self.connections.write().await;
        if connections.remove(&connection_id).is_some() {
            self.rooms.remove_connection(connection_id).await;

            tracing::info!(
                connection_id = %connection_id,
                remaining_connections = connections.len(),
                "WebSocket connection removed"
            );
        }
    }

    pub async fn get_connection(&self, connection_id: ConnectionId) -> Option<Arc<Connection>> {
        let connections = self.connections.read().await;
        connections.get(&connection_id).cloned()
    }

    /// Send an event to every connection bound to a worker
    pub async fn broadcast_to_workers(&self, event: ServerEvent) -> usize {
        let connections: Vec<Arc<Connection>> = {
            let guard = self.connections.read().await;
            guard.values().cloned().collect()
        };

        let mut sent = 0;
        for conn in connections {
            if matches!(conn.party().await, Some(Party::Worker(_))) && conn.send(event.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Get total number of active connections
    pub async fn connection_count(&self) -> usize {
        let connections = self.connections.read().await;
        connections.len()
    }

    /// Get statistics about the WebSocket state
    pub async fn get_stats(&self) -> WebSocketStats {
        WebSocketStats {
            active_connections: self.connection_count().await,
            active_rooms: self.rooms.get_room_count().await,
        }
    }
}

impl Default for WebSocketState {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about WebSocket connections
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketStats {
    pub active_connections: usize,
    pub active_rooms: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskline_shared::{CustomerId, WorkerId};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_add_and_remove_connection() {
        let state = WebSocketState::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let conn = state.add_connection(Connection::new(tx)).await;
        assert_eq!(state.connection_count().await, 1);
        assert!(state.get_connection(conn.id).await.is_some());

        state.remove_connection(conn.id).await;
        assert_eq!(state.connection_count().await, 0);
        assert!(state.get_connection(conn.id).await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_to_workers_only() {
        let state = WebSocketState::new();
        let (tx1, mut worker_rx) = mpsc::unbounded_channel();
        let (tx2, mut customer_rx) = mpsc::unbounded_channel();

        let worker = state.add_connection(Connection::new(tx1)).await;
        worker.bind_party(Party::Worker(WorkerId::new())).await;
        let customer = state.add_connection(Connection::new(tx2)).await;
        customer.bind_party(Party::Customer(CustomerId::new())).await;

        assert_eq!(state.broadcast_to_workers(ServerEvent::Pong).await, 1);
        assert!(worker_rx.try_recv().is_ok());
        assert!(customer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stats() {
        let state = WebSocketState::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        state.add_connection(Connection::new(tx)).await;

        let stats = state.get_stats().await;
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.active_rooms, 0);
    }
}
