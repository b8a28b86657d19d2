//! Ephemeral customer presence
//!
//! Exists only while a customer transport is open. Idle entries are expired
//! by the sweeper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::Instant;

use deskline_shared::{BrokerError, BrokerResult, CustomerId, RoomId};

use super::{Broker, Party, SessionSnapshot};
use crate::websocket::connection::{Connection, ConnectionId};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerPresence {
    pub customer_id: CustomerId,
    pub room_id: RoomId,
    #[serde(skip)]
    pub connection: ConnectionId,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
    #[serde(skip)]
    last_activity: Instant,
}

#[derive(Clone, Default)]
pub struct CustomerRegistry {
    customers: Arc<RwLock<HashMap<CustomerId, CustomerPresence>>>,
}

impl CustomerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a customer transport; returns the transport it replaced
    pub async fn bind(&self, customer_id: CustomerId, room_id: RoomId, connection: ConnectionId) -> Option<ConnectionId> {
        let mut customers = self.customers.write().await;
        let previous = customers.insert(
            customer_id,
            CustomerPresence {
                customer_id,
                room_id,
                connection,
                joined_at: OffsetDateTime::now_utc(),
                last_activity: Instant::now(),
            },
        );
        previous.map(|p| p.connection).filter(|c| *c != connection)
    }

    pub async fn touch(&self, customer_id: CustomerId) {
        let mut customers = self.customers.write().await;
        if let Some(entry) = customers.get_mut(&customer_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Remove the entry if `connection` is still the bound transport
    pub async fn remove_if(&self, customer_id: CustomerId, connection: ConnectionId) -> Option<CustomerPresence> {
        let mut customers = self.customers.write().await;
        match customers.get(&customer_id) {
            Some(entry) if entry.connection == connection => customers.remove(&customer_id),
            _ => None,
        }
    }

    /// Customers with no activity for at least `idle_for`
    pub async fn idle(&self, idle_for: Duration) -> Vec<CustomerPresence> {
        let customers = self.customers.read().await;
        customers
            .values()
            .filter(|c| c.last_activity.elapsed() >= idle_for)
            .cloned()
            .collect()
    }

    pub async fn get(&self, customer_id: CustomerId) -> Option<CustomerPresence> {
        let customers = self.customers.read().await;
        customers.get(&customer_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.customers.read().await.len()
    }
}

impl Broker {
    /// A customer transport presents the room it was admitted to
    pub async fn customer_join(
        &self,
        customer_id: CustomerId,
        room_id: &RoomId,
        conn: &Arc<Connection>,
    ) -> BrokerResult<SessionSnapshot> {
        if let Some(bound) = conn.party().await {
            if bound != Party::Customer(customer_id) {
                return Err(BrokerError::Unauthorized);
            }
        }

        let party = Party::Customer(customer_id);
        let snapshot = self.join(room_id, party, conn).await?;

        conn.bind_party(party).await;
        if let Some(superseded) = self.customers.bind(customer_id, room_id.clone(), conn.id).await {
            tracing::info!(
                customer_id = %customer_id,
                superseded = %superseded,
                "Customer rejoined on a new connection"
            );
        }

        tracing::info!(customer_id = %customer_id, room_id = %room_id, "Customer joined room");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_idle_expiry_window() {
        let registry = CustomerRegistry::new();
        let customer = CustomerId::new();
        let conn = ConnectionId::new();
        registry.bind(customer, RoomId::from("room_a"), conn).await;

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(registry.idle(Duration::from_secs(60)).await.is_empty());

        registry.touch(customer).await;
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(registry.idle(Duration::from_secs(60)).await.is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(registry.idle(Duration::from_secs(60)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_if_bound_connection() {
        let registry = CustomerRegistry::new();
        let customer = CustomerId::new();
        let old = ConnectionId::new();
        let new = ConnectionId::new();

        registry.bind(customer, RoomId::from("room_a"), old).await;
        assert_eq!(registry.bind(customer, RoomId::from("room_a"), new).await, Some(old));

        assert!(registry.remove_if(customer, old).await.is_none());
        assert!(registry.remove_if(customer, new).await.is_some());
        assert_eq!(registry.count().await, 0);
    }
}
