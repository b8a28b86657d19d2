//! Transport connect and loss
//!
//! Reconnection never restores a session on the server's initiative. A party
//! that comes back presents its room id again and joins as if fresh. A
//! transport that was superseded by a newer one for the same party closes
//! without side effects.

use std::sync::Arc;

use deskline_shared::{Availability, BrokerError, BrokerResult, CustomerId, RoomId, WorkerId};

use super::{Broker, Party, WorkerPresence};
use crate::websocket::connection::{Connection, ConnectionId};
use crate::websocket::events::ServerEvent;

/// Why a room was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonCause {
    CustomerDisconnected,
    WorkerDisconnected,
    /// The pair did not both join in time
    JoinTimeout,
    /// The customer went quiet for too long
    IdleTimeout,
}

impl AbandonCause {
    /// Notice broadcast to whoever is left in the room
    pub fn notice(&self, room_id: &RoomId) -> ServerEvent {
        let room_id = room_id.clone();
        match self {
            AbandonCause::CustomerDisconnected => ServerEvent::CustomerDisconnected {
                room_id,
                message: "The customer has disconnected.".to_string(),
            },
            AbandonCause::IdleTimeout => ServerEvent::CustomerDisconnected {
                room_id,
                message: "The chat was closed after a period of inactivity.".to_string(),
            },
            AbandonCause::WorkerDisconnected => ServerEvent::WorkerDisconnected {
                room_id,
                message: "The agent has disconnected.".to_string(),
            },
            AbandonCause::JoinTimeout => ServerEvent::ChatEnded {
                room_id,
                message: "The chat was closed because it was not joined in time.".to_string(),
            },
        }
    }
}

impl Broker {
    /// Bind a worker's transport and bring the worker online.
    ///
    /// The connection must carry a token for the same worker.
    pub async fn worker_connected(&self, worker_id: WorkerId, conn: &Arc<Connection>) -> BrokerResult<WorkerPresence> {
        if conn.authenticated_worker != Some(worker_id) {
            return Err(BrokerError::Unauthorized);
        }
        if let Some(Party::Customer(_)) = conn.party().await {
            return Err(BrokerError::Unauthorized);
        }

        let worker = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("worker {}", worker_id)))?;

        conn.bind_party(Party::Worker(worker_id)).await;
        let registration = self
            .presence
            .register_connection(worker_id, &worker.display_name, conn.id)
            .await;

        if registration.came_online {
            self.persist_online(worker_id).await;
        }
        if let Err(e) = self.store.touch_worker(worker_id).await {
            tracing::warn!(worker_id = %worker_id, error = %e, "Failed to touch worker");
        }

        if let Some(superseded) = registration.superseded {
            tracing::info!(worker_id = %worker_id, superseded = %superseded, "Worker transport replaced");
        }

        // A busy worker on a new transport goes straight back into its room
        if let Some(room_id) = registration.presence.room_id.clone() {
            if let Err(e) = self.join(&room_id, Party::Worker(worker_id), conn).await {
                tracing::warn!(worker_id = %worker_id, room_id = %room_id, error = %e, "Worker could not rejoin room");
            }
        }

        tracing::info!(
            worker_id = %worker_id,
            availability = %registration.presence.availability,
            "Worker connected"
        );
        self.publish_worker_state(&registration.presence).await;
        Ok(registration.presence)
    }

    /// Store a freshly registered worker as available. A stale stored value
    /// would make every later reservation conflict, so it is overwritten.
    async fn persist_online(&self, worker_id: WorkerId) {
        let mut expected = Availability::Offline;
        for _ in 0..2 {
            match self
                .store
                .compare_and_set_availability(worker_id, expected, Availability::Available, None)
                .await
            {
                Ok(true) => return,
                Ok(false) => match self.store.get_worker(worker_id).await {
                    Ok(Some(stored)) => {
                        tracing::warn!(
                            worker_id = %worker_id,
                            stored = %stored.availability,
                            "Stored availability was not offline; reconciling"
                        );
                        expected = stored.availability;
                    }
                    Ok(None) => return,
                    Err(e) => {
                        tracing::error!(worker_id = %worker_id, error = %e, "Failed to read stored availability");
                        return;
                    }
                },
                Err(e) => {
                    tracing::error!(worker_id = %worker_id, error = %e, "Failed to persist worker online");
                    return;
                }
            }
        }
        tracing::warn!(worker_id = %worker_id, "Stored availability could not be reconciled");
    }

    /// Reconcile state after a transport is gone. The websocket layer has
    /// already detached the connection from its rooms.
    pub async fn connection_closed(&self, conn: &Connection) {
        match conn.party().await {
            Some(Party::Worker(worker_id)) => self.worker_disconnected(worker_id, conn.id).await,
            Some(Party::Customer(customer_id)) => {
                self.customer_disconnected(customer_id, conn.id, AbandonCause::CustomerDisconnected)
                    .await
            }
            None => tracing::debug!(connection_id = %conn.id, "Anonymous connection closed"),
        }
    }

    async fn worker_disconnected(&self, worker_id: WorkerId, connection: ConnectionId) {
        let Some(previous) = self.presence.unregister(worker_id, connection).await else {
            tracing::debug!(worker_id = %worker_id, "Superseded worker transport closed");
            return;
        };

        if let Err(e) = self.store.set_offline(worker_id).await {
            tracing::error!(worker_id = %worker_id, error = %e, "Failed to persist worker offline");
        }
        tracing::info!(worker_id = %worker_id, "Worker disconnected");

        if let Some(offline) = self.presence.get(worker_id).await {
            self.publish_worker_state(&offline).await;
        }

        let room = match previous.room_id {
            Some(room_id) => Some(room_id),
            None => self.sessions.live_for_worker(worker_id).await,
        };
        if let Some(room_id) = room {
            if let Err(e) = self.abandon(&room_id, AbandonCause::WorkerDisconnected).await {
                tracing::warn!(room_id = %room_id, error = %e, "Could not abandon worker's room");
            }
        }
    }

    /// Drop a customer's presence and abandon its room if still live
    pub(crate) async fn customer_disconnected(&self, customer_id: CustomerId, connection: ConnectionId, cause: AbandonCause) {
        let Some(presence) = self.customers.remove_if(customer_id, connection).await else {
            tracing::debug!(customer_id = %customer_id, "Superseded customer transport closed");
            return;
        };
        tracing::info!(customer_id = %customer_id, room_id = %presence.room_id, cause = ?cause, "Customer left");

        let live = self
            .sessions
            .get(&presence.room_id)
            .await
            .map(|s| !s.status.is_terminal())
            .unwrap_or(false);
        if !live {
            return;
        }

        if let Err(e) = self.abandon(&presence.room_id, cause).await {
            tracing::warn!(room_id = %presence.room_id, error = %e, "Could not abandon customer's room");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::matching::Admission;
    use crate::broker::testing::harness;
    use deskline_shared::{RecordStore, SessionStatus};

    #[tokio::test]
    async fn test_worker_join_requires_matching_token() {
        let h = harness();
        let record = h.store.create_worker("ada", "Ada", "hash").await.unwrap();

        let anonymous = h.connect(None).await;
        assert!(matches!(
            h.broker.worker_connected(record.id, &anonymous.conn).await,
            Err(BrokerError::Unauthorized)
        ));

        let other = h.connect(Some(WorkerId::new())).await;
        assert!(matches!(
            h.broker.worker_connected(record.id, &other.conn).await,
            Err(BrokerError::Unauthorized)
        ));

        let own = h.connect(Some(record.id)).await;
        let presence = h.broker.worker_connected(record.id, &own.conn).await.unwrap();
        assert_eq!(presence.availability, Availability::Available);

        let stored = h.store.get_worker(record.id).await.unwrap().unwrap();
        assert_eq!(stored.availability, Availability::Available);
    }

    #[tokio::test]
    async fn test_stale_stored_availability_is_reconciled() {
        let h = harness();
        let record = h.store.create_worker("ada", "Ada", "hash").await.unwrap();
        let leftover = RoomId::from("room_leftover");
        h.store
            .compare_and_set_availability(record.id, Availability::Offline, Availability::Busy, Some(&leftover))
            .await
            .unwrap();

        let conn = h.connect(Some(record.id)).await;
        h.broker.worker_connected(record.id, &conn.conn).await.unwrap();

        let stored = h.store.get_worker(record.id).await.unwrap().unwrap();
        assert_eq!(stored.availability, Availability::Available);
        assert_eq!(stored.current_session, None);

        // Reservations are no longer refused by the store
        assert!(matches!(
            h.broker.admit_customer(None).await.unwrap(),
            Admission::Connected { .. }
        ));
    }

    #[tokio::test]
    async fn test_customer_drop_mid_session() {
        let h = harness();
        let (worker, mut worker_conn) = h.online_worker("ada").await;
        let Admission::Connected { customer_id, room_id, .. } = h.broker.admit_customer(None).await.unwrap() else {
            panic!("expected a match");
        };
        let customer_conn = h.connect(None).await;
        h.broker.customer_join(customer_id, &room_id, &customer_conn.conn).await.unwrap();
        worker_conn.drain();

        h.disconnect(&customer_conn).await;

        assert!(worker_conn.names().contains(&"customer-disconnected"));
        assert_eq!(
            h.broker.presence().get(worker).await.unwrap().availability,
            Availability::Available
        );
        assert_eq!(
            h.store.get_worker(worker).await.unwrap().unwrap().availability,
            Availability::Available
        );
        assert_eq!(
            h.store.get_session(&room_id).await.unwrap().unwrap().status,
            SessionStatus::Abandoned
        );
        assert_eq!(h.broker.stats().await.connected_customers, 0);
    }

    #[tokio::test]
    async fn test_worker_drop_mid_session() {
        let h = harness();
        let (worker, worker_conn) = h.online_worker("ada").await;
        let Admission::Connected { customer_id, room_id, .. } = h.broker.admit_customer(None).await.unwrap() else {
            panic!("expected a match");
        };
        let mut customer_conn = h.connect(None).await;
        h.broker.customer_join(customer_id, &room_id, &customer_conn.conn).await.unwrap();
        customer_conn.drain();

        h.disconnect(&worker_conn).await;

        assert!(customer_conn.names().contains(&"worker-disconnected"));
        let presence = h.broker.presence().get(worker).await.unwrap();
        assert_eq!(presence.availability, Availability::Offline);
        assert_eq!(
            h.store.get_worker(worker).await.unwrap().unwrap().availability,
            Availability::Offline
        );
        assert_eq!(
            h.store.get_session(&room_id).await.unwrap().unwrap().status,
            SessionStatus::Abandoned
        );
    }

    #[tokio::test]
    async fn test_superseded_worker_transport_keeps_session() {
        let h = harness();
        let (worker, old_conn) = h.online_worker("ada").await;
        let Admission::Connected { customer_id, room_id, .. } = h.broker.admit_customer(None).await.unwrap() else {
            panic!("expected a match");
        };
        let customer_conn = h.connect(None).await;
        h.broker.customer_join(customer_id, &room_id, &customer_conn.conn).await.unwrap();

        let mut new_conn = h.connect(Some(worker)).await;
        let presence = h.broker.worker_connected(worker, &new_conn.conn).await.unwrap();
        assert_eq!(presence.availability, Availability::Busy);
        assert!(new_conn.names().contains(&"chat-active"));

        h.disconnect(&old_conn).await;

        assert_eq!(
            h.broker.sessions().get(&room_id).await.unwrap().status,
            SessionStatus::Active
        );
        assert_eq!(h.broker.presence().lookup_transport(worker).await, Some(new_conn.conn.id));
    }

    #[tokio::test]
    async fn test_worker_freed_after_drop_can_be_matched_again() {
        let h = harness();
        let (worker, _worker_conn) = h.online_worker("ada").await;
        let Admission::Connected { customer_id, room_id, .. } = h.broker.admit_customer(None).await.unwrap() else {
            panic!("expected a match");
        };
        let customer_conn = h.connect(None).await;
        h.broker.customer_join(customer_id, &room_id, &customer_conn.conn).await.unwrap();
        h.disconnect(&customer_conn).await;

        let Admission::Connected { worker_id, room_id: next_room, .. } =
            h.broker.admit_customer(None).await.unwrap()
        else {
            panic!("worker should be free again");
        };
        assert_eq!(worker_id, worker);
        assert_ne!(next_room, room_id);
    }
}
