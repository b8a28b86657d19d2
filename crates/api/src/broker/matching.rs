//! Matching engine
//!
//! Admission picks the longest idle available worker and reserves it inside
//! the presence registry's write lock, so two concurrent admissions can never
//! see the same worker as free. The store's conditional availability update
//! then confirms the reservation; if the store disagrees the reservation is
//! rolled back and selection runs once more without that worker.

use std::collections::HashSet;

use serde::Serialize;

use deskline_shared::{Availability, BrokerError, BrokerResult, CustomerId, RoomId, WorkerId};

use super::disconnect::AbandonCause;
use super::{Broker, WorkerPresence};
use crate::notifications::NotificationEvent;
use crate::websocket::events::ServerEvent;

/// Selection is retried once after a conflict
const MAX_ATTEMPTS: usize = 2;

/// Admission outcome
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Admission {
    Connected {
        customer_id: CustomerId,
        room_id: RoomId,
        worker_id: WorkerId,
        worker_name: String,
    },
    Busy {
        customer_id: CustomerId,
        message: String,
    },
}

impl Broker {
    /// Match a customer to a worker.
    ///
    /// A customer that already has a live session gets it back. Any other
    /// customer id is replaced by a freshly minted one, so every pairing
    /// derives a room id that has never been used.
    pub async fn admit_customer(&self, requested: Option<CustomerId>) -> BrokerResult<Admission> {
        if let Some(customer_id) = requested {
            if let Some(existing) = self.sessions.live_for_customer(customer_id).await {
                tracing::debug!(
                    customer_id = %customer_id,
                    room_id = %existing.room_id,
                    "Returning existing session on repeated admission"
                );
                return Ok(Admission::Connected {
                    customer_id,
                    room_id: existing.room_id,
                    worker_id: existing.worker_id,
                    worker_name: existing.worker_name,
                });
            }
        }

        let customer_id = CustomerId::new();
        let mut excluded = HashSet::new();

        for attempt in 1..=MAX_ATTEMPTS {
            let opened = match self.reserve_worker(customer_id, &mut excluded).await {
                Ok(reserved) => {
                    excluded.insert(reserved.worker_id);
                    self.open_session(customer_id, reserved).await
                }
                Err(e) => Err(e),
            };

            match opened {
                Ok(admission) => return Ok(admission),
                Err(BrokerError::Conflict(reason)) => {
                    tracing::warn!(
                        customer_id = %customer_id,
                        attempt,
                        reason = %reason,
                        "Worker reservation conflicted, retrying selection"
                    );
                }
                Err(BrokerError::NoWorkerAvailable) => break,
                Err(e) => return Err(e),
            }
        }

        tracing::info!(customer_id = %customer_id, "No worker available");
        Ok(Admission::Busy {
            customer_id,
            message: "All of our agents are busy right now. Leave your details and we will call you back."
                .to_string(),
        })
    }

    /// Fused select-and-reserve, confirmed against the store. A worker the
    /// store refuses is added to `excluded`.
    async fn reserve_worker(
        &self,
        customer_id: CustomerId,
        excluded: &mut HashSet<WorkerId>,
    ) -> BrokerResult<WorkerPresence> {
        let reserved = self
            .presence
            .reserve_longest_idle(excluded, |worker_id| RoomId::derive(customer_id, worker_id))
            .await?;

        let confirmed = self
            .store
            .compare_and_set_availability(
                reserved.worker_id,
                Availability::Available,
                Availability::Busy,
                reserved.room_id.as_ref(),
            )
            .await;

        match confirmed {
            Ok(true) => Ok(reserved),
            Ok(false) => {
                self.presence.rollback_reservation(&reserved).await;
                excluded.insert(reserved.worker_id);
                Err(BrokerError::conflict(format!(
                    "stored availability of worker {} is not available",
                    reserved.worker_id
                )))
            }
            Err(e) => {
                self.presence.rollback_reservation(&reserved).await;
                Err(e)
            }
        }
    }

    /// Turn a confirmed reservation into a session and tell the worker
    async fn open_session(&self, customer_id: CustomerId, reserved: WorkerPresence) -> BrokerResult<Admission> {
        let session = match self.create_session(customer_id, &reserved).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(
                    worker_id = %reserved.worker_id,
                    error = %e,
                    "Failed to create session; releasing reservation"
                );
                self.presence.rollback_reservation(&reserved).await;
                if let Err(release) = self
                    .store
                    .compare_and_set_availability(reserved.worker_id, Availability::Busy, Availability::Available, None)
                    .await
                {
                    tracing::error!(worker_id = %reserved.worker_id, error = %release, "Failed to release stored reservation");
                }
                return Err(e);
            }
        };

        let room_id = session.room_id.clone();

        // A disconnect between the store confirmation and the insert found no
        // session to abandon
        let still_reserved = self
            .presence
            .get(reserved.worker_id)
            .await
            .map(|p| p.availability == Availability::Busy && p.room_id.as_ref() == Some(&room_id))
            .unwrap_or(false);
        if !still_reserved {
            tracing::warn!(
                worker_id = %reserved.worker_id,
                room_id = %room_id,
                "Worker left before its session opened"
            );
            if let Err(e) = self.abandon(&room_id, AbandonCause::WorkerDisconnected).await {
                tracing::debug!(room_id = %room_id, error = %e, "Room already closed");
            }
            return Err(BrokerError::conflict(format!(
                "worker {} went offline before room {} opened",
                reserved.worker_id, room_id
            )));
        }

        if let Some(connection_id) = self.presence.lookup_transport(reserved.worker_id).await {
            if let Some(conn) = self.ws.get_connection(connection_id).await {
                if let Err(e) = self.join(&room_id, super::Party::Worker(reserved.worker_id), &conn).await {
                    tracing::warn!(room_id = %room_id, error = %e, "Worker transport could not join new room");
                }
                let _ = conn.send(ServerEvent::NewChat {
                    room_id: room_id.clone(),
                    customer_id,
                });
            }
        }

        self.publish_worker_state(&reserved).await;
        self.notifier.notify(NotificationEvent::NewSession {
            room_id: room_id.clone(),
            customer_id,
            worker_id: reserved.worker_id,
        });

        tracing::info!(
            customer_id = %customer_id,
            room_id = %room_id,
            worker_id = %reserved.worker_id,
            "Customer matched"
        );

        Ok(Admission::Connected {
            customer_id,
            room_id,
            worker_id: reserved.worker_id,
            worker_name: reserved.display_name,
        })
    }
}
