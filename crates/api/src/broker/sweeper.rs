//! Background sweeper
//!
//! Periodically expires idle customers, abandons rooms nobody joined in time
//! and forgets rooms that ended a while ago.

use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use super::{AbandonCause, Broker};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub idle_customers: usize,
    pub join_timeouts: usize,
    pub purged: usize,
}

impl Broker {
    /// Run one sweep pass
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for customer in self.customers.idle(self.config.customer_idle_timeout).await {
            tracing::info!(
                customer_id = %customer.customer_id,
                room_id = %customer.room_id,
                "Expiring idle customer"
            );
            self.customer_disconnected(customer.customer_id, customer.connection, AbandonCause::IdleTimeout)
                .await;
            report.idle_customers += 1;
        }

        for room_id in self.sessions.stale_created(self.config.join_timeout).await {
            match self.abandon(&room_id, AbandonCause::JoinTimeout).await {
                Ok(()) => report.join_timeouts += 1,
                Err(e) => tracing::warn!(room_id = %room_id, error = %e, "Join timeout not applied"),
            }
        }

        report.purged = self.sessions.purge_terminal(self.config.terminal_retention).await;

        if report != SweepReport::default() {
            tracing::debug!(
                idle_customers = report.idle_customers,
                join_timeouts = report.join_timeouts,
                purged = report.purged,
                "Sweep completed"
            );
        }
        report
    }
}

/// Spawn the sweeper on a fixed interval
pub fn spawn_sweeper(broker: Broker, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = every.as_secs(), "Sweeper started");

        loop {
            interval.tick().await;
            broker.sweep().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::matching::Admission;
    use crate::broker::testing::harness_with;
    use crate::broker::BrokerConfig;
    use deskline_shared::{Availability, RecordStore, SessionStatus};

    fn short_timeouts() -> BrokerConfig {
        BrokerConfig {
            customer_idle_timeout: Duration::from_secs(60),
            join_timeout: Duration::from_secs(30),
            terminal_retention: Duration::from_secs(10),
            ..BrokerConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unjoined_room_times_out_and_frees_worker() {
        let h = harness_with(short_timeouts());
        let (worker, mut worker_conn) = h.online_worker("ada").await;
        let Admission::Connected { room_id, .. } = h.broker.admit_customer(None).await.unwrap() else {
            panic!("expected a match");
        };
        worker_conn.drain();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(h.broker.sweep().await, SweepReport::default());

        tokio::time::advance(Duration::from_secs(25)).await;
        let report = h.broker.sweep().await;
        assert_eq!(report.join_timeouts, 1);

        assert!(worker_conn.names().contains(&"chat-ended"));
        assert_eq!(
            h.broker.presence().get(worker).await.unwrap().availability,
            Availability::Available
        );
        assert_eq!(
            h.store.get_session(&room_id).await.unwrap().unwrap().status,
            SessionStatus::Abandoned
        );

        // Forgotten once the retention window passes
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(h.broker.sweep().await.purged, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_customer_is_disconnected() {
        let h = harness_with(short_timeouts());
        let (worker, mut worker_conn) = h.online_worker("ada").await;
        let Admission::Connected { customer_id, room_id, .. } = h.broker.admit_customer(None).await.unwrap() else {
            panic!("expected a match");
        };
        let customer_conn = h.connect(None).await;
        h.broker.customer_join(customer_id, &room_id, &customer_conn.conn).await.unwrap();
        worker_conn.drain();

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = h.broker.sweep().await;
        assert_eq!(report.idle_customers, 1);

        assert!(worker_conn.names().contains(&"customer-disconnected"));
        assert_eq!(
            h.broker.presence().get(worker).await.unwrap().availability,
            Availability::Available
        );
        assert_eq!(
            h.store.get_session(&room_id).await.unwrap().unwrap().status,
            SessionStatus::Abandoned
        );
    }
}
