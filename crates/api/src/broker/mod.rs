//! Session broker
//!
//! Matches anonymous customers to available workers and owns every live
//! conversation until it ends or a party drops.
//!
//! # Architecture
//!
//! - **Presence**: in-memory worker availability and transport bindings
//! - **Matching**: fused select-and-reserve of the longest idle worker
//! - **Session**: per-room lifecycle (created, active, ended, abandoned)
//! - **Pipeline**: message submission, fan-out and delivery status
//! - **Typing**: ephemeral typing relay with server-side expiry
//! - **Disconnect**: transport connect/loss reconciliation
//! - **Sweeper**: background expiry of idle customers and stale rooms
//!
//! Every state change is applied as a compare-and-set in memory, written to
//! the [`RecordStore`], and only then broadcast.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use deskline_shared::{CustomerId, RecordStore, SenderRole, WorkerId};

use crate::notifications::Notifier;
use crate::websocket::events::ServerEvent;
use crate::websocket::WebSocketState;

mod customers;
mod disconnect;
mod matching;
mod pipeline;
mod presence;
mod session;
mod sweeper;
mod typing;

pub use customers::{CustomerPresence, CustomerRegistry};
pub use disconnect::AbandonCause;
pub use matching::Admission;
pub use pipeline::{content_from_wire, Submission};
pub use presence::{PresenceRegistry, Registration, WorkerPresence};
pub use session::{SessionSnapshot, SessionTable};
pub use sweeper::{spawn_sweeper, SweepReport};
pub use typing::TypingRelay;

/// The identity a transport speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Party {
    Worker(WorkerId),
    Customer(CustomerId),
}

impl Party {
    pub fn role(&self) -> SenderRole {
        match self {
            Party::Worker(_) => SenderRole::Worker,
            Party::Customer(_) => SenderRole::Customer,
        }
    }

    /// Sender id as it appears on stored messages
    pub fn sender_id(&self) -> String {
        match self {
            Party::Worker(id) => id.to_string(),
            Party::Customer(id) => id.to_string(),
        }
    }
}

/// Broker timings and limits
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Delay before a sent message is marked delivered
    pub delivered_delay: Duration,
    /// Typing flag lifetime without a refresh
    pub typing_timeout: Duration,
    pub customer_idle_timeout: Duration,
    /// How long a room may stay in `Created` before it is abandoned
    pub join_timeout: Duration,
    /// How long ended rooms stay in memory for late read receipts
    pub terminal_retention: Duration,
    pub max_message_length: usize,
    pub history_limit: i64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            delivered_delay: Duration::from_millis(500),
            typing_timeout: Duration::from_millis(3000),
            customer_idle_timeout: Duration::from_secs(1800),
            join_timeout: Duration::from_secs(120),
            terminal_retention: Duration::from_secs(300),
            max_message_length: 5000,
            history_limit: 200,
        }
    }
}

/// Shared broker handle. Cloning is cheap; all state lives behind `Arc`s.
#[derive(Clone)]
pub struct Broker {
    store: Arc<dyn RecordStore>,
    ws: WebSocketState,
    presence: PresenceRegistry,
    sessions: SessionTable,
    customers: CustomerRegistry,
    typing: TypingRelay,
    notifier: Arc<dyn Notifier>,
    config: Arc<BrokerConfig>,
}

/// Point-in-time counters for the presence endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStats {
    pub available_workers: usize,
    pub busy_workers: usize,
    pub live_sessions: usize,
    pub connected_customers: usize,
    pub active_connections: usize,
    pub active_rooms: usize,
}

impl Broker {
    pub fn new(store: Arc<dyn RecordStore>, notifier: Arc<dyn Notifier>, config: BrokerConfig) -> Self {
        Self {
            store,
            ws: WebSocketState::new(),
            presence: PresenceRegistry::new(),
            sessions: SessionTable::new(),
            customers: CustomerRegistry::new(),
            typing: TypingRelay::new(config.typing_timeout),
            notifier,
            config: Arc::new(config),
        }
    }

    pub fn ws(&self) -> &WebSocketState {
        &self.ws
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub async fn stats(&self) -> BrokerStats {
        let (available_workers, busy_workers) = self.presence.counts().await;
        let ws = self.ws.get_stats().await;
        BrokerStats {
            available_workers,
            busy_workers,
            live_sessions: self.sessions.live_count().await,
            connected_customers: self.customers.count().await,
            active_connections: ws.active_connections,
            active_rooms: ws.active_rooms,
        }
    }

    /// Tell every connected worker about a presence change
    async fn publish_worker_state(&self, presence: &WorkerPresence) {
        let event = ServerEvent::WorkerState {
            worker_id: presence.worker_id,
            availability: presence.availability,
            room_id: presence.room_id.clone(),
        };
        let recipients = self.ws.broadcast_to_workers(event).await;
        tracing::debug!(
            worker_id = %presence.worker_id,
            availability = %presence.availability,
            recipients,
            "Published worker state"
        );
    }
}
