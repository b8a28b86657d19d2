//! Durable record store
//!
//! The store is the system of record for workers, sessions, messages,
//! callbacks and ratings. The broker keeps its own in-memory view for
//! matching and always writes here before broadcasting a state change.
//!
//! Two backends implement [`RecordStore`]:
//! - [`PgStore`]: PostgreSQL via sqlx
//! - [`MemoryStore`]: process-local maps, used by tests and database-less runs

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BrokerResult;
use crate::types::{
    Availability, CallbackRequest, CallbackStatus, DeliveryStatus, MessageId, MessageRecord,
    Rating, RoomId, SessionRecord, SessionStatus, WorkerId, WorkerRecord,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Fields of a new callback request
#[derive(Debug, Clone)]
pub struct NewCallback {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub message: Option<String>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Connectivity check for readiness probes
    async fn ping(&self) -> BrokerResult<()>;

    // Workers

    async fn create_worker(
        &self,
        username: &str,
        display_name: &str,
        password_hash: &str,
    ) -> BrokerResult<WorkerRecord>;

    async fn get_worker(&self, id: WorkerId) -> BrokerResult<Option<WorkerRecord>>;

    async fn find_worker_by_username(&self, username: &str) -> BrokerResult<Option<WorkerRecord>>;

    async fn list_workers(&self) -> BrokerResult<Vec<WorkerRecord>>;

    /// Atomically move a worker from `expected` to `new` availability.
    ///
    /// Returns `false` without writing when the stored availability is not
    /// `expected`.
    async fn compare_and_set_availability(
        &self,
        id: WorkerId,
        expected: Availability,
        new: Availability,
        session: Option<&RoomId>,
    ) -> BrokerResult<bool>;

    /// Unconditionally mark a worker offline and clear its session reference
    async fn set_offline(&self, id: WorkerId) -> BrokerResult<()>;

    async fn touch_worker(&self, id: WorkerId) -> BrokerResult<()>;

    /// Startup reconciliation: every worker offline, every non-terminal
    /// session abandoned. Returns the number of sessions abandoned.
    async fn reset_presence(&self) -> BrokerResult<u64>;

    // Sessions

    async fn create_session(&self, session: &SessionRecord) -> BrokerResult<()>;

    async fn get_session(&self, id: &RoomId) -> BrokerResult<Option<SessionRecord>>;

    /// Conditional status update; `false` when the stored status is not `expected`.
    async fn update_session_status(
        &self,
        id: &RoomId,
        expected: SessionStatus,
        new: SessionStatus,
        ended_at: Option<OffsetDateTime>,
    ) -> BrokerResult<bool>;

    /// Abandon a session from whichever non-terminal status it is stored in.
    /// `false` when it already ended.
    async fn abandon_session(&self, id: &RoomId, ended_at: OffsetDateTime) -> BrokerResult<bool>;

    // Messages

    /// Insert a message and bump the session's message count
    async fn insert_message(&self, message: &MessageRecord) -> BrokerResult<()>;

    /// Advance a message's delivery status. Never regresses; returns `false`
    /// when the stored status is already at or past `status`.
    async fn update_message_status(
        &self,
        room_id: &RoomId,
        id: MessageId,
        status: DeliveryStatus,
    ) -> BrokerResult<bool>;

    async fn list_messages(&self, room_id: &RoomId, limit: i64) -> BrokerResult<Vec<MessageRecord>>;

    // Callbacks

    async fn create_callback(&self, callback: NewCallback) -> BrokerResult<CallbackRequest>;

    async fn get_callback(&self, id: Uuid) -> BrokerResult<Option<CallbackRequest>>;

    async fn list_callbacks(
        &self,
        status: Option<CallbackStatus>,
        limit: i64,
    ) -> BrokerResult<Vec<CallbackRequest>>;

    async fn update_callback_status(
        &self,
        id: Uuid,
        expected: CallbackStatus,
        new: CallbackStatus,
    ) -> BrokerResult<bool>;

    // Ratings

    /// Store a rating; a room can be rated once
    async fn create_rating(&self, rating: &Rating) -> BrokerResult<()>;
}

/// Delivery statuses that may still advance to `to`
pub(crate) fn statuses_before(to: DeliveryStatus) -> Vec<String> {
    [DeliveryStatus::Sent, DeliveryStatus::Delivered, DeliveryStatus::Read]
        .into_iter()
        .filter(|s| *s < to)
        .map(|s| s.as_str().to_string())
        .collect()
}
