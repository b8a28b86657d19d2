//! PostgreSQL record store

use async_trait::async_trait;
use sqlx::{types::Json, FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{statuses_before, NewCallback, RecordStore};
use crate::error::{BrokerError, BrokerResult};
use crate::types::{
    Attachment, Availability, CallbackRequest, CallbackStatus, CustomerId, DeliveryStatus,
    MessageContent, MessageId, MessageRecord, Rating, RoomId, SessionRecord,
    SessionStatus, WorkerId, WorkerRecord,
};

/// [`RecordStore`] backed by a Postgres pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(Debug, FromRow)]
struct WorkerRow {
    id: Uuid,
    username: String,
    display_name: String,
    password_hash: String,
    availability: String,
    current_session: Option<String>,
    last_active_at: OffsetDateTime,
    created_at: OffsetDateTime,
}

impl TryFrom<WorkerRow> for WorkerRecord {
    type Error = BrokerError;

    fn try_from(row: WorkerRow) -> Result<Self, Self::Error> {
        Ok(WorkerRecord {
            id: WorkerId(row.id),
            username: row.username,
            display_name: row.display_name,
            password_hash: row.password_hash,
            availability: row.availability.parse()?,
            current_session: row.current_session.map(RoomId),
            last_active_at: row.last_active_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    customer_id: Uuid,
    worker_id: Uuid,
    status: String,
    created_at: OffsetDateTime,
    ended_at: Option<OffsetDateTime>,
    message_count: i64,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = BrokerError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(SessionRecord {
            id: RoomId(row.id),
            customer_id: CustomerId(row.customer_id),
            worker_id: WorkerId(row.worker_id),
            status: row.status.parse()?,
            created_at: row.created_at,
            ended_at: row.ended_at,
            message_count: row.message_count,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    room_id: String,
    sender_role: String,
    sender_id: String,
    kind: String,
    body: String,
    attachment: Option<Json<Attachment>>,
    duration_secs: Option<f64>,
    status: String,
    created_at: OffsetDateTime,
}

impl TryFrom<MessageRow> for MessageRecord {
    type Error = BrokerError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let content = MessageContent::from_parts(
            row.kind.parse()?,
            row.body,
            row.attachment.map(|Json(a)| a),
            row.duration_secs,
        )?;
        Ok(MessageRecord {
            id: MessageId(row.id),
            room_id: RoomId(row.room_id),
            sender_role: row.sender_role.parse()?,
            sender_id: row.sender_id,
            content,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CallbackRow {
    id: Uuid,
    name: String,
    phone: String,
    email: Option<String>,
    message: Option<String>,
    status: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<CallbackRow> for CallbackRequest {
    type Error = BrokerError;

    fn try_from(row: CallbackRow) -> Result<Self, Self::Error> {
        Ok(CallbackRequest {
            id: row.id,
            name: row.name,
            phone: row.phone,
            email: row.email,
            message: row.message,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn collect<R, T>(rows: Vec<R>) -> BrokerResult<Vec<T>>
where
    T: TryFrom<R, Error = BrokerError>,
{
    rows.into_iter().map(T::try_from).collect()
}

const WORKER_COLUMNS: &str = "id, username, display_name, password_hash, availability, \
                              current_session, last_active_at, created_at";
const SESSION_COLUMNS: &str = "id, customer_id, worker_id, status, created_at, ended_at, message_count";
const MESSAGE_COLUMNS: &str = "id, room_id, sender_role, sender_id, kind, body, attachment, \
                               duration_secs, status, created_at";
const CALLBACK_COLUMNS: &str = "id, name, phone, email, message, status, created_at, updated_at";

#[async_trait]
impl RecordStore for PgStore {
    async fn ping(&self) -> BrokerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_worker(
        &self,
        username: &str,
        display_name: &str,
        password_hash: &str,
    ) -> BrokerResult<WorkerRecord> {
        let row: WorkerRow = sqlx::query_as(&format!(
            "INSERT INTO workers (id, username, display_name, password_hash) \
             VALUES ($1, $2, $3, $4) RETURNING {WORKER_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(username)
        .bind(display_name)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_worker(&self, id: WorkerId) -> BrokerResult<Option<WorkerRecord>> {
        let row: Option<WorkerRow> =
            sqlx::query_as(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.map(WorkerRecord::try_from).transpose()
    }

    async fn find_worker_by_username(&self, username: &str) -> BrokerResult<Option<WorkerRecord>> {
        let row: Option<WorkerRow> =
            sqlx::query_as(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE username = $1"))
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;

        row.map(WorkerRecord::try_from).transpose()
    }

    async fn list_workers(&self) -> BrokerResult<Vec<WorkerRecord>> {
        let rows: Vec<WorkerRow> =
            sqlx::query_as(&format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY username"))
                .fetch_all(&self.pool)
                .await?;

        collect(rows)
    }

    async fn compare_and_set_availability(
        &self,
        id: WorkerId,
        expected: Availability,
        new: Availability,
        session: Option<&RoomId>,
    ) -> BrokerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET availability = $3, current_session = $4, last_active_at = NOW()
            WHERE id = $1 AND availability = $2
            "#,
        )
        .bind(id.0)
        .bind(expected.as_str())
        .bind(new.as_str())
        .bind(session.map(RoomId::as_str))
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() == 1;
        if !applied {
            tracing::debug!(worker_id = %id, expected = %expected, new = %new, "Availability change refused");
        }
        Ok(applied)
    }

    async fn set_offline(&self, id: WorkerId) -> BrokerResult<()> {
        sqlx::query(
            r#"
            UPDATE workers
            SET availability = 'offline', current_session = NULL, last_active_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn touch_worker(&self, id: WorkerId) -> BrokerResult<()> {
        sqlx::query("UPDATE workers SET last_active_at = NOW() WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn reset_presence(&self) -> BrokerResult<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE workers SET availability = 'offline', current_session = NULL")
            .execute(&mut *tx)
            .await?;

        let abandoned = sqlx::query(
            r#"
            UPDATE chat_sessions
            SET status = 'abandoned', ended_at = NOW()
            WHERE status IN ('created', 'active')
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        tracing::info!(abandoned, "Presence reset");
        Ok(abandoned)
    }

    async fn create_session(&self, session: &SessionRecord) -> BrokerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_sessions (id, customer_id, worker_id, status, created_at, message_count)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(session.id.as_str())
        .bind(session.customer_id.0)
        .bind(session.worker_id.0)
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.message_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_session(&self, id: &RoomId) -> BrokerResult<Option<SessionRecord>> {
        let row: Option<SessionRow> =
            sqlx::query_as(&format!("SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE id = $1"))
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(SessionRecord::try_from).transpose()
    }

    async fn update_session_status(
        &self,
        id: &RoomId,
        expected: SessionStatus,
        new: SessionStatus,
        ended_at: Option<OffsetDateTime>,
    ) -> BrokerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chat_sessions
            SET status = $3, ended_at = COALESCE($4, ended_at)
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id.as_str())
        .bind(expected.as_str())
        .bind(new.as_str())
        .bind(ended_at)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() == 1;
        if !applied {
            tracing::debug!(room_id = %id, expected = %expected, new = %new, "Session status change refused");
        }
        Ok(applied)
    }

    async fn abandon_session(&self, id: &RoomId, ended_at: OffsetDateTime) -> BrokerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chat_sessions
            SET status = 'abandoned', ended_at = $2
            WHERE id = $1 AND status IN ('created', 'active')
            "#,
        )
        .bind(id.as_str())
        .bind(ended_at)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() == 1;
        if !applied {
            tracing::debug!(room_id = %id, "Stored session already terminal; abandon refused");
        }
        Ok(applied)
    }

    async fn insert_message(&self, message: &MessageRecord) -> BrokerResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO chat_messages
              (id, room_id, sender_role, sender_id, kind, body, attachment, duration_secs, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(message.id.0)
        .bind(message.room_id.as_str())
        .bind(message.sender_role.as_str())
        .bind(&message.sender_id)
        .bind(message.content.kind().as_str())
        .bind(message.content.body())
        .bind(message.content.attachment().cloned().map(Json))
        .bind(message.content.duration_secs())
        .bind(message.status.as_str())
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE chat_sessions SET message_count = message_count + 1 WHERE id = $1")
            .bind(message.room_id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_message_status(
        &self,
        room_id: &RoomId,
        id: MessageId,
        status: DeliveryStatus,
    ) -> BrokerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chat_messages
            SET status = $3
            WHERE room_id = $1 AND id = $2 AND status = ANY($4)
            "#,
        )
        .bind(room_id.as_str())
        .bind(id.0)
        .bind(status.as_str())
        .bind(statuses_before(status))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_messages(&self, room_id: &RoomId, limit: i64) -> BrokerResult<Vec<MessageRecord>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE room_id = $1 ORDER BY id ASC LIMIT $2"
        ))
        .bind(room_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn create_callback(&self, callback: NewCallback) -> BrokerResult<CallbackRequest> {
        let row: CallbackRow = sqlx::query_as(&format!(
            "INSERT INTO callback_requests (id, name, phone, email, message) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {CALLBACK_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&callback.name)
        .bind(&callback.phone)
        .bind(&callback.email)
        .bind(&callback.message)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_callback(&self, id: Uuid) -> BrokerResult<Option<CallbackRequest>> {
        let row: Option<CallbackRow> = sqlx::query_as(&format!(
            "SELECT {CALLBACK_COLUMNS} FROM callback_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CallbackRequest::try_from).transpose()
    }

    async fn list_callbacks(
        &self,
        status: Option<CallbackStatus>,
        limit: i64,
    ) -> BrokerResult<Vec<CallbackRequest>> {
        let rows: Vec<CallbackRow> = sqlx::query_as(&format!(
            "SELECT {CALLBACK_COLUMNS} FROM callback_requests \
             WHERE ($1::text IS NULL OR status = $1) \
             ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn update_callback_status(
        &self,
        id: Uuid,
        expected: CallbackStatus,
        new: CallbackStatus,
    ) -> BrokerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE callback_requests
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(new.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn create_rating(&self, rating: &Rating) -> BrokerResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO ratings (id, room_id, worker_id, rating, comment, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (room_id) DO NOTHING
            "#,
        )
        .bind(rating.id)
        .bind(rating.room_id.as_str())
        .bind(rating.worker_id.0)
        .bind(rating.rating)
        .bind(&rating.comment)
        .bind(rating.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::conflict(format!("room {} already rated", rating.room_id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = crate::db::create_pool(&url, 2).await.expect("Failed to create pool");
        crate::db::run_migrations(&pool).await.expect("Failed to migrate");
        PgStore::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_conditional_availability_update() {
        let store = connect().await;
        let username = format!("pg-worker-{}", Uuid::new_v4());
        let worker = store.create_worker(&username, "Pg Worker", "hash").await.unwrap();

        assert!(store
            .compare_and_set_availability(worker.id, Availability::Offline, Availability::Available, None)
            .await
            .unwrap());
        assert!(!store
            .compare_and_set_availability(worker.id, Availability::Offline, Availability::Available, None)
            .await
            .unwrap());
    }

    #[test]
    fn test_statuses_before() {
        assert_eq!(statuses_before(DeliveryStatus::Read), vec!["sent", "delivered"]);
        assert_eq!(statuses_before(DeliveryStatus::Delivered), vec!["sent"]);
        assert!(statuses_before(DeliveryStatus::Sent).is_empty());
    }
}
