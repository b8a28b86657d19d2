//! In-memory record store

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{NewCallback, RecordStore};
use crate::error::{BrokerError, BrokerResult};
use crate::types::{
    Availability, CallbackRequest, CallbackStatus, DeliveryStatus, MessageId, MessageRecord,
    Rating, RoomId, SessionRecord, SessionStatus, WorkerId, WorkerRecord,
};

#[derive(Default)]
struct Tables {
    workers: HashMap<WorkerId, WorkerRecord>,
    sessions: HashMap<RoomId, SessionRecord>,
    messages: HashMap<RoomId, BTreeMap<MessageId, MessageRecord>>,
    callbacks: HashMap<Uuid, CallbackRequest>,
    ratings: HashMap<RoomId, Rating>,
}

/// Process-local [`RecordStore`] with the same semantics as the Postgres backend
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    fail_message_writes: Arc<AtomicBool>,
    activation_delay_ms: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent message insert fail with a persistence error
    pub fn set_fail_message_writes(&self, fail: bool) {
        self.fail_message_writes.store(fail, Ordering::SeqCst);
    }

    /// Stall every `Created -> Active` write, as a slow database would
    pub fn set_activation_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.activation_delay_ms.store(ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn ping(&self) -> BrokerResult<()> {
        Ok(())
    }

    async fn create_worker(
        &self,
        username: &str,
        display_name: &str,
        password_hash: &str,
    ) -> BrokerResult<WorkerRecord> {
        let mut tables = self.tables.write().await;
        if tables.workers.values().any(|w| w.username == username) {
            return Err(BrokerError::conflict(format!("username {} taken", username)));
        }

        let now = OffsetDateTime::now_utc();
        let worker = WorkerRecord {
            id: WorkerId::new(),
            username: username.to_string(),
            display_name: display_name.to_string(),
            password_hash: password_hash.to_string(),
            availability: Availability::Offline,
            current_session: None,
            last_active_at: now,
            created_at: now,
        };
        tables.workers.insert(worker.id, worker.clone());
        Ok(worker)
    }

    async fn get_worker(&self, id: WorkerId) -> BrokerResult<Option<WorkerRecord>> {
        Ok(self.tables.read().await.workers.get(&id).cloned())
    }

    async fn find_worker_by_username(&self, username: &str) -> BrokerResult<Option<WorkerRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.workers.values().find(|w| w.username == username).cloned())
    }

    async fn list_workers(&self) -> BrokerResult<Vec<WorkerRecord>> {
        let tables = self.tables.read().await;
        let mut workers: Vec<_> = tables.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(workers)
    }

    async fn compare_and_set_availability(
        &self,
        id: WorkerId,
        expected: Availability,
        new: Availability,
        session: Option<&RoomId>,
    ) -> BrokerResult<bool> {
        let mut tables = self.tables.write().await;
        let worker = tables
            .workers
            .get_mut(&id)
            .ok_or_else(|| BrokerError::NotFound(format!("worker {}", id)))?;

        if worker.availability != expected {
            return Ok(false);
        }
        worker.availability = new;
        worker.current_session = session.cloned();
        worker.last_active_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn set_offline(&self, id: WorkerId) -> BrokerResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(worker) = tables.workers.get_mut(&id) {
            worker.availability = Availability::Offline;
            worker.current_session = None;
            worker.last_active_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn touch_worker(&self, id: WorkerId) -> BrokerResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(worker) = tables.workers.get_mut(&id) {
            worker.last_active_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn reset_presence(&self) -> BrokerResult<u64> {
        let mut tables = self.tables.write().await;
        for worker in tables.workers.values_mut() {
            worker.availability = Availability::Offline;
            worker.current_session = None;
        }

        let now = OffsetDateTime::now_utc();
        let mut abandoned = 0;
        for session in tables.sessions.values_mut() {
            if !session.status.is_terminal() {
                session.status = SessionStatus::Abandoned;
                session.ended_at = Some(now);
                abandoned += 1;
            }
        }
        Ok(abandoned)
    }

    async fn create_session(&self, session: &SessionRecord) -> BrokerResult<()> {
        let mut tables = self.tables.write().await;
        if tables.sessions.contains_key(&session.id) {
            return Err(BrokerError::conflict(format!("room {} exists", session.id)));
        }
        tables.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &RoomId) -> BrokerResult<Option<SessionRecord>> {
        Ok(self.tables.read().await.sessions.get(id).cloned())
    }

    async fn update_session_status(
        &self,
        id: &RoomId,
        expected: SessionStatus,
        new: SessionStatus,
        ended_at: Option<OffsetDateTime>,
    ) -> BrokerResult<bool> {
        let delay = self.activation_delay_ms.load(Ordering::SeqCst);
        if new == SessionStatus::Active && delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut tables = self.tables.write().await;
        let session = tables
            .sessions
            .get_mut(id)
            .ok_or_else(|| BrokerError::NotFound(format!("room {}", id)))?;

        if session.status != expected {
            return Ok(false);
        }
        session.status = new;
        if ended_at.is_some() {
            session.ended_at = ended_at;
        }
        Ok(true)
    }

    async fn abandon_session(&self, id: &RoomId, ended_at: OffsetDateTime) -> BrokerResult<bool> {
        let mut tables = self.tables.write().await;
        let session = tables
            .sessions
            .get_mut(id)
            .ok_or_else(|| BrokerError::NotFound(format!("room {}", id)))?;

        if session.status.is_terminal() {
            return Ok(false);
        }
        session.status = SessionStatus::Abandoned;
        session.ended_at = Some(ended_at);
        Ok(true)
    }

    async fn insert_message(&self, message: &MessageRecord) -> BrokerResult<()> {
        if self.fail_message_writes.load(Ordering::SeqCst) {
            return Err(BrokerError::Persistence("message write rejected".to_string()));
        }

        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        let session = tables
            .sessions
            .get_mut(&message.room_id)
            .ok_or_else(|| BrokerError::NotFound(format!("room {}", message.room_id)))?;

        let room = tables.messages.entry(message.room_id.clone()).or_default();
        if room.contains_key(&message.id) {
            return Err(BrokerError::conflict(format!("message {} exists", message.id)));
        }
        room.insert(message.id, message.clone());
        session.message_count += 1;
        Ok(())
    }

    async fn update_message_status(
        &self,
        room_id: &RoomId,
        id: MessageId,
        status: DeliveryStatus,
    ) -> BrokerResult<bool> {
        let mut tables = self.tables.write().await;
        let message = tables
            .messages
            .get_mut(room_id)
            .and_then(|room| room.get_mut(&id))
            .ok_or_else(|| BrokerError::NotFound(format!("message {} in {}", id, room_id)))?;

        match message.status.advance(status) {
            Some(next) => {
                message.status = next;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_messages(&self, room_id: &RoomId, limit: i64) -> BrokerResult<Vec<MessageRecord>> {
        let tables = self.tables.read().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(tables
            .messages
            .get(room_id)
            .map(|room| room.values().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn create_callback(&self, callback: NewCallback) -> BrokerResult<CallbackRequest> {
        let now = OffsetDateTime::now_utc();
        let record = CallbackRequest {
            id: Uuid::new_v4(),
            name: callback.name,
            phone: callback.phone,
            email: callback.email,
            message: callback.message,
            status: CallbackStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.tables
            .write()
            .await
            .callbacks
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_callback(&self, id: Uuid) -> BrokerResult<Option<CallbackRequest>> {
        Ok(self.tables.read().await.callbacks.get(&id).cloned())
    }

    async fn list_callbacks(
        &self,
        status: Option<CallbackStatus>,
        limit: i64,
    ) -> BrokerResult<Vec<CallbackRequest>> {
        let tables = self.tables.read().await;
        let mut callbacks: Vec<_> = tables
            .callbacks
            .values()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        callbacks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        callbacks.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(callbacks)
    }

    async fn update_callback_status(
        &self,
        id: Uuid,
        expected: CallbackStatus,
        new: CallbackStatus,
    ) -> BrokerResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(callback) = tables.callbacks.get_mut(&id) else {
            return Err(BrokerError::NotFound(format!("callback {}", id)));
        };
        if callback.status != expected {
            return Ok(false);
        }
        callback.status = new;
        callback.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn create_rating(&self, rating: &Rating) -> BrokerResult<()> {
        let mut tables = self.tables.write().await;
        if tables.ratings.contains_key(&rating.room_id) {
            return Err(BrokerError::conflict(format!("room {} already rated", rating.room_id)));
        }
        tables.ratings.insert(rating.room_id.clone(), rating.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CustomerId, MessageContent, SenderRole};

    fn session_for(worker: WorkerId) -> SessionRecord {
        let customer = CustomerId::new();
        SessionRecord {
            id: RoomId::derive(customer, worker),
            customer_id: customer,
            worker_id: worker,
            status: SessionStatus::Created,
            created_at: OffsetDateTime::now_utc(),
            ended_at: None,
            message_count: 0,
        }
    }

    fn text_message(room_id: &RoomId, id: i64) -> MessageRecord {
        MessageRecord {
            id: MessageId(id),
            room_id: room_id.clone(),
            sender_role: SenderRole::Customer,
            sender_id: "c".to_string(),
            content: MessageContent::Text {
                text: "hi".to_string(),
            },
            status: DeliveryStatus::Sent,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_compare_and_set_availability() {
        let store = MemoryStore::new();
        let worker = store.create_worker("ana", "Ana", "hash").await.unwrap();
        let room = RoomId::from("room_x");

        assert!(store
            .compare_and_set_availability(worker.id, Availability::Offline, Availability::Available, None)
            .await
            .unwrap());

        // Second writer with a stale expectation loses
        assert!(!store
            .compare_and_set_availability(worker.id, Availability::Offline, Availability::Available, None)
            .await
            .unwrap());

        assert!(store
            .compare_and_set_availability(worker.id, Availability::Available, Availability::Busy, Some(&room))
            .await
            .unwrap());

        let stored = store.get_worker(worker.id).await.unwrap().unwrap();
        assert_eq!(stored.availability, Availability::Busy);
        assert_eq!(stored.current_session, Some(room));
    }

    #[tokio::test]
    async fn test_message_status_never_regresses() {
        let store = MemoryStore::new();
        let worker = store.create_worker("ben", "Ben", "hash").await.unwrap();
        let session = session_for(worker.id);
        store.create_session(&session).await.unwrap();
        store.insert_message(&text_message(&session.id, 1)).await.unwrap();

        assert!(store
            .update_message_status(&session.id, MessageId(1), DeliveryStatus::Read)
            .await
            .unwrap());
        assert!(!store
            .update_message_status(&session.id, MessageId(1), DeliveryStatus::Delivered)
            .await
            .unwrap());

        let messages = store.list_messages(&session.id, 10).await.unwrap();
        assert_eq!(messages[0].status, DeliveryStatus::Read);

        let stored = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.message_count, 1);
    }

    #[tokio::test]
    async fn test_reset_presence_abandons_live_sessions() {
        let store = MemoryStore::new();
        let worker = store.create_worker("cy", "Cy", "hash").await.unwrap();
        let session = session_for(worker.id);
        store.create_session(&session).await.unwrap();
        store
            .compare_and_set_availability(worker.id, Availability::Offline, Availability::Busy, Some(&session.id))
            .await
            .unwrap();

        assert_eq!(store.reset_presence().await.unwrap(), 1);

        let stored = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Abandoned);
        assert!(stored.ended_at.is_some());
        let worker = store.get_worker(worker.id).await.unwrap().unwrap();
        assert_eq!(worker.availability, Availability::Offline);
    }

    #[tokio::test]
    async fn test_abandon_from_any_live_status() {
        let store = MemoryStore::new();
        let worker = store.create_worker("eve", "Eve", "hash").await.unwrap();

        let created = session_for(worker.id);
        store.create_session(&created).await.unwrap();
        assert!(store.abandon_session(&created.id, OffsetDateTime::now_utc()).await.unwrap());

        let active = session_for(worker.id);
        store.create_session(&active).await.unwrap();
        store
            .update_session_status(&active.id, SessionStatus::Created, SessionStatus::Active, None)
            .await
            .unwrap();
        assert!(store.abandon_session(&active.id, OffsetDateTime::now_utc()).await.unwrap());

        // Terminal sessions stay put, and a late activation cannot revive them
        assert!(!store.abandon_session(&created.id, OffsetDateTime::now_utc()).await.unwrap());
        assert!(!store
            .update_session_status(&created.id, SessionStatus::Created, SessionStatus::Active, None)
            .await
            .unwrap());

        let stored = store.get_session(&created.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Abandoned);
        assert!(stored.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_injected_message_failure() {
        let store = MemoryStore::new();
        let worker = store.create_worker("dee", "Dee", "hash").await.unwrap();
        let session = session_for(worker.id);
        store.create_session(&session).await.unwrap();

        store.set_fail_message_writes(true);
        let result = store.insert_message(&text_message(&session.id, 1)).await;
        assert!(matches!(result, Err(BrokerError::Persistence(_))));
    }

    #[tokio::test]
    async fn test_rating_once_per_room() {
        let store = MemoryStore::new();
        let rating = Rating {
            id: Uuid::new_v4(),
            room_id: RoomId::from("room_r"),
            worker_id: WorkerId::new(),
            rating: 5,
            comment: None,
            created_at: OffsetDateTime::now_utc(),
        };
        store.create_rating(&rating).await.unwrap();
        assert!(matches!(
            store.create_rating(&rating).await,
            Err(BrokerError::Conflict(_))
        ));
    }
}
