//! Message pipeline
//!
//! submit: validate, number, persist, fan out, then mark delivered after a
//! fixed delay. Delivery status only moves forward (sent, delivered, read).
//! A message that cannot be stored is never broadcast; only the sender hears
//! about the failure.

use time::OffsetDateTime;

use deskline_shared::{
    BrokerError, BrokerResult, ContentKind, DeliveryStatus, MessageContent, MessageId, MessageRecord,
    RoomId, SenderRole,
};

use super::{Broker, Party};
use crate::notifications::NotificationEvent;
use crate::websocket::events::{FileData, MessageEvent, ServerEvent};

/// A validated message ready for the pipeline
#[derive(Debug, Clone)]
pub struct Submission {
    pub room_id: RoomId,
    pub sender: SenderRole,
    pub content: MessageContent,
}

/// Build typed content from the loose wire fields
pub fn content_from_wire(
    kind: ContentKind,
    message: Option<String>,
    file_data: Option<FileData>,
    max_length: usize,
) -> BrokerResult<MessageContent> {
    match kind {
        ContentKind::Text => {
            let text = message.unwrap_or_default();
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Err(BrokerError::Validation("Message cannot be empty".to_string()));
            }
            if trimmed.chars().count() > max_length {
                return Err(BrokerError::Validation(format!(
                    "Message exceeds {} characters",
                    max_length
                )));
            }
            Ok(MessageContent::Text {
                text: trimmed.to_string(),
            })
        }
        ContentKind::Image | ContentKind::File | ContentKind::Voice => {
            let file = file_data
                .ok_or_else(|| BrokerError::Validation(format!("{} message requires fileData", kind)))?;
            if file.url.is_empty() {
                return Err(BrokerError::Validation("fileData.url is required".to_string()));
            }
            let duration = file.duration;
            let attachment = file.into_attachment();
            Ok(match kind {
                ContentKind::Image => MessageContent::Image { attachment },
                ContentKind::File => MessageContent::File { attachment },
                _ => MessageContent::Voice {
                    attachment,
                    duration_secs: duration.unwrap_or(0.0),
                },
            })
        }
    }
}

impl Broker {
    /// Accept a message from a participant of an active room
    pub async fn submit(&self, party: Party, submission: Submission) -> BrokerResult<MessageRecord> {
        let Submission {
            room_id,
            sender,
            content,
        } = submission;

        if sender != party.role() {
            return Err(BrokerError::Validation(format!(
                "sender {} does not match the connection",
                sender
            )));
        }

        let id = self.sessions.next_message_id(&room_id, party).await?;
        let record = MessageRecord {
            id,
            room_id: room_id.clone(),
            sender_role: sender,
            sender_id: party.sender_id(),
            content,
            status: DeliveryStatus::Sent,
            created_at: OffsetDateTime::now_utc(),
        };

        if let Err(e) = self.store.insert_message(&record).await {
            self.sessions.forget_message(&room_id, id).await;
            tracing::error!(
                room_id = %room_id,
                message_id = %id,
                error = %e,
                "Failed to persist message; not delivered"
            );
            return Err(match e {
                BrokerError::Persistence(_) => e,
                other => BrokerError::Persistence(other.to_string()),
            });
        }

        self.ws
            .rooms
            .broadcast(&room_id, ServerEvent::NewMessage(MessageEvent::from(&record)))
            .await;

        self.schedule_delivered(room_id.clone(), id);

        match party {
            Party::Worker(worker_id) => {
                if let Err(e) = self.store.touch_worker(worker_id).await {
                    tracing::warn!(worker_id = %worker_id, error = %e, "Failed to touch worker");
                }
            }
            Party::Customer(customer_id) => self.customers.touch(customer_id).await,
        }

        self.notifier.notify(NotificationEvent::NewMessage {
            room_id,
            message_id: id,
            sender,
            preview: record.content.body().chars().take(120).collect(),
        });

        Ok(record)
    }

    /// Fixed-delay stand-in for a delivery acknowledgment
    fn schedule_delivered(&self, room_id: RoomId, message_id: MessageId) {
        let broker = self.clone();
        let delay = self.config.delivered_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = broker
                .advance_status(&room_id, message_id, DeliveryStatus::Delivered)
                .await
            {
                tracing::debug!(room_id = %room_id, message_id = %message_id, error = %e, "Delivered update skipped");
            }
        });
    }

    /// Receiver observed a message. Repeats and reads of one's own messages
    /// are silently ignored.
    pub async fn mark_read(&self, party: Party, room_id: &RoomId, message_id: MessageId) -> BrokerResult<()> {
        let session = self
            .sessions
            .get(room_id)
            .await
            .ok_or_else(|| BrokerError::NotFound(format!("room {}", room_id)))?;
        if !session.involves(party) {
            return Err(BrokerError::Unauthorized);
        }

        let (sender, status) = self
            .sessions
            .message_status(room_id, message_id)
            .await
            .ok_or_else(|| BrokerError::NotFound(format!("message {} in {}", message_id, room_id)))?;

        if sender == party.role() || status == DeliveryStatus::Read {
            return Ok(());
        }

        self.advance_status(room_id, message_id, DeliveryStatus::Read).await?;
        if let Party::Customer(customer_id) = party {
            self.customers.touch(customer_id).await;
        }
        Ok(())
    }

    /// Move a message forward, store first, then broadcast. Returns false
    /// when the message was already at or past `to`.
    pub(crate) async fn advance_status(
        &self,
        room_id: &RoomId,
        message_id: MessageId,
        to: DeliveryStatus,
    ) -> BrokerResult<bool> {
        let Some((_, current)) = self.sessions.message_status(room_id, message_id).await else {
            return Ok(false);
        };
        if current.advance(to).is_none() {
            return Ok(false);
        }

        if !self.store.update_message_status(room_id, message_id, to).await? {
            return Ok(false);
        }
        if !self.sessions.advance_message(room_id, message_id, to).await {
            return Ok(false);
        }

        self.ws
            .rooms
            .broadcast(
                room_id,
                ServerEvent::MessageStatusUpdate {
                    room_id: room_id.clone(),
                    message_id,
                    status: to,
                },
            )
            .await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::matching::Admission;
    use crate::broker::testing::{harness_with, Harness, TestConn};
    use crate::broker::BrokerConfig;
    use deskline_shared::{CustomerId, RecordStore, WorkerId};
    use std::time::Duration;

    struct ActiveRoom {
        worker: WorkerId,
        customer: CustomerId,
        room_id: RoomId,
        worker_conn: TestConn,
        customer_conn: TestConn,
    }

    fn slow_delivery() -> Harness {
        harness_with(BrokerConfig {
            delivered_delay: Duration::from_millis(500),
            ..BrokerConfig::default()
        })
    }

    async fn active_room(h: &Harness) -> ActiveRoom {
        let (worker, mut worker_conn) = h.online_worker("ada").await;
        let Admission::Connected { customer_id, room_id, .. } = h.broker.admit_customer(None).await.unwrap() else {
            panic!("expected a match");
        };
        let mut customer_conn = h.connect(None).await;
        h.broker.customer_join(customer_id, &room_id, &customer_conn.conn).await.unwrap();
        worker_conn.drain();
        customer_conn.drain();
        ActiveRoom {
            worker,
            customer: customer_id,
            room_id,
            worker_conn,
            customer_conn,
        }
    }

    fn text(room_id: &RoomId, sender: SenderRole, body: &str) -> Submission {
        Submission {
            room_id: room_id.clone(),
            sender,
            content: MessageContent::Text { text: body.to_string() },
        }
    }

    fn statuses(events: &[ServerEvent]) -> Vec<DeliveryStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::MessageStatusUpdate { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_content_from_wire() {
        assert!(matches!(
            content_from_wire(ContentKind::Text, Some("  ".to_string()), None, 10),
            Err(BrokerError::Validation(_))
        ));
        assert!(matches!(
            content_from_wire(ContentKind::Text, Some("x".repeat(11)), None, 10),
            Err(BrokerError::Validation(_))
        ));
        assert!(matches!(
            content_from_wire(ContentKind::Image, None, None, 10),
            Err(BrokerError::Validation(_))
        ));

        let voice = content_from_wire(
            ContentKind::Voice,
            None,
            Some(FileData {
                url: "https://blobs/v".to_string(),
                name: "v.webm".to_string(),
                size: 100,
                mime: "audio/webm".to_string(),
                duration: Some(3.5),
            }),
            10,
        )
        .unwrap();
        assert_eq!(voice.kind(), ContentKind::Voice);
        assert_eq!(voice.duration_secs(), Some(3.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_fans_out_then_delivers() {
        let h = slow_delivery();
        let mut room = active_room(&h).await;

        let record = h
            .broker
            .submit(
                Party::Customer(room.customer),
                text(&room.room_id, SenderRole::Customer, "hi"),
            )
            .await
            .unwrap();
        assert_eq!(record.id, MessageId(1));

        for conn in [&mut room.worker_conn, &mut room.customer_conn] {
            let events = conn.drain();
            assert_eq!(events.len(), 1);
            match &events[0] {
                ServerEvent::NewMessage(m) => {
                    assert_eq!(m.message, "hi");
                    assert_eq!(m.status, DeliveryStatus::Sent);
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(statuses(&room.worker_conn.drain()), vec![DeliveryStatus::Delivered]);
        assert_eq!(statuses(&room.customer_conn.drain()), vec![DeliveryStatus::Delivered]);

        let stored = h.store.list_messages(&room.room_id, 10).await.unwrap();
        assert_eq!(stored[0].status, DeliveryStatus::Delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_is_final_and_idempotent() {
        let h = slow_delivery();
        let mut room = active_room(&h).await;

        let record = h
            .broker
            .submit(
                Party::Customer(room.customer),
                text(&room.room_id, SenderRole::Customer, "hi"),
            )
            .await
            .unwrap();

        // Read before the delivered timer fires
        h.broker
            .mark_read(Party::Worker(room.worker), &room.room_id, record.id)
            .await
            .unwrap();
        h.broker
            .mark_read(Party::Worker(room.worker), &room.room_id, record.id)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;

        // Delivered never follows read
        assert_eq!(statuses(&room.customer_conn.drain()), vec![DeliveryStatus::Read]);
        let stored = h.store.list_messages(&room.room_id, 10).await.unwrap();
        assert_eq!(stored[0].status, DeliveryStatus::Read);
        assert!(!h
            .broker
            .advance_status(&room.room_id, record.id, DeliveryStatus::Delivered)
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_cannot_mark_own_message_read() {
        let h = slow_delivery();
        let mut room = active_room(&h).await;

        let record = h
            .broker
            .submit(Party::Worker(room.worker), text(&room.room_id, SenderRole::Worker, "hello"))
            .await
            .unwrap();
        room.customer_conn.drain();

        h.broker
            .mark_read(Party::Worker(room.worker), &room.room_id, record.id)
            .await
            .unwrap();
        assert!(statuses(&room.customer_conn.drain()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_increase_within_room() {
        let h = slow_delivery();
        let room = active_room(&h).await;

        let mut last = MessageId(0);
        for (party, role) in [
            (Party::Customer(room.customer), SenderRole::Customer),
            (Party::Worker(room.worker), SenderRole::Worker),
            (Party::Customer(room.customer), SenderRole::Customer),
        ] {
            let record = h.broker.submit(party, text(&room.room_id, role, "m")).await.unwrap();
            assert!(record.id > last);
            last = record.id;
        }

        let stored = h.store.get_session(&room.room_id).await.unwrap().unwrap();
        assert_eq!(stored.message_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_failure_is_not_broadcast() {
        let h = slow_delivery();
        let mut room = active_room(&h).await;
        h.store.set_fail_message_writes(true);

        let result = h
            .broker
            .submit(
                Party::Customer(room.customer),
                text(&room.room_id, SenderRole::Customer, "lost"),
            )
            .await;
        assert!(matches!(result, Err(BrokerError::Persistence(_))));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(room.worker_conn.drain().is_empty());
        assert!(room.customer_conn.drain().is_empty());

        // The pipeline recovers once the store does
        h.store.set_fail_message_writes(false);
        h.broker
            .submit(
                Party::Customer(room.customer),
                text(&room.room_id, SenderRole::Customer, "again"),
            )
            .await
            .unwrap();
        assert_eq!(room.worker_conn.names(), vec!["new-message"]);
    }

    #[tokio::test]
    async fn test_submit_rejects_wrong_role_and_inactive_room() {
        let h = slow_delivery();
        let (worker, _conn) = h.online_worker("ada").await;
        let Admission::Connected { customer_id, room_id, .. } = h.broker.admit_customer(None).await.unwrap() else {
            panic!("expected a match");
        };

        // Room is still created
        assert!(matches!(
            h.broker
                .submit(Party::Worker(worker), text(&room_id, SenderRole::Worker, "early"))
                .await,
            Err(BrokerError::InvalidSessionState { .. })
        ));

        assert!(matches!(
            h.broker
                .submit(Party::Customer(customer_id), text(&room_id, SenderRole::Worker, "spoof"))
                .await,
            Err(BrokerError::Validation(_))
        ));
    }
}
