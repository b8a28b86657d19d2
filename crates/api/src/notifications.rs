//! Fire-and-forget notifications
//!
//! The broker emits events here for sound cues and external alerting. Delivery
//! is never awaited by the caller.

use std::time::Duration;

use serde::Serialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use deskline_shared::{CustomerId, MessageId, RoomId, SenderRole, WorkerId};

/// Events posted to the notification collaborator
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum NotificationEvent {
    NewSession {
        room_id: RoomId,
        customer_id: CustomerId,
        worker_id: WorkerId,
    },
    NewMessage {
        room_id: RoomId,
        message_id: MessageId,
        sender: SenderRole,
        preview: String,
    },
    RatingReceived {
        room_id: RoomId,
        worker_id: WorkerId,
        rating: i16,
    },
}

pub trait Notifier: Send + Sync {
    /// Hand off an event; must not block the caller
    fn notify(&self, event: NotificationEvent);
}

/// Discards every event
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: NotificationEvent) {}
}

const MAX_RETRIES: usize = 3;
const RETRY_FACTOR_MS: u64 = 100;
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts events as JSON to a webhook
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
    retries: usize,
    factor_ms: u64,
}

impl WebhookNotifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            client,
            webhook_url,
            retries: MAX_RETRIES,
            factor_ms: RETRY_FACTOR_MS,
        }
    }

    #[cfg(test)]
    fn with_retry(mut self, retries: usize, factor_ms: u64) -> Self {
        self.retries = retries;
        self.factor_ms = factor_ms;
        self
    }

    /// Deliver one event, retrying transient failures with backoff
    pub async fn deliver(&self, event: &NotificationEvent) -> Result<(), reqwest::Error> {
        let Some(url) = self.webhook_url.as_deref() else {
            return Ok(());
        };

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.factor_ms)
            .max_delay(RETRY_MAX_DELAY)
            .take(self.retries)
            .map(jitter);

        Retry::spawn(strategy, || async {
            self.client
                .post(url)
                .json(event)
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .map(|_| ())
        })
        .await
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, event: NotificationEvent) {
        if self.webhook_url.is_none() {
            return;
        }

        let notifier = self.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.deliver(&event).await {
                tracing::warn!(error = %e, event = ?event, "Notification webhook failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn new_session() -> NotificationEvent {
        NotificationEvent::NewSession {
            room_id: RoomId::from("room_a"),
            customer_id: CustomerId::new(),
            worker_id: WorkerId::new(),
        }
    }

    #[test]
    fn test_event_envelope() {
        let event = NotificationEvent::RatingReceived {
            room_id: RoomId::from("room_a"),
            worker_id: WorkerId::new(),
            rating: 5,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "rating-received");
        assert_eq!(value["data"]["roomId"], "room_a");
        assert_eq!(value["data"]["rating"], 5);
    }

    #[tokio::test]
    async fn test_posts_event_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .match_body(Matcher::PartialJson(json!({
                "event": "new-session",
                "data": { "roomId": "room_a" }
            })))
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let notifier = WebhookNotifier::new(Some(format!("{}/hook", server.url())));
        notifier.deliver(&new_session()).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let notifier = WebhookNotifier::new(Some(format!("{}/hook", server.url()))).with_retry(2, 1);
        assert!(notifier.deliver(&new_session()).await.is_err());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unconfigured_is_noop() {
        let notifier = WebhookNotifier::new(None);
        notifier.deliver(&new_session()).await.unwrap();
        notifier.notify(new_session());
    }
}
