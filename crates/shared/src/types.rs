//! Common types used across Deskline

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Worker ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for WorkerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Customer ID wrapper. Customers are anonymous; the id is minted on admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerId(pub Uuid);

impl CustomerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CustomerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CustomerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Room (session) identifier, derived from the customer/worker pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    /// Derive the room id for a customer/worker pairing.
    ///
    /// The same pair always maps to the same room.
    pub fn derive(customer_id: CustomerId, worker_id: WorkerId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(customer_id.0.as_bytes());
        hasher.update(worker_id.0.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(format!("room_{}", &digest[..24]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Message identity, strictly increasing within a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Error returned when a stored enum value cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Worker availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Offline,
    Available,
    Busy,
}

string_enum!(Availability, "availability", {
    Offline => "offline",
    Available => "available",
    Busy => "busy",
});

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Durable record written, parties not yet both joined
    Created,
    Active,
    /// Closed gracefully by a party
    Ended,
    /// Closed because a party dropped
    Abandoned,
}

string_enum!(SessionStatus, "session status", {
    Created => "created",
    Active => "active",
    Ended => "ended",
    Abandoned => "abandoned",
});

/// Transitions of the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransition {
    Activate,
    End,
    Abandon,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Abandoned)
    }

    /// Status after applying `transition`, or `None` when the transition is
    /// not valid from the current status.
    pub fn apply(self, transition: SessionTransition) -> Option<SessionStatus> {
        match (self, transition) {
            (Self::Created, SessionTransition::Activate) => Some(Self::Active),
            (Self::Active, SessionTransition::End) => Some(Self::Ended),
            (Self::Created | Self::Active, SessionTransition::Abandon) => Some(Self::Abandoned),
            _ => None,
        }
    }
}

/// Who sent a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Customer,
    Worker,
    System,
}

string_enum!(SenderRole, "sender role", {
    Customer => "customer",
    Worker => "worker",
    System => "system",
});

/// Kind of message content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Image,
    File,
    Voice,
}

string_enum!(ContentKind, "content kind", {
    Text => "text",
    Image => "image",
    File => "file",
    Voice => "voice",
});

/// Message delivery status. Ordered: sent < delivered < read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

string_enum!(DeliveryStatus, "delivery status", {
    Sent => "sent",
    Delivered => "delivered",
    Read => "read",
});

impl DeliveryStatus {
    /// The new status if moving to `to` is a forward step, `None` otherwise.
    pub fn advance(self, to: DeliveryStatus) -> Option<DeliveryStatus> {
        (to > self).then_some(to)
    }
}

/// Callback request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    Pending,
    Contacted,
    Completed,
    Cancelled,
}

string_enum!(CallbackStatus, "callback status", {
    Pending => "pending",
    Contacted => "contacted",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl CallbackStatus {
    pub fn can_transition_to(&self, to: CallbackStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Contacted)
                | (Self::Contacted, Self::Completed)
                | (Self::Pending | Self::Contacted, Self::Cancelled)
        )
    }
}

// =============================================================================
// Message Content
// =============================================================================

/// Attachment descriptor returned by the blob store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    pub name: String,
    pub size: i64,
    pub mime: String,
}

/// Message payload, one variant per content kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageContent {
    Text { text: String },
    Image { attachment: Attachment },
    File { attachment: Attachment },
    #[serde(rename_all = "camelCase")]
    Voice { attachment: Attachment, duration_secs: f64 },
}

impl MessageContent {
    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Text { .. } => ContentKind::Text,
            Self::Image { .. } => ContentKind::Image,
            Self::File { .. } => ContentKind::File,
            Self::Voice { .. } => ContentKind::Voice,
        }
    }

    /// Text body; attachments carry their file name
    pub fn body(&self) -> &str {
        match self {
            Self::Text { text } => text,
            Self::Image { attachment } | Self::File { attachment } | Self::Voice { attachment, .. } => {
                &attachment.name
            }
        }
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        match self {
            Self::Text { .. } => None,
            Self::Image { attachment } | Self::File { attachment } | Self::Voice { attachment, .. } => {
                Some(attachment)
            }
        }
    }

    pub fn duration_secs(&self) -> Option<f64> {
        match self {
            Self::Voice { duration_secs, .. } => Some(*duration_secs),
            _ => None,
        }
    }

    /// Rebuild content from its stored columns
    pub fn from_parts(
        kind: ContentKind,
        body: String,
        attachment: Option<Attachment>,
        duration_secs: Option<f64>,
    ) -> Result<Self, ParseEnumError> {
        let missing = |what: &str| ParseEnumError {
            kind: "message content",
            value: format!("{} without {}", kind, what),
        };
        Ok(match kind {
            ContentKind::Text => Self::Text { text: body },
            ContentKind::Image => Self::Image {
                attachment: attachment.ok_or_else(|| missing("attachment"))?,
            },
            ContentKind::File => Self::File {
                attachment: attachment.ok_or_else(|| missing("attachment"))?,
            },
            ContentKind::Voice => Self::Voice {
                attachment: attachment.ok_or_else(|| missing("attachment"))?,
                duration_secs: duration_secs.unwrap_or(0.0),
            },
        })
    }
}

// =============================================================================
// Records
// =============================================================================

/// Worker record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub username: String,
    pub display_name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub availability: Availability,
    pub current_session: Option<RoomId>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Session (room) record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: RoomId,
    pub customer_id: CustomerId,
    pub worker_id: WorkerId,
    pub status: SessionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub message_count: i64,
}

/// Chat message record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_role: SenderRole,
    pub sender_id: String,
    pub content: MessageContent,
    pub status: DeliveryStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Callback request left by a customer when nobody was available
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRequest {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub message: Option<String>,
    pub status: CallbackStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Post-chat rating
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub id: Uuid,
    pub room_id: RoomId,
    pub worker_id: WorkerId,
    pub rating: i16,
    pub comment: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
