//! WebSocket event types and serialization
//!
//! Defines all client-to-server and server-to-client event types.
//! Every frame is `{"event": "<kebab-name>", "data": {...camelCase fields}}`.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use deskline_shared::{
    Attachment, Availability, ContentKind, CustomerId, DeliveryStatus, MessageContent, MessageId,
    MessageRecord, RoomId, SenderRole, WorkerId,
};

use super::connection::ConnectionId;

// =============================================================================
// Client-to-Server Events
// =============================================================================

/// Events sent from client to server
#[derive(Debug, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Worker announces itself on this connection
    WorkerJoin { worker_id: WorkerId },

    /// Customer joins the room it was admitted to
    CustomerJoin { customer_id: CustomerId, room_id: RoomId },

    /// Chat message submission
    SendMessage {
        room_id: RoomId,
        #[serde(default)]
        message: Option<String>,
        sender: SenderRole,
        sender_id: String,
        #[serde(default = "default_message_type")]
        message_type: ContentKind,
        #[serde(default)]
        file_data: Option<FileData>,
        /// Client-side correlation id echoed back on failure
        #[serde(default)]
        client_message_id: Option<String>,
    },

    TypingStart { room_id: RoomId, sender: SenderRole },

    TypingStop { room_id: RoomId, sender: SenderRole },

    /// Receiver observed a message
    MessageRead { room_id: RoomId, message_id: MessageId },

    /// Graceful close of the conversation
    EndChat {
        room_id: RoomId,
        #[serde(default)]
        worker_id: Option<WorkerId>,
    },

    /// Heartbeat ping to keep connection alive
    Ping,
}

fn default_message_type() -> ContentKind {
    ContentKind::Text
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Events sent from server to client
#[derive(Debug, Serialize, Clone)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Connection acknowledged
    Connected { connection_id: ConnectionId },

    /// Worker availability changed
    WorkerState {
        worker_id: WorkerId,
        availability: Availability,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
    },

    /// A customer was matched to the receiving worker
    NewChat { room_id: RoomId, customer_id: CustomerId },

    /// Both parties have joined
    ChatActive { room_id: RoomId },

    NewMessage(MessageEvent),

    MessageStatusUpdate {
        room_id: RoomId,
        message_id: MessageId,
        status: DeliveryStatus,
    },

    UserTyping {
        room_id: RoomId,
        sender: SenderRole,
        typing: bool,
    },

    ChatEnded { room_id: RoomId, message: String },

    CustomerDisconnected { room_id: RoomId, message: String },

    WorkerDisconnected { room_id: RoomId, message: String },

    /// The sender's message could not be stored and was not delivered
    MessageFailed {
        room_id: RoomId,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_message_id: Option<String>,
        reason: String,
    },

    /// Error message
    Error { message: String },

    /// Heartbeat response
    Pong,
}

impl ServerEvent {
    /// Wire name of the event, for logging
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::WorkerState { .. } => "worker-state",
            ServerEvent::NewChat { .. } => "new-chat",
            ServerEvent::ChatActive { .. } => "chat-active",
            ServerEvent::NewMessage(_) => "new-message",
            ServerEvent::MessageStatusUpdate { .. } => "message-status-update",
            ServerEvent::UserTyping { .. } => "user-typing",
            ServerEvent::ChatEnded { .. } => "chat-ended",
            ServerEvent::CustomerDisconnected { .. } => "customer-disconnected",
            ServerEvent::WorkerDisconnected { .. } => "worker-disconnected",
            ServerEvent::MessageFailed { .. } => "message-failed",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Pong => "pong",
        }
    }
}

// =============================================================================
// Event Data Structures
// =============================================================================

/// Attachment payload as sent by clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub url: String,
    pub name: String,
    pub size: i64,
    #[serde(alias = "mimeType")]
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl FileData {
    pub fn into_attachment(self) -> Attachment {
        Attachment {
            url: self.url,
            name: self.name,
            size: self.size,
            mime: self.mime,
        }
    }
}

/// Message event data
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub id: MessageId,
    pub room_id: RoomId,
    pub message: String,
    pub sender: SenderRole,
    pub sender_id: String,
    pub message_type: ContentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_data: Option<FileData>,
    pub status: DeliveryStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl From<&MessageRecord> for MessageEvent {
    fn from(record: &MessageRecord) -> Self {
        let file_data = record.content.attachment().map(|a| FileData {
            url: a.url.clone(),
            name: a.name.clone(),
            size: a.size,
            mime: a.mime.clone(),
            duration: record.content.duration_secs(),
        });
        let message = match &record.content {
            MessageContent::Text { text } => text.clone(),
            _ => String::new(),
        };

        MessageEvent {
            id: record.id,
            room_id: record.room_id.clone(),
            message,
            sender: record.sender_role,
            sender_id: record.sender_id.clone(),
            message_type: record.content.kind(),
            file_data,
            status: record.status,
            timestamp: record.created_at,
        }
    }
}
