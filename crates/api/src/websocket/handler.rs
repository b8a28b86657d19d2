//! WebSocket handler for Axum
//!
//! Upgrades the connection, pumps outbound events and dispatches inbound
//! client events to the broker.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::Response,
};
use futures::{stream::StreamExt, SinkExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use deskline_shared::{BrokerError, WorkerId};

use crate::broker::{content_from_wire, Broker, Party, Submission};
use crate::state::AppState;

use super::{
    connection::Connection,
    events::{ClientEvent, ServerEvent},
};

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    /// Worker token; customers connect without one
    #[serde(default)]
    token: Option<String>,
}

/// WebSocket handler - upgrades HTTP connection to WebSocket
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
) -> Result<Response, StatusCode> {
    let worker_id = match params.token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => match state.jwt.validate_token(token) {
            Ok(claims) => Some(claims.worker_id()),
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket auth failed: invalid token");
                return Err(StatusCode::UNAUTHORIZED);
            }
        },
        None => None,
    };

    tracing::debug!(worker_id = ?worker_id, "WebSocket connection upgrade requested");

    let broker = state.broker.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, worker_id, broker)))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, worker_id: Option<WorkerId>, broker: Broker) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let conn = match worker_id {
        Some(id) => Connection::authenticated(id, tx),
        None => Connection::new(tx),
    };
    let conn = broker.ws().add_connection(conn).await;
    let connection_id = conn.id;

    let _ = conn.send(ServerEvent::Connected { connection_id });
    tracing::info!(connection_id = %connection_id, worker_id = ?worker_id, "WebSocket connected");

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, event = event.name(), "Failed to serialize WebSocket event");
                }
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(connection_id = %connection_id, error = %e, "WebSocket transport error");
                break;
            }
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => dispatch(&broker, &conn, event).await,
                Err(e) => {
                    tracing::warn!(connection_id = %connection_id, error = %e, "Failed to parse client event");
                    let _ = conn.send(ServerEvent::Error {
                        message: "Invalid event format".to_string(),
                    });
                }
            },
            Message::Close(_) => {
                tracing::debug!(connection_id = %connection_id, "WebSocket close frame received");
                break;
            }
            // Axum answers pings itself; binary frames are not part of the protocol
            _ => {}
        }
    }

    tracing::info!(connection_id = %connection_id, "WebSocket connection closing");
    broker.ws().remove_connection(connection_id).await;
    broker.connection_closed(&conn).await;

    send_task.abort();
}

/// Route one client event to the broker
pub(crate) async fn dispatch(broker: &Broker, conn: &Arc<Connection>, event: ClientEvent) {
    let party = conn.party().await;

    let result = match event {
        ClientEvent::WorkerJoin { worker_id } => broker.worker_connected(worker_id, conn).await.map(|_| ()),

        ClientEvent::CustomerJoin { customer_id, room_id } => {
            broker.customer_join(customer_id, &room_id, conn).await.map(|_| ())
        }

        ClientEvent::SendMessage {
            room_id,
            message,
            sender,
            sender_id,
            message_type,
            file_data,
            client_message_id,
        } => {
            let Some(party) = party else {
                return reject_unbound(conn);
            };
            if sender_id != party.sender_id() {
                tracing::debug!(
                    connection_id = %conn.id,
                    claimed = %sender_id,
                    "Ignoring client-supplied sender id"
                );
            }

            let submitted = match content_from_wire(message_type, message, file_data, broker.config().max_message_length) {
                Ok(content) => {
                    broker
                        .submit(
                            party,
                            Submission {
                                room_id: room_id.clone(),
                                sender,
                                content,
                            },
                        )
                        .await
                }
                Err(e) => Err(e),
            };

            match submitted {
                Err(BrokerError::Persistence(_)) => {
                    let _ = conn.send(ServerEvent::MessageFailed {
                        room_id,
                        client_message_id,
                        reason: "Message could not be saved".to_string(),
                    });
                    return;
                }
                other => other.map(|_| ()),
            }
        }

        ClientEvent::TypingStart { room_id, sender } => {
            let Some(party) = party else {
                return reject_unbound(conn);
            };
            broker.set_typing(party, &room_id, sender, true, conn.id).await
        }

        ClientEvent::TypingStop { room_id, sender } => {
            let Some(party) = party else {
                return reject_unbound(conn);
            };
            broker.set_typing(party, &room_id, sender, false, conn.id).await
        }

        ClientEvent::MessageRead { room_id, message_id } => {
            let Some(party) = party else {
                return reject_unbound(conn);
            };
            broker.mark_read(party, &room_id, message_id).await
        }

        ClientEvent::EndChat { room_id, worker_id } => {
            let Some(party) = party else {
                return reject_unbound(conn);
            };
            match (party, worker_id) {
                (Party::Worker(id), Some(claimed)) if id != claimed => Err(BrokerError::Unauthorized),
                _ => broker.end(&room_id, party, Some(conn.id)).await,
            }
        }

        ClientEvent::Ping => {
            let _ = conn.send(ServerEvent::Pong);
            Ok(())
        }
    };

    if let Err(e) = result {
        report(conn, e);
    }
}

fn reject_unbound(conn: &Connection) {
    let _ = conn.send(ServerEvent::Error {
        message: "Join a chat before sending events".to_string(),
    });
}

/// Apply the error policy for a failed client event
fn report(conn: &Connection, err: BrokerError) {
    match err {
        // The room is already torn down for the other party; drop the event
        BrokerError::InvalidSessionState { room_id, status } => {
            tracing::warn!(
                connection_id = %conn.id,
                room_id = %room_id,
                status = %status,
                "Dropped event for closed session"
            );
        }
        BrokerError::Conflict(msg) => {
            tracing::warn!(connection_id = %conn.id, conflict = %msg, "Dropped conflicting event");
        }
        BrokerError::Persistence(msg) => {
            tracing::error!(connection_id = %conn.id, error = %msg, "Event failed to persist");
            let _ = conn.send(ServerEvent::Error {
                message: "Temporary storage failure".to_string(),
            });
        }
        other => {
            tracing::debug!(connection_id = %conn.id, error = %other, "Rejected client event");
            let _ = conn.send(ServerEvent::Error {
                message: other.to_string(),
            });
        }
    }
}
