//! WebSocket transport
//!
//! - **Connection**: one socket, optionally carrying a verified worker identity
//! - **Room**: per-session fan-out
//! - **State**: registry of live connections
//! - **Handler**: Axum upgrade route and client event dispatch
//! - **Events**: the `{"event", "data"}` wire protocol

pub mod connection;
pub mod events;
pub mod handler;
pub mod room;
pub mod state;

pub use handler::ws_handler;
pub use state::WebSocketState;
