//! Deskline API Library
//!
//! Session broker, websocket transport and HTTP surface of the Deskline
//! live-support server.

pub mod auth;
pub mod blob_store;
pub mod broker;
pub mod config;
pub mod error;
pub mod notifications;
pub mod routes;
pub mod state;
pub mod websocket;

pub use broker::Broker;
pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
