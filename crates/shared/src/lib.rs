//! Deskline Shared Types and Utilities
//!
//! This crate contains the domain types, errors, and the durable record store
//! shared across the Deskline broker.

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use db::*;
pub use error::*;
pub use store::{MemoryStore, NewCallback, PgStore, RecordStore};
pub use types::*;
