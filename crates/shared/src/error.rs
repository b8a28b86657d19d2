//! Error types for Deskline

use thiserror::Error;

use crate::types::{ParseEnumError, RoomId, SessionStatus};

/// Broker error taxonomy.
///
/// `NoWorkerAvailable` is an expected outcome rather than a fault; callers
/// turn it into a callback offer.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Compare-and-set precondition did not hold (e.g. double assignment)
    #[error("State conflict: {0}")]
    Conflict(String),

    #[error("No worker available")]
    NoWorkerAvailable,

    #[error("Invalid session state for {room_id}: {status}")]
    InvalidSessionState { room_id: RoomId, status: SessionStatus },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl BrokerError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invalid_state(room_id: &RoomId, status: SessionStatus) -> Self {
        Self::InvalidSessionState {
            room_id: room_id.clone(),
            status,
        }
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => BrokerError::NotFound("record".to_string()),
            other => BrokerError::Persistence(other.to_string()),
        }
    }
}

impl From<ParseEnumError> for BrokerError {
    fn from(err: ParseEnumError) -> Self {
        BrokerError::Persistence(err.to_string())
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
