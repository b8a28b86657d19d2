//! Credential check against the record store

use std::sync::Arc;

use deskline_shared::{BrokerError, RecordStore, WorkerId};

use super::password::{verify_password, PasswordError, DUMMY_HASH};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid username or password")]
    InvalidCredentials,
    #[error(transparent)]
    Password(#[from] PasswordError),
    #[error(transparent)]
    Store(#[from] BrokerError),
}

/// Resolves worker credentials to an identity
#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn RecordStore>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Verify a username and password; returns the worker id on success
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<WorkerId, AuthError> {
        let username = username.trim();

        let Some(worker) = self.store.find_worker_by_username(username).await? else {
            // Burn a verification so unknown usernames take as long as wrong passwords
            let _ = verify_password(password, DUMMY_HASH);
            tracing::debug!(username = %username, "Login for unknown worker");
            return Err(AuthError::InvalidCredentials);
        };

        if !verify_password(password, &worker.password_hash)? {
            tracing::warn!(worker_id = %worker.id, "Login with wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        Ok(worker.id)
    }
}
