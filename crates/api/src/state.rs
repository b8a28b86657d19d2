//! Shared application state

use std::sync::Arc;

use deskline_shared::RecordStore;

use crate::{
    auth::{Authenticator, JwtManager},
    blob_store::BlobStore,
    broker::Broker,
    config::Config,
    notifications::Notifier,
};

/// State handed to every axum handler
#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    pub store: Arc<dyn RecordStore>,
    pub jwt: JwtManager,
    pub authenticator: Authenticator,
    /// Absent when no blob store is configured
    pub blob_store: Option<Arc<dyn BlobStore>>,
    pub notifier: Arc<dyn Notifier>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn RecordStore>,
        notifier: Arc<dyn Notifier>,
        blob_store: Option<Arc<dyn BlobStore>>,
    ) -> Self {
        let broker = Broker::new(store.clone(), notifier.clone(), config.broker());
        Self {
            broker,
            jwt: JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours),
            authenticator: Authenticator::new(store.clone()),
            store,
            blob_store,
            notifier,
            config: Arc::new(config),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::notifications::NoopNotifier;
    use deskline_shared::MemoryStore;

    pub const TEST_SECRET: &str = "test-jwt-secret-must-be-at-least-32-characters-long";

    pub fn test_config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".to_string(),
            cors_allowed_origins: Vec::new(),
            database_url: None,
            database_max_connections: 1,
            jwt_secret: TEST_SECRET.to_string(),
            jwt_expiry_hours: 1,
            delivered_delay_ms: 500,
            typing_timeout_ms: 3000,
            customer_idle_timeout_secs: 1800,
            join_timeout_secs: 120,
            sweep_interval_secs: 15,
            max_message_length: 5000,
            blob_store_url: None,
            max_upload_bytes: 1024,
            notify_webhook_url: None,
        }
    }

    /// State over a fresh in-memory store
    pub fn test_state(blob_store: Option<Arc<dyn BlobStore>>) -> (AppState, MemoryStore) {
        let store = MemoryStore::new();
        let state = AppState::new(test_config(), Arc::new(store.clone()), Arc::new(NoopNotifier), blob_store);
        (state, store)
    }
}
