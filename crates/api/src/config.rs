//! Application configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::broker::BrokerConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub cors_allowed_origins: Vec<String>,

    // Database (absent selects the in-memory store)
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // Authentication
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,

    // Broker
    pub delivered_delay_ms: u64,
    pub typing_timeout_ms: u64,
    pub customer_idle_timeout_secs: u64,
    pub join_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_message_length: usize,

    // Collaborators
    pub blob_store_url: Option<String>,
    pub max_upload_bytes: usize,
    pub notify_webhook_url: Option<String>,
}

/// Parse a numeric variable, falling back to `default` when unset or invalid
fn parse_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Optional string variable; empty counts as unset
fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            cors_allowed_origins: optional("CORS_ALLOWED_ORIGINS")
                .map(|origins| {
                    origins
                        .split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_default(),

            // Database
            database_url: optional("DATABASE_URL"),
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10),

            // Authentication
            jwt_secret: {
                let secret = env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret("JWT_SECRET must be at least 32 characters"));
                }
                secret
            },
            jwt_expiry_hours: parse_or("JWT_EXPIRY_HOURS", 12),

            // Broker
            delivered_delay_ms: parse_or("DELIVERED_DELAY_MS", 500),
            typing_timeout_ms: parse_or("TYPING_TIMEOUT_MS", 3000),
            customer_idle_timeout_secs: parse_or("CUSTOMER_IDLE_TIMEOUT_SECS", 1800),
            join_timeout_secs: parse_or("JOIN_TIMEOUT_SECS", 120),
            sweep_interval_secs: parse_or("SWEEP_INTERVAL_SECS", 15),
            max_message_length: parse_or("MAX_MESSAGE_LENGTH", 5000),

            // Collaborators
            blob_store_url: optional("BLOB_STORE_URL"),
            max_upload_bytes: parse_or("MAX_UPLOAD_BYTES", 10 * 1024 * 1024),
            notify_webhook_url: optional("NOTIFY_WEBHOOK_URL"),
        })
    }

    /// Broker timings and limits
    pub fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            delivered_delay: Duration::from_millis(self.delivered_delay_ms),
            typing_timeout: Duration::from_millis(self.typing_timeout_ms),
            customer_idle_timeout: Duration::from_secs(self.customer_idle_timeout_secs),
            join_timeout: Duration::from_secs(self.join_timeout_secs),
            max_message_length: self.max_message_length,
            ..BrokerConfig::default()
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}
