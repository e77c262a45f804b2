//! Shared Redis connection setup.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{Client, RedisError};

use turnstile_core::StoreError;

/// Redis connection configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Prepended to every key so several deployments can share one server
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout: Duration::from_secs(5),
            key_prefix: "turnstile".to_string(),
        }
    }
}

impl RedisConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            connect_timeout: Duration::from_secs(
                std::env::var("REDIS_CONNECT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            key_prefix: std::env::var("STORE_KEY_PREFIX")
                .unwrap_or_else(|_| "turnstile".to_string()),
        }
    }

    pub fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.key_prefix, suffix)
    }
}

/// Open a managed connection, giving up after `connect_timeout`.
///
/// The manager reconnects on its own; clone it per operation.
pub async fn connect(config: &RedisConfig) -> Result<ConnectionManager, StoreError> {
    let client =
        Client::open(config.url.as_str()).map_err(|e| StoreError::Connection(e.to_string()))?;

    // Use timeout to prevent hanging if Redis is unreachable
    let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
        .await
        .map_err(|_| StoreError::Connection("Connection timed out".to_string()))?
        .map_err(|e| StoreError::Connection(e.to_string()))?;

    tracing::info!(url = %config.url, prefix = %config.key_prefix, "Connected to Redis");
    Ok(conn)
}

pub(crate) fn store_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Operation(e.to_string())
    }
}

pub(crate) fn json_error(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Connection to a throwaway prefix, or `None` when Redis is not running.
    pub async fn test_connection(name: &str) -> Option<(ConnectionManager, RedisConfig)> {
        let config = RedisConfig {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6389".to_string()),
            connect_timeout: Duration::from_secs(1),
            key_prefix: format!("turnstile-test:{name}:{}", uuid::Uuid::new_v4()),
        };
        let conn = connect(&config).await.ok()?;
        Some((conn, config))
    }
}
