//! Round-robin rotation counters.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use turnstile_core::StoreError;
use turnstile_core::ports::RotationCounter;

/// Process-local counters.
pub struct InMemoryRotationCounter {
    counters: Mutex<HashMap<String, u64>>,
}

impl InMemoryRotationCounter {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryRotationCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RotationCounter for InMemoryRotationCounter {
    async fn next(&self, name: &str) -> Result<u64, StoreError> {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(name.to_string()).or_insert(0);
        let current = *counter;
        *counter = counter.wrapping_add(1);
        Ok(current)
    }
}

#[cfg(feature = "redis")]
pub use self::redis_counter::RedisRotationCounter;

#[cfg(feature = "redis")]
mod redis_counter {
    use async_trait::async_trait;
    use redis::AsyncCommands;
    use redis::aio::ConnectionManager;

    use turnstile_core::StoreError;
    use turnstile_core::ports::RotationCounter;

    use crate::connection::{RedisConfig, connect, store_error};

    /// INCR-based counter shared by every router instance.
    pub struct RedisRotationCounter {
        conn: ConnectionManager,
        config: RedisConfig,
    }

    impl RedisRotationCounter {
        pub async fn new(config: RedisConfig) -> Result<Self, StoreError> {
            let conn = connect(&config).await?;
            Ok(Self::with_connection(conn, config))
        }

        pub fn with_connection(conn: ConnectionManager, config: RedisConfig) -> Self {
            Self { conn, config }
        }
    }

    #[async_trait]
    impl RotationCounter for RedisRotationCounter {
        async fn next(&self, name: &str) -> Result<u64, StoreError> {
            let mut conn = self.conn.clone();
            let value: u64 = conn
                .incr(self.config.key(name), 1u64)
                .await
                .map_err(store_error)?;
            Ok(value.saturating_sub(1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_are_independent() {
        let counter = InMemoryRotationCounter::new();
        assert_eq!(counter.next("a").await.unwrap(), 0);
        assert_eq!(counter.next("a").await.unwrap(), 1);
        assert_eq!(counter.next("b").await.unwrap(), 0);
    }
}
