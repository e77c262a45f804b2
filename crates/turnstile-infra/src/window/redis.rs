//! Redis window store: one sorted set per key, scored by epoch millis.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use turnstile_core::StoreError;
use turnstile_core::domain::WindowHit;
use turnstile_core::ports::WindowStore;

use crate::connection::{RedisConfig, connect, store_error};

/// Redis-backed sliding log shared by every process.
pub struct RedisWindowStore {
    conn: ConnectionManager,
    config: RedisConfig,
    /// Lua script for atomic prune + insert + expire + read
    script: Script,
}

impl RedisWindowStore {
    pub async fn new(config: RedisConfig) -> Result<Self, StoreError> {
        let conn = connect(&config).await?;
        Ok(Self::with_connection(conn, config))
    }

    pub fn with_connection(conn: ConnectionManager, config: RedisConfig) -> Self {
        // Returns the scores left in the window, ascending
        let script = Script::new(
            r#"
            local key = KEYS[1]
            local now = tonumber(ARGV[1])
            local window = tonumber(ARGV[2])

            redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
            redis.call('ZADD', key, now, ARGV[3])
            redis.call('PEXPIRE', key, window)

            local entries = redis.call('ZRANGE', key, 0, -1, 'WITHSCORES')
            local scores = {}
            for i = 2, #entries, 2 do
                scores[#scores + 1] = tonumber(entries[i])
            end
            return scores
            "#,
        );

        Self {
            conn,
            config,
            script,
        }
    }

    fn make_key(&self, key: &str) -> String {
        self.config.key(key)
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn hit(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<WindowHit, StoreError> {
        let mut conn = self.conn.clone();
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());

        let timestamps: Vec<i64> = self
            .script
            .key(self.make_key(key))
            .arg(now_ms)
            .arg(window_ms)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;

        Ok(WindowHit {
            count: timestamps.len() as u64,
            timestamps,
        })
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.make_key(key))
            .await
            .map_err(store_error)
    }

    /// Keys carry a PEXPIRE of one window, so Redis evicts idle keys itself.
    async fn purge_expired(&self, _now_ms: i64) -> Result<usize, StoreError> {
        Ok(0)
    }
}
