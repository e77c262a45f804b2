//! Redis activity log backed by sorted sets.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use turnstile_core::StoreError;
use turnstile_core::ports::ActivityLog;

use crate::connection::{RedisConfig, connect, store_error};

pub struct RedisActivityLog {
    conn: ConnectionManager,
    config: RedisConfig,
}

impl RedisActivityLog {
    pub async fn new(config: RedisConfig) -> Result<Self, StoreError> {
        let conn = connect(&config).await?;
        Ok(Self::with_connection(conn, config))
    }

    pub fn with_connection(conn: ConnectionManager, config: RedisConfig) -> Self {
        Self { conn, config }
    }
}

#[async_trait]
impl ActivityLog for RedisActivityLog {
    async fn append(
        &self,
        key: &str,
        member: Option<&str>,
        at_ms: i64,
        retention_ms: i64,
    ) -> Result<(), StoreError> {
        let key = self.config.key(key);
        let member = match member {
            Some(m) => m.to_string(),
            None => format!("{}-{}", at_ms, uuid::Uuid::new_v4()),
        };

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .zadd(&key, member, at_ms)
            .ignore()
            .zrembyscore(&key, "-inf", at_ms - retention_ms)
            .ignore()
            .pexpire(&key, retention_ms)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn count_since(&self, key: &str, since_ms: i64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        conn.zcount(self.config.key(key), since_ms, "+inf")
            .await
            .map_err(store_error)
    }

    async fn timestamps_since(&self, key: &str, since_ms: i64) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, f64)> = conn
            .zrangebyscore_withscores(self.config.key(key), since_ms, "+inf")
            .await
            .map_err(store_error)?;
        Ok(entries.into_iter().map(|(_, score)| score as i64).collect())
    }

    /// Every key carries a PEXPIRE of its retention.
    async fn purge_expired(&self, _now_ms: i64) -> Result<usize, StoreError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::test_connection;

    #[tokio::test]
    async fn test_redis_activity_counts() {
        let (conn, config) = match test_connection("activity").await {
            Some(c) => c,
            None => return,
        };
        let log = RedisActivityLog::with_connection(conn, config);

        log.append("ua", Some("10.0.0.1"), 1_000, 60_000).await.unwrap();
        log.append("ua", Some("10.0.0.1"), 2_000, 60_000).await.unwrap();
        log.append("ua", Some("10.0.0.2"), 3_000, 60_000).await.unwrap();
        assert_eq!(log.count_since("ua", 0).await.unwrap(), 2);

        log.append("ip", None, 1_000, 60_000).await.unwrap();
        log.append("ip", None, 1_000, 60_000).await.unwrap();
        assert_eq!(
            log.timestamps_since("ip", 0).await.unwrap(),
            vec![1_000, 1_000]
        );
    }
}
