//! Redis block store and cache.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use turnstile_core::StoreError;
use turnstile_core::domain::{BlockPlacement, BlockedIp};
use turnstile_core::ports::{BlockCache, BlockStore};

use crate::connection::{RedisConfig, connect, json_error, store_error};

const HISTORY_LIMIT: isize = 1_000;
/// Compare-and-set rounds before a contended placement gives up.
const PLACE_ATTEMPTS: usize = 16;

/// Durable block log: `block:{ip}` records, the `block:active` set and a
/// capped `block:history` list.
pub struct RedisBlockStore {
    conn: ConnectionManager,
    config: RedisConfig,
    compare_and_place: Script,
}

impl RedisBlockStore {
    pub async fn new(config: RedisConfig) -> Result<Self, StoreError> {
        let conn = connect(&config).await?;
        Ok(Self::with_connection(conn, config))
    }

    pub fn with_connection(conn: ConnectionManager, config: RedisConfig) -> Self {
        // KEYS: record, active set, history
        // ARGV: record json seen by the caller ('' for none), new json, ip,
        //       retired json ('' for none), history limit
        // Returns 0 when the record changed underneath the caller
        let compare_and_place = Script::new(
            r#"
            local current = redis.call('GET', KEYS[1]) or ''
            if current ~= ARGV[1] then
                return 0
            end
            if ARGV[4] ~= '' then
                redis.call('LPUSH', KEYS[3], ARGV[4])
                redis.call('LTRIM', KEYS[3], 0, tonumber(ARGV[5]) - 1)
            end
            redis.call('SET', KEYS[1], ARGV[2])
            redis.call('SADD', KEYS[2], ARGV[3])
            return 1
            "#,
        );

        Self {
            conn,
            config,
            compare_and_place,
        }
    }

    fn record_key(&self, ip: &str) -> String {
        self.config.key(&format!("block:{ip}"))
    }

    fn active_key(&self) -> String {
        self.config.key("block:active")
    }

    fn history_key(&self) -> String {
        self.config.key("block:history")
    }
}

#[async_trait]
impl BlockStore for RedisBlockStore {
    async fn find_active(&self, ip: &str) -> Result<Option<BlockedIp>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.record_key(ip)).await.map_err(store_error)?;
        match raw {
            Some(json) => {
                let record: BlockedIp = serde_json::from_str(&json).map_err(json_error)?;
                Ok(record.is_active.then_some(record))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, record: &BlockedIp) -> Result<(), StoreError> {
        let json = serde_json::to_string(record).map_err(json_error)?;
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();

        if record.is_active {
            pipe.set(self.record_key(&record.ip_address), json)
                .ignore()
                .sadd(self.active_key(), &record.ip_address)
                .ignore();
        } else {
            pipe.del(self.record_key(&record.ip_address))
                .ignore()
                .srem(self.active_key(), &record.ip_address)
                .ignore()
                .lpush(self.history_key(), json)
                .ignore()
                .ltrim(self.history_key(), 0, HISTORY_LIMIT - 1)
                .ignore();
        }

        let _: () = pipe.query_async(&mut conn).await.map_err(store_error)?;
        Ok(())
    }

    async fn place(
        &self,
        candidate: &BlockedIp,
        now: DateTime<Utc>,
    ) -> Result<BlockedIp, StoreError> {
        let key = self.record_key(&candidate.ip_address);
        let mut conn = self.conn.clone();

        for _ in 0..PLACE_ATTEMPTS {
            let seen: Option<String> = conn.get(&key).await.map_err(store_error)?;
            let current = seen
                .as_deref()
                .map(serde_json::from_str::<BlockedIp>)
                .transpose()
                .map_err(json_error)?;

            let placement = BlockPlacement::resolve(current, candidate.clone(), now);
            let json = serde_json::to_string(&placement.record).map_err(json_error)?;
            let retired = placement
                .retired
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(json_error)?;

            let applied: i64 = self
                .compare_and_place
                .key(&key)
                .key(self.active_key())
                .key(self.history_key())
                .arg(seen.unwrap_or_default())
                .arg(json)
                .arg(&candidate.ip_address)
                .arg(retired.unwrap_or_default())
                .arg(HISTORY_LIMIT)
                .invoke_async(&mut conn)
                .await
                .map_err(store_error)?;
            if applied == 1 {
                return Ok(placement.record);
            }
        }

        Err(StoreError::Operation(format!(
            "block for {} changed concurrently {} times",
            candidate.ip_address, PLACE_ATTEMPTS
        )))
    }

    async fn list_active(&self) -> Result<Vec<BlockedIp>, StoreError> {
        let mut conn = self.conn.clone();
        let ips: Vec<String> = conn.smembers(self.active_key()).await.map_err(store_error)?;

        let mut records = Vec::with_capacity(ips.len());
        for ip in ips {
            if let Some(record) = self.find_active(&ip).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn history(&self, limit: usize) -> Result<Vec<BlockedIp>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(self.history_key(), 0, limit as isize - 1)
            .await
            .map_err(store_error)?;
        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(json_error))
            .collect()
    }
}

/// Fast existence cache: `block-cache:{ip}` with the record JSON and a TTL
/// matching the block.
pub struct RedisBlockCache {
    conn: ConnectionManager,
    config: RedisConfig,
}

impl RedisBlockCache {
    pub async fn new(config: RedisConfig) -> Result<Self, StoreError> {
        let conn = connect(&config).await?;
        Ok(Self::with_connection(conn, config))
    }

    pub fn with_connection(conn: ConnectionManager, config: RedisConfig) -> Self {
        Self { conn, config }
    }

    fn make_key(&self, ip: &str) -> String {
        self.config.key(&format!("block-cache:{ip}"))
    }
}

#[async_trait]
impl BlockCache for RedisBlockCache {
    async fn lookup(&self, ip: &str) -> Result<Option<BlockedIp>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.make_key(ip)).await.map_err(store_error)?;
        raw.map(|json| serde_json::from_str(&json).map_err(json_error))
            .transpose()
    }

    async fn remember(&self, record: &BlockedIp, ttl: TimeDelta) -> Result<(), StoreError> {
        let millis = ttl.num_milliseconds();
        if millis <= 0 {
            return Ok(());
        }
        let json = serde_json::to_string(record).map_err(json_error)?;
        let mut conn = self.conn.clone();
        conn.pset_ex::<_, _, ()>(self.make_key(&record.ip_address), json, millis as u64)
            .await
            .map_err(store_error)
    }

    async fn forget(&self, ip: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.make_key(ip))
            .await
            .map_err(store_error)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use turnstile_core::domain::{BlockType, ThreatLevel};

    use super::*;
    use crate::connection::test_support::test_connection;

    fn record(ip: &str) -> BlockedIp {
        let now = Utc::now();
        BlockedIp {
            ip_address: ip.to_string(),
            block_type: BlockType::Threat,
            reason: "request flood".to_string(),
            threat_level: ThreatLevel::Critical,
            violation_count: 1,
            blocked_at: now,
            expires_at: now + TimeDelta::hours(24),
            is_active: true,
            unblocked_at: None,
            unblocked_by: None,
        }
    }

    #[tokio::test]
    async fn test_redis_block_store_roundtrip() {
        let (conn, config) = match test_connection("blocks").await {
            Some(c) => c,
            None => return,
        };
        let store = RedisBlockStore::with_connection(conn.clone(), config.clone());
        let cache = RedisBlockCache::with_connection(conn, config);

        let mut blocked = record("192.0.2.7");
        store.save(&blocked).await.unwrap();
        cache.remember(&blocked, TimeDelta::seconds(5)).await.unwrap();
        assert_eq!(store.list_active().await.unwrap().len(), 1);
        assert!(cache.lookup("192.0.2.7").await.unwrap().is_some());

        blocked.is_active = false;
        store.save(&blocked).await.unwrap();
        cache.forget("192.0.2.7").await.unwrap();
        assert!(store.find_active("192.0.2.7").await.unwrap().is_none());
        assert!(cache.lookup("192.0.2.7").await.unwrap().is_none());
        assert_eq!(store.history(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_redis_concurrent_placements_count_every_violation() {
        let (conn, config) = match test_connection("blocks-place").await {
            Some(c) => c,
            None => return,
        };
        let store = std::sync::Arc::new(RedisBlockStore::with_connection(conn, config));
        let now = Utc::now();

        let placements = (0..16).map(|_| {
            let store = store.clone();
            async move { store.place(&record("192.0.2.8"), now).await }
        });
        for placed in futures::future::join_all(placements).await {
            placed.unwrap();
        }

        let active = store.find_active("192.0.2.8").await.unwrap().unwrap();
        assert_eq!(active.violation_count, 16);
    }
}
