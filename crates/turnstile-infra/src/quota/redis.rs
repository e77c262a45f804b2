//! Redis quota store.
//!
//! Layout under the configured prefix:
//! - `quota:row:{id}` row JSON (its `used` field is not authoritative)
//! - `quota:used:{id}` usage counter, moved with INCRBY
//! - `quota:slot:{subject}:{endpoint}:{tier}:{period}` id of the active row
//! - `quota:active` set of active ids
//! - `quota:subject:{subject}` set of active ids per subject

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use turnstile_core::StoreError;
use turnstile_core::domain::{Period, Quota, QuotaScope};
use turnstile_core::ports::QuotaStore;
use turnstile_core::services::RETIRED_QUOTA_RETENTION_DAYS;

use crate::connection::{RedisConfig, connect, json_error, store_error};

/// Deactivated rows are kept this long for history.
const INACTIVE_TTL_SECS: i64 = RETIRED_QUOTA_RETENTION_DAYS * 24 * 3600;

pub struct RedisQuotaStore {
    conn: ConnectionManager,
    config: RedisConfig,
    insert_if_absent: Script,
    deactivate: Script,
}

impl RedisQuotaStore {
    pub async fn new(config: RedisConfig) -> Result<Self, StoreError> {
        let conn = connect(&config).await?;
        Ok(Self::with_connection(conn, config))
    }

    pub fn with_connection(conn: ConnectionManager, config: RedisConfig) -> Self {
        // KEYS: slot, row, used, active set, subject set
        // ARGV: id, row json, used
        // Returns the id of the active row
        let insert_if_absent = Script::new(
            r#"
            local existing = redis.call('GET', KEYS[1])
            if existing then
                return existing
            end
            redis.call('SET', KEYS[1], ARGV[1])
            redis.call('SET', KEYS[2], ARGV[2])
            redis.call('SET', KEYS[3], ARGV[3])
            redis.call('SADD', KEYS[4], ARGV[1])
            redis.call('SADD', KEYS[5], ARGV[1])
            return ARGV[1]
            "#,
        );

        // KEYS: slot, row, used, active set, subject set
        // ARGV: id, row json, used, ttl seconds
        let deactivate = Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                redis.call('DEL', KEYS[1])
            end
            redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[4])
            redis.call('SET', KEYS[3], ARGV[3], 'EX', ARGV[4])
            redis.call('SREM', KEYS[4], ARGV[1])
            redis.call('SREM', KEYS[5], ARGV[1])
            return 1
            "#,
        );

        Self {
            conn,
            config,
            insert_if_absent,
            deactivate,
        }
    }

    fn row_key(&self, id: Uuid) -> String {
        self.config.key(&format!("quota:row:{id}"))
    }

    fn used_key(&self, id: Uuid) -> String {
        self.config.key(&format!("quota:used:{id}"))
    }

    fn slot_key(&self, scope: &QuotaScope, period: Period) -> String {
        self.config.key(&format!(
            "quota:slot:{}:{}:{}:{}",
            scope.subject, scope.endpoint, scope.tier, period
        ))
    }

    fn active_key(&self) -> String {
        self.config.key("quota:active")
    }

    fn subject_key(&self, subject: &str) -> String {
        self.config.key(&format!("quota:subject:{subject}"))
    }

    async fn load(&self, id: Uuid) -> Result<Option<Quota>, StoreError> {
        let mut conn = self.conn.clone();
        let (row, used): (Option<String>, Option<u64>) = redis::pipe()
            .get(self.row_key(id))
            .get(self.used_key(id))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut quota: Quota = serde_json::from_str(&row).map_err(json_error)?;
        quota.used = used.unwrap_or(quota.used);
        Ok(Some(quota))
    }

    async fn load_all(&self, set_key: String) -> Result<Vec<Quota>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(set_key).await.map_err(store_error)?;

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(id) = Uuid::parse_str(&id) else {
                continue;
            };
            if let Some(quota) = self.load(id).await? {
                if quota.is_active {
                    rows.push(quota);
                }
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn find_active(
        &self,
        scope: &QuotaScope,
        period: Period,
    ) -> Result<Option<Quota>, StoreError> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn
            .get(self.slot_key(scope, period))
            .await
            .map_err(store_error)?;

        match id.and_then(|id| Uuid::parse_str(&id).ok()) {
            Some(id) => self.load(id).await,
            None => Ok(None),
        }
    }

    async fn list_active_for(
        &self,
        subject: &str,
        endpoint: &str,
    ) -> Result<Vec<Quota>, StoreError> {
        Ok(self
            .load_all(self.subject_key(subject))
            .await?
            .into_iter()
            .filter(|q| q.scope.endpoint == endpoint)
            .collect())
    }

    async fn list_active_for_subject(&self, subject: &str) -> Result<Vec<Quota>, StoreError> {
        self.load_all(self.subject_key(subject)).await
    }

    async fn list_active(&self) -> Result<Vec<Quota>, StoreError> {
        self.load_all(self.active_key()).await
    }

    async fn insert(&self, quota: &Quota) -> Result<(), StoreError> {
        let json = serde_json::to_string(quota).map_err(json_error)?;
        let id = quota.id.to_string();

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .set(self.slot_key(&quota.scope, quota.period), &id)
            .ignore()
            .set(self.row_key(quota.id), json)
            .ignore()
            .set(self.used_key(quota.id), quota.used)
            .ignore()
            .sadd(self.active_key(), &id)
            .ignore()
            .sadd(self.subject_key(&quota.scope.subject), &id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn insert_if_absent(&self, quota: &Quota) -> Result<Quota, StoreError> {
        let json = serde_json::to_string(quota).map_err(json_error)?;
        let mut conn = self.conn.clone();

        let active_id: String = self
            .insert_if_absent
            .key(self.slot_key(&quota.scope, quota.period))
            .key(self.row_key(quota.id))
            .key(self.used_key(quota.id))
            .key(self.active_key())
            .key(self.subject_key(&quota.scope.subject))
            .arg(quota.id.to_string())
            .arg(json)
            .arg(quota.used)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;

        if active_id == quota.id.to_string() {
            return Ok(quota.clone());
        }

        let id = Uuid::parse_str(&active_id)
            .map_err(|e| StoreError::Serialization(format!("bad quota id {active_id}: {e}")))?;
        self.load(id)
            .await?
            .ok_or_else(|| StoreError::Operation(format!("quota {id} not found")))
    }

    async fn update(&self, quota: &Quota) -> Result<(), StoreError> {
        let json = serde_json::to_string(quota).map_err(json_error)?;
        let mut conn = self.conn.clone();

        if quota.is_active {
            let _: () = redis::pipe()
                .atomic()
                .set(self.row_key(quota.id), json)
                .ignore()
                .set(self.used_key(quota.id), quota.used)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(store_error)?;
            return Ok(());
        }

        let _: i64 = self
            .deactivate
            .key(self.slot_key(&quota.scope, quota.period))
            .key(self.row_key(quota.id))
            .key(self.used_key(quota.id))
            .key(self.active_key())
            .key(self.subject_key(&quota.scope.subject))
            .arg(quota.id.to_string())
            .arg(json)
            .arg(quota.used)
            .arg(INACTIVE_TTL_SECS)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn increment_usage(&self, id: Uuid, by: u64) -> Result<Quota, StoreError> {
        let mut conn = self.conn.clone();
        let used: u64 = conn
            .incr(self.used_key(id), by)
            .await
            .map_err(store_error)?;

        let mut quota = self
            .load(id)
            .await?
            .ok_or_else(|| StoreError::Operation(format!("quota {id} not found")))?;
        quota.used = used;
        Ok(quota)
    }

    /// Retired rows carry a TTL from the moment they are deactivated, so
    /// Redis drops them on its own.
    async fn purge_retired(&self, _before: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(0)
    }
}
