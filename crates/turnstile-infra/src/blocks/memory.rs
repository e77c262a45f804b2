//! In-memory block store and cache.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;

use turnstile_core::StoreError;
use turnstile_core::domain::{BlockPlacement, BlockedIp};
use turnstile_core::ports::{BlockCache, BlockStore};

const HISTORY_LIMIT: usize = 1_000;

#[derive(Default)]
struct BlockTables {
    active: HashMap<String, BlockedIp>,
    /// Newest first.
    history: VecDeque<BlockedIp>,
}

impl BlockTables {
    fn archive(&mut self, record: BlockedIp) {
        self.history.push_front(record);
        self.history.truncate(HISTORY_LIMIT);
    }
}

/// Note: Data is lost on process restart.
pub struct InMemoryBlockStore {
    tables: RwLock<BlockTables>,
}

impl InMemoryBlockStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(BlockTables::default()),
        }
    }
}

impl Default for InMemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockStore for InMemoryBlockStore {
    async fn find_active(&self, ip: &str) -> Result<Option<BlockedIp>, StoreError> {
        Ok(self.tables.read().await.active.get(ip).cloned())
    }

    async fn save(&self, record: &BlockedIp) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if record.is_active {
            tables
                .active
                .insert(record.ip_address.clone(), record.clone());
        } else {
            tables.active.remove(&record.ip_address);
            tables.archive(record.clone());
        }
        Ok(())
    }

    async fn place(
        &self,
        candidate: &BlockedIp,
        now: DateTime<Utc>,
    ) -> Result<BlockedIp, StoreError> {
        let mut tables = self.tables.write().await;
        let current = tables.active.get(&candidate.ip_address).cloned();
        let placement = BlockPlacement::resolve(current, candidate.clone(), now);

        if let Some(retired) = placement.retired {
            tables.archive(retired);
        }
        tables
            .active
            .insert(placement.record.ip_address.clone(), placement.record.clone());
        Ok(placement.record)
    }

    async fn list_active(&self) -> Result<Vec<BlockedIp>, StoreError> {
        Ok(self.tables.read().await.active.values().cloned().collect())
    }

    async fn history(&self, limit: usize) -> Result<Vec<BlockedIp>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .history
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }
}

struct CacheEntry {
    record: BlockedIp,
    expires_at: Instant,
}

/// In-process block cache with per-entry expiry.
pub struct InMemoryBlockCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryBlockCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryBlockCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockCache for InMemoryBlockCache {
    async fn lookup(&self, ip: &str) -> Result<Option<BlockedIp>, StoreError> {
        let entries = self.entries.read().await;
        let Some(entry) = entries.get(ip) else {
            return Ok(None);
        };

        if Instant::now() >= entry.expires_at {
            drop(entries);
            // Clean up expired entry with write lock
            self.entries.write().await.remove(ip);
            return Ok(None);
        }

        Ok(Some(entry.record.clone()))
    }

    async fn remember(&self, record: &BlockedIp, ttl: TimeDelta) -> Result<(), StoreError> {
        let ttl = ttl
            .to_std()
            .map_err(|e| StoreError::Operation(format!("invalid cache ttl: {e}")))?;
        self.entries.write().await.insert(
            record.ip_address.clone(),
            CacheEntry {
                record: record.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn forget(&self, ip: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(ip);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use turnstile_core::domain::{BlockType, ThreatLevel};

    use super::*;

    fn record(ip: &str) -> BlockedIp {
        let now = Utc::now();
        BlockedIp {
            ip_address: ip.to_string(),
            block_type: BlockType::Manual,
            reason: "test".to_string(),
            threat_level: ThreatLevel::High,
            violation_count: 1,
            blocked_at: now,
            expires_at: now + TimeDelta::hours(1),
            is_active: true,
            unblocked_at: None,
            unblocked_by: None,
        }
    }

    #[tokio::test]
    async fn test_inactive_save_moves_record_to_history() {
        let store = InMemoryBlockStore::new();
        let mut blocked = record("10.0.0.9");
        store.save(&blocked).await.unwrap();
        assert!(store.find_active("10.0.0.9").await.unwrap().is_some());

        blocked.is_active = false;
        store.save(&blocked).await.unwrap();
        assert!(store.find_active("10.0.0.9").await.unwrap().is_none());
        assert_eq!(store.history(10).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_placements_count_every_violation() {
        let store = std::sync::Arc::new(InMemoryBlockStore::new());
        let now = Utc::now();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.place(&record("10.0.0.5"), now).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let active = store.find_active("10.0.0.5").await.unwrap().unwrap();
        assert_eq!(active.violation_count, 32);
        assert_eq!(store.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_record_is_archived_on_place() {
        let store = InMemoryBlockStore::new();
        let mut stale = record("10.0.0.6");
        stale.expires_at = stale.blocked_at;
        store.save(&stale).await.unwrap();

        let placed = store.place(&record("10.0.0.6"), Utc::now()).await.unwrap();
        assert_eq!(placed.violation_count, 1);
        assert_eq!(store.history(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cache_entry_expires() {
        let cache = InMemoryBlockCache::new();
        cache
            .remember(&record("10.0.0.1"), TimeDelta::milliseconds(20))
            .await
            .unwrap();
        assert!(cache.lookup("10.0.0.1").await.unwrap().is_some());

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        assert!(cache.lookup("10.0.0.1").await.unwrap().is_none());
    }
}
