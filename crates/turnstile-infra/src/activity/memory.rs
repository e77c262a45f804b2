//! In-memory activity log.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use turnstile_core::StoreError;
use turnstile_core::ports::ActivityLog;

struct ActivitySet {
    members: HashMap<String, i64>,
    retention_ms: i64,
    newest_ms: i64,
}

/// Scored member sets keyed by string.
///
/// Note: Data is lost on process restart.
pub struct InMemoryActivityLog {
    sets: RwLock<HashMap<String, ActivitySet>>,
}

impl InMemoryActivityLog {
    pub fn new() -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActivityLog for InMemoryActivityLog {
    async fn append(
        &self,
        key: &str,
        member: Option<&str>,
        at_ms: i64,
        retention_ms: i64,
    ) -> Result<(), StoreError> {
        let member = match member {
            Some(m) => m.to_string(),
            None => format!("{}-{}", at_ms, Uuid::new_v4()),
        };

        let mut sets = self.sets.write().await;
        let set = sets.entry(key.to_string()).or_insert_with(|| ActivitySet {
            members: HashMap::new(),
            retention_ms,
            newest_ms: at_ms,
        });
        set.retention_ms = retention_ms;
        set.newest_ms = set.newest_ms.max(at_ms);
        set.members.insert(member, at_ms);

        let cutoff = at_ms - retention_ms;
        set.members.retain(|_, score| *score > cutoff);
        Ok(())
    }

    async fn count_since(&self, key: &str, since_ms: i64) -> Result<u64, StoreError> {
        let sets = self.sets.read().await;
        Ok(sets
            .get(key)
            .map(|set| set.members.values().filter(|s| **s >= since_ms).count() as u64)
            .unwrap_or(0))
    }

    async fn timestamps_since(&self, key: &str, since_ms: i64) -> Result<Vec<i64>, StoreError> {
        let sets = self.sets.read().await;
        let mut scores: Vec<i64> = sets
            .get(key)
            .map(|set| {
                set.members
                    .values()
                    .copied()
                    .filter(|s| *s >= since_ms)
                    .collect()
            })
            .unwrap_or_default();
        scores.sort_unstable();
        Ok(scores)
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<usize, StoreError> {
        let mut sets = self.sets.write().await;
        let before = sets.len();
        sets.retain(|_, set| set.newest_ms > now_ms - set.retention_ms);
        Ok(before - sets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_distinct_members_are_counted_once() {
        let log = InMemoryActivityLog::new();
        for at in [100, 200, 300] {
            log.append("ua", Some("10.0.0.1"), at, 10_000).await.unwrap();
        }
        log.append("ua", Some("10.0.0.2"), 300, 10_000).await.unwrap();
        assert_eq!(log.count_since("ua", 0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_anonymous_events_are_all_counted() {
        let log = InMemoryActivityLog::new();
        for _ in 0..3 {
            log.append("ip", None, 500, 10_000).await.unwrap();
        }
        assert_eq!(log.count_since("ip", 500).await.unwrap(), 3);
        assert_eq!(
            log.timestamps_since("ip", 0).await.unwrap(),
            vec![500, 500, 500]
        );
    }

    #[tokio::test]
    async fn test_retention_and_purge() {
        let log = InMemoryActivityLog::new();
        log.append("old", None, 0, 1_000).await.unwrap();
        log.append("new", None, 0, 1_000).await.unwrap();
        log.append("new", None, 1_500, 1_000).await.unwrap();

        assert_eq!(log.count_since("new", 0).await.unwrap(), 1);
        assert_eq!(log.purge_expired(2_000).await.unwrap(), 1);
    }
}
