//! Activity log port - time-indexed events queried by the threat heuristics.

use async_trait::async_trait;

use crate::error::StoreError;

/// Time-indexed sets keyed by string.
///
/// Each set holds members scored by epoch milliseconds. Appending without a
/// member records a distinct event; appending an existing member only
/// refreshes its score, so `count_since` then counts distinct members.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    /// Record `member` (or a fresh event when `None`) at `at_ms`, dropping
    /// entries older than `retention_ms`.
    async fn append(
        &self,
        key: &str,
        member: Option<&str>,
        at_ms: i64,
        retention_ms: i64,
    ) -> Result<(), StoreError>;

    /// Entries scored at or after `since_ms`.
    async fn count_since(&self, key: &str, since_ms: i64) -> Result<u64, StoreError>;

    /// Scores at or after `since_ms`, ascending.
    async fn timestamps_since(&self, key: &str, since_ms: i64) -> Result<Vec<i64>, StoreError>;

    /// Evict keys with no entries newer than their retention.
    async fn purge_expired(&self, now_ms: i64) -> Result<usize, StoreError>;
}
