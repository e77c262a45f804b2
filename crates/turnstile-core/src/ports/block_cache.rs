//! Fast existence cache in front of the durable block store.

use async_trait::async_trait;
use chrono::TimeDelta;

use crate::domain::BlockedIp;
use crate::error::StoreError;

/// Block cache - abstraction over caching backends (Redis, in-memory).
///
/// Entries carry the whole record so a cache hit can answer without touching
/// the durable store; they expire with the block.
#[async_trait]
pub trait BlockCache: Send + Sync {
    /// Cached active block for `ip`, if any.
    async fn lookup(&self, ip: &str) -> Result<Option<BlockedIp>, StoreError>;

    /// Cache `record` for `ttl`.
    async fn remember(&self, record: &BlockedIp, ttl: TimeDelta) -> Result<(), StoreError>;

    /// Evict `ip`.
    async fn forget(&self, ip: &str) -> Result<(), StoreError>;
}
