//! Durable block log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::BlockedIp;
use crate::error::StoreError;

/// Authoritative record of blocked IPs.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Active block for `ip`, if any.
    async fn find_active(&self, ip: &str) -> Result<Option<BlockedIp>, StoreError>;

    /// Insert or replace the record for `record.ip_address`. Inactive records
    /// leave the active set and are appended to the history log.
    async fn save(&self, record: &BlockedIp) -> Result<(), StoreError>;

    /// Atomically place `candidate` for its IP, extending a live record or
    /// retiring an expired one, as
    /// [`BlockPlacement::resolve`](crate::domain::BlockPlacement::resolve)
    /// decides. Concurrent calls for one IP never lose a violation.
    async fn place(
        &self,
        candidate: &BlockedIp,
        now: DateTime<Utc>,
    ) -> Result<BlockedIp, StoreError>;

    /// Every active block.
    async fn list_active(&self) -> Result<Vec<BlockedIp>, StoreError>;

    /// Active blocks whose `expires_at <= now`.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<BlockedIp>, StoreError> {
        Ok(self
            .list_active()
            .await?
            .into_iter()
            .filter(|record| record.is_expired(now))
            .collect())
    }

    /// Most recent deactivated records, newest first.
    async fn history(&self, limit: usize) -> Result<Vec<BlockedIp>, StoreError>;
}
