//! Block registry: the durable block log fronted by a fast cache.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use crate::clock::Clock;
use crate::domain::{BlockFailurePolicy, BlockRequest, BlockedIp};
use crate::error::{BlockError, StoreError};
use crate::ports::{BlockCache, BlockStore};

/// Log target of block events, so alerting can pick them out.
pub const SECURITY_TARGET: &str = "turnstile::security";

/// Result of asking whether an IP is blocked.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockCheck {
    Clear,
    Blocked(BlockedIp),
    /// The durable store was unreachable and the policy is fail-closed.
    Unavailable,
}

pub struct BlockRegistry {
    store: Arc<dyn BlockStore>,
    cache: Arc<dyn BlockCache>,
    clock: Arc<dyn Clock>,
    failure_policy: BlockFailurePolicy,
}

impl BlockRegistry {
    pub fn new(
        store: Arc<dyn BlockStore>,
        cache: Arc<dyn BlockCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            failure_policy: BlockFailurePolicy::default(),
        }
    }

    pub fn with_failure_policy(mut self, policy: BlockFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn failure_policy(&self) -> BlockFailurePolicy {
        self.failure_policy
    }

    /// Cache first, durable store second. A store hit repopulates the cache.
    pub async fn lookup(&self, ip: &str) -> Result<Option<BlockedIp>, StoreError> {
        let now = self.clock.now();

        match self.cache.lookup(ip).await {
            Ok(Some(record)) if record.is_active && !record.is_expired(now) => {
                return Ok(Some(record));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(ip = %ip, error = %e, "Block cache unavailable, reading store");
            }
        }

        let Some(record) = self.store.find_active(ip).await? else {
            return Ok(None);
        };
        if record.is_expired(now) {
            return Ok(None);
        }

        self.cache_record(&record, now).await;
        Ok(Some(record))
    }

    /// [`lookup`](Self::lookup) with the failure policy applied.
    pub async fn check(&self, ip: &str) -> BlockCheck {
        match self.lookup(ip).await {
            Ok(Some(record)) => BlockCheck::Blocked(record),
            Ok(None) => BlockCheck::Clear,
            Err(e) => match self.failure_policy {
                BlockFailurePolicy::Open => {
                    tracing::warn!(ip = %ip, error = %e, "Block store unavailable, failing open");
                    BlockCheck::Clear
                }
                BlockFailurePolicy::Closed => {
                    tracing::error!(ip = %ip, error = %e, "Block store unavailable, failing closed");
                    BlockCheck::Unavailable
                }
            },
        }
    }

    /// Place a block, or extend the active one.
    ///
    /// Re-blocking keeps a single active record: `expires_at` only moves
    /// forward and `violation_count` goes up by one.
    pub async fn block(&self, request: BlockRequest) -> Result<BlockedIp, BlockError> {
        if request.duration <= TimeDelta::zero() {
            return Err(BlockError::InvalidDuration);
        }

        let now = self.clock.now();
        let until = now + request.duration;

        let candidate = BlockedIp {
            ip_address: request.ip_address,
            block_type: request.block_type,
            reason: request.reason,
            threat_level: request.threat_level,
            violation_count: 1,
            blocked_at: now,
            expires_at: until,
            is_active: true,
            unblocked_at: None,
            unblocked_by: None,
        };
        let record = self.store.place(&candidate, now).await?;
        self.cache_record(&record, now).await;

        tracing::warn!(
            target: SECURITY_TARGET,
            ip = %record.ip_address,
            block_type = ?record.block_type,
            threat_level = %record.threat_level,
            violations = record.violation_count,
            expires_at = %record.expires_at,
            reason = %record.reason,
            "IP blocked"
        );
        Ok(record)
    }

    /// Lift an active block on behalf of `actor`.
    pub async fn unblock(&self, ip: &str, actor: &str) -> Result<BlockedIp, BlockError> {
        if actor.trim().is_empty() {
            return Err(BlockError::MissingActor);
        }

        let mut record = self
            .store
            .find_active(ip)
            .await?
            .ok_or_else(|| BlockError::NotBlocked(ip.to_string()))?;

        record.is_active = false;
        record.unblocked_at = Some(self.clock.now());
        record.unblocked_by = Some(actor.to_string());
        self.store.save(&record).await?;
        self.evict(ip).await;

        tracing::info!(ip = %ip, actor = %actor, "IP unblocked");
        Ok(record)
    }

    /// Deactivate every expired block. Returns how many were swept.
    pub async fn sweep_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let expired = self.store.list_expired(now).await?;

        for mut record in expired.iter().cloned() {
            record.is_active = false;
            self.store.save(&record).await?;
            self.evict(&record.ip_address).await;
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired blocks swept");
        }
        Ok(expired.len())
    }

    pub async fn list_active(&self) -> Result<Vec<BlockedIp>, StoreError> {
        let now = self.clock.now();
        let mut active: Vec<BlockedIp> = self
            .store
            .list_active()
            .await?
            .into_iter()
            .filter(|record| !record.is_expired(now))
            .collect();
        active.sort_by(|a, b| b.blocked_at.cmp(&a.blocked_at));
        Ok(active)
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<BlockedIp>, StoreError> {
        self.store.history(limit).await
    }

    async fn cache_record(&self, record: &BlockedIp, now: DateTime<Utc>) {
        let ttl = record.expires_at - now;
        if ttl <= TimeDelta::zero() {
            return;
        }
        if let Err(e) = self.cache.remember(record, ttl).await {
            tracing::warn!(ip = %record.ip_address, error = %e, "Failed to cache block");
        }
    }

    async fn evict(&self, ip: &str) {
        if let Err(e) = self.cache.forget(ip).await {
            tracing::warn!(ip = %ip, error = %e, "Failed to evict block from cache");
        }
    }
}
