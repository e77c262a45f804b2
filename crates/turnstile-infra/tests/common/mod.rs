#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use uuid::Uuid;

use turnstile_core::ManualClock;
use turnstile_core::StoreError;
use turnstile_core::domain::{
    ApiKey, BlockFailurePolicy, BlockedIp, Period, Quota, QuotaScope, RateLimitConfig,
    RateLimitPolicy, ServerNode, Strategy, Tier, UsageEvent, WindowHit,
};
use turnstile_core::ports::{
    ActivityLog, BlockCache, BlockStore, HealthProbe, ProbeOutcome, QuotaStore, RotationCounter,
    UsageError, UsageSink, WindowStore,
};
use turnstile_core::services::{
    AdmissionController, BlockRegistry, QuotaManager, SlidingWindowLimiter, ThreatDetector,
};
use turnstile_infra::{
    InMemoryActivityLog, InMemoryBlockCache, InMemoryBlockStore, InMemoryQuotaStore,
    InMemoryWindowStore,
};

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

pub fn clock_at(start: DateTime<Utc>) -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start))
}

pub fn noon() -> Arc<ManualClock> {
    clock_at(at(2024, 5, 14, 12, 0, 0))
}

/// Every operation fails as if the backend were unreachable.
pub struct UnreachableStore;

fn unreachable<T>() -> Result<T, StoreError> {
    Err(StoreError::Connection("connection refused".to_string()))
}

#[async_trait]
impl WindowStore for UnreachableStore {
    async fn hit(&self, _: &str, _: i64, _: i64) -> Result<WindowHit, StoreError> {
        unreachable()
    }
    async fn reset(&self, _: &str) -> Result<(), StoreError> {
        unreachable()
    }
    async fn purge_expired(&self, _: i64) -> Result<usize, StoreError> {
        unreachable()
    }
}

#[async_trait]
impl ActivityLog for UnreachableStore {
    async fn append(&self, _: &str, _: Option<&str>, _: i64, _: i64) -> Result<(), StoreError> {
        unreachable()
    }
    async fn count_since(&self, _: &str, _: i64) -> Result<u64, StoreError> {
        unreachable()
    }
    async fn timestamps_since(&self, _: &str, _: i64) -> Result<Vec<i64>, StoreError> {
        unreachable()
    }
    async fn purge_expired(&self, _: i64) -> Result<usize, StoreError> {
        unreachable()
    }
}

#[async_trait]
impl QuotaStore for UnreachableStore {
    async fn find_active(&self, _: &QuotaScope, _: Period) -> Result<Option<Quota>, StoreError> {
        unreachable()
    }
    async fn list_active_for(&self, _: &str, _: &str) -> Result<Vec<Quota>, StoreError> {
        unreachable()
    }
    async fn list_active_for_subject(&self, _: &str) -> Result<Vec<Quota>, StoreError> {
        unreachable()
    }
    async fn list_active(&self) -> Result<Vec<Quota>, StoreError> {
        unreachable()
    }
    async fn insert(&self, _: &Quota) -> Result<(), StoreError> {
        unreachable()
    }
    async fn insert_if_absent(&self, _: &Quota) -> Result<Quota, StoreError> {
        unreachable()
    }
    async fn update(&self, _: &Quota) -> Result<(), StoreError> {
        unreachable()
    }
    async fn increment_usage(&self, _: Uuid, _: u64) -> Result<Quota, StoreError> {
        unreachable()
    }
    async fn purge_retired(&self, _: DateTime<Utc>) -> Result<usize, StoreError> {
        unreachable()
    }
}

#[async_trait]
impl BlockStore for UnreachableStore {
    async fn find_active(&self, _: &str) -> Result<Option<BlockedIp>, StoreError> {
        unreachable()
    }
    async fn save(&self, _: &BlockedIp) -> Result<(), StoreError> {
        unreachable()
    }
    async fn place(&self, _: &BlockedIp, _: DateTime<Utc>) -> Result<BlockedIp, StoreError> {
        unreachable()
    }
    async fn list_active(&self) -> Result<Vec<BlockedIp>, StoreError> {
        unreachable()
    }
    async fn history(&self, _: usize) -> Result<Vec<BlockedIp>, StoreError> {
        unreachable()
    }
}

#[async_trait]
impl BlockCache for UnreachableStore {
    async fn lookup(&self, _: &str) -> Result<Option<BlockedIp>, StoreError> {
        unreachable()
    }
    async fn remember(&self, _: &BlockedIp, _: TimeDelta) -> Result<(), StoreError> {
        unreachable()
    }
    async fn forget(&self, _: &str) -> Result<(), StoreError> {
        unreachable()
    }
}

#[async_trait]
impl RotationCounter for UnreachableStore {
    async fn next(&self, _: &str) -> Result<u64, StoreError> {
        unreachable()
    }
}

/// Discards usage events.
pub struct NullSink;

impl UsageSink for NullSink {
    fn emit(&self, _: UsageEvent) -> Result<(), UsageError> {
        Ok(())
    }
}

/// Reports each node healthy unless told otherwise, and counts probes.
#[derive(Default)]
pub struct ScriptedProbe {
    unhealthy: Mutex<HashMap<String, bool>>,
    pub probes: Mutex<u32>,
}

impl ScriptedProbe {
    pub fn set_healthy(&self, node_id: &str, healthy: bool) {
        self.unhealthy
            .lock()
            .unwrap()
            .insert(node_id.to_string(), !healthy);
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, node: &ServerNode, _timeout: Duration) -> ProbeOutcome {
        *self.probes.lock().unwrap() += 1;
        let down = self
            .unhealthy
            .lock()
            .unwrap()
            .get(&node.id)
            .copied()
            .unwrap_or(false);
        ProbeOutcome {
            healthy: !down,
            response_time: Duration::from_millis(5),
            detail: down.then(|| "status 503".to_string()),
        }
    }
}

pub fn api_key(id: &str, tier: Tier, permissions: &[&str]) -> ApiKey {
    ApiKey {
        id: id.to_string(),
        subject: format!("{id}-owner"),
        tier,
        permissions: permissions.iter().map(|p| p.to_string()).collect(),
    }
}

/// Every admission component over fresh in-memory stores.
pub struct Stack {
    pub clock: Arc<ManualClock>,
    pub windows: Arc<InMemoryWindowStore>,
    pub activity: Arc<InMemoryActivityLog>,
    pub quota_store: Arc<InMemoryQuotaStore>,
    pub block_store: Arc<InMemoryBlockStore>,
    pub registry: Arc<BlockRegistry>,
    pub detector: Arc<ThreatDetector>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub quotas: Arc<QuotaManager>,
}

impl Stack {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        let windows = Arc::new(InMemoryWindowStore::new());
        let activity = Arc::new(InMemoryActivityLog::new());
        let quota_store = Arc::new(InMemoryQuotaStore::new());
        let block_store = Arc::new(InMemoryBlockStore::new());

        let registry = Arc::new(
            BlockRegistry::new(
                block_store.clone(),
                Arc::new(InMemoryBlockCache::new()),
                clock.clone(),
            )
            .with_failure_policy(BlockFailurePolicy::Open),
        );
        let detector = Arc::new(ThreatDetector::new(
            activity.clone(),
            registry.clone(),
            clock.clone(),
        ));
        let limiter = Arc::new(SlidingWindowLimiter::new(windows.clone(), clock.clone()));
        let quotas = Arc::new(QuotaManager::new(
            quota_store.clone(),
            Arc::new(NullSink),
            clock.clone(),
        ));

        Self {
            clock,
            windows,
            activity,
            quota_store,
            block_store,
            registry,
            detector,
            limiter,
            quotas,
        }
    }

    pub fn admission(&self, limit: u32) -> AdmissionController {
        let default = RateLimitConfig::new(limit, 60_000, Strategy::Ip).unwrap();
        AdmissionController::new(
            self.detector.clone(),
            self.limiter.clone(),
            self.quotas.clone(),
            RateLimitPolicy::new(default, Vec::new()),
        )
    }
}
