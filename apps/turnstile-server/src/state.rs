//! Application state - shared across all handlers.

use std::sync::Arc;

use tokio::task::JoinHandle;

use turnstile_core::domain::PermissionMap;
use turnstile_core::ports::{
    ActivityLog, ApiKeyDirectory, BlockCache, BlockStore, QuotaStore, RotationCounter,
    UsageRecorder, WindowStore,
};
use turnstile_core::services::{
    AdmissionController, BlockRegistry, GatewayRouter, QuotaManager, SlidingWindowLimiter,
    ThreatDetector,
};
use turnstile_core::{Clock, SystemClock};
use turnstile_infra::{
    ChannelUsageSink, HttpHealthProbe, InMemoryActivityLog, InMemoryApiKeyDirectory,
    InMemoryBlockCache, InMemoryBlockStore, InMemoryQuotaStore, InMemoryRotationCounter,
    InMemoryWindowStore, TracingUsageRecorder,
};

#[cfg(feature = "redis")]
use turnstile_infra::{
    RedisActivityLog, RedisBlockCache, RedisBlockStore, RedisConfig, RedisQuotaStore,
    RedisRotationCounter, RedisWindowStore,
};

use crate::config::AppConfig;
use crate::middleware::TrustedProxies;

/// Every store the services need, from one backend.
struct Stores {
    kind: &'static str,
    windows: Arc<dyn WindowStore>,
    activity: Arc<dyn ActivityLog>,
    quotas: Arc<dyn QuotaStore>,
    blocks: Arc<dyn BlockStore>,
    block_cache: Arc<dyn BlockCache>,
    rotation: Arc<dyn RotationCounter>,
}

impl Stores {
    fn in_memory() -> Self {
        Self {
            kind: "memory",
            windows: Arc::new(InMemoryWindowStore::new()),
            activity: Arc::new(InMemoryActivityLog::new()),
            quotas: Arc::new(InMemoryQuotaStore::new()),
            blocks: Arc::new(InMemoryBlockStore::new()),
            block_cache: Arc::new(InMemoryBlockCache::new()),
            rotation: Arc::new(InMemoryRotationCounter::new()),
        }
    }

    #[cfg(feature = "redis")]
    async fn connect(url: &str) -> Self {
        let config = RedisConfig {
            url: url.to_string(),
            ..RedisConfig::from_env()
        };
        match turnstile_infra::connect(&config).await {
            Ok(conn) => Self {
                kind: "redis",
                windows: Arc::new(RedisWindowStore::with_connection(conn.clone(), config.clone())),
                activity: Arc::new(RedisActivityLog::with_connection(conn.clone(), config.clone())),
                quotas: Arc::new(RedisQuotaStore::with_connection(conn.clone(), config.clone())),
                blocks: Arc::new(RedisBlockStore::with_connection(conn.clone(), config.clone())),
                block_cache: Arc::new(RedisBlockCache::with_connection(conn.clone(), config.clone())),
                rotation: Arc::new(RedisRotationCounter::with_connection(conn, config)),
            },
            Err(e) => {
                tracing::error!(
                    "Failed to connect to Redis: {}. Using in-memory fallback.",
                    e
                );
                Self::in_memory()
            }
        }
    }

    #[cfg(not(feature = "redis"))]
    async fn connect(_url: &str) -> Self {
        tracing::info!("Running without redis feature - using in-memory stores");
        Self::in_memory()
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<AdmissionController>,
    pub quotas: Arc<QuotaManager>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub detector: Arc<ThreatDetector>,
    pub blocks: Arc<BlockRegistry>,
    pub router: Arc<GatewayRouter>,
    pub api_keys: Arc<dyn ApiKeyDirectory>,
    pub trusted_proxies: Arc<TrustedProxies>,
    /// Client used to forward gateway traffic.
    pub http: reqwest::Client,
    pub store_kind: &'static str,
}

impl AppState {
    /// Build the application state with appropriate implementations.
    ///
    /// Returns the state and the handle of the usage recorder task.
    pub async fn new(config: &AppConfig) -> (Self, JoinHandle<()>) {
        let stores = match &config.redis_url {
            Some(url) => Stores::connect(url).await,
            None => {
                tracing::warn!("REDIS_URL not set. Limits are enforced per process (in-memory mode).");
                Stores::in_memory()
            }
        };
        let recorder: Arc<dyn UsageRecorder> = Arc::new(TracingUsageRecorder);
        let (sink, usage_task) = ChannelUsageSink::spawn(config.usage_queue_capacity, recorder);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let api_keys: Arc<dyn ApiKeyDirectory> =
            Arc::new(InMemoryApiKeyDirectory::new(config.api_keys.clone()));

        let state = Self::assemble(config, stores, Arc::new(sink), api_keys, clock).await;
        tracing::info!(store = state.store_kind, "Application state initialized");
        (state, usage_task)
    }

    async fn assemble(
        config: &AppConfig,
        stores: Stores,
        sink: Arc<ChannelUsageSink>,
        api_keys: Arc<dyn ApiKeyDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let blocks = Arc::new(
            BlockRegistry::new(stores.blocks, stores.block_cache, clock.clone())
                .with_failure_policy(config.block_failure_policy),
        );
        let detector = Arc::new(ThreatDetector::new(
            stores.activity,
            blocks.clone(),
            clock.clone(),
        ));
        let limiter = Arc::new(SlidingWindowLimiter::new(stores.windows, clock.clone()));
        let quotas = Arc::new(
            QuotaManager::new(stores.quotas, sink, clock.clone())
                .with_tiers(config.tiers.clone())
                .with_overage_policy(config.overage_policy),
        );
        let admission = Arc::new(AdmissionController::new(
            detector.clone(),
            limiter.clone(),
            quotas.clone(),
            config.rate_limit.clone(),
        ));

        let http = reqwest::Client::new();
        let probe = Arc::new(HttpHealthProbe::with_client(
            http.clone(),
            config.gateway.health_path.clone(),
        ));
        let router = Arc::new(
            GatewayRouter::new(
                config.gateway.clone(),
                api_keys.clone(),
                stores.rotation,
                probe,
                clock,
            )
            .with_permissions(PermissionMap::default()),
        );
        for node in &config.nodes {
            if let Err(e) = router.add_node(node.clone()).await {
                tracing::error!(node_id = %node.id, error = %e, "Skipping invalid gateway node");
            }
        }

        Self {
            admission,
            quotas,
            limiter,
            detector,
            blocks,
            router,
            api_keys,
            trusted_proxies: Arc::new(config.trusted_proxies.clone()),
            http,
            store_kind: stores.kind,
        }
    }

    /// In-memory state over the given clock and keys, for handler tests.
    #[cfg(test)]
    pub async fn for_tests(
        config: &AppConfig,
        clock: Arc<dyn Clock>,
    ) -> (Self, Arc<turnstile_infra::InMemoryUsageRecorder>) {
        let recorder = Arc::new(turnstile_infra::InMemoryUsageRecorder::new());
        let (sink, _task) = ChannelUsageSink::spawn(64, recorder.clone());
        let api_keys: Arc<dyn ApiKeyDirectory> =
            Arc::new(InMemoryApiKeyDirectory::new(config.api_keys.clone()));
        let state = Self::assemble(config, Stores::in_memory(), Arc::new(sink), api_keys, clock).await;
        (state, recorder)
    }
}
