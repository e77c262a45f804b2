//! Ports - trait definitions for external dependencies.
//! These are the "interfaces" that infrastructure must implement.

mod activity_log;
mod api_keys;
mod block_cache;
mod block_store;
mod health_probe;
mod quota_store;
mod rotation;
mod usage;
mod window_store;

pub use activity_log::ActivityLog;
pub use api_keys::ApiKeyDirectory;
pub use block_cache::BlockCache;
pub use block_store::BlockStore;
pub use health_probe::{HealthProbe, ProbeOutcome};
pub use quota_store::QuotaStore;
pub use rotation::RotationCounter;
pub use usage::{UsageError, UsageRecorder, UsageSink};
pub use window_store::WindowStore;
