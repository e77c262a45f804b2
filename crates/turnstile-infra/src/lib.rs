//! # Turnstile Infrastructure
//!
//! Concrete implementations of the ports defined in `turnstile-core`.
//! Every store has an in-memory variant for single-process deployments and
//! tests, and a Redis variant for sharing state across processes.
//!
//! ## Feature Flags
//!
//! - `full` (default) - All features enabled
//! - `minimal` - No external dependencies, in-memory only
//! - `redis` - Redis-backed window, activity, quota, block and rotation stores
//! - `http` - HTTP health probes via reqwest

pub mod activity;
pub mod blocks;
pub mod gateway;
pub mod quota;
pub mod usage;
pub mod window;

#[cfg(feature = "redis")]
pub mod connection;

// Re-exports - In-Memory
pub use activity::InMemoryActivityLog;
pub use blocks::{InMemoryBlockCache, InMemoryBlockStore};
pub use gateway::{InMemoryApiKeyDirectory, InMemoryRotationCounter};
pub use quota::InMemoryQuotaStore;
pub use usage::{ChannelUsageSink, InMemoryUsageRecorder, TracingUsageRecorder};
pub use window::InMemoryWindowStore;

// Re-exports - Redis
#[cfg(feature = "redis")]
pub use activity::RedisActivityLog;
#[cfg(feature = "redis")]
pub use blocks::{RedisBlockCache, RedisBlockStore};
#[cfg(feature = "redis")]
pub use connection::{RedisConfig, connect};
#[cfg(feature = "redis")]
pub use gateway::RedisRotationCounter;
#[cfg(feature = "redis")]
pub use quota::RedisQuotaStore;
#[cfg(feature = "redis")]
pub use window::RedisWindowStore;

// Re-exports - HTTP
#[cfg(feature = "http")]
pub use gateway::HttpHealthProbe;
