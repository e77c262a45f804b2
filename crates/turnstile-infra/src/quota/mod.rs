//! Quota row storage - Redis and in-memory fallback.

mod memory;

pub use memory::InMemoryQuotaStore;

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use self::redis::RedisQuotaStore;
