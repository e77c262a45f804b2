//! Activity log implementations - Redis and in-memory fallback.

mod memory;

pub use memory::InMemoryActivityLog;

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use self::redis::RedisActivityLog;
