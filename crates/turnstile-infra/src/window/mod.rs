//! Sliding-window hit logs - Redis and in-memory fallback.

mod memory;

pub use memory::InMemoryWindowStore;

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use self::redis::RedisWindowStore;
