//! Block log and block cache - Redis and in-memory fallback.

mod memory;

pub use memory::{InMemoryBlockCache, InMemoryBlockStore};

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use self::redis::{RedisBlockCache, RedisBlockStore};
