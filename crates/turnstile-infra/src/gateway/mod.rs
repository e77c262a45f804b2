//! Gateway adapters: rotation counters, health probes and API key lookup.

mod api_keys;
mod rotation;

pub use api_keys::InMemoryApiKeyDirectory;
pub use rotation::InMemoryRotationCounter;

#[cfg(feature = "redis")]
pub use rotation::RedisRotationCounter;

#[cfg(feature = "http")]
mod probe;
#[cfg(feature = "http")]
pub use probe::HttpHealthProbe;
