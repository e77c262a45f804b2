//! Window Store port - sliding-window hit log per rate-limit key.

use async_trait::async_trait;

use crate::domain::WindowHit;
use crate::error::StoreError;

/// Sliding-window storage backend (Redis, in-memory).
///
/// `hit` must be atomic per key: pruning, inserting and counting happen as
/// one unit so concurrent callers never lose or double-count a hit.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Drop timestamps `<= now_ms - window_ms`, record `now_ms`, and return
    /// what is left in the window.
    async fn hit(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<WindowHit, StoreError>;

    /// Forget every hit recorded for `key`.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;

    /// Evict keys whose newest hit fell out of their window. Returns the
    /// number of keys removed. Backends with native TTLs may return 0.
    async fn purge_expired(&self, now_ms: i64) -> Result<usize, StoreError>;
}
