//! Shared round-robin rotation counter.

use async_trait::async_trait;

use crate::error::StoreError;

/// Monotonic counter shared by every router instance so they agree on
/// rotation order.
#[async_trait]
pub trait RotationCounter: Send + Sync {
    /// Increment `name` and return the value before the increment.
    async fn next(&self, name: &str) -> Result<u64, StoreError>;
}
