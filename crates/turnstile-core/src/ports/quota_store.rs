//! Quota persistence port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Period, Quota, QuotaScope};
use crate::error::StoreError;

/// Quota rows shared across processes.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// The active row for `scope` and `period`, if any.
    async fn find_active(
        &self,
        scope: &QuotaScope,
        period: Period,
    ) -> Result<Option<Quota>, StoreError>;

    /// Every active row of `subject` on `endpoint`, any tier and period.
    async fn list_active_for(
        &self,
        subject: &str,
        endpoint: &str,
    ) -> Result<Vec<Quota>, StoreError>;

    /// Every active row of `subject`.
    async fn list_active_for_subject(&self, subject: &str) -> Result<Vec<Quota>, StoreError>;

    /// Every active row.
    async fn list_active(&self) -> Result<Vec<Quota>, StoreError>;

    /// Insert a new active row. An existing active row for the same scope and
    /// period is left untouched; the caller deactivates it first.
    async fn insert(&self, quota: &Quota) -> Result<(), StoreError>;

    /// Insert `quota` only when no active row exists for its scope and
    /// period; otherwise return the existing row.
    async fn insert_if_absent(&self, quota: &Quota) -> Result<Quota, StoreError>;

    /// Replace row metadata, including `used` and `is_active`.
    async fn update(&self, quota: &Quota) -> Result<(), StoreError>;

    /// Atomically add `by` to `used` and return the updated row.
    async fn increment_usage(&self, id: Uuid, by: u64) -> Result<Quota, StoreError>;

    /// Drop inactive rows whose period ended before `before`. Returns the
    /// number of rows removed.
    async fn purge_retired(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;
}
