//! In-memory quota store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use turnstile_core::StoreError;
use turnstile_core::domain::{Period, Quota, QuotaScope};
use turnstile_core::ports::QuotaStore;

#[derive(Default)]
struct Tables {
    rows: HashMap<Uuid, Quota>,
    /// Active row per scope and period.
    active: HashMap<(QuotaScope, Period), Uuid>,
}

impl Tables {
    fn activate(&mut self, quota: &Quota) {
        self.active
            .insert((quota.scope.clone(), quota.period), quota.id);
        self.rows.insert(quota.id, quota.clone());
    }

    fn active_rows(&self) -> impl Iterator<Item = &Quota> {
        self.active.values().filter_map(|id| self.rows.get(id))
    }
}

/// Note: Data is lost on process restart.
pub struct InMemoryQuotaStore {
    tables: Mutex<Tables>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Every row ever stored, active or not.
    pub async fn all_rows(&self) -> Vec<Quota> {
        self.tables.lock().await.rows.values().cloned().collect()
    }
}

impl Default for InMemoryQuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn find_active(
        &self,
        scope: &QuotaScope,
        period: Period,
    ) -> Result<Option<Quota>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .active
            .get(&(scope.clone(), period))
            .and_then(|id| tables.rows.get(id))
            .cloned())
    }

    async fn list_active_for(
        &self,
        subject: &str,
        endpoint: &str,
    ) -> Result<Vec<Quota>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .active_rows()
            .filter(|q| q.scope.subject == subject && q.scope.endpoint == endpoint)
            .cloned()
            .collect())
    }

    async fn list_active_for_subject(&self, subject: &str) -> Result<Vec<Quota>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .active_rows()
            .filter(|q| q.scope.subject == subject)
            .cloned()
            .collect())
    }

    async fn list_active(&self) -> Result<Vec<Quota>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.active_rows().cloned().collect())
    }

    async fn insert(&self, quota: &Quota) -> Result<(), StoreError> {
        self.tables.lock().await.activate(quota);
        Ok(())
    }

    async fn insert_if_absent(&self, quota: &Quota) -> Result<Quota, StoreError> {
        let mut tables = self.tables.lock().await;
        let existing = tables
            .active
            .get(&(quota.scope.clone(), quota.period))
            .and_then(|id| tables.rows.get(id))
            .cloned();

        match existing {
            Some(row) => Ok(row),
            None => {
                tables.activate(quota);
                Ok(quota.clone())
            }
        }
    }

    async fn update(&self, quota: &Quota) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.rows.contains_key(&quota.id) {
            return Err(StoreError::Operation(format!("quota {} not found", quota.id)));
        }

        let slot = (quota.scope.clone(), quota.period);
        if quota.is_active {
            tables.active.insert(slot, quota.id);
        } else if tables.active.get(&slot) == Some(&quota.id) {
            tables.active.remove(&slot);
        }
        tables.rows.insert(quota.id, quota.clone());
        Ok(())
    }

    async fn increment_usage(&self, id: Uuid, by: u64) -> Result<Quota, StoreError> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::Operation(format!("quota {id} not found")))?;
        row.used = row.used.saturating_add(by);
        Ok(row.clone())
    }

    async fn purge_retired(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock().await;
        let before_len = tables.rows.len();
        tables
            .rows
            .retain(|_, row| row.is_active || row.period_end >= before);
        Ok(before_len - tables.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use turnstile_core::domain::Tier;

    use super::*;

    fn row(period: Period) -> Quota {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        Quota::new(
            QuotaScope::new("acme", "/api/events", Tier::Basic),
            period,
            10,
            0.5,
            false,
            now,
        )
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first_row() {
        let store = InMemoryQuotaStore::new();
        let first = row(Period::Day);
        let second = row(Period::Day);

        assert_eq!(store.insert_if_absent(&first).await.unwrap().id, first.id);
        assert_eq!(store.insert_if_absent(&second).await.unwrap().id, first.id);
        assert_eq!(store.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deactivated_row_leaves_active_set() {
        let store = InMemoryQuotaStore::new();
        let mut quota = row(Period::Hour);
        store.insert(&quota).await.unwrap();
        store.increment_usage(quota.id, 3).await.unwrap();

        quota.is_active = false;
        store.update(&quota).await.unwrap();

        assert!(store.list_active_for_subject("acme").await.unwrap().is_empty());
        assert_eq!(store.all_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn test_purge_retired_keeps_active_and_recent_rows() {
        let store = InMemoryQuotaStore::new();
        let active = row(Period::Minute);
        let mut retired = row(Period::Hour);
        store.insert(&active).await.unwrap();
        store.insert(&retired).await.unwrap();
        retired.is_active = false;
        store.update(&retired).await.unwrap();

        assert_eq!(store.purge_retired(retired.period_end).await.unwrap(), 0);

        let later = retired.period_end + chrono::TimeDelta::days(1);
        assert_eq!(store.purge_retired(later).await.unwrap(), 1);
        let rows = store.all_rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, active.id);
    }
}
