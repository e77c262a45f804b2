//! In-memory window store - used as fallback when Redis is unavailable.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use turnstile_core::StoreError;
use turnstile_core::domain::WindowHit;
use turnstile_core::ports::WindowStore;

struct Window {
    /// Ascending epoch milliseconds.
    hits: Vec<i64>,
    window_ms: i64,
}

impl Window {
    fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_ms;
        let stale = self.hits.partition_point(|t| *t <= cutoff);
        self.hits.drain(..stale);
    }
}

/// Per-key hit logs behind one mutex, so prune, insert and count are a
/// single step.
///
/// Note: Data is lost on process restart and is not shared between
/// processes.
pub struct InMemoryWindowStore {
    windows: Mutex<HashMap<String, Window>>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.windows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn hit(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<WindowHit, StoreError> {
        let mut windows = self.windows.lock().await;
        let window = windows.entry(key.to_string()).or_insert_with(|| Window {
            hits: Vec::new(),
            window_ms,
        });
        window.window_ms = window_ms;
        window.prune(now_ms);

        let at = window.hits.partition_point(|t| *t <= now_ms);
        window.hits.insert(at, now_ms);

        Ok(WindowHit {
            count: window.hits.len() as u64,
            timestamps: window.hits.clone(),
        })
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.windows.lock().await.remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<usize, StoreError> {
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, window| {
            window.prune(now_ms);
            !window.hits.is_empty()
        });
        Ok(before - windows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hit_prunes_old_timestamps() {
        let store = InMemoryWindowStore::new();
        store.hit("k", 1_000, 500).await.unwrap();
        store.hit("k", 1_200, 500).await.unwrap();

        // 1_000 is exactly window_ms old at 1_500 and must be gone
        let hit = store.hit("k", 1_500, 500).await.unwrap();
        assert_eq!(hit.timestamps, vec![1_200, 1_500]);
        assert_eq!(hit.count, 2);
    }

    #[tokio::test]
    async fn test_out_of_order_hits_stay_sorted() {
        let store = InMemoryWindowStore::new();
        store.hit("k", 2_000, 10_000).await.unwrap();
        let hit = store.hit("k", 1_500, 10_000).await.unwrap();
        assert_eq!(hit.timestamps, vec![1_500, 2_000]);
    }

    #[tokio::test]
    async fn test_reset_and_purge() {
        let store = InMemoryWindowStore::new();
        store.hit("a", 0, 100).await.unwrap();
        store.hit("b", 0, 100).await.unwrap();
        store.hit("c", 150, 100).await.unwrap();

        store.reset("a").await.unwrap();
        assert_eq!(store.purge_expired(200).await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
    }
}
