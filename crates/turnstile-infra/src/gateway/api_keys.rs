use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use turnstile_core::StoreError;
use turnstile_core::domain::ApiKey;
use turnstile_core::ports::ApiKeyDirectory;

/// API key metadata loaded from configuration.
pub struct InMemoryApiKeyDirectory {
    keys: RwLock<HashMap<String, ApiKey>>,
}

impl InMemoryApiKeyDirectory {
    pub fn new(keys: impl IntoIterator<Item = ApiKey>) -> Self {
        Self {
            keys: RwLock::new(keys.into_iter().map(|k| (k.id.clone(), k)).collect()),
        }
    }

    pub async fn insert(&self, key: ApiKey) {
        self.keys.write().await.insert(key.id.clone(), key);
    }

    pub async fn len(&self) -> usize {
        self.keys.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryApiKeyDirectory {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl ApiKeyDirectory for InMemoryApiKeyDirectory {
    async fn find(&self, api_key_id: &str) -> Result<Option<ApiKey>, StoreError> {
        Ok(self.keys.read().await.get(api_key_id).cloned())
    }
}
