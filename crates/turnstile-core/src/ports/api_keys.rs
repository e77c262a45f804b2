//! API key metadata lookup. Issuing and authenticating keys is external.

use async_trait::async_trait;

use crate::domain::ApiKey;
use crate::error::StoreError;

#[async_trait]
pub trait ApiKeyDirectory: Send + Sync {
    async fn find(&self, api_key_id: &str) -> Result<Option<ApiKey>, StoreError>;
}
