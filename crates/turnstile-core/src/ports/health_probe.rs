//! Node health probing.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::ServerNode;

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub response_time: Duration,
    pub detail: Option<String>,
}

/// Checks whether a node answers within `timeout`.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, node: &ServerNode, timeout: Duration) -> ProbeOutcome;
}
