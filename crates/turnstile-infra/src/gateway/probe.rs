//! HTTP health probe.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use turnstile_core::domain::ServerNode;
use turnstile_core::ports::{HealthProbe, ProbeOutcome};

/// GETs `{node.url}{health_path}`; any 2xx within the timeout is healthy.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    health_path: String,
}

impl HttpHealthProbe {
    pub fn new(health_path: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), health_path)
    }

    pub fn with_client(client: reqwest::Client, health_path: impl Into<String>) -> Self {
        Self {
            client,
            health_path: health_path.into(),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, node: &ServerNode, timeout: Duration) -> ProbeOutcome {
        let url = format!("{}{}", node.url, self.health_path);
        let started = Instant::now();

        let result = self.client.get(&url).timeout(timeout).send().await;
        let response_time = started.elapsed();

        match result {
            Ok(response) if response.status().is_success() => ProbeOutcome {
                healthy: true,
                response_time,
                detail: None,
            },
            Ok(response) => ProbeOutcome {
                healthy: false,
                response_time,
                detail: Some(format!("status {}", response.status())),
            },
            Err(e) => {
                tracing::debug!(node_id = %node.id, url = %url, error = %e, "Health probe failed");
                ProbeOutcome {
                    healthy: false,
                    response_time,
                    detail: Some(e.to_string()),
                }
            }
        }
    }
}
