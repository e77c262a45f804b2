use async_trait::async_trait;
use tokio::sync::Mutex;

use turnstile_core::domain::UsageEvent;
use turnstile_core::ports::{UsageError, UsageRecorder};

/// Writes every event to the `usage` tracing target, for log-based
/// analytics pipelines.
#[derive(Debug, Default)]
pub struct TracingUsageRecorder;

#[async_trait]
impl UsageRecorder for TracingUsageRecorder {
    async fn record(&self, event: UsageEvent) -> Result<(), UsageError> {
        tracing::info!(
            target: "usage",
            subject = %event.subject,
            api_key_id = event.api_key_id.as_deref().unwrap_or("-"),
            ip = %event.ip,
            endpoint = %event.endpoint,
            method = %event.method,
            status = event.status_code,
            response_time_ms = event.response_time_ms,
            cost = event.cost,
            timestamp = %event.timestamp,
            "request usage"
        );
        Ok(())
    }
}

/// Keeps events in memory.
#[derive(Default)]
pub struct InMemoryUsageRecorder {
    events: Mutex<Vec<UsageEvent>>,
}

impl InMemoryUsageRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<UsageEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl UsageRecorder for InMemoryUsageRecorder {
    async fn record(&self, event: UsageEvent) -> Result<(), UsageError> {
        self.events.lock().await.push(event);
        Ok(())
    }
}
