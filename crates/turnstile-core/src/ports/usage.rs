//! Usage event sink - the hand-off point to the external usage recorder.

use async_trait::async_trait;

use crate::domain::UsageEvent;

/// Non-blocking producer side of the usage channel.
pub trait UsageSink: Send + Sync {
    /// Enqueue `event`. Never waits; a full queue is reported, not awaited.
    fn emit(&self, event: UsageEvent) -> Result<(), UsageError>;
}

/// Consumer side: persists events for analytics and billing.
#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record(&self, event: UsageEvent) -> Result<(), UsageError>;
}

/// Usage hand-off errors.
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("Usage queue is full")]
    QueueFull,

    #[error("Usage queue is closed")]
    Closed,

    #[error("Recorder failed: {0}")]
    Recorder(String),
}
