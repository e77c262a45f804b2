//! Bounded usage channel.
//!
//! The request path only ever calls `try_send`; when the consumer falls
//! behind, events are dropped and reported as `QueueFull`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use turnstile_core::domain::UsageEvent;
use turnstile_core::ports::{UsageError, UsageRecorder, UsageSink};

pub struct ChannelUsageSink {
    sender: mpsc::Sender<UsageEvent>,
}

impl ChannelUsageSink {
    /// Create the channel and spawn the task that feeds `recorder`.
    ///
    /// The task ends once every sink clone is dropped and the queue drained.
    pub fn spawn(capacity: usize, recorder: Arc<dyn UsageRecorder>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<UsageEvent>(capacity.max(1));

        let handle = tokio::spawn(async move {
            tracing::info!(capacity, "Usage recorder started");
            while let Some(event) = rx.recv().await {
                if let Err(e) = recorder.record(event).await {
                    tracing::error!(error = %e, "Failed to record usage event");
                }
            }
            tracing::info!("Usage recorder stopped");
        });

        (Self { sender: tx }, handle)
    }

    pub fn from_env(recorder: Arc<dyn UsageRecorder>) -> (Self, JoinHandle<()>) {
        let capacity = std::env::var("USAGE_QUEUE_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10_000);
        Self::spawn(capacity, recorder)
    }
}

impl UsageSink for ChannelUsageSink {
    fn emit(&self, event: UsageEvent) -> Result<(), UsageError> {
        self.sender.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => UsageError::QueueFull,
            TrySendError::Closed(_) => UsageError::Closed,
        })
    }
}
