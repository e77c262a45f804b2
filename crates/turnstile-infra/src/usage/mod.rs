//! Usage event hand-off: a bounded channel drained by a recorder task.

mod channel;
mod recorder;

pub use channel::ChannelUsageSink;
pub use recorder::{InMemoryUsageRecorder, TracingUsageRecorder};
