//! Background processing - scheduled maintenance jobs.

mod jobs;
mod scheduler;

pub use jobs::register as register_jobs;
pub use scheduler::{Scheduler, SchedulerConfig};
