//! Services - the admission-control logic, written against ports only.

mod admission;
mod block_registry;
mod gateway;
mod quota;
mod rate_limiter;
mod threat;

pub use admission::{
    Admission, AdmissionController, AdmissionRequest, LimitHeaders, QuotaSubject, Verdict,
};
pub use block_registry::{BlockCheck, BlockRegistry, SECURITY_TARGET};
pub use gateway::{GatewayRouter, HealthReport, least_connections, weighted_pick};
pub use quota::{QuotaManager, RETIRED_QUOTA_RETENTION_DAYS, ResetReport};
pub use rate_limiter::{SlidingWindowLimiter, evaluate};
pub use threat::{ThreatDetector, coefficient_of_variation};
