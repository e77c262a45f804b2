//! Domain types for admission control.

mod gateway;
mod path;
mod quota;
mod rate_limit;
mod threat;
mod usage;

pub use gateway::{
    ADMIN_PERMISSION, Algorithm, ApiKey, GatewayConfig, GatewayStats, GlobPattern, NodeSpec, PermissionMap, Recommendation,
    RouteTarget, RoutingRule, RuleConditions, ServerNode,
};
pub use path::{RequestPath, has_path_prefix};
pub use quota::{
    OveragePolicy, Period, Quota, QuotaDecision, QuotaScope, Tier, TierLimits, TierTable,
};
pub use rate_limit::{
    ClientIdentity, RateLimitConfig, RateLimitDecision, RateLimitPolicy, RoutePreset, Strategy,
    WindowHit, rate_limit_key,
};
pub use threat::{
    BlockFailurePolicy, BlockPlacement, BlockRequest, BlockType, BlockedIp, Heuristic, MAX_SEVERITY,
    ThreatAssessment, ThreatLevel, ThreatSignal, ThreatThresholds, ratio_severity,
};
pub use usage::UsageEvent;
