//! Response header names.

pub const RATE_LIMIT_LIMIT: &str = "X-RateLimit-Limit";
pub const RATE_LIMIT_REMAINING: &str = "X-RateLimit-Remaining";
/// ISO-8601 instant the current window or period resets.
pub const RATE_LIMIT_RESET: &str = "X-RateLimit-Reset";
pub const RATE_LIMIT_OVERAGE: &str = "X-RateLimit-Overage";
pub const RETRY_AFTER: &str = "Retry-After";

/// API key presented to the gateway and the management plane.
pub const API_KEY: &str = "X-Api-Key";
/// Authenticated user id forwarded by the upstream auth layer.
pub const USER_ID: &str = "X-User-Id";
/// Correlation id, echoed on every response.
pub const REQUEST_ID: &str = "X-Request-ID";
