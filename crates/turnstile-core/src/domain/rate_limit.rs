use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::path::has_path_prefix;
use crate::error::ConfigError;

/// Which client identity a window is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Ip,
    /// Falls back to the IP key for unauthenticated callers.
    User,
    /// Both keys are checked; the most restrictive result wins.
    IpAndUser,
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ip" => Ok(Strategy::Ip),
            "user" => Ok(Strategy::User),
            "ip-and-user" | "ip_and_user" => Ok(Strategy::IpAndUser),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Ip => f.write_str("ip"),
            Strategy::User => f.write_str("user"),
            Strategy::IpAndUser => f.write_str("ip-and-user"),
        }
    }
}

/// Short-window limit applied to a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window_ms: i64,
    pub strategy: Strategy,
}

impl RateLimitConfig {
    pub fn new(limit: u32, window_ms: i64, strategy: Strategy) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::InvalidLimit("limit must be positive".to_string()));
        }
        if window_ms <= 0 {
            return Err(ConfigError::InvalidLimit(
                "window must be positive".to_string(),
            ));
        }
        Ok(Self {
            limit,
            window_ms,
            strategy,
        })
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window_ms: 60_000,
            strategy: Strategy::Ip,
        }
    }
}

/// A rate limit preset bound to a route prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePreset {
    pub name: String,
    pub route_prefix: String,
    pub config: RateLimitConfig,
}

/// Per-route presets with a fallback. The longest matching prefix wins.
#[derive(Debug, Clone, Default)]
pub struct RateLimitPolicy {
    pub default: RateLimitConfig,
    presets: Vec<RoutePreset>,
}

impl RateLimitPolicy {
    pub fn new(default: RateLimitConfig, mut presets: Vec<RoutePreset>) -> Self {
        presets.sort_by(|a, b| b.route_prefix.len().cmp(&a.route_prefix.len()));
        Self { default, presets }
    }

    fn preset_for(&self, path: &str) -> Option<&RoutePreset> {
        self.presets
            .iter()
            .find(|p| has_path_prefix(path, &p.route_prefix))
    }

    pub fn for_route(&self, path: &str) -> &RateLimitConfig {
        self.preset_for(path)
            .map(|p| &p.config)
            .unwrap_or(&self.default)
    }

    /// Config for `path` and the route its window is counted under: the
    /// preset's prefix when one matches, else `resource`.
    pub fn resolve<'a>(&'a self, path: &str, resource: &'a str) -> (&'a str, &'a RateLimitConfig) {
        match self.preset_for(path) {
            Some(preset) => match preset.route_prefix.trim_end_matches('/') {
                "" => ("/", &preset.config),
                prefix => (prefix, &preset.config),
            },
            None => (resource, &self.default),
        }
    }

    pub fn presets(&self) -> &[RoutePreset] {
        &self.presets
    }
}

/// The already-authenticated caller as seen by the limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub ip: String,
    pub user_id: Option<String>,
}

impl ClientIdentity {
    pub fn anonymous(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_id: None,
        }
    }

    pub fn user(ip: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_id: Some(user_id.into()),
        }
    }

    /// Window keys to check for this caller under `strategy`.
    pub fn keys(&self, route: &str, strategy: Strategy) -> Vec<String> {
        let ip_key = rate_limit_key("ip", &self.ip, route);
        match (strategy, &self.user_id) {
            (Strategy::Ip, _) | (Strategy::User, None) | (Strategy::IpAndUser, None) => {
                vec![ip_key]
            }
            (Strategy::User, Some(user)) => vec![rate_limit_key("user", user, route)],
            (Strategy::IpAndUser, Some(user)) => {
                vec![ip_key, rate_limit_key("user", user, route)]
            }
        }
    }
}

/// Composite window key: `rl:<scope>:<value>:<route>`.
pub fn rate_limit_key(scope: &str, value: &str, route: &str) -> String {
    format!("rl:{}:{}:{}", scope, value, route)
}

/// Result of a Window Store hit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowHit {
    pub count: u64,
    /// Epoch milliseconds, ascending.
    pub timestamps: Vec<i64>,
}

impl WindowHit {
    pub fn oldest(&self) -> Option<i64> {
        self.timestamps.first().copied()
    }
}

/// Outcome of a short-window check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Seconds; zero when allowed.
    pub retry_after: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RateLimitPolicy {
        RateLimitPolicy::new(
            RateLimitConfig::default(),
            vec![RoutePreset {
                name: "payments".to_string(),
                route_prefix: "/api/payments/".to_string(),
                config: RateLimitConfig::new(10, 60_000, Strategy::IpAndUser).unwrap(),
            }],
        )
    }

    #[test]
    fn presets_match_whole_segments() {
        let policy = policy();
        assert_eq!(policy.for_route("/api/payments/charge").limit, 10);
        assert_eq!(policy.for_route("/api/payments").limit, 10);
        assert_eq!(policy.for_route("/api/paymentsX").limit, 100);
    }

    #[test]
    fn windows_are_counted_per_preset_or_resource() {
        let policy = policy();
        let (route, config) = policy.resolve("/api/payments/charge/9", "/api/payments");
        assert_eq!(route, "/api/payments");
        assert_eq!(config.limit, 10);

        let (route, config) = policy.resolve("/api/events/9", "/api/events");
        assert_eq!(route, "/api/events");
        assert_eq!(config.limit, 100);
    }

    #[test]
    fn ip_and_user_checks_both_keys() {
        let identity = ClientIdentity::user("10.0.0.1", "u-1");
        assert_eq!(
            identity.keys("/api/events", Strategy::IpAndUser),
            vec![
                "rl:ip:10.0.0.1:/api/events".to_string(),
                "rl:user:u-1:/api/events".to_string()
            ]
        );
        assert_eq!(
            ClientIdentity::anonymous("10.0.0.1").keys("/api/events", Strategy::User),
            vec!["rl:ip:10.0.0.1:/api/events".to_string()]
        );
    }
}
