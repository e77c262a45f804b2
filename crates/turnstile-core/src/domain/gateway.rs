use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::path::{RequestPath, has_path_prefix};
use super::quota::Tier;
use crate::error::ConfigError;

/// Node selection algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    RoundRobin,
    Weighted,
    LeastConnections,
}

impl FromStr for Algorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "round-robin" | "round_robin" => Ok(Algorithm::RoundRobin),
            "weighted" | "weighted-random" => Ok(Algorithm::Weighted),
            "least-connections" | "least_connections" => Ok(Algorithm::LeastConnections),
            other => Err(ConfigError::UnknownAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::RoundRobin => f.write_str("round-robin"),
            Algorithm::Weighted => f.write_str("weighted"),
            Algorithm::LeastConnections => f.write_str("least-connections"),
        }
    }
}

/// Backend node registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub url: String,
    pub weight: u32,
}

impl NodeSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "node.id",
                value: self.id.clone(),
            });
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                field: "node.url",
                value: self.url.clone(),
            });
        }
        if self.weight == 0 {
            return Err(ConfigError::InvalidValue {
                field: "node.weight",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Live view of a backend node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerNode {
    pub id: String,
    pub url: String,
    pub weight: u32,
    pub is_active: bool,
    pub connections: u64,
    pub requests_served: u64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub response_time_ms: Option<u64>,
}

impl From<NodeSpec> for ServerNode {
    fn from(spec: NodeSpec) -> Self {
        Self {
            id: spec.id,
            url: spec.url.trim_end_matches('/').to_string(),
            weight: spec.weight,
            is_active: true,
            connections: 0,
            requests_served: 0,
            last_health_check: None,
            response_time_ms: None,
        }
    }
}

/// Extra predicates a rule must satisfy besides path and method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConditions {
    pub required_tier: Option<Tier>,
}

impl RuleConditions {
    pub fn holds(&self, tier: Tier) -> bool {
        self.required_tier.is_none_or(|required| required == tier)
    }
}

/// Routing rule: matching requests go to `target_servers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    pub pattern: String,
    /// HTTP method or `*`.
    pub method: String,
    pub priority: i32,
    pub target_servers: Vec<String>,
    #[serde(default)]
    pub conditions: RuleConditions,
}

impl RoutingRule {
    pub fn method_matches(&self, method: &str) -> bool {
        self.method == "*" || self.method.eq_ignore_ascii_case(method)
    }
}

/// Compiled glob: `**` spans segments, `*` stays within one, `?` is one char.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn compile(pattern: &str) -> Result<Self, ConfigError> {
        if !pattern.starts_with('/') {
            return Err(ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern must start with '/'".to_string(),
            });
        }

        let mut expr = String::from("^");
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    expr.push_str(".*");
                }
                '*' => expr.push_str("[^/]*"),
                '?' => expr.push_str("[^/]"),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// API key metadata issued by the (external) authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub subject: String,
    pub tier: Tier,
    pub permissions: Vec<String>,
}

/// Permission that opens the management plane.
pub const ADMIN_PERMISSION: &str = "admin";

impl ApiKey {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions
            .iter()
            .any(|p| p == "*" || p == permission)
    }

    /// Management access needs an explicit `admin` grant; `*` does not
    /// imply it.
    pub fn is_operator(&self) -> bool {
        self.permissions.iter().any(|p| p == ADMIN_PERMISSION)
    }
}

/// Endpoint prefix to required permission. Longest prefix wins.
#[derive(Debug, Clone)]
pub struct PermissionMap {
    entries: Vec<(String, String)>,
    fallback: String,
}

impl PermissionMap {
    pub fn new(mut entries: Vec<(String, String)>, fallback: impl Into<String>) -> Self {
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self {
            entries,
            fallback: fallback.into(),
        }
    }

    fn entry_for(&self, path: &str) -> Option<&(String, String)> {
        self.entries
            .iter()
            .find(|(prefix, _)| has_path_prefix(path, prefix))
    }

    /// Permission needed for a normalized `path`.
    pub fn required_for(&self, path: &str) -> &str {
        self.entry_for(path)
            .map(|(_, permission)| permission.as_str())
            .unwrap_or(&self.fallback)
    }

    /// The resource a request is accounted under: the owning permission
    /// prefix, else the path's first segment. `/api/events/7` and
    /// `/api/events/8` share `/api/events`.
    pub fn resource_for(&self, path: &RequestPath) -> String {
        let full = path.path();
        match self.entry_for(&full) {
            Some((prefix, _)) => prefix.trim_end_matches('/').to_string(),
            None => path.top_level(),
        }
    }
}

impl Default for PermissionMap {
    fn default() -> Self {
        let entries = [
            ("/api/events", "events"),
            ("/api/gigs", "gigs"),
            ("/api/users", "users"),
            ("/api/payments", "payments"),
            ("/api/analytics", "analytics"),
            ("/api/webhooks", "webhooks"),
            ("/api/admin", "admin"),
        ]
        .into_iter()
        .map(|(prefix, permission)| (prefix.to_string(), permission.to_string()))
        .collect();
        Self::new(entries, "api")
    }
}

/// Where a routed request should be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteTarget {
    pub node_id: String,
    pub target_url: String,
    pub retries: u32,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

/// Advisory capacity recommendation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recommendation {
    ScaleOut {
        average_connections: f64,
        threshold: f64,
        suggested_additional_nodes: u32,
    },
    ScaleIn {
        node_id: String,
        connections: u64,
        average_connections: f64,
    },
    RebalanceWeight {
        node_id: String,
        current_weight: u32,
        suggested_weight: u32,
        weight_share: f64,
        connection_share: f64,
    },
}

/// Snapshot of router state for the management plane.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayStats {
    pub algorithm: Algorithm,
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub total_connections: u64,
    pub total_requests_served: u64,
    pub average_response_time_ms: Option<f64>,
    pub rules: usize,
    pub nodes: Vec<ServerNode>,
}

/// Router tuning knobs.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub algorithm: Algorithm,
    pub health_check_interval: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    /// Average connections per node above which scale-out is advised.
    pub scale_out_threshold: f64,
    pub health_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::RoundRobin,
            health_check_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            max_retries: 2,
            scale_out_threshold: 100.0,
            health_path: "/health".to_string(),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_single_and_double_star() {
        let single = GlobPattern::compile("/api/events/*").unwrap();
        assert!(single.matches("/api/events/42"));
        assert!(!single.matches("/api/events/42/tickets"));

        let double = GlobPattern::compile("/api/**").unwrap();
        assert!(double.matches("/api/events/42/tickets"));
        assert!(!double.matches("/health"));
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        let pattern = GlobPattern::compile("/api/v1.0/items").unwrap();
        assert!(pattern.matches("/api/v1.0/items"));
        assert!(!pattern.matches("/api/v1x0/items"));
    }

    #[test]
    fn glob_rejects_relative_pattern() {
        assert!(matches!(
            GlobPattern::compile("api/*"),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn permission_map_longest_prefix() {
        let map = PermissionMap::new(
            vec![
                ("/api".to_string(), "api".to_string()),
                ("/api/payments".to_string(), "payments".to_string()),
            ],
            "none",
        );
        assert_eq!(map.required_for("/api/payments/7"), "payments");
        assert_eq!(map.required_for("/api/events"), "api");
        assert_eq!(map.required_for("/other"), "none");
    }

    #[test]
    fn permission_prefix_stops_at_segment_boundary() {
        let map = PermissionMap::default();
        assert_eq!(map.required_for("/api/events/42"), "events");
        assert_eq!(map.required_for("/api/eventsX"), "api");
        assert_eq!(map.required_for("/api/admin"), "admin");
    }

    #[test]
    fn parameterized_paths_share_a_resource() {
        let map = PermissionMap::default();
        let first = RequestPath::parse("/api/events/1").unwrap();
        let second = RequestPath::parse("/api/events/2/tickets?x=1").unwrap();
        assert_eq!(map.resource_for(&first), "/api/events");
        assert_eq!(map.resource_for(&second), "/api/events");

        let unmapped = RequestPath::parse("/status/deep/path").unwrap();
        assert_eq!(map.resource_for(&unmapped), "/status");
    }

    #[test]
    fn wildcard_permission_grants_everything() {
        let key = ApiKey {
            id: "k1".to_string(),
            subject: "acme".to_string(),
            tier: Tier::Enterprise,
            permissions: vec!["*".to_string()],
        };
        assert!(key.has_permission("payments"));
        assert!(!key.is_operator());

        let ops = ApiKey {
            permissions: vec![ADMIN_PERMISSION.to_string()],
            ..key
        };
        assert!(ops.is_operator());
    }

    #[test]
    fn node_spec_validation() {
        let spec = NodeSpec {
            id: "n1".to_string(),
            url: "ftp://nope".to_string(),
            weight: 10,
        };
        assert!(spec.validate().is_err());
    }
}
