//! Management-plane request and response bodies.
//!
//! Enumerations travel as strings (`"free"`, `"day"`, `"HIGH"`) and are
//! parsed by the server, so clients do not need the domain crate.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetQuotaRequest {
    pub subject: String,
    pub endpoint: String,
    pub tier: String,
    pub period: String,
    pub limit: u64,
    #[serde(default)]
    pub overage_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeTierRequest {
    pub subject: String,
    pub endpoint: String,
    pub tier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockIpRequest {
    pub ip_address: String,
    pub reason: String,
    pub duration_secs: i64,
    /// Defaults to `HIGH`.
    #[serde(default)]
    pub threat_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetRateLimitRequest {
    pub ip: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub route: String,
    /// Defaults to the strategy configured for the route.
    #[serde(default)]
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddNodeRequest {
    pub id: String,
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddRuleRequest {
    pub id: String,
    pub pattern: String,
    #[serde(default = "any_method")]
    pub method: String,
    #[serde(default)]
    pub priority: i32,
    pub target_servers: Vec<String>,
    #[serde(default)]
    pub required_tier: Option<String>,
}

fn any_method() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    50
}

/// Counts from a maintenance pass (quota reset, block sweep, purge).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub deactivated: usize,
    pub created: usize,
    #[serde(default)]
    pub purged: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub store: String,
    pub nodes_total: usize,
    pub nodes_active: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_take_defaults() {
        let rule: AddRuleRequest = serde_json::from_str(
            r#"{"id":"r1","pattern":"/api/**","target_servers":["a"]}"#,
        )
        .unwrap();
        assert_eq!(rule.method, "*");
        assert_eq!(rule.priority, 0);
        assert!(rule.required_tier.is_none());

        let node: AddNodeRequest =
            serde_json::from_str(r#"{"id":"a","url":"http://a:8080"}"#).unwrap();
        assert_eq!(node.weight, 1);
    }
}
