//! Application configuration loaded from environment variables.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use turnstile_core::ConfigError;
use turnstile_core::domain::{
    ApiKey, BlockFailurePolicy, GatewayConfig, NodeSpec, OveragePolicy, RateLimitConfig,
    RateLimitPolicy, RoutePreset, Strategy, Tier, TierLimits, TierTable,
};

use crate::middleware::TrustedProxies;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Shared store; in-memory adapters are used when unset.
    pub redis_url: Option<String>,
    pub rate_limit: RateLimitPolicy,
    pub overage_policy: OveragePolicy,
    pub tiers: TierTable,
    pub block_failure_policy: BlockFailurePolicy,
    pub gateway: GatewayConfig,
    pub nodes: Vec<NodeSpec>,
    pub api_keys: Vec<ApiKey>,
    pub usage_queue_capacity: usize,
    /// Peers allowed to set `X-Forwarded-For`. Empty means the TCP peer is
    /// always the client.
    pub trusted_proxies: TrustedProxies,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(env::vars())
    }

    /// Build from an explicit variable set.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let defaults = GatewayConfig::default();
        let gateway = GatewayConfig {
            algorithm: parse_or(get("GATEWAY_ALGORITHM"), defaults.algorithm)?,
            health_check_interval: Duration::from_secs(number_or(
                "GATEWAY_HEALTH_INTERVAL_SECS",
                get("GATEWAY_HEALTH_INTERVAL_SECS"),
                defaults.health_check_interval.as_secs(),
            )?),
            request_timeout: Duration::from_millis(number_or(
                "GATEWAY_REQUEST_TIMEOUT_MS",
                get("GATEWAY_REQUEST_TIMEOUT_MS"),
                defaults.request_timeout.as_millis() as u64,
            )?),
            max_retries: number_or(
                "GATEWAY_MAX_RETRIES",
                get("GATEWAY_MAX_RETRIES"),
                defaults.max_retries,
            )?,
            scale_out_threshold: number_or(
                "GATEWAY_SCALE_OUT_THRESHOLD",
                get("GATEWAY_SCALE_OUT_THRESHOLD"),
                defaults.scale_out_threshold,
            )?,
            health_path: get("GATEWAY_HEALTH_PATH")
                .map(str::to_string)
                .unwrap_or(defaults.health_path),
        };

        Ok(Self {
            host: get("HOST").unwrap_or("127.0.0.1").to_string(),
            port: number_or("PORT", get("PORT"), 8080)?,
            redis_url: get("REDIS_URL").map(str::to_string),
            rate_limit: Self::parse_rate_limits(&vars)?,
            overage_policy: parse_or(get("QUOTA_OVERAGE_POLICY"), OveragePolicy::default())?,
            tiers: Self::parse_tiers(&vars)?,
            block_failure_policy: parse_or(
                get("BLOCK_FAILURE_POLICY"),
                BlockFailurePolicy::default(),
            )?,
            gateway,
            nodes: get("GATEWAY_NODES").map(parse_nodes).transpose()?.unwrap_or_default(),
            api_keys: get("API_KEYS").map(parse_api_keys).transpose()?.unwrap_or_default(),
            usage_queue_capacity: number_or(
                "USAGE_QUEUE_CAPACITY",
                get("USAGE_QUEUE_CAPACITY"),
                10_000,
            )?,
            trusted_proxies: parse_or(get("TRUSTED_PROXIES"), TrustedProxies::default())?,
        })
    }

    /// Default limit from `RATE_LIMIT_*`, presets from `RATE_LIMIT_ROUTE_*`.
    /// Preset format: `RATE_LIMIT_ROUTE_<NAME>=<prefix>,<limit>,<window_ms>,<strategy>`
    /// Example: `RATE_LIMIT_ROUTE_PAYMENTS=/api/payments,10,60000,ip-and-user`
    fn parse_rate_limits(vars: &HashMap<String, String>) -> Result<RateLimitPolicy, ConfigError> {
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
        let fallback = RateLimitConfig::default();
        let default = RateLimitConfig::new(
            number_or("RATE_LIMIT_LIMIT", get("RATE_LIMIT_LIMIT"), fallback.limit)?,
            number_or(
                "RATE_LIMIT_WINDOW_MS",
                get("RATE_LIMIT_WINDOW_MS"),
                fallback.window_ms,
            )?,
            parse_or(get("RATE_LIMIT_STRATEGY"), fallback.strategy)?,
        )?;

        let mut presets = Vec::new();
        for (key, value) in vars {
            let Some(name) = key.strip_prefix("RATE_LIMIT_ROUTE_") else {
                continue;
            };
            let parts: Vec<&str> = value.split(',').map(str::trim).collect();
            let [prefix, limit, window_ms, strategy] = parts[..] else {
                return Err(invalid("RATE_LIMIT_ROUTE", value));
            };
            presets.push(RoutePreset {
                name: name.to_lowercase(),
                route_prefix: prefix.to_string(),
                config: RateLimitConfig::new(
                    number("RATE_LIMIT_ROUTE", limit)?,
                    number("RATE_LIMIT_ROUTE", window_ms)?,
                    Strategy::from_str(strategy)?,
                )?,
            });
        }

        Ok(RateLimitPolicy::new(default, presets))
    }

    /// Tier overrides.
    /// Format: `QUOTA_TIER_<TIER>=<per_min>,<per_hour>,<per_day>,<cost>,<overage_rate>`
    fn parse_tiers(vars: &HashMap<String, String>) -> Result<TierTable, ConfigError> {
        let mut table = TierTable::default();
        for (key, value) in vars {
            let Some(name) = key.strip_prefix("QUOTA_TIER_") else {
                continue;
            };
            let tier = Tier::from_str(name)?;
            let parts: Vec<&str> = value.split(',').map(str::trim).collect();
            let [per_minute, per_hour, per_day, cost, overage] = parts[..] else {
                return Err(invalid("QUOTA_TIER", value));
            };
            table.set(
                tier,
                TierLimits {
                    requests_per_minute: number("QUOTA_TIER", per_minute)?,
                    requests_per_hour: number("QUOTA_TIER", per_hour)?,
                    requests_per_day: number("QUOTA_TIER", per_day)?,
                    cost_per_request: number("QUOTA_TIER", cost)?,
                    overage_rate: number("QUOTA_TIER", overage)?,
                },
            )?;
        }
        Ok(table)
    }
}

/// `GATEWAY_NODES=<id>,<url>,<weight>;...`
fn parse_nodes(raw: &str) -> Result<Vec<NodeSpec>, ConfigError> {
    entries(raw)
        .map(|entry| {
            let parts: Vec<&str> = entry.split(',').map(str::trim).collect();
            let (id, url, weight) = match parts[..] {
                [id, url] => (id, url, 1),
                [id, url, weight] => (id, url, number("GATEWAY_NODES", weight)?),
                _ => return Err(invalid("GATEWAY_NODES", entry)),
            };
            let spec = NodeSpec {
                id: id.to_string(),
                url: url.to_string(),
                weight,
            };
            spec.validate()?;
            Ok(spec)
        })
        .collect()
}

/// `API_KEYS=<id>,<subject>,<tier>,<perm>|<perm>;...`
fn parse_api_keys(raw: &str) -> Result<Vec<ApiKey>, ConfigError> {
    entries(raw)
        .map(|entry| {
            let parts: Vec<&str> = entry.split(',').map(str::trim).collect();
            let [id, subject, tier, permissions] = parts[..] else {
                return Err(invalid("API_KEYS", entry));
            };
            Ok(ApiKey {
                id: id.to_string(),
                subject: subject.to_string(),
                tier: Tier::from_str(tier)?,
                permissions: permissions
                    .split('|')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        })
        .collect()
}

fn entries(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(';').map(str::trim).filter(|e| !e.is_empty())
}

fn parse_or<T>(value: Option<&str>, default: T) -> Result<T, ConfigError>
where
    T: FromStr<Err = ConfigError>,
{
    value.map(T::from_str).transpose().map(|v| v.unwrap_or(default))
}

fn number_or<T: FromStr>(
    field: &'static str,
    value: Option<&str>,
    default: T,
) -> Result<T, ConfigError> {
    value.map(|v| number(field, v)).transpose().map(|v| v.unwrap_or(default))
}

fn number<T: FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(field, value))
}

fn invalid(field: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use turnstile_core::domain::Algorithm;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = AppConfig::from_vars(Vec::new()).unwrap();
        assert_eq!(config.port, 8080);
        assert!(config.redis_url.is_none());
        assert_eq!(config.rate_limit.default, RateLimitConfig::default());
        assert_eq!(config.block_failure_policy, BlockFailurePolicy::Open);
        assert_eq!(config.overage_policy, OveragePolicy::Deny);
        assert!(config.nodes.is_empty());
        assert!(config.trusted_proxies.is_empty());
    }

    #[test]
    fn trusted_proxies_are_parsed() {
        let config =
            AppConfig::from_vars(vars(&[("TRUSTED_PROXIES", "10.0.0.0/8, 192.0.2.1")])).unwrap();
        assert!(config.trusted_proxies.contains(&"10.4.4.4".parse().unwrap()));
        assert!(config.trusted_proxies.contains(&"192.0.2.1".parse().unwrap()));
        assert!(!config.trusted_proxies.contains(&"198.51.100.7".parse().unwrap()));

        assert!(AppConfig::from_vars(vars(&[("TRUSTED_PROXIES", "everyone")])).is_err());
    }

    #[test]
    fn route_presets_and_tiers_are_parsed() {
        let config = AppConfig::from_vars(vars(&[
            ("RATE_LIMIT_ROUTE_PAYMENTS", "/api/payments,10,60000,ip-and-user"),
            ("QUOTA_TIER_FREE", "5,50,500,0,0"),
            ("BLOCK_FAILURE_POLICY", "closed"),
        ]))
        .unwrap();

        let payments = config.rate_limit.for_route("/api/payments/charge");
        assert_eq!(payments.limit, 10);
        assert_eq!(payments.strategy, Strategy::IpAndUser);
        assert_eq!(config.rate_limit.for_route("/api/events").limit, 100);
        assert_eq!(config.tiers.get(Tier::Free).requests_per_minute, 5);
        assert_eq!(config.block_failure_policy, BlockFailurePolicy::Closed);
    }

    #[test]
    fn gateway_nodes_and_keys_are_parsed() {
        let config = AppConfig::from_vars(vars(&[
            ("GATEWAY_ALGORITHM", "weighted"),
            (
                "GATEWAY_NODES",
                "a,http://10.0.0.1:8080,3; b,http://10.0.0.2:8080",
            ),
            ("API_KEYS", "key-1,acme,professional,events|gigs;key-2,globex,free,*"),
        ]))
        .unwrap();

        assert_eq!(config.gateway.algorithm, Algorithm::Weighted);
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].weight, 3);
        assert_eq!(config.nodes[1].weight, 1);
        assert_eq!(config.api_keys[0].tier, Tier::Professional);
        assert_eq!(config.api_keys[0].permissions, ["events", "gigs"]);
        assert!(config.api_keys[1].has_permission("payments"));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(AppConfig::from_vars(vars(&[("QUOTA_TIER_GOLD", "1,1,1,0,0")])).is_err());
        assert!(AppConfig::from_vars(vars(&[("QUOTA_TIER_FREE", "0,1,1,0,0")])).is_err());
        assert!(AppConfig::from_vars(vars(&[("RATE_LIMIT_STRATEGY", "cookie")])).is_err());
        assert!(AppConfig::from_vars(vars(&[("GATEWAY_NODES", "a,ftp://x,1")])).is_err());
        assert!(AppConfig::from_vars(vars(&[("PORT", "http")])).is_err());
    }
}
