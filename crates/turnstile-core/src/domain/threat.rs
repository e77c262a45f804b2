use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Heuristic severities are clamped to this range.
pub const MAX_SEVERITY: f64 = 5.0;

/// Fused threat classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn from_severity(severity: f64) -> Self {
        if severity >= 4.0 {
            ThreatLevel::Critical
        } else if severity >= 3.0 {
            ThreatLevel::High
        } else if severity >= 2.0 {
            ThreatLevel::Medium
        } else {
            ThreatLevel::Low
        }
    }

    /// Only HIGH and CRITICAL trigger an automatic block.
    pub fn triggers_block(&self) -> bool {
        matches!(self, ThreatLevel::High | ThreatLevel::Critical)
    }

    /// Block length for this level. LOW never blocks.
    pub fn block_duration(&self) -> Option<TimeDelta> {
        match self {
            ThreatLevel::Low => None,
            ThreatLevel::Medium => Some(TimeDelta::minutes(30)),
            ThreatLevel::High => Some(TimeDelta::hours(2)),
            ThreatLevel::Critical => Some(TimeDelta::hours(24)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Low => "LOW",
            ThreatLevel::Medium => "MEDIUM",
            ThreatLevel::High => "HIGH",
            ThreatLevel::Critical => "CRITICAL",
        }
    }
}

impl FromStr for ThreatLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "LOW" => Ok(ThreatLevel::Low),
            "MEDIUM" => Ok(ThreatLevel::Medium),
            "HIGH" => Ok(ThreatLevel::High),
            "CRITICAL" => Ok(ThreatLevel::Critical),
            other => Err(ConfigError::InvalidValue {
                field: "threat_level",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `min(count / threshold, 5)`.
pub fn ratio_severity(count: u64, threshold: u64) -> f64 {
    if threshold == 0 {
        return 0.0;
    }
    (count as f64 / threshold as f64).min(MAX_SEVERITY)
}

/// Which heuristic produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Heuristic {
    RequestRate,
    EndpointFlood,
    DistributedAttack,
    Behavioral,
    Geographic,
}

impl Heuristic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Heuristic::RequestRate => "request_rate",
            Heuristic::EndpointFlood => "endpoint_flood",
            Heuristic::DistributedAttack => "distributed_attack",
            Heuristic::Behavioral => "behavioral",
            Heuristic::Geographic => "geographic",
        }
    }
}

/// One heuristic's verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreatSignal {
    pub heuristic: Heuristic,
    pub severity: f64,
    pub reason: String,
}

impl ThreatSignal {
    pub fn new(heuristic: Heuristic, severity: f64, reason: impl Into<String>) -> Self {
        Self {
            heuristic,
            severity: severity.clamp(0.0, MAX_SEVERITY),
            reason: reason.into(),
        }
    }

    pub fn quiet(heuristic: Heuristic) -> Self {
        Self::new(heuristic, 0.0, "no anomaly")
    }
}

/// Outcome of `ThreatDetector::analyze`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreatAssessment {
    pub is_blocked: bool,
    pub threat_level: ThreatLevel,
    pub reason: String,
    /// Remaining block time in seconds; zero when not blocked.
    pub block_duration: u64,
    pub violation_count: u32,
    pub severity: f64,
}

impl ThreatAssessment {
    pub fn clear(level: ThreatLevel, severity: f64, reason: impl Into<String>) -> Self {
        Self {
            is_blocked: false,
            threat_level: level,
            reason: reason.into(),
            block_duration: 0,
            violation_count: 0,
            severity,
        }
    }
}

/// Fixed thresholds for the detection heuristics.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreatThresholds {
    /// `(window, max requests)` pairs for the request-rate heuristic.
    pub rate_windows: Vec<(TimeDelta, u64)>,
    pub endpoint_window: TimeDelta,
    pub endpoint_threshold: u64,
    pub distributed_window: TimeDelta,
    pub distributed_threshold: u64,
    pub user_agent_window: TimeDelta,
    pub user_agent_threshold: u64,
    pub fan_out_window: TimeDelta,
    pub fan_out_threshold: u64,
    pub timing_window: TimeDelta,
    /// Fewer intervals than this are not judged.
    pub timing_min_intervals: usize,
    /// Coefficient of variation below which timing counts as scripted.
    pub timing_max_variation: f64,
    pub timing_severity: f64,
}

impl ThreatThresholds {
    /// How long activity must be retained to answer every heuristic.
    pub fn retention(&self) -> TimeDelta {
        self.rate_windows
            .iter()
            .map(|(w, _)| *w)
            .chain([
                self.endpoint_window,
                self.distributed_window,
                self.user_agent_window,
                self.fan_out_window,
                self.timing_window,
            ])
            .max()
            .unwrap_or(TimeDelta::minutes(15))
    }
}

impl Default for ThreatThresholds {
    fn default() -> Self {
        Self {
            rate_windows: vec![
                (TimeDelta::minutes(1), 60),
                (TimeDelta::minutes(5), 200),
                (TimeDelta::minutes(15), 500),
            ],
            endpoint_window: TimeDelta::minutes(5),
            endpoint_threshold: 50,
            distributed_window: TimeDelta::minutes(10),
            distributed_threshold: 100,
            user_agent_window: TimeDelta::minutes(10),
            user_agent_threshold: 5,
            fan_out_window: TimeDelta::minutes(5),
            fan_out_threshold: 20,
            timing_window: TimeDelta::minutes(5),
            timing_min_intervals: 10,
            timing_max_variation: 0.1,
            timing_severity: 2.0,
        }
    }
}

/// How a block came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Manual,
    Automatic,
    Threat,
}

impl FromStr for BlockType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "manual" => Ok(BlockType::Manual),
            "automatic" => Ok(BlockType::Automatic),
            "threat" => Ok(BlockType::Threat),
            other => Err(ConfigError::InvalidValue {
                field: "block_type",
                value: other.to_string(),
            }),
        }
    }
}

/// A block record. At most one active record exists per IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedIp {
    pub ip_address: String,
    pub block_type: BlockType,
    pub reason: String,
    pub threat_level: ThreatLevel,
    pub violation_count: u32,
    pub blocked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub unblocked_at: Option<DateTime<Utc>>,
    pub unblocked_by: Option<String>,
}

impl BlockedIp {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whole seconds until expiry, rounded up.
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.expires_at - now).num_milliseconds();
        if millis <= 0 {
            0
        } else {
            (millis as u64).div_ceil(1000)
        }
    }
}

/// Result of placing a block over whatever the IP already had.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockPlacement {
    /// The active record after the placement.
    pub record: BlockedIp,
    /// An expired record displaced by the placement, now inactive.
    pub retired: Option<BlockedIp>,
}

impl BlockPlacement {
    /// Fold `candidate` into `current`, the IP's active record if any.
    ///
    /// A live record is extended: expiry only moves forward, the level never
    /// drops and `violation_count` goes up by one. An expired record is
    /// retired and `candidate` takes its place.
    pub fn resolve(current: Option<BlockedIp>, candidate: BlockedIp, now: DateTime<Utc>) -> Self {
        match current {
            Some(mut live) if live.is_active && !live.is_expired(now) => {
                live.expires_at = live.expires_at.max(candidate.expires_at);
                live.violation_count = live.violation_count.saturating_add(1);
                live.threat_level = live.threat_level.max(candidate.threat_level);
                live.reason = candidate.reason;
                Self {
                    record: live,
                    retired: None,
                }
            }
            stale => Self {
                record: candidate,
                retired: stale.filter(|r| r.is_active).map(|mut r| {
                    r.is_active = false;
                    r
                }),
            },
        }
    }
}

/// Request to place (or extend) a block.
#[derive(Debug, Clone)]
pub struct BlockRequest {
    pub ip_address: String,
    pub block_type: BlockType,
    pub reason: String,
    pub threat_level: ThreatLevel,
    pub duration: TimeDelta,
}

/// What to do when the durable block store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockFailurePolicy {
    /// Treat the IP as not blocked.
    #[default]
    Open,
    /// Deny the request as if blocked.
    Closed,
}

impl FromStr for BlockFailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "open" => Ok(BlockFailurePolicy::Open),
            "closed" => Ok(BlockFailurePolicy::Closed),
            other => Err(ConfigError::InvalidValue {
                field: "block_failure_policy",
                value: other.to_string(),
            }),
        }
    }
}
