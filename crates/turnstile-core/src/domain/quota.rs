use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

/// Billing tier of a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Professional,
    Enterprise,
    Custom,
}

impl Tier {
    pub const ALL: [Tier; 5] = [
        Tier::Free,
        Tier::Basic,
        Tier::Professional,
        Tier::Enterprise,
        Tier::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Professional => "professional",
            Tier::Enterprise => "enterprise",
            Tier::Custom => "custom",
        }
    }
}

impl FromStr for Tier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "professional" | "pro" => Ok(Tier::Professional),
            "enterprise" => Ok(Tier::Enterprise),
            "custom" => Ok(Tier::Custom),
            other => Err(ConfigError::UnknownTier(other.to_string())),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calendar unit a quota is counted over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Minute => "minute",
            Period::Hour => "hour",
            Period::Day => "day",
            Period::Week => "week",
            Period::Month => "month",
        }
    }

    /// Calendar-aligned `[start, end)` in UTC containing `now`.
    ///
    /// Weeks start on Monday. A day quota created at 23:59:50 ends at the
    /// following midnight, not 24 hours later.
    pub fn bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        const MINUTE: i64 = 60;
        const HOUR: i64 = 60 * MINUTE;
        const DAY: i64 = 24 * HOUR;

        let secs = now.timestamp();
        let truncate = |unit: i64, offset: i64| {
            let rem = (secs + offset).rem_euclid(unit);
            now - TimeDelta::seconds(rem)
                - TimeDelta::nanoseconds(i64::from(now.timestamp_subsec_nanos()))
        };

        match self {
            Period::Minute => {
                let start = truncate(MINUTE, 0);
                (start, start + TimeDelta::seconds(MINUTE))
            }
            Period::Hour => {
                let start = truncate(HOUR, 0);
                (start, start + TimeDelta::seconds(HOUR))
            }
            Period::Day => {
                let start = truncate(DAY, 0);
                (start, start + TimeDelta::seconds(DAY))
            }
            Period::Week => {
                // 1970-01-01 was a Thursday; shift so weeks begin on Monday.
                let start = truncate(7 * DAY, 3 * DAY);
                (start, start + TimeDelta::seconds(7 * DAY))
            }
            Period::Month => {
                let day_start = truncate(DAY, 0);
                let start = day_start - TimeDelta::days(i64::from(now.day0()));
                (start, start + Months::new(1))
            }
        }
    }
}

impl FromStr for Period {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "minute" => Ok(Period::Minute),
            "hour" => Ok(Period::Hour),
            "day" => Ok(Period::Day),
            "week" => Ok(Period::Week),
            "month" => Ok(Period::Month),
            other => Err(ConfigError::UnknownPeriod(other.to_string())),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Built-in limits for a tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    pub requests_per_minute: u64,
    pub requests_per_hour: u64,
    pub requests_per_day: u64,
    pub cost_per_request: f64,
    pub overage_rate: f64,
}

impl TierLimits {
    pub fn per_period(&self) -> [(Period, u64); 3] {
        [
            (Period::Minute, self.requests_per_minute),
            (Period::Hour, self.requests_per_hour),
            (Period::Day, self.requests_per_day),
        ]
    }
}

/// Default limits applied when a subject has no explicit quota rows.
#[derive(Debug, Clone)]
pub struct TierTable {
    tiers: HashMap<Tier, TierLimits>,
}

impl TierTable {
    pub fn get(&self, tier: Tier) -> TierLimits {
        self.tiers
            .get(&tier)
            .copied()
            .unwrap_or_else(|| Self::builtin(tier))
    }

    pub fn set(&mut self, tier: Tier, limits: TierLimits) -> Result<(), ConfigError> {
        if limits.requests_per_minute == 0
            || limits.requests_per_hour == 0
            || limits.requests_per_day == 0
        {
            return Err(ConfigError::InvalidLimit(format!(
                "tier {} limits must be positive",
                tier
            )));
        }
        if limits.cost_per_request < 0.0 || limits.overage_rate < 0.0 {
            return Err(ConfigError::InvalidLimit(format!(
                "tier {} rates must not be negative",
                tier
            )));
        }
        self.tiers.insert(tier, limits);
        Ok(())
    }

    fn builtin(tier: Tier) -> TierLimits {
        let (per_minute, per_hour, per_day, cost, overage) = match tier {
            Tier::Free => (10, 100, 1_000, 0.0, 0.0),
            Tier::Basic => (60, 2_000, 20_000, 0.001, 0.002),
            Tier::Professional => (300, 10_000, 100_000, 0.0008, 0.0015),
            Tier::Enterprise => (1_000, 50_000, 1_000_000, 0.0005, 0.001),
            Tier::Custom => (5_000, 200_000, 5_000_000, 0.0002, 0.0005),
        };
        TierLimits {
            requests_per_minute: per_minute,
            requests_per_hour: per_hour,
            requests_per_day: per_day,
            cost_per_request: cost,
            overage_rate: overage,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            tiers: Tier::ALL
                .iter()
                .map(|tier| (*tier, Self::builtin(*tier)))
                .collect(),
        }
    }
}

/// What a quota row counts: one subject, one endpoint, one tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotaScope {
    pub subject: String,
    pub endpoint: String,
    pub tier: Tier,
}

impl QuotaScope {
    pub fn new(subject: impl Into<String>, endpoint: impl Into<String>, tier: Tier) -> Self {
        Self {
            subject: subject.into(),
            endpoint: endpoint.into(),
            tier,
        }
    }
}

/// Usage counter for one scope and one calendar period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    pub id: Uuid,
    pub scope: QuotaScope,
    pub period: Period,
    pub limit: u64,
    pub used: u64,
    pub overage_rate: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub is_active: bool,
    /// Set for rows configured through `SetQuota`; tier-table rows are not.
    pub explicit: bool,
    pub created_at: DateTime<Utc>,
}

impl Quota {
    pub fn new(
        scope: QuotaScope,
        period: Period,
        limit: u64,
        overage_rate: f64,
        explicit: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let (period_start, period_end) = period.bounds(now);
        Self {
            id: Uuid::new_v4(),
            scope,
            period,
            limit,
            used: 0,
            overage_rate,
            period_start,
            period_end,
            is_active: true,
            explicit,
            created_at: now,
        }
    }

    /// Fresh row for the period containing `now`, same configuration.
    pub fn rolled_over(&self, now: DateTime<Utc>) -> Self {
        Self::new(
            self.scope.clone(),
            self.period,
            self.limit,
            self.overage_rate,
            self.explicit,
            now,
        )
    }

    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.period_start <= now && now < self.period_end
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    pub fn overage(&self) -> u64 {
        self.used.saturating_sub(self.limit)
    }

    pub fn cost(&self) -> f64 {
        self.overage() as f64 * self.overage_rate
    }
}

/// Outcome of a quota check across every applicable period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub overage: u64,
    pub cost: f64,
    pub overage_rate: f64,
    pub retry_after: u64,
    pub period: Period,
}

/// Whether traffic beyond the limit is admitted (and billed) or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OveragePolicy {
    #[default]
    Deny,
    Allow,
}

impl FromStr for OveragePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "deny" => Ok(OveragePolicy::Deny),
            "allow" => Ok(OveragePolicy::Allow),
            other => Err(ConfigError::InvalidValue {
                field: "overage_policy",
                value: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn day_period_rolls_over_at_midnight() {
        let now = at(2024, 3, 14, 23, 59, 50);
        let (start, end) = Period::Day.bounds(now);
        assert_eq!(start, at(2024, 3, 14, 0, 0, 0));
        assert_eq!(end, at(2024, 3, 15, 0, 0, 0));
    }

    #[test]
    fn minute_and_hour_are_truncated() {
        let now = at(2024, 3, 14, 10, 17, 42) + TimeDelta::milliseconds(250);
        assert_eq!(Period::Minute.bounds(now).0, at(2024, 3, 14, 10, 17, 0));
        assert_eq!(Period::Hour.bounds(now).1, at(2024, 3, 14, 11, 0, 0));
    }

    #[test]
    fn week_starts_on_monday() {
        // 2024-03-14 is a Thursday.
        let (start, end) = Period::Week.bounds(at(2024, 3, 14, 12, 0, 0));
        assert_eq!(start, at(2024, 3, 11, 0, 0, 0));
        assert_eq!(end, at(2024, 3, 18, 0, 0, 0));
    }

    #[test]
    fn month_handles_year_end() {
        let (start, end) = Period::Month.bounds(at(2024, 12, 31, 23, 0, 0));
        assert_eq!(start, at(2024, 12, 1, 0, 0, 0));
        assert_eq!(end, at(2025, 1, 1, 0, 0, 0));
    }

    #[test]
    fn overage_only_past_limit() {
        let scope = QuotaScope::new("acme", "/api/events", Tier::Basic);
        let mut quota = Quota::new(scope, Period::Hour, 100, 0.25, true, Utc::now());
        quota.used = 100;
        assert_eq!(quota.overage(), 0);
        assert_eq!(quota.cost(), 0.0);
        quota.used = 104;
        assert_eq!(quota.overage(), 4);
        assert_eq!(quota.cost(), 4.0 * 0.25);
    }

    #[test]
    fn tiers_have_distinct_defaults() {
        let table = TierTable::default();
        let minutes: Vec<u64> = Tier::ALL
            .iter()
            .map(|t| table.get(*t).requests_per_minute)
            .collect();
        let mut deduped = minutes.clone();
        deduped.dedup();
        assert_eq!(minutes, deduped);
        assert_eq!(table.get(Tier::Free).requests_per_minute, 10);
    }

    #[test]
    fn unknown_tier_is_rejected() {
        assert_eq!(
            "platinum".parse::<Tier>(),
            Err(ConfigError::UnknownTier("platinum".to_string()))
        );
    }
}
