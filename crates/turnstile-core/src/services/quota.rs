//! Multi-period quota tracking and overage billing.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use crate::clock::Clock;
use crate::domain::{
    OveragePolicy, Period, Quota, QuotaDecision, QuotaScope, Tier, TierTable, UsageEvent,
};
use crate::error::{ConfigError, QuotaError, StoreError};
use crate::ports::{QuotaStore, UsageError, UsageSink};

/// Days a retired row is kept after its period ends.
pub const RETIRED_QUOTA_RETENTION_DAYS: i64 = 30;

/// Rows touched by a `ResetQuotas` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetReport {
    pub deactivated: usize,
    pub created: usize,
    /// Idle rows moved to the current period in place.
    pub advanced: usize,
    /// Retired rows dropped past retention.
    pub purged: usize,
}

/// Calendar-period quotas per (subject, endpoint, tier).
///
/// Without explicit rows the tier table's minute/hour/day limits apply.
pub struct QuotaManager {
    store: Arc<dyn QuotaStore>,
    sink: Arc<dyn UsageSink>,
    clock: Arc<dyn Clock>,
    tiers: TierTable,
    overage_policy: OveragePolicy,
}

/// One period a request is counted against.
struct PeriodPlan {
    period: Period,
    limit: u64,
    overage_rate: f64,
    explicit: bool,
    existing: Option<Quota>,
}

impl QuotaManager {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        sink: Arc<dyn UsageSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            sink,
            clock,
            tiers: TierTable::default(),
            overage_policy: OveragePolicy::default(),
        }
    }

    pub fn with_tiers(mut self, tiers: TierTable) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn with_overage_policy(mut self, policy: OveragePolicy) -> Self {
        self.overage_policy = policy;
        self
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// Count one request against every applicable period and decide.
    ///
    /// Usage is consumed even when the request ends up denied, so overage
    /// keeps accruing for billing.
    pub async fn check_quota(
        &self,
        subject: &str,
        api_key_id: Option<&str>,
        endpoint: &str,
        tier: Tier,
    ) -> QuotaDecision {
        let now = self.clock.now();
        let scope = QuotaScope::new(subject, endpoint, tier);

        match self.consume(&scope, now).await {
            Ok(rows) => {
                let decision = self.decide(&rows, now);
                match decision {
                    Some(decision) => {
                        if !decision.allowed {
                            tracing::info!(
                                subject = %subject,
                                api_key_id = api_key_id.unwrap_or("-"),
                                endpoint = %endpoint,
                                tier = %tier,
                                period = %decision.period,
                                overage = decision.overage,
                                "Quota exceeded"
                            );
                        }
                        decision
                    }
                    None => self.fail_open(tier, now),
                }
            }
            Err(e) => {
                tracing::warn!(
                    subject = %subject,
                    api_key_id = api_key_id.unwrap_or("-"),
                    endpoint = %endpoint,
                    error = %e,
                    "Quota store unavailable, failing open"
                );
                self.fail_open(tier, now)
            }
        }
    }

    /// Hand a finished request to the usage recorder.
    pub fn record_usage(&self, event: UsageEvent) {
        match self.sink.emit(event) {
            Ok(()) => {}
            Err(UsageError::QueueFull) => {
                tracing::warn!("Usage queue full, dropping usage event");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to emit usage event");
            }
        }
    }

    /// Billable cost of one request: the tier's per-request price plus the
    /// overage rate when the request landed past the limit.
    pub fn request_cost(&self, tier: Tier, decision: Option<&QuotaDecision>) -> f64 {
        let base = self.tiers.get(tier).cost_per_request;
        match decision {
            Some(d) if d.overage > 0 => base + d.overage_rate,
            _ => base,
        }
    }

    /// Configure an explicit quota, superseding the active row for the same
    /// scope and period. Usage already counted in the current period carries
    /// over.
    pub async fn set_quota(
        &self,
        scope: QuotaScope,
        period: Period,
        limit: u64,
        overage_rate: f64,
    ) -> Result<Quota, QuotaError> {
        if limit == 0 {
            return Err(ConfigError::InvalidLimit("quota limit must be positive".to_string()).into());
        }
        if !overage_rate.is_finite() || overage_rate < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "overage_rate",
                value: overage_rate.to_string(),
            }
            .into());
        }

        let now = self.clock.now();
        let mut quota = Quota::new(scope.clone(), period, limit, overage_rate, true, now);

        if let Some(mut existing) = self.store.find_active(&scope, period).await? {
            if existing.is_current(now) {
                quota.used = existing.used;
            }
            existing.is_active = false;
            self.store.update(&existing).await?;
        }

        self.store.insert(&quota).await?;
        tracing::info!(
            subject = %scope.subject,
            endpoint = %scope.endpoint,
            tier = %scope.tier,
            period = %period,
            limit,
            overage_rate,
            "Quota configured"
        );
        Ok(quota)
    }

    /// Move `subject` on `endpoint` to `new_tier`. Rows of other tiers are
    /// deactivated (history kept) and fresh rows for the new tier created.
    pub async fn change_tier(
        &self,
        subject: &str,
        endpoint: &str,
        new_tier: Tier,
    ) -> Result<Vec<Quota>, QuotaError> {
        let now = self.clock.now();

        for mut row in self.store.list_active_for(subject, endpoint).await? {
            if row.scope.tier != new_tier {
                row.is_active = false;
                self.store.update(&row).await?;
            }
        }

        let scope = QuotaScope::new(subject, endpoint, new_tier);
        let limits = self.tiers.get(new_tier);
        let mut created = Vec::new();
        for (period, limit) in limits.per_period() {
            let fresh = Quota::new(scope.clone(), period, limit, limits.overage_rate, false, now);
            created.push(self.store.insert_if_absent(&fresh).await?);
        }

        tracing::info!(subject = %subject, endpoint = %endpoint, tier = %new_tier, "Tier changed");
        Ok(created)
    }

    /// Roll expired rows over. A row that saw traffic is deactivated with
    /// usage zeroed and replaced by a fresh row for the current period; an
    /// idle row is moved to the current period in place. Retired rows older
    /// than [`RETIRED_QUOTA_RETENTION_DAYS`] are then dropped.
    pub async fn reset_quotas(&self) -> Result<ResetReport, StoreError> {
        let now = self.clock.now();
        let mut report = ResetReport::default();

        for row in self.store.list_active().await? {
            if row.period_end > now {
                continue;
            }

            if row.used == 0 {
                let mut advanced = row.rolled_over(now);
                advanced.id = row.id;
                advanced.created_at = row.created_at;
                self.store.update(&advanced).await?;
                report.advanced += 1;
                continue;
            }

            let fresh = row.rolled_over(now);
            self.retire(row).await?;
            report.deactivated += 1;

            let active = self.store.insert_if_absent(&fresh).await?;
            if active.id == fresh.id {
                report.created += 1;
            }
        }

        report.purged = self
            .store
            .purge_retired(now - TimeDelta::days(RETIRED_QUOTA_RETENTION_DAYS))
            .await?;

        if report.deactivated > 0 || report.purged > 0 {
            tracing::info!(
                deactivated = report.deactivated,
                created = report.created,
                advanced = report.advanced,
                purged = report.purged,
                "Quota periods rolled over"
            );
        }
        Ok(report)
    }

    /// Active rows of `subject`, for usage statistics.
    pub async fn usage(&self, subject: &str) -> Result<Vec<Quota>, StoreError> {
        self.store.list_active_for_subject(subject).await
    }

    async fn consume(&self, scope: &QuotaScope, now: DateTime<Utc>) -> Result<Vec<Quota>, StoreError> {
        let mut consumed = Vec::new();
        for plan in self.plan(scope).await? {
            let row = self.current_row(scope, plan, now).await?;
            consumed.push(self.store.increment_usage(row.id, 1).await?);
        }
        Ok(consumed)
    }

    async fn plan(&self, scope: &QuotaScope) -> Result<Vec<PeriodPlan>, StoreError> {
        let explicit: Vec<Quota> = self
            .store
            .list_active_for(&scope.subject, &scope.endpoint)
            .await?
            .into_iter()
            .filter(|q| q.scope.tier == scope.tier && q.explicit)
            .collect();

        if !explicit.is_empty() {
            return Ok(explicit
                .into_iter()
                .map(|q| PeriodPlan {
                    period: q.period,
                    limit: q.limit,
                    overage_rate: q.overage_rate,
                    explicit: true,
                    existing: Some(q),
                })
                .collect());
        }

        let limits = self.tiers.get(scope.tier);
        Ok(limits
            .per_period()
            .into_iter()
            .map(|(period, limit)| PeriodPlan {
                period,
                limit,
                overage_rate: limits.overage_rate,
                explicit: false,
                existing: None,
            })
            .collect())
    }

    async fn current_row(
        &self,
        scope: &QuotaScope,
        plan: PeriodPlan,
        now: DateTime<Utc>,
    ) -> Result<Quota, StoreError> {
        let existing = match plan.existing {
            Some(row) => Some(row),
            None => self.store.find_active(scope, plan.period).await?,
        };

        match existing {
            Some(row) if row.is_current(now) => Ok(row),
            Some(stale) => {
                let fresh = stale.rolled_over(now);
                self.retire(stale).await?;
                self.store.insert_if_absent(&fresh).await
            }
            None => {
                let fresh = Quota::new(
                    scope.clone(),
                    plan.period,
                    plan.limit,
                    plan.overage_rate,
                    plan.explicit,
                    now,
                );
                self.store.insert_if_absent(&fresh).await
            }
        }
    }

    async fn retire(&self, mut row: Quota) -> Result<(), StoreError> {
        row.is_active = false;
        row.used = 0;
        self.store.update(&row).await
    }

    fn decide(&self, rows: &[Quota], now: DateTime<Utc>) -> Option<QuotaDecision> {
        rows.iter()
            .map(|row| {
                let within = row.used <= row.limit;
                let allowed = within || self.overage_policy == OveragePolicy::Allow;
                let retry_after = if allowed {
                    0
                } else {
                    seconds_until(row.period_end, now)
                };
                QuotaDecision {
                    allowed,
                    limit: row.limit,
                    remaining: row.remaining(),
                    reset_at: row.period_end,
                    overage: row.overage(),
                    cost: row.cost(),
                    overage_rate: row.overage_rate,
                    retry_after,
                    period: row.period,
                }
            })
            .min_by(|a, b| {
                (a.allowed, a.remaining)
                    .cmp(&(b.allowed, b.remaining))
                    .then(b.retry_after.cmp(&a.retry_after))
            })
    }

    fn fail_open(&self, tier: Tier, now: DateTime<Utc>) -> QuotaDecision {
        let limit = self.tiers.get(tier).requests_per_minute;
        QuotaDecision {
            allowed: true,
            limit,
            remaining: limit,
            reset_at: Period::Minute.bounds(now).1,
            overage: 0,
            cost: 0.0,
            overage_rate: 0.0,
            retry_after: 0,
            period: Period::Minute,
        }
    }
}

fn seconds_until(at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (at - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}
