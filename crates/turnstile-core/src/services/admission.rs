//! Admission controller: threat check, then rate limit, then quota.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::quota::QuotaManager;
use super::rate_limiter::SlidingWindowLimiter;
use super::threat::ThreatDetector;
use crate::domain::{
    ClientIdentity, QuotaDecision, RateLimitDecision, RateLimitPolicy, ThreatAssessment, Tier,
};

/// Quota identity of an authenticated caller.
#[derive(Debug, Clone)]
pub struct QuotaSubject {
    pub subject: String,
    pub api_key_id: Option<String>,
    pub tier: Tier,
}

/// One inbound request as seen by the admission pipeline.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub identity: ClientIdentity,
    pub user_agent: String,
    /// Normalized request path; threat activity is tracked per path.
    pub route: String,
    /// What limits and quotas are accounted under, e.g. `/api/events` for
    /// `/api/events/42`.
    pub resource: String,
    pub quota: Option<QuotaSubject>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Admit,
    Blocked,
    RateLimited,
    QuotaExceeded,
}

/// Values for the `X-RateLimit-*` response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub overage: u64,
}

/// Everything the pipeline decided about a request.
#[derive(Debug, Clone)]
pub struct Admission {
    pub verdict: Verdict,
    pub threat: ThreatAssessment,
    pub rate_limit: Option<RateLimitDecision>,
    pub quota: Option<QuotaDecision>,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        self.verdict == Verdict::Admit
    }

    /// Seconds the caller should wait before retrying; zero when admitted.
    pub fn retry_after(&self) -> u64 {
        match self.verdict {
            Verdict::Admit => 0,
            Verdict::Blocked => self.threat.block_duration,
            Verdict::RateLimited => self.rate_limit.as_ref().map_or(0, |d| d.retry_after),
            Verdict::QuotaExceeded => self.quota.as_ref().map_or(0, |d| d.retry_after),
        }
    }

    /// Header values from whichever check was most restrictive. `None` for
    /// blocked requests, which never reach the limiter.
    pub fn headers(&self) -> Option<LimitHeaders> {
        let rate = self.rate_limit.as_ref().map(|d| LimitHeaders {
            limit: u64::from(d.limit),
            remaining: u64::from(d.remaining),
            reset_at: d.reset_at,
            overage: 0,
        });
        let quota = self.quota.as_ref().map(|d| LimitHeaders {
            limit: d.limit,
            remaining: d.remaining,
            reset_at: d.reset_at,
            overage: d.overage,
        });

        match (self.verdict, rate, quota) {
            (Verdict::QuotaExceeded, _, Some(q)) => Some(q),
            (Verdict::RateLimited, Some(r), _) => Some(r),
            (_, Some(r), Some(q)) => {
                let overage = q.overage;
                let mut picked = if q.remaining < r.remaining { q } else { r };
                picked.overage = overage;
                Some(picked)
            }
            (_, r, q) => r.or(q),
        }
    }
}

/// Runs every check in order and stops at the first denial: a blocked IP
/// consumes no rate-limit or quota budget, and a rate-limited request
/// consumes no quota.
pub struct AdmissionController {
    threats: Arc<ThreatDetector>,
    limiter: Arc<SlidingWindowLimiter>,
    quotas: Arc<QuotaManager>,
    policy: RateLimitPolicy,
}

impl AdmissionController {
    pub fn new(
        threats: Arc<ThreatDetector>,
        limiter: Arc<SlidingWindowLimiter>,
        quotas: Arc<QuotaManager>,
        policy: RateLimitPolicy,
    ) -> Self {
        Self {
            threats,
            limiter,
            quotas,
            policy,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn quotas(&self) -> &Arc<QuotaManager> {
        &self.quotas
    }

    pub async fn admit(&self, request: &AdmissionRequest) -> Admission {
        let threat = self
            .threats
            .analyze(&request.identity.ip, &request.route, &request.user_agent)
            .await;
        if threat.is_blocked {
            return Admission {
                verdict: Verdict::Blocked,
                threat,
                rate_limit: None,
                quota: None,
            };
        }

        let (window_route, config) = self.policy.resolve(&request.route, &request.resource);
        let rate = self
            .limiter
            .check(&request.identity, window_route, config)
            .await;
        if !rate.allowed {
            return Admission {
                verdict: Verdict::RateLimited,
                threat,
                rate_limit: Some(rate),
                quota: None,
            };
        }

        let quota = match &request.quota {
            Some(q) => Some(
                self.quotas
                    .check_quota(&q.subject, q.api_key_id.as_deref(), &request.resource, q.tier)
                    .await,
            ),
            None => None,
        };

        let verdict = match &quota {
            Some(d) if !d.allowed => Verdict::QuotaExceeded,
            _ => Verdict::Admit,
        };

        Admission {
            verdict,
            threat,
            rate_limit: Some(rate),
            quota,
        }
    }
}
