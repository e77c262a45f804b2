//! Abuse detection: heuristics over the activity log, fused into a threat
//! level that may auto-block the source IP.

use std::sync::Arc;

use chrono::TimeDelta;

use super::block_registry::{BlockCheck, BlockRegistry};
use crate::clock::Clock;
use crate::domain::{
    BlockRequest, BlockType, Heuristic, MAX_SEVERITY, ThreatAssessment, ThreatLevel, ThreatSignal,
    ThreatThresholds, ratio_severity,
};
use crate::error::StoreError;
use crate::ports::ActivityLog;

/// Retry hint returned when the block store is down and the policy is
/// fail-closed.
const UNAVAILABLE_RETRY_SECS: u64 = 30;

fn ip_key(ip: &str) -> String {
    format!("threat:ip:{ip}")
}

fn ip_endpoint_key(ip: &str, endpoint: &str) -> String {
    format!("threat:ip-endpoint:{ip}:{endpoint}")
}

fn user_agent_ips_key(user_agent: &str) -> String {
    format!("threat:ua-ips:{user_agent}")
}

fn ip_user_agents_key(ip: &str) -> String {
    format!("threat:ip-uas:{ip}")
}

fn ip_endpoints_key(ip: &str) -> String {
    format!("threat:ip-endpoints:{ip}")
}

pub struct ThreatDetector {
    activity: Arc<dyn ActivityLog>,
    blocks: Arc<BlockRegistry>,
    clock: Arc<dyn Clock>,
    thresholds: ThreatThresholds,
}

impl ThreatDetector {
    pub fn new(
        activity: Arc<dyn ActivityLog>,
        blocks: Arc<BlockRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            activity,
            blocks,
            clock,
            thresholds: ThreatThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: ThreatThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn registry(&self) -> &Arc<BlockRegistry> {
        &self.blocks
    }

    /// Assess one request. Already-blocked IPs short-circuit as CRITICAL
    /// without touching the activity log.
    pub async fn analyze(&self, ip: &str, endpoint: &str, user_agent: &str) -> ThreatAssessment {
        let now = self.clock.now();

        match self.blocks.check(ip).await {
            BlockCheck::Blocked(record) => {
                return ThreatAssessment {
                    is_blocked: true,
                    threat_level: ThreatLevel::Critical,
                    reason: record.reason.clone(),
                    block_duration: record.seconds_remaining(now),
                    violation_count: record.violation_count,
                    severity: MAX_SEVERITY,
                };
            }
            BlockCheck::Unavailable => {
                return ThreatAssessment {
                    is_blocked: true,
                    threat_level: ThreatLevel::High,
                    reason: "Block registry unavailable".to_string(),
                    block_duration: UNAVAILABLE_RETRY_SECS,
                    violation_count: 0,
                    severity: 0.0,
                };
            }
            BlockCheck::Clear => {}
        }

        let user_agent = user_agent.trim();
        self.record(ip, endpoint, user_agent).await;

        let (rate, flood, distributed, behavioral, geographic) = futures::join!(
            self.request_rate(ip),
            self.endpoint_flood(ip, endpoint),
            self.distributed_attack(user_agent),
            self.behavioral(ip),
            self.geographic(ip),
        );

        let strongest = [rate, flood, distributed, behavioral, geographic]
            .into_iter()
            .max_by(|a, b| a.severity.total_cmp(&b.severity))
            .unwrap_or_else(|| ThreatSignal::quiet(Heuristic::RequestRate));

        let level = ThreatLevel::from_severity(strongest.severity);
        if !level.triggers_block() {
            return ThreatAssessment::clear(level, strongest.severity, strongest.reason);
        }

        let duration = level.block_duration().unwrap_or(TimeDelta::hours(2));
        let request = BlockRequest {
            ip_address: ip.to_string(),
            block_type: BlockType::Threat,
            reason: strongest.reason.clone(),
            threat_level: level,
            duration,
        };

        match self.blocks.block(request).await {
            Ok(record) => ThreatAssessment {
                is_blocked: true,
                threat_level: level,
                reason: strongest.reason,
                block_duration: record.seconds_remaining(now),
                violation_count: record.violation_count,
                severity: strongest.severity,
            },
            Err(e) => {
                tracing::error!(ip = %ip, error = %e, "Failed to persist automatic block");
                ThreatAssessment {
                    is_blocked: true,
                    threat_level: level,
                    reason: strongest.reason,
                    block_duration: duration.num_seconds().max(0) as u64,
                    violation_count: 1,
                    severity: strongest.severity,
                }
            }
        }
    }

    /// Evict idle activity keys.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.activity.purge_expired(self.clock.now_ms()).await
    }

    async fn record(&self, ip: &str, endpoint: &str, user_agent: &str) {
        let at = self.clock.now_ms();
        let retention = self.thresholds.retention().num_milliseconds();

        let ip_events = ip_key(ip);
        let endpoint_events = ip_endpoint_key(ip, endpoint);
        let endpoints = ip_endpoints_key(ip);
        let agent_ips = user_agent_ips_key(user_agent);
        let agents = ip_user_agents_key(ip);
        let mut writes = vec![
            self.activity.append(&ip_events, None, at, retention),
            self.activity.append(&endpoint_events, None, at, retention),
            self.activity.append(&endpoints, Some(endpoint), at, retention),
        ];

        if !user_agent.is_empty() {
            writes.push(self.activity.append(&agent_ips, Some(ip), at, retention));
            writes.push(self.activity.append(&agents, Some(user_agent), at, retention));
        }

        for result in futures::future::join_all(writes).await {
            if let Err(e) = result {
                tracing::warn!(ip = %ip, error = %e, "Failed to record activity");
            }
        }
    }

    async fn count(&self, key: &str, window: TimeDelta) -> Result<u64, StoreError> {
        let since = self.clock.now_ms() - window.num_milliseconds();
        self.activity.count_since(key, since).await
    }

    async fn request_rate(&self, ip: &str) -> ThreatSignal {
        let key = ip_key(ip);
        let mut strongest = ThreatSignal::quiet(Heuristic::RequestRate);

        for (window, threshold) in &self.thresholds.rate_windows {
            let count = match self.count(&key, *window).await {
                Ok(count) => count,
                Err(e) => return degraded(Heuristic::RequestRate, ip, e),
            };
            let severity = ratio_severity(count, *threshold);
            if severity > strongest.severity {
                strongest = ThreatSignal::new(
                    Heuristic::RequestRate,
                    severity,
                    format!(
                        "{count} requests in {}m (threshold {threshold})",
                        window.num_minutes()
                    ),
                );
            }
        }
        strongest
    }

    async fn endpoint_flood(&self, ip: &str, endpoint: &str) -> ThreatSignal {
        let t = &self.thresholds;
        let key = ip_endpoint_key(ip, endpoint);
        match self.count(&key, t.endpoint_window).await {
            Ok(count) => ThreatSignal::new(
                Heuristic::EndpointFlood,
                ratio_severity(count, t.endpoint_threshold),
                format!("{count} requests to {endpoint} in {}m", t.endpoint_window.num_minutes()),
            ),
            Err(e) => degraded(Heuristic::EndpointFlood, ip, e),
        }
    }

    async fn distributed_attack(&self, user_agent: &str) -> ThreatSignal {
        if user_agent.is_empty() {
            return ThreatSignal::quiet(Heuristic::DistributedAttack);
        }
        let t = &self.thresholds;
        let key = user_agent_ips_key(user_agent);
        match self.count(&key, t.distributed_window).await {
            Ok(ips) => ThreatSignal::new(
                Heuristic::DistributedAttack,
                ratio_severity(ips, t.distributed_threshold),
                format!(
                    "{ips} IPs sharing one user agent in {}m",
                    t.distributed_window.num_minutes()
                ),
            ),
            Err(e) => degraded(Heuristic::DistributedAttack, user_agent, e),
        }
    }

    async fn behavioral(&self, ip: &str) -> ThreatSignal {
        let t = &self.thresholds;
        let agents_key = ip_user_agents_key(ip);
        let endpoints_key = ip_endpoints_key(ip);
        let (agents, endpoints, timing) = futures::join!(
            self.count(&agents_key, t.user_agent_window),
            self.count(&endpoints_key, t.fan_out_window),
            self.timing_regularity(ip),
        );

        let mut signals = Vec::with_capacity(3);
        match agents {
            Ok(n) if n > t.user_agent_threshold => signals.push(ThreatSignal::new(
                Heuristic::Behavioral,
                ratio_severity(n, t.user_agent_threshold),
                format!("{n} user agents from one IP"),
            )),
            Ok(_) => {}
            Err(e) => signals.push(degraded(Heuristic::Behavioral, ip, e)),
        }
        match endpoints {
            Ok(n) if n > t.fan_out_threshold => signals.push(ThreatSignal::new(
                Heuristic::Behavioral,
                ratio_severity(n, t.fan_out_threshold),
                format!("{n} distinct endpoints from one IP"),
            )),
            Ok(_) => {}
            Err(e) => signals.push(degraded(Heuristic::Behavioral, ip, e)),
        }
        signals.push(timing);

        signals
            .into_iter()
            .max_by(|a, b| a.severity.total_cmp(&b.severity))
            .unwrap_or_else(|| ThreatSignal::quiet(Heuristic::Behavioral))
    }

    async fn timing_regularity(&self, ip: &str) -> ThreatSignal {
        let t = &self.thresholds;
        let since = self.clock.now_ms() - t.timing_window.num_milliseconds();
        let key = ip_key(ip);
        let timestamps = match self.activity.timestamps_since(&key, since).await {
            Ok(ts) => ts,
            Err(e) => return degraded(Heuristic::Behavioral, ip, e),
        };

        match coefficient_of_variation(&timestamps, t.timing_min_intervals) {
            Some(cv) if cv < t.timing_max_variation => ThreatSignal::new(
                Heuristic::Behavioral,
                t.timing_severity,
                format!("scripted request timing (variation {cv:.3})"),
            ),
            _ => ThreatSignal::quiet(Heuristic::Behavioral),
        }
    }

    /// No geolocation source is wired in; always quiet.
    async fn geographic(&self, _ip: &str) -> ThreatSignal {
        ThreatSignal::quiet(Heuristic::Geographic)
    }
}

fn degraded(heuristic: Heuristic, subject: &str, error: StoreError) -> ThreatSignal {
    tracing::warn!(
        heuristic = heuristic.as_str(),
        subject = %subject,
        error = %error,
        "Heuristic query failed, treating as quiet"
    );
    ThreatSignal::quiet(heuristic)
}

/// Coefficient of variation of the gaps between sorted `timestamps`, or
/// `None` with fewer than `min_intervals` gaps. All-zero gaps count as
/// perfectly regular.
pub fn coefficient_of_variation(timestamps: &[i64], min_intervals: usize) -> Option<f64> {
    let intervals: Vec<f64> = timestamps
        .windows(2)
        .map(|pair| (pair[1] - pair[0]) as f64)
        .collect();
    if intervals.len() < min_intervals || intervals.is_empty() {
        return None;
    }

    let n = intervals.len() as f64;
    let mean = intervals.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return Some(0.0);
    }
    let variance = intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt() / mean)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metronome_timing_has_no_variation() {
        let ts: Vec<i64> = (0..12).map(|i| i * 1_000).collect();
        assert_eq!(coefficient_of_variation(&ts, 10), Some(0.0));
    }

    #[test]
    fn too_few_intervals_are_not_judged() {
        let ts: Vec<i64> = (0..10).map(|i| i * 1_000).collect();
        assert_eq!(coefficient_of_variation(&ts, 10), None);
    }

    #[test]
    fn human_timing_varies() {
        let ts = [0, 800, 3_100, 3_500, 9_000, 9_200, 15_000, 15_900, 21_000, 30_000, 31_000];
        let cv = coefficient_of_variation(&ts, 10).unwrap();
        assert!(cv > 0.1, "cv = {cv}");
    }
}
