//! Sliding-window rate limiter.

use std::cmp::Reverse;
use std::sync::Arc;

use futures::future::join_all;

use crate::clock::{Clock, from_millis};
use crate::domain::{ClientIdentity, RateLimitConfig, RateLimitDecision, Strategy, WindowHit};
use crate::error::StoreError;
use crate::ports::WindowStore;

/// Exact sliding-window limiter over a shared [`WindowStore`].
///
/// Store faults fail open: the request is allowed and the fault is logged.
pub struct SlidingWindowLimiter {
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn WindowStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a hit for `identity` on `route` and decide.
    ///
    /// With `ip-and-user` both windows are hit and the most restrictive
    /// decision is returned.
    pub async fn check(
        &self,
        identity: &ClientIdentity,
        route: &str,
        config: &RateLimitConfig,
    ) -> RateLimitDecision {
        let now_ms = self.clock.now_ms();
        let keys = identity.keys(route, config.strategy);

        let decisions = join_all(
            keys.iter()
                .map(|key| self.check_key(key, route, now_ms, config)),
        )
        .await;

        most_restrictive(decisions).unwrap_or_else(|| fail_open(now_ms, config))
    }

    async fn check_key(
        &self,
        key: &str,
        route: &str,
        now_ms: i64,
        config: &RateLimitConfig,
    ) -> RateLimitDecision {
        match self.store.hit(key, now_ms, config.window_ms).await {
            Ok(hit) => {
                let decision = evaluate(&hit, now_ms, config);
                if !decision.allowed {
                    tracing::debug!(
                        key = %key,
                        route = %route,
                        count = hit.count,
                        limit = config.limit,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    route = %route,
                    error = %e,
                    "Window store unavailable, failing open"
                );
                fail_open(now_ms, config)
            }
        }
    }

    /// Clear the windows `identity` would be checked against on `route`.
    pub async fn reset(
        &self,
        identity: &ClientIdentity,
        route: &str,
        strategy: Strategy,
    ) -> Result<(), StoreError> {
        for key in identity.keys(route, strategy) {
            self.store.reset(&key).await?;
        }
        tracing::info!(ip = %identity.ip, route = %route, "Rate limit window reset");
        Ok(())
    }

    /// Evict idle windows.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.store.purge_expired(self.clock.now_ms()).await
    }
}

/// Turn a window snapshot into a decision.
pub fn evaluate(hit: &WindowHit, now_ms: i64, config: &RateLimitConfig) -> RateLimitDecision {
    let limit = u64::from(config.limit);
    let allowed = hit.count <= limit;
    let remaining = limit.saturating_sub(hit.count) as u32;
    let reset_ms = hit.oldest().unwrap_or(now_ms) + config.window_ms;
    let retry_after = if allowed {
        0
    } else {
        ((reset_ms - now_ms).max(0) as u64).div_ceil(1000)
    };

    RateLimitDecision {
        allowed,
        limit: config.limit,
        remaining,
        reset_at: from_millis(reset_ms),
        retry_after,
    }
}

/// Denials first, then the smallest `remaining`, then the longest wait.
fn most_restrictive(decisions: Vec<RateLimitDecision>) -> Option<RateLimitDecision> {
    decisions
        .into_iter()
        .min_by_key(|d| (d.allowed, d.remaining, Reverse(d.retry_after)))
}

fn fail_open(now_ms: i64, config: &RateLimitConfig) -> RateLimitDecision {
    RateLimitDecision {
        allowed: true,
        limit: config.limit,
        remaining: config.limit,
        reset_at: from_millis(now_ms + config.window_ms),
        retry_after: 0,
    }
}
