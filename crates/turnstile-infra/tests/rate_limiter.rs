mod common;

use std::sync::Arc;

use chrono::TimeDelta;

use turnstile_core::Clock;
use turnstile_core::domain::{ClientIdentity, RateLimitConfig, Strategy};
use turnstile_core::ports::WindowStore;
use turnstile_core::services::SlidingWindowLimiter;
use turnstile_infra::InMemoryWindowStore;

use common::{UnreachableStore, noon};

fn config(limit: u32, strategy: Strategy) -> RateLimitConfig {
    RateLimitConfig::new(limit, 60_000, strategy).unwrap()
}

#[tokio::test]
async fn sixth_hit_is_denied_until_window_passes() {
    let clock = noon();
    let limiter = SlidingWindowLimiter::new(Arc::new(InMemoryWindowStore::new()), clock.clone());
    let client = ClientIdentity::anonymous("203.0.113.5");
    let cfg = config(5, Strategy::Ip);

    for expected_remaining in (0..5).rev() {
        let decision = limiter.check(&client, "/api/events", &cfg).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, expected_remaining);
        clock.advance(TimeDelta::milliseconds(100));
    }

    let denied = limiter.check(&client, "/api/events", &cfg).await;
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);
    assert!(denied.retry_after > 0);
    assert!(denied.retry_after <= 60);

    // Denied hits are recorded too; wait until the sixth has aged out
    clock.advance(TimeDelta::milliseconds(60_000));
    let decision = limiter.check(&client, "/api/events", &cfg).await;
    assert!(decision.allowed);
}

#[tokio::test]
async fn window_never_counts_stale_timestamps() {
    let clock = noon();
    let store = InMemoryWindowStore::new();
    let window_ms = 1_000;

    for step in 0..40 {
        let now = clock.now_ms();
        let hit = store.hit("rl:ip:x:/", now, window_ms).await.unwrap();
        assert!(hit.timestamps.iter().all(|t| *t > now - window_ms));
        assert_eq!(hit.count as usize, hit.timestamps.len());
        clock.advance(TimeDelta::milliseconds(if step % 3 == 0 { 450 } else { 90 }));
    }
}

#[tokio::test]
async fn ip_and_user_denies_when_ip_window_is_full() {
    let clock = noon();
    let limiter = SlidingWindowLimiter::new(Arc::new(InMemoryWindowStore::new()), clock);
    let cfg = config(5, Strategy::IpAndUser);

    let neighbour = ClientIdentity::user("198.51.100.9", "mallory");
    for _ in 0..5 {
        assert!(limiter.check(&neighbour, "/api/gigs", &cfg).await.allowed);
    }

    // Same IP, fresh user: the user window allows, the IP window does not
    let alice = ClientIdentity::user("198.51.100.9", "alice");
    let decision = limiter.check(&alice, "/api/gigs", &cfg).await;
    assert!(!decision.allowed);
    assert_eq!(decision.remaining, 0);
}

#[tokio::test]
async fn user_strategy_falls_back_to_ip_when_anonymous() {
    let clock = noon();
    let limiter = SlidingWindowLimiter::new(Arc::new(InMemoryWindowStore::new()), clock);
    let cfg = config(1, Strategy::User);

    let anon = ClientIdentity::anonymous("192.0.2.1");
    assert!(limiter.check(&anon, "/api/users", &cfg).await.allowed);
    assert!(!limiter.check(&anon, "/api/users", &cfg).await.allowed);

    // A signed-in user on the same IP has their own window
    let bob = ClientIdentity::user("192.0.2.1", "bob");
    assert!(limiter.check(&bob, "/api/users", &cfg).await.allowed);
}

#[tokio::test]
async fn fails_open_when_store_is_unreachable() {
    let limiter = SlidingWindowLimiter::new(Arc::new(UnreachableStore), noon());
    let cfg = config(3, Strategy::IpAndUser);
    let client = ClientIdentity::user("203.0.113.1", "carol");

    for _ in 0..10 {
        let decision = limiter.check(&client, "/api/payments", &cfg).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 3);
        assert_eq!(decision.retry_after, 0);
    }
}

#[tokio::test]
async fn reset_clears_client_window() {
    let limiter = SlidingWindowLimiter::new(Arc::new(InMemoryWindowStore::new()), noon());
    let cfg = config(1, Strategy::Ip);
    let client = ClientIdentity::anonymous("192.0.2.44");

    assert!(limiter.check(&client, "/api/events", &cfg).await.allowed);
    assert!(!limiter.check(&client, "/api/events", &cfg).await.allowed);

    limiter.reset(&client, "/api/events", Strategy::Ip).await.unwrap();
    assert!(limiter.check(&client, "/api/events", &cfg).await.allowed);
}

#[tokio::test]
async fn routes_have_separate_windows() {
    let limiter = SlidingWindowLimiter::new(Arc::new(InMemoryWindowStore::new()), noon());
    let cfg = config(1, Strategy::Ip);
    let client = ClientIdentity::anonymous("192.0.2.45");

    assert!(limiter.check(&client, "/api/events", &cfg).await.allowed);
    assert!(limiter.check(&client, "/api/gigs", &cfg).await.allowed);
}
