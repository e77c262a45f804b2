mod common;

use std::sync::Arc;

use chrono::TimeDelta;

use turnstile_core::QuotaError;
use turnstile_core::domain::{OveragePolicy, Period, QuotaScope, Tier, UsageEvent};
use turnstile_core::services::QuotaManager;
use turnstile_infra::{ChannelUsageSink, InMemoryQuotaStore, InMemoryUsageRecorder};

use common::{NullSink, UnreachableStore, at, clock_at, noon};

fn manager(clock: Arc<turnstile_core::ManualClock>) -> (QuotaManager, Arc<InMemoryQuotaStore>) {
    let store = Arc::new(InMemoryQuotaStore::new());
    let manager = QuotaManager::new(store.clone(), Arc::new(NullSink), clock);
    (manager, store)
}

#[tokio::test]
async fn free_tier_allows_ten_per_minute() {
    let clock = noon();
    let (quotas, _) = manager(clock.clone());

    for _ in 0..10 {
        let decision = quotas
            .check_quota("acme", Some("key-1"), "/api/events", Tier::Free)
            .await;
        assert!(decision.allowed);
        clock.advance(TimeDelta::milliseconds(500));
    }

    let denied = quotas
        .check_quota("acme", Some("key-1"), "/api/events", Tier::Free)
        .await;
    assert!(!denied.allowed);
    assert_eq!(denied.period, Period::Minute);
    assert_eq!(denied.limit, 10);
    assert_eq!(denied.remaining, 0);
    assert!(denied.retry_after > 0);
    assert_eq!(denied.reset_at, at(2024, 5, 14, 12, 1, 0));
}

#[tokio::test]
async fn overage_cost_is_exact() {
    let clock = noon();
    let store = Arc::new(InMemoryQuotaStore::new());
    let quotas = QuotaManager::new(store, Arc::new(NullSink), clock)
        .with_overage_policy(OveragePolicy::Allow);

    let scope = QuotaScope::new("acme", "/api/analytics", Tier::Basic);
    quotas
        .set_quota(scope, Period::Day, 3, 0.25)
        .await
        .unwrap();

    let mut decisions = Vec::new();
    for _ in 0..5 {
        decisions.push(
            quotas
                .check_quota("acme", None, "/api/analytics", Tier::Basic)
                .await,
        );
    }

    for d in &decisions[..3] {
        assert_eq!(d.overage, 0);
        assert_eq!(d.cost, 0.0);
    }
    assert!(decisions.iter().all(|d| d.allowed));
    assert_eq!(decisions[3].overage, 1);
    assert_eq!(decisions[3].cost, 0.25);
    assert_eq!(decisions[4].overage, 2);
    assert_eq!(decisions[4].cost, 0.5);
    assert_eq!(decisions[4].period, Period::Day);
}

#[tokio::test]
async fn deny_policy_rejects_past_limit_but_still_counts() {
    let clock = noon();
    let (quotas, _) = manager(clock);

    let scope = QuotaScope::new("acme", "/api/webhooks", Tier::Custom);
    quotas.set_quota(scope, Period::Hour, 2, 1.5).await.unwrap();

    for _ in 0..2 {
        assert!(
            quotas
                .check_quota("acme", None, "/api/webhooks", Tier::Custom)
                .await
                .allowed
        );
    }
    let third = quotas
        .check_quota("acme", None, "/api/webhooks", Tier::Custom)
        .await;
    assert!(!third.allowed);
    assert_eq!(third.overage, 1);
    assert_eq!(third.cost, 1.5);
}

#[tokio::test]
async fn day_quota_rolls_over_at_midnight() {
    let clock = clock_at(at(2024, 5, 14, 23, 59, 50));
    let (quotas, store) = manager(clock.clone());

    let scope = QuotaScope::new("acme", "/api/events", Tier::Professional);
    let row = quotas.set_quota(scope, Period::Day, 2, 0.0).await.unwrap();
    assert_eq!(row.period_end, at(2024, 5, 15, 0, 0, 0));

    for _ in 0..2 {
        assert!(
            quotas
                .check_quota("acme", None, "/api/events", Tier::Professional)
                .await
                .allowed
        );
    }
    assert!(
        !quotas
            .check_quota("acme", None, "/api/events", Tier::Professional)
            .await
            .allowed
    );

    clock.advance(TimeDelta::seconds(10));
    let fresh = quotas
        .check_quota("acme", None, "/api/events", Tier::Professional)
        .await;
    assert!(fresh.allowed);
    assert_eq!(fresh.remaining, 1);
    assert_eq!(fresh.reset_at, at(2024, 5, 16, 0, 0, 0));

    let active = quotas.usage("acme").await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].period_start, at(2024, 5, 15, 0, 0, 0));
    assert!(active[0].explicit);
    assert_eq!(store.all_rows().await.len(), 2);
}

#[tokio::test]
async fn explicit_rows_replace_tier_table() {
    let clock = noon();
    let (quotas, _) = manager(clock);

    let scope = QuotaScope::new("acme", "/api/events", Tier::Free);
    quotas.set_quota(scope, Period::Week, 50, 0.0).await.unwrap();

    // The free table would stop this at 10 per minute
    for _ in 0..20 {
        assert!(
            quotas
                .check_quota("acme", None, "/api/events", Tier::Free)
                .await
                .allowed
        );
    }
    let rows = quotas.usage("acme").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].period, Period::Week);
    assert_eq!(rows[0].used, 20);
}

#[tokio::test]
async fn reset_quotas_rolls_expired_rows() {
    let clock = noon();
    let (quotas, _) = manager(clock.clone());

    quotas
        .check_quota("acme", None, "/api/events", Tier::Basic)
        .await;
    assert_eq!(quotas.usage("acme").await.unwrap().len(), 3);

    clock.advance(TimeDelta::minutes(2));
    let report = quotas.reset_quotas().await.unwrap();
    assert_eq!(report.deactivated, 1);
    assert_eq!(report.created, 1);

    let rows = quotas.usage("acme").await.unwrap();
    let minute = rows.iter().find(|q| q.period == Period::Minute).unwrap();
    assert_eq!(minute.used, 0);
    assert_eq!(minute.period_start, at(2024, 5, 14, 12, 2, 0));
    let hour = rows.iter().find(|q| q.period == Period::Hour).unwrap();
    assert_eq!(hour.used, 1);
}

#[tokio::test]
async fn idle_scopes_do_not_grow_rows_across_resets() {
    let clock = noon();
    let (quotas, store) = manager(clock.clone());

    quotas
        .check_quota("acme", None, "/api/events", Tier::Basic)
        .await;

    let mut advanced = 0;
    for _ in 0..120 {
        clock.advance(TimeDelta::minutes(1));
        advanced += quotas.reset_quotas().await.unwrap().advanced;
    }
    assert!(advanced > 100);

    // Minute and hour rows each retire once after their single hit.
    let rows = store.all_rows().await;
    assert_eq!(rows.len(), 5);
    assert_eq!(rows.iter().filter(|q| q.is_active).count(), 3);

    let active = quotas.usage("acme").await.unwrap();
    let minute = active.iter().find(|q| q.period == Period::Minute).unwrap();
    assert_eq!(minute.period_start, at(2024, 5, 14, 14, 0, 0));
    assert_eq!(minute.used, 0);
}

#[tokio::test]
async fn retired_rows_are_purged_after_retention() {
    let clock = noon();
    let (quotas, store) = manager(clock.clone());

    quotas
        .check_quota("acme", None, "/api/events", Tier::Basic)
        .await;
    clock.advance(TimeDelta::minutes(1));
    quotas.reset_quotas().await.unwrap();
    assert_eq!(store.all_rows().await.len(), 4);

    clock.advance(TimeDelta::days(31));
    let report = quotas.reset_quotas().await.unwrap();
    assert!(report.purged >= 1);
    assert!(store.all_rows().await.iter().all(|q| q.is_active));
}

#[tokio::test]
async fn change_tier_supersedes_old_rows() {
    let clock = noon();
    let (quotas, store) = manager(clock);

    quotas
        .check_quota("acme", None, "/api/events", Tier::Free)
        .await;
    let created = quotas
        .change_tier("acme", "/api/events", Tier::Enterprise)
        .await
        .unwrap();
    assert_eq!(created.len(), 3);

    let active = quotas.usage("acme").await.unwrap();
    assert_eq!(active.len(), 3);
    assert!(active.iter().all(|q| q.scope.tier == Tier::Enterprise));
    // History is kept
    assert_eq!(store.all_rows().await.len(), 6);
}

#[tokio::test]
async fn set_quota_rejects_zero_limit() {
    let (quotas, _) = manager(noon());
    let scope = QuotaScope::new("acme", "/api/events", Tier::Free);
    let err = quotas
        .set_quota(scope, Period::Day, 0, 0.1)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::Config(_)));
}

#[tokio::test]
async fn fails_open_when_store_is_unreachable() {
    let quotas = QuotaManager::new(Arc::new(UnreachableStore), Arc::new(NullSink), noon());
    for _ in 0..25 {
        let decision = quotas
            .check_quota("acme", None, "/api/events", Tier::Free)
            .await;
        assert!(decision.allowed);
        assert_eq!(decision.overage, 0);
    }
}

#[tokio::test]
async fn usage_events_reach_recorder_with_cost() {
    let clock = noon();
    let recorder = Arc::new(InMemoryUsageRecorder::new());
    let (sink, _handle) = ChannelUsageSink::spawn(16, recorder.clone());
    let quotas = QuotaManager::new(
        Arc::new(InMemoryQuotaStore::new()),
        Arc::new(sink),
        clock.clone(),
    );

    let decision = quotas
        .check_quota("acme", Some("key-1"), "/api/events", Tier::Basic)
        .await;
    let cost = quotas.request_cost(Tier::Basic, Some(&decision));
    assert_eq!(cost, 0.001);

    quotas.record_usage(UsageEvent {
        subject: "acme".to_string(),
        api_key_id: Some("key-1".to_string()),
        ip: "203.0.113.8".to_string(),
        endpoint: "/api/events".to_string(),
        method: "GET".to_string(),
        status_code: 200,
        response_time_ms: 18,
        cost,
        timestamp: chrono::Utc::now(),
    });

    for _ in 0..100 {
        if !recorder.events().await.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let events = recorder.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].cost, 0.001);
}
