mod common;

use chrono::TimeDelta;

use turnstile_core::domain::{
    BlockRequest, BlockType, ClientIdentity, PermissionMap, Period, RequestPath, ThreatLevel, Tier,
};
use turnstile_core::services::{AdmissionRequest, QuotaSubject, Verdict};

use common::{Stack, noon};

fn request(ip: &str, route: &str, tier: Option<Tier>) -> AdmissionRequest {
    let path = RequestPath::parse(route).unwrap();
    AdmissionRequest {
        identity: ClientIdentity::anonymous(ip),
        user_agent: "Mozilla/5.0".to_string(),
        route: path.path(),
        resource: PermissionMap::default().resource_for(&path),
        quota: tier.map(|tier| QuotaSubject {
            subject: "acme".to_string(),
            api_key_id: Some("key-1".to_string()),
            tier,
        }),
    }
}

#[tokio::test]
async fn blocked_ip_consumes_nothing() {
    let stack = Stack::new(noon());
    stack
        .registry
        .block(BlockRequest {
            ip_address: "203.0.113.9".to_string(),
            block_type: BlockType::Manual,
            reason: "credential stuffing".to_string(),
            threat_level: ThreatLevel::High,
            duration: TimeDelta::minutes(30),
        })
        .await
        .unwrap();

    let admission = stack
        .admission(100)
        .admit(&request("203.0.113.9", "/api/events", Some(Tier::Free)))
        .await;

    assert_eq!(admission.verdict, Verdict::Blocked);
    assert!(!admission.is_admitted());
    assert_eq!(admission.retry_after(), 1800);
    assert!(admission.headers().is_none());
    assert!(stack.windows.is_empty().await);
    assert!(stack.quota_store.all_rows().await.is_empty());
}

#[tokio::test]
async fn free_tier_hits_quota_before_rate_limit() {
    let stack = Stack::new(noon());
    let controller = stack.admission(100);

    for _ in 0..10 {
        let admission = controller
            .admit(&request("198.51.100.2", "/api/events", Some(Tier::Free)))
            .await;
        assert!(admission.is_admitted());
        stack.clock.advance(TimeDelta::milliseconds(700));
    }

    let denied = controller
        .admit(&request("198.51.100.2", "/api/events", Some(Tier::Free)))
        .await;
    assert_eq!(denied.verdict, Verdict::QuotaExceeded);
    assert!(denied.retry_after() > 0);

    let quota = denied.quota.as_ref().unwrap();
    assert_eq!(quota.period, Period::Minute);

    let headers = denied.headers().unwrap();
    assert_eq!(headers.limit, 10);
    assert_eq!(headers.remaining, 0);
    assert_eq!(headers.reset_at, quota.reset_at);
}

#[tokio::test]
async fn rate_limited_request_consumes_no_quota() {
    let stack = Stack::new(noon());
    let controller = stack.admission(3);

    for _ in 0..3 {
        assert!(
            controller
                .admit(&request("192.0.2.30", "/api/gigs", Some(Tier::Basic)))
                .await
                .is_admitted()
        );
    }
    let limited = controller
        .admit(&request("192.0.2.30", "/api/gigs", Some(Tier::Basic)))
        .await;
    assert_eq!(limited.verdict, Verdict::RateLimited);
    assert!(limited.quota.is_none());
    assert_eq!(limited.headers().unwrap().limit, 3);

    let rows = stack.quotas.usage("acme").await.unwrap();
    assert!(rows.iter().all(|q| q.used == 3));
}

#[tokio::test]
async fn headers_report_the_tighter_budget() {
    let stack = Stack::new(noon());
    let controller = stack.admission(5);

    let admission = controller
        .admit(&request("192.0.2.31", "/api/events", Some(Tier::Free)))
        .await;
    assert!(admission.is_admitted());
    assert_eq!(admission.retry_after(), 0);

    // Rate window has 4 left, the free minute quota 9
    let headers = admission.headers().unwrap();
    assert_eq!(headers.limit, 5);
    assert_eq!(headers.remaining, 4);
    assert_eq!(headers.overage, 0);
}

#[tokio::test]
async fn anonymous_requests_skip_quota() {
    let stack = Stack::new(noon());
    let admission = stack
        .admission(5)
        .admit(&request("192.0.2.32", "/api/events", None))
        .await;

    assert!(admission.is_admitted());
    assert!(admission.quota.is_none());
    assert!(stack.quota_store.all_rows().await.is_empty());
    assert_eq!(admission.threat.threat_level, ThreatLevel::Low);
}

#[tokio::test]
async fn parameterized_paths_share_one_budget() {
    let stack = Stack::new(noon());
    let controller = stack.admission(5);

    let mut admitted = 0;
    for id in 0..20 {
        let route = format!("/api/events/{id}");
        if controller
            .admit(&request("192.0.2.40", &route, Some(Tier::Enterprise)))
            .await
            .is_admitted()
        {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);

    let rows = stack.quotas.usage("acme").await.unwrap();
    assert!(!rows.is_empty());
    assert!(rows.iter().all(|q| q.scope.endpoint == "/api/events"));
}
