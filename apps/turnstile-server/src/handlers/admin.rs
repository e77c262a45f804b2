//! Management plane: quotas, IP blocks, gateway topology and rate-limit
//! windows.

use actix_web::{HttpResponse, web};
use chrono::TimeDelta;
use turnstile_core::domain::{
    BlockRequest, BlockType, ClientIdentity, NodeSpec, Period, QuotaScope, RequestPath,
    RoutingRule, RuleConditions, Strategy, ThreatLevel, Tier,
};
use turnstile_shared::ApiResponse;
use turnstile_shared::dto::{
    AddNodeRequest, AddRuleRequest, BlockIpRequest, ChangeTierRequest, HistoryQuery,
    MaintenanceReport, ResetRateLimitRequest, SetQuotaRequest,
};

use crate::middleware::{AppResult, Operator};
use crate::state::AppState;

/// Quota and window key for an endpoint given in a management call, matching
/// what admission uses for live traffic.
fn resource_key(state: &AppState, endpoint: &str) -> AppResult<(RequestPath, String)> {
    let path = RequestPath::parse(endpoint)?;
    let resource = state.router.permissions().resource_for(&path);
    Ok((path, resource))
}

// ---- Quotas ----

/// POST /api/admin/quotas
pub async fn set_quota(
    state: web::Data<AppState>,
    body: web::Json<SetQuotaRequest>,
) -> AppResult<HttpResponse> {
    let req = body.into_inner();
    let tier: Tier = req.tier.parse()?;
    let period: Period = req.period.parse()?;
    let (_, endpoint) = resource_key(&state, &req.endpoint)?;

    let quota = state
        .quotas
        .set_quota(
            QuotaScope::new(req.subject, endpoint, tier),
            period,
            req.limit,
            req.overage_rate,
        )
        .await?;

    Ok(HttpResponse::Created().json(ApiResponse::ok(quota)))
}

/// POST /api/admin/quotas/tier
pub async fn change_tier(
    state: web::Data<AppState>,
    body: web::Json<ChangeTierRequest>,
) -> AppResult<HttpResponse> {
    let tier: Tier = body.tier.parse()?;
    let (_, endpoint) = resource_key(&state, &body.endpoint)?;
    let rows = state
        .quotas
        .change_tier(&body.subject, &endpoint, tier)
        .await?;

    Ok(HttpResponse::Ok().json(ApiResponse::ok(rows)))
}

/// POST /api/admin/quotas/reset
pub async fn reset_quotas(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let report = state.quotas.reset_quotas().await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(MaintenanceReport {
        deactivated: report.deactivated,
        created: report.created,
        purged: report.purged,
    })))
}

/// GET /api/admin/quotas/{subject}
pub async fn quota_usage(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let rows = state.quotas.usage(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(rows)))
}

// ---- Blocks ----

/// POST /api/admin/blocks
pub async fn block_ip(
    state: web::Data<AppState>,
    body: web::Json<BlockIpRequest>,
) -> AppResult<HttpResponse> {
    let req = body.into_inner();
    let threat_level = match req.threat_level.as_deref() {
        Some(level) => level.parse()?,
        None => ThreatLevel::High,
    };

    let record = state
        .blocks
        .block(BlockRequest {
            ip_address: req.ip_address,
            block_type: BlockType::Manual,
            reason: req.reason,
            threat_level,
            duration: TimeDelta::seconds(req.duration_secs),
        })
        .await?;

    Ok(HttpResponse::Created().json(ApiResponse::ok(record)))
}

/// DELETE /api/admin/blocks/{ip}
///
/// Recorded as unblocked by the authenticated operator's subject.
pub async fn unblock_ip(
    state: web::Data<AppState>,
    operator: Operator,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let record = state
        .blocks
        .unblock(&path.into_inner(), &operator.subject)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(record)))
}

/// GET /api/admin/blocks
pub async fn list_blocks(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let blocks = state.blocks.list_active().await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(blocks)))
}

/// GET /api/admin/blocks/history?limit=50
pub async fn block_history(
    state: web::Data<AppState>,
    query: web::Query<HistoryQuery>,
) -> AppResult<HttpResponse> {
    let history = state.blocks.history(query.limit).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(history)))
}

/// POST /api/admin/blocks/sweep
pub async fn sweep_blocks(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let deactivated = state.blocks.sweep_expired().await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(MaintenanceReport {
        deactivated,
        ..Default::default()
    })))
}

// ---- Gateway ----

/// GET /api/admin/gateway/nodes
pub async fn list_nodes(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::ok(state.router.nodes().await))
}

/// POST /api/admin/gateway/nodes
pub async fn add_node(
    state: web::Data<AppState>,
    body: web::Json<AddNodeRequest>,
) -> AppResult<HttpResponse> {
    let req = body.into_inner();
    let node = state
        .router
        .add_node(NodeSpec {
            id: req.id,
            url: req.url,
            weight: req.weight,
        })
        .await?;

    Ok(HttpResponse::Created().json(ApiResponse::ok(node)))
}

/// DELETE /api/admin/gateway/nodes/{id}
pub async fn remove_node(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let node = state.router.remove_node(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(node)))
}

/// GET /api/admin/gateway/rules
pub async fn list_rules(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::ok(state.router.rules().await))
}

/// POST /api/admin/gateway/rules
pub async fn add_rule(
    state: web::Data<AppState>,
    body: web::Json<AddRuleRequest>,
) -> AppResult<HttpResponse> {
    let req = body.into_inner();
    let required_tier = req
        .required_tier
        .as_deref()
        .map(str::parse::<Tier>)
        .transpose()?;

    let rule = state
        .router
        .add_rule(RoutingRule {
            id: req.id,
            pattern: req.pattern,
            method: req.method,
            priority: req.priority,
            target_servers: req.target_servers,
            conditions: RuleConditions { required_tier },
        })
        .await?;

    Ok(HttpResponse::Created().json(ApiResponse::ok(rule)))
}

/// DELETE /api/admin/gateway/rules/{id}
pub async fn remove_rule(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let rule = state.router.remove_rule(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(rule)))
}

/// GET /api/admin/gateway/stats
pub async fn gateway_stats(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::ok(state.router.stats().await))
}

/// GET /api/admin/gateway/recommendations
pub async fn recommendations(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::ok(state.router.recommendations().await))
}

/// POST /api/admin/gateway/health-checks
///
/// Runs a probe pass now instead of waiting for the next tick.
pub async fn run_health_checks(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::ok(state.router.run_health_checks().await))
}

// ---- Rate limits ----

/// POST /api/admin/rate-limits/reset
///
/// Clears the windows the client would be checked against on `route`, using
/// the route's configured strategy unless one is given.
pub async fn reset_rate_limit(
    state: web::Data<AppState>,
    body: web::Json<ResetRateLimitRequest>,
) -> AppResult<HttpResponse> {
    let req = body.into_inner();
    let (path, resource) = resource_key(&state, &req.route)?;
    let (window_route, config) = state.admission.policy().resolve(&path.path(), &resource);
    let strategy: Strategy = match req.strategy.as_deref() {
        Some(s) => s.parse()?,
        None => config.strategy,
    };
    let identity = match req.user_id {
        Some(user) => ClientIdentity::user(req.ip, user),
        None => ClientIdentity::anonymous(req.ip),
    };

    state.limiter.reset(&identity, window_route, strategy).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok_with_message(
        strategy.to_string(),
        format!("Rate limit window cleared for {}", window_route),
    )))
}
