//! Health check endpoint.

use actix_web::{HttpResponse, web};
use turnstile_shared::dto::HealthResponse;

use crate::state::AppState;

/// GET /api/health
///
/// `degraded` when nodes are registered but none is active.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let nodes = state.router.nodes().await;
    let nodes_active = nodes.iter().filter(|n| n.is_active).count();
    let status = if !nodes.is_empty() && nodes_active == 0 {
        "degraded"
    } else {
        "ok"
    };

    HttpResponse::Ok().json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: state.store_kind.to_string(),
        nodes_total: nodes.len(),
        nodes_active,
    })
}
