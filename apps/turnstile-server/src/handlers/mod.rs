//! HTTP handlers and route configuration.

mod admin;
mod gateway;
mod health;

use actix_web::web;

use crate::middleware::{AdmissionGate, OperatorGate};
use crate::state::AppState;

pub use gateway::GATEWAY_PREFIX;

/// Configure all application routes.
///
/// The gateway scope passes through admission control. The management scope
/// answers only to API keys holding the `admin` permission.
pub fn configure_routes(cfg: &mut web::ServiceConfig, state: &AppState) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(health::health_check))
            .service(
                web::scope("/admin")
                    .wrap(OperatorGate::new(state.clone()))
                    .route("/quotas", web::post().to(admin::set_quota))
                    .route("/quotas/tier", web::post().to(admin::change_tier))
                    .route("/quotas/reset", web::post().to(admin::reset_quotas))
                    .route("/quotas/{subject}", web::get().to(admin::quota_usage))
                    .route("/blocks", web::get().to(admin::list_blocks))
                    .route("/blocks", web::post().to(admin::block_ip))
                    .route("/blocks/history", web::get().to(admin::block_history))
                    .route("/blocks/sweep", web::post().to(admin::sweep_blocks))
                    .route("/blocks/{ip}", web::delete().to(admin::unblock_ip))
                    .route("/gateway/nodes", web::get().to(admin::list_nodes))
                    .route("/gateway/nodes", web::post().to(admin::add_node))
                    .route("/gateway/nodes/{id}", web::delete().to(admin::remove_node))
                    .route("/gateway/rules", web::get().to(admin::list_rules))
                    .route("/gateway/rules", web::post().to(admin::add_rule))
                    .route("/gateway/rules/{id}", web::delete().to(admin::remove_rule))
                    .route("/gateway/stats", web::get().to(admin::gateway_stats))
                    .route(
                        "/gateway/recommendations",
                        web::get().to(admin::recommendations),
                    )
                    .route(
                        "/gateway/health-checks",
                        web::post().to(admin::run_health_checks),
                    )
                    .route("/rate-limits/reset", web::post().to(admin::reset_rate_limit)),
            ),
    )
    .service(
        web::scope(GATEWAY_PREFIX)
            .wrap(AdmissionGate::new(state.clone(), GATEWAY_PREFIX))
            .route("/{tail:.*}", web::route().to(gateway::proxy)),
    );
}
