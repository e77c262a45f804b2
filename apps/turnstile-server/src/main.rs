//! # Turnstile Server
//!
//! Actix-web front door: admission control on `/gateway/*`, the management
//! plane on `/api/admin/*`.

use std::time::Duration;

use actix_web::{App, HttpServer, web};
use tracing_actix_web::TracingLogger;

#[cfg(feature = "scheduler")]
mod background;
mod config;
mod handlers;
mod middleware;
mod observability;
mod state;
mod telemetry;


use config::AppConfig;
use observability::RequestIdMiddleware;
use state::AppState;
use telemetry::{TelemetryConfig, init_telemetry};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    init_telemetry(&TelemetryConfig::from_env());

    let config = AppConfig::from_env().map_err(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::io::Error::other(e.to_string())
    })?;

    tracing::info!(
        "Starting Turnstile on {}:{}",
        config.host,
        config.port
    );

    if config.trusted_proxies.is_empty() {
        tracing::info!("No trusted proxies; client address is the TCP peer");
    }

    let (state, usage_task) = AppState::new(&config).await;
    let health_task = state.router.clone().spawn_health_checks();

    #[cfg(feature = "scheduler")]
    let mut scheduler = start_scheduler(&state).await;
    #[cfg(not(feature = "scheduler"))]
    tracing::info!("Built without scheduler feature - maintenance jobs disabled");

    let server_state = state.clone();
    let result = HttpServer::new(move || {
        let state = server_state.clone();
        App::new()
            .wrap(TracingLogger::default())
            .wrap(RequestIdMiddleware)
            .app_data(web::Data::new(state.clone()))
            .configure(|cfg| handlers::configure_routes(cfg, &state))
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await;

    health_task.abort();
    #[cfg(feature = "scheduler")]
    stop_scheduler(scheduler.as_mut()).await;

    // The usage task drains once every sender is gone.
    drop(state);
    match tokio::time::timeout(Duration::from_secs(5), usage_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Usage recorder task ended abnormally"),
        Err(_) => tracing::warn!("Usage recorder did not drain in time"),
    }

    result
}

#[cfg(feature = "scheduler")]
async fn start_scheduler(state: &AppState) -> Option<background::Scheduler> {
    let config = background::SchedulerConfig::from_env();
    if !config.enabled {
        tracing::info!("Scheduler disabled");
        return None;
    }

    let scheduler = match background::Scheduler::new(config).await {
        Ok(scheduler) => scheduler,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create scheduler");
            return None;
        }
    };
    if let Err(e) = background::register_jobs(&scheduler, state).await {
        tracing::error!(error = %e, "Failed to register maintenance jobs");
        return None;
    }
    if let Err(e) = scheduler.start().await {
        tracing::error!(error = %e, "Failed to start scheduler");
        return None;
    }
    Some(scheduler)
}

#[cfg(feature = "scheduler")]
async fn stop_scheduler(scheduler: Option<&mut background::Scheduler>) {
    if let Some(scheduler) = scheduler {
        if let Err(e) = scheduler.shutdown().await {
            tracing::warn!(error = %e, "Scheduler shutdown failed");
        }
    }
}
