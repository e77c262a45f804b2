//! Maintenance jobs: quota rollover, block sweep and store purges.

use tokio_cron_scheduler::JobSchedulerError;

use super::scheduler::Scheduler;
use crate::state::AppState;

/// Register every maintenance job on `scheduler`.
pub async fn register(scheduler: &Scheduler, state: &AppState) -> Result<(), JobSchedulerError> {
    let config = scheduler.config().clone();

    let quotas = state.quotas.clone();
    scheduler
        .add_cron(&config.quota_reset_cron, "quota-reset", move || {
            let quotas = quotas.clone();
            async move {
                match quotas.reset_quotas().await {
                    Ok(report) => tracing::debug!(
                        deactivated = report.deactivated,
                        created = report.created,
                        advanced = report.advanced,
                        purged = report.purged,
                        "Quota reset pass complete"
                    ),
                    Err(e) => tracing::error!(error = %e, "Quota reset failed"),
                }
            }
        })
        .await?;

    let blocks = state.blocks.clone();
    scheduler
        .add_cron(&config.block_sweep_cron, "block-sweep", move || {
            let blocks = blocks.clone();
            async move {
                if let Err(e) = blocks.sweep_expired().await {
                    tracing::error!(error = %e, "Block sweep failed");
                }
            }
        })
        .await?;

    let limiter = state.limiter.clone();
    let detector = state.detector.clone();
    scheduler
        .add_cron(&config.purge_cron, "store-purge", move || {
            let limiter = limiter.clone();
            let detector = detector.clone();
            async move {
                let windows = limiter.purge_expired().await;
                let activity = detector.purge_expired().await;
                match (windows, activity) {
                    (Ok(windows), Ok(activity)) => tracing::debug!(
                        windows,
                        activity,
                        "Expired windows and activity purged"
                    ),
                    (Err(e), _) | (_, Err(e)) => {
                        tracing::error!(error = %e, "Store purge failed");
                    }
                }
            }
        })
        .await?;

    Ok(())
}
