use std::time::Duration;

use tokio::time::sleep;

use crate::state::AppState;

/// Background loop for periodic jobs. Each run is spawned on its own task so a
/// failing sweep never takes the loop down.
pub async fn run_background_scheduler(state: AppState) {
    let Some(pool) = state.db_pool.clone() else {
        tracing::warn!("Scheduler: no database pool configured, exiting");
        return;
    };

    let overdue_interval =
        Duration::from_secs(state.config.overdue_sweep_interval_minutes.max(1) * 60);
    tracing::info!(
        interval_minutes = overdue_interval.as_secs() / 60,
        "Background scheduler started"
    );

    // First sweep runs shortly after boot instead of waiting a full interval.
    let mut last_overdue_run: Option<tokio::time::Instant> = None;

    loop {
        sleep(Duration::from_secs(15)).await;

        let now = tokio::time::Instant::now();
        if last_overdue_run.is_some_and(|last| now.duration_since(last) < overdue_interval) {
            continue;
        }
        last_overdue_run = Some(now);

        let pool = pool.clone();
        let today = state.config.business_today();
        let report_cache = state.report_cache.clone();
        tokio::spawn(async move {
            match crate::services::overdue::mark_overdue_installments(&pool, today).await {
                Ok(0) => {}
                Ok(updated) => {
                    report_cache.invalidate_all();
                    tracing::info!(updated, %today, "Scheduler: marked installments overdue");
                }
                Err(error) => {
                    tracing::error!(error = %error, "Scheduler: overdue sweep failed");
                }
            }
        });
    }
}
