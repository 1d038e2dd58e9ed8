use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let database = match &state.db_pool {
        // Short timeout so the probe answers even when the first connection hangs.
        Some(pool) => match tokio::time::timeout(
            Duration::from_secs(1),
            sqlx::query("SELECT 1").fetch_one(pool),
        )
        .await
        {
            Ok(Ok(_)) => "ok",
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Health check DB query failed");
                "error"
            }
            Err(_) => {
                tracing::error!("Health check DB query timed out (1s)");
                "error"
            }
        },
        None => "unconfigured",
    };

    Json(json!({
        "status": "ok",
        "app": state.config.app_name,
        "environment": state.config.environment,
        "database": database,
        "now": Utc::now().to_rfc3339(),
    }))
}
