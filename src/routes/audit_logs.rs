use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    access::{assert_role, ADMIN_ONLY},
    auth::require_user_id,
    error::AppResult,
    repository::table_service::{get_row, list_rows, MAX_LIST_LIMIT},
    schemas::{AuditLogsQuery, IdPath},
    state::{db_pool, AppState},
    values::non_empty_opt,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/audit-logs", axum::routing::get(list_audit_logs))
        .route("/audit-logs/{id}", axum::routing::get(get_audit_log))
}

async fn list_audit_logs(
    State(state): State<AppState>,
    Query(query): Query<AuditLogsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, ADMIN_ONLY).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(entity_name) = non_empty_opt(query.entity_name.as_deref()) {
        filters.insert("entity_name".to_string(), Value::String(entity_name));
    }
    if let Some(entity_id) = non_empty_opt(query.entity_id.as_deref()) {
        filters.insert("entity_id".to_string(), Value::String(entity_id));
    }
    if let Some(actor) = non_empty_opt(query.actor_user_id.as_deref()) {
        filters.insert("actor_user_id".to_string(), Value::String(actor));
    }

    let rows = list_rows(
        pool,
        "audit_logs",
        Some(&filters),
        audit_limit(query.limit),
        0,
        "created_at",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn get_audit_log(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, ADMIN_ONLY).await?;
    let pool = db_pool(&state)?;
    Ok(Json(get_row(pool, "audit_logs", &path.id).await?))
}

/// Audit browsing may page further than regular lists, up to the gateway cap.
fn audit_limit(limit: i64) -> i64 {
    limit.clamp(1, MAX_LIST_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::audit_limit;
    use crate::repository::table_service::MAX_LIST_LIMIT;

    #[test]
    fn limit_never_exceeds_gateway_cap() {
        assert_eq!(audit_limit(5_000), MAX_LIST_LIMIT);
        assert_eq!(audit_limit(0), 1);
        assert_eq!(audit_limit(250), 250);
    }
}
