use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use crate::{
    access::{assert_active_user, assert_role, ADMIN_ONLY, SALES_ROLES},
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{
        count_rows, create_row, get_live_row, list_rows, live_filters, soft_delete_row, update_row,
    },
    schemas::{
        clamp_limit, remove_nulls, serialize_to_map, validate_input, CreatePartyInput, IdPath,
        NameSearchQuery, UpdatePartyInput,
    },
    services::audit::write_audit_log,
    state::{db_pool, AppState},
    values::{json_map, non_empty_opt, value_str},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/brokers", axum::routing::get(list_brokers).post(create_broker))
        .route(
            "/brokers/{id}",
            axum::routing::get(get_broker)
                .patch(update_broker)
                .delete(delete_broker),
        )
}

async fn list_brokers(
    State(state): State<AppState>,
    Query(query): Query<NameSearchQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = live_filters();
    if let Some(q) = non_empty_opt(query.q.as_deref()) {
        filters.insert("full_name__ilike".to_string(), Value::String(format!("%{q}%")));
    }
    let rows = list_rows(
        pool,
        "brokers",
        Some(&filters),
        clamp_limit(query.limit),
        query.offset,
        "full_name",
        true,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_broker(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePartyInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, SALES_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "brokers", &record).await?;
    state.report_cache.invalidate_all();
    let entity_id = value_str(&created, "id");

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "create",
        "brokers",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_broker(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;
    Ok(Json(get_live_row(pool, "brokers", &path.id).await?))
}

async fn update_broker(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdatePartyInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, SALES_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let before = get_live_row(pool, "brokers", &path.id).await?;
    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "brokers", &path.id, &patch).await?;
    state.report_cache.invalidate_all();

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "update",
        "brokers",
        Some(&path.id),
        Some(before),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

async fn delete_broker(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, ADMIN_ONLY).await?;
    let pool = db_pool(&state)?;

    let pending = json_map(&[
        ("broker_id", Value::String(path.id.clone())),
        ("status", Value::String("pending".to_string())),
    ]);
    if count_rows(pool, "broker_dues", Some(&pending)).await? > 0 {
        return Err(AppError::Conflict(
            "Broker has pending dues and cannot be deleted.".to_string(),
        ));
    }

    let deleted = soft_delete_row(pool, "brokers", &path.id).await?;
    state.report_cache.invalidate_all();
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "delete",
        "brokers",
        Some(&path.id),
        Some(deleted.clone()),
        None,
    )
    .await;
    Ok(Json(deleted))
}
