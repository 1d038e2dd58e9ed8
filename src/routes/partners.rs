use std::collections::HashMap;

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
        .route(
            "/partners",
            axum::routing::get(list_partners).post(create_partner),
        )
        .route(
            "/partners/{id}",
            axum::routing::get(get_partner)
                .patch(update_partner)
                .delete(delete_partner),
        )
        .route("/partners/{id}/units", axum::routing::get(list_partner_units))
}

async fn list_partners(
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
        "partners",
        Some(&filters),
        clamp_limit(query.limit),
        query.offset,
        "full_name",
        true,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_partner(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePartyInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, SALES_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "partners", &record).await?;
    state.report_cache.invalidate_all();
    let entity_id = value_str(&created, "id");

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "create",
        "partners",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_partner(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;
    Ok(Json(get_live_row(pool, "partners", &path.id).await?))
}

async fn update_partner(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdatePartyInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, SALES_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let before = get_live_row(pool, "partners", &path.id).await?;
    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "partners", &path.id, &patch).await?;
    state.report_cache.invalidate_all();

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "update",
        "partners",
        Some(&path.id),
        Some(before),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

async fn delete_partner(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, ADMIN_ONLY).await?;
    let pool = db_pool(&state)?;

    let links = json_map(&[("partner_id", Value::String(path.id.clone()))]);
    if count_rows(pool, "unit_partners", Some(&links)).await? > 0 {
        return Err(AppError::Conflict(
            "Partner still holds unit shares. Detach them first.".to_string(),
        ));
    }

    let deleted = soft_delete_row(pool, "partners", &path.id).await?;
    state.report_cache.invalidate_all();
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "delete",
        "partners",
        Some(&path.id),
        Some(deleted.clone()),
        None,
    )
    .await;
    Ok(Json(deleted))
}

async fn list_partner_units(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    get_live_row(pool, "partners", &path.id).await?;
    let links = list_rows(
        pool,
        "unit_partners",
        Some(&json_map(&[("partner_id", Value::String(path.id.clone()))])),
        1000,
        0,
        "created_at",
        true,
    )
    .await?;
    if links.is_empty() {
        return Ok(Json(json!({ "data": [] })));
    }

    let shares = links
        .iter()
        .map(|link| (value_str(link, "unit_id"), link.get("share_percent").cloned()))
        .collect::<HashMap<_, _>>();
    let mut unit_filters = live_filters();
    unit_filters.insert(
        "id__in".to_string(),
        Value::Array(shares.keys().cloned().map(Value::String).collect()),
    );
    let units = list_rows(pool, "units", Some(&unit_filters), 1000, 0, "code", true).await?;

    let rows = units
        .into_iter()
        .map(|mut unit| {
            let share = shares
                .get(&value_str(&unit, "id"))
                .cloned()
                .flatten()
                .unwrap_or(Value::Null);
            if let Some(obj) = unit.as_object_mut() {
                obj.insert("share_percent".to_string(), share);
            }
            unit
        })
        .collect::<Vec<_>>();
    Ok(Json(json!({ "data": rows })))
}

