use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};
use sqlx::Row;

use crate::{
    access::{assert_active_user, assert_role, FINANCE_ROLES},
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{
        create_row, get_live_row, list_rows, live_filters, lock_live_row, map_db_error,
        soft_delete_row, update_row,
    },
    schemas::{
        clamp_limit, remove_nulls, serialize_to_map, validate_input, CreateSafeInput, IdPath,
        ReportRangeQuery, SafeTransferInput, SafeTransfersQuery, SafesQuery, UpdateSafeInput,
    },
    services::{
        audit::write_audit_log,
        ledger::{transfer_between_safes, TransferDraft},
        reports::{resolve_range, safe_ledger},
    },
    state::{db_pool, AppState},
    values::{non_empty_opt, parse_date, round2, value_number, value_str},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/safes", axum::routing::get(list_safes).post(create_safe))
        .route("/safes/transfer", axum::routing::post(transfer))
        .route("/safes/transfers", axum::routing::get(list_transfers))
        .route(
            "/safes/{id}",
            axum::routing::get(get_safe)
                .patch(update_safe)
                .delete(delete_safe),
        )
        .route("/safes/{id}/ledger", axum::routing::get(get_safe_ledger))
}

async fn list_safes(
    State(state): State<AppState>,
    Query(query): Query<SafesQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = live_filters();
    if let Some(is_active) = query.is_active {
        filters.insert("is_active".to_string(), Value::Bool(is_active));
    }
    let rows = list_rows(
        pool,
        "safes",
        Some(&filters),
        clamp_limit(query.limit),
        query.offset,
        "name",
        true,
    )
    .await?;
    let total_balance = round2(rows.iter().map(|row| value_number(row, "balance")).sum());
    Ok(Json(json!({ "data": rows, "total_balance": total_balance })))
}

async fn create_safe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateSafeInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, FINANCE_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("name".to_string(), Value::String(payload.name.trim().to_string()));
    record.insert("balance".to_string(), json!(round2(payload.balance)));
    let created = create_row(pool, "safes", &record).await?;
    let entity_id = value_str(&created, "id");
    state.report_cache.invalidate_all();

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "create",
        "safes",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_safe(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;
    Ok(Json(get_live_row(pool, "safes", &path.id).await?))
}

async fn update_safe(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateSafeInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, FINANCE_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let before = get_live_row(pool, "safes", &path.id).await?;
    let mut patch = Map::new();
    if let Some(name) = non_empty_opt(payload.name.as_deref()) {
        patch.insert("name".to_string(), Value::String(name));
    }
    if let Some(is_active) = payload.is_active {
        patch.insert("is_active".to_string(), Value::Bool(is_active));
    }
    if patch.is_empty() {
        return Ok(Json(before));
    }
    let updated = update_row(pool, "safes", &path.id, &patch).await?;
    state.report_cache.invalidate_all();

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "update",
        "safes",
        Some(&path.id),
        Some(before),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

async fn delete_safe(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, FINANCE_ROLES).await?;
    let pool = db_pool(&state)?;

    let mut tx = pool.begin().await.map_err(map_db_error)?;
    let before = lock_live_row(&mut *tx, "safes", &path.id).await?;
    ensure_empty_safe(&before)?;
    let deleted = soft_delete_row(&mut *tx, "safes", &path.id).await?;
    tx.commit().await.map_err(map_db_error)?;
    state.report_cache.invalidate_all();

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "delete",
        "safes",
        Some(&path.id),
        Some(before),
        None,
    )
    .await;
    Ok(Json(deleted))
}

async fn transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SafeTransferInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, FINANCE_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let transfer_date = match non_empty_opt(payload.transfer_date.as_deref()) {
        Some(raw) => parse_date(&raw)?,
        None => state.config.business_today(),
    };
    let draft = TransferDraft {
        from_safe_id: payload.from_safe_id.trim().to_string(),
        to_safe_id: payload.to_safe_id.trim().to_string(),
        amount: payload.amount,
        transfer_date,
        notes: payload.notes,
        created_by_user_id: user_id.clone(),
    };

    let mut tx = pool.begin().await.map_err(map_db_error)?;
    let created = transfer_between_safes(&mut *tx, draft).await?;
    tx.commit().await.map_err(map_db_error)?;
    state.report_cache.invalidate_all();

    let entity_id = value_str(&created, "id");
    tracing::info!(
        transfer_id = %entity_id,
        from_safe_id = %payload.from_safe_id,
        to_safe_id = %payload.to_safe_id,
        amount = payload.amount,
        "Safe transfer recorded"
    );
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "transfer",
        "safe_transfers",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn list_transfers(
    State(state): State<AppState>,
    Query(query): Query<SafeTransfersQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let safe_id = non_empty_opt(query.safe_id.as_deref());
    let from_date = non_empty_opt(query.from_date.as_deref())
        .map(|raw| parse_date(&raw))
        .transpose()?;
    let to_date = non_empty_opt(query.to_date.as_deref())
        .map(|raw| parse_date(&raw))
        .transpose()?;

    // A safe filter matches either side of the transfer.
    let rows = sqlx::query(
        "SELECT row_to_json(t) AS row
         FROM safe_transfers t
         WHERE ($1::uuid IS NULL OR t.from_safe_id = $1::uuid OR t.to_safe_id = $1::uuid)
           AND ($2::date IS NULL OR t.transfer_date >= $2)
           AND ($3::date IS NULL OR t.transfer_date <= $3)
         ORDER BY t.transfer_date DESC, t.created_at DESC
         LIMIT $4 OFFSET $5",
    )
    .bind(safe_id)
    .bind(from_date)
    .bind(to_date)
    .bind(clamp_limit(query.limit))
    .bind(query.offset.max(0))
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let data = rows
        .into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect::<Vec<_>>();
    Ok(Json(json!({ "data": data })))
}

async fn get_safe_ledger(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    Query(query): Query<ReportRangeQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, FINANCE_ROLES).await?;
    let pool = db_pool(&state)?;

    let from = non_empty_opt(query.from_date.as_deref())
        .map(|raw| parse_date(&raw))
        .transpose()?;
    let to = non_empty_opt(query.to_date.as_deref())
        .map(|raw| parse_date(&raw))
        .transpose()?;
    let range = resolve_range(from, to, state.config.business_today())?;

    let safe = get_live_row(pool, "safes", &path.id).await?;
    Ok(Json(safe_ledger(pool, &safe, &range).await?))
}

fn ensure_empty_safe(safe: &Value) -> AppResult<()> {
    let balance = value_number(safe, "balance");
    if balance.abs() >= 0.005 {
        return Err(AppError::Conflict(format!(
            "Safe '{}' still holds {balance:.2}. Transfer the balance out before deleting it.",
            value_str(safe, "name")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::ensure_empty_safe;
    use crate::error::AppError;

    #[test]
    fn only_empty_safes_can_be_deleted() {
        assert!(ensure_empty_safe(&json!({"name": "Main", "balance": 0.0})).is_ok());
        assert!(ensure_empty_safe(&json!({"name": "Main", "balance": "0.00"})).is_ok());
        assert!(matches!(
            ensure_empty_safe(&json!({"name": "Main", "balance": 12.5})),
            Err(AppError::Conflict(_))
        ));
    }
}
