use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    access::{assert_active_user, assert_role, FINANCE_ROLES},
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{
        get_live_row, get_row, list_rows, lock_live_row, map_db_error, update_row,
    },
    schemas::{clamp_limit, BrokerDuesQuery, IdPath, PayBrokerDueInput},
    services::{
        audit::write_audit_log,
        ledger::{record_voucher, VoucherDraft, VoucherKind},
    },
    state::{db_pool, AppState},
    values::{non_empty_opt, payment_moment, round2, value_number, value_str},
};

const BROKER_DUE_STATUSES: &[&str] = &["pending", "paid"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/broker-dues", axum::routing::get(list_broker_dues))
        .route("/broker-dues/{id}", axum::routing::get(get_broker_due))
        .route(
            "/broker-dues/{id}/pay",
            axum::routing::post(pay_broker_due),
        )
}

async fn list_broker_dues(
    State(state): State<AppState>,
    Query(query): Query<BrokerDuesQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(broker_id) = non_empty_opt(query.broker_id.as_deref()) {
        filters.insert("broker_id".to_string(), Value::String(broker_id));
    }
    if let Some(contract_id) = non_empty_opt(query.contract_id.as_deref()) {
        filters.insert("contract_id".to_string(), Value::String(contract_id));
    }
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        if !BROKER_DUE_STATUSES.contains(&status.as_str()) {
            return Err(AppError::BadRequest(format!(
                "Unknown broker due status '{status}'."
            )));
        }
        filters.insert("status".to_string(), Value::String(status));
    }

    let rows = list_rows(
        pool,
        "broker_dues",
        Some(&filters),
        clamp_limit(query.limit),
        query.offset,
        "due_date",
        true,
    )
    .await?;
    let pending_total: f64 = rows
        .iter()
        .filter(|row| value_str(row, "status") == "pending")
        .map(|row| value_number(row, "amount"))
        .sum();
    Ok(Json(json!({
        "data": rows,
        "pending_total": round2(pending_total),
    })))
}

async fn get_broker_due(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut due = get_row(pool, "broker_dues", &path.id).await?;
    let broker = get_row(pool, "brokers", &value_str(&due, "broker_id")).await?;
    let contract = get_row(pool, "contracts", &value_str(&due, "contract_id")).await?;
    if let Some(obj) = due.as_object_mut() {
        obj.insert("broker".to_string(), broker);
        obj.insert("contract".to_string(), contract);
    }
    Ok(Json(due))
}

/// Pay a broker due in full out of a safe.
async fn pay_broker_due(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
    Json(payload): Json<PayBrokerDueInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, FINANCE_ROLES).await?;
    let pool = db_pool(&state)?;

    let today = state.config.business_today();
    let (paid_on, paid_at) = payment_moment(
        payload.paid_at.as_deref(),
        today,
        state.config.business_timezone,
    )?;

    let mut tx = pool.begin().await.map_err(map_db_error)?;
    let before = lock_live_row(&mut *tx, "broker_dues", &path.id).await?;
    if value_str(&before, "status") == "paid" {
        return Err(AppError::Conflict("Broker due is already paid.".to_string()));
    }
    let broker = get_row(&mut *tx, "brokers", &value_str(&before, "broker_id")).await?;
    let contract = get_live_row(&mut *tx, "contracts", &value_str(&before, "contract_id")).await?;

    let mut draft = VoucherDraft::new(
        VoucherKind::Payment,
        payload.safe_id.trim(),
        value_number(&before, "amount"),
        paid_on,
        &user_id,
    );
    draft.description = Some(format!(
        "Broker commission for contract {}",
        value_str(&contract, "code")
    ));
    draft.party_name = Some(value_str(&broker, "full_name"));
    draft.contract_id = Some(value_str(&contract, "id"));
    draft.unit_id = Some(value_str(&contract, "unit_id"));
    draft.broker_due_id = Some(path.id.clone());
    let voucher = record_voucher(&mut *tx, draft).await?;

    let mut patch = Map::new();
    patch.insert("status".to_string(), Value::String("paid".to_string()));
    patch.insert("paid_at".to_string(), Value::String(paid_at));
    patch.insert("voucher_id".to_string(), Value::String(value_str(&voucher, "id")));
    let updated = update_row(&mut *tx, "broker_dues", &path.id, &patch).await?;
    tx.commit().await.map_err(map_db_error)?;
    state.report_cache.invalidate_all();

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "pay",
        "broker_dues",
        Some(&path.id),
        Some(before),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(json!({ "broker_due": updated, "voucher": voucher })))
}
