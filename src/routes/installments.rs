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
    repository::table_service::{get_live_row, get_row, list_rows, lock_live_row, map_db_error, update_row},
    schemas::{
        clamp_limit, validate_input, IdPath, InstallmentsQuery, PayInstallmentInput,
        UpdateInstallmentInput,
    },
    services::{
        audit::write_audit_log,
        ledger::{record_voucher, VoucherDraft, VoucherKind},
        overdue::{installment_status_for, mark_overdue_installments},
    },
    state::{db_pool, AppState},
    values::{
        non_empty_opt, parse_date, payment_moment, round2, value_date, value_number, value_str,
    },
};

const INSTALLMENT_STATUSES: &[&str] = &["pending", "paid", "overdue"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/installments", axum::routing::get(list_installments))
        .route(
            "/installments/refresh-overdue",
            axum::routing::post(refresh_overdue),
        )
        .route(
            "/installments/{id}",
            axum::routing::get(get_installment).patch(update_installment),
        )
        .route(
            "/installments/{id}/pay",
            axum::routing::post(pay_installment),
        )
}

async fn list_installments(
    State(state): State<AppState>,
    Query(query): Query<InstallmentsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(contract_id) = non_empty_opt(query.contract_id.as_deref()) {
        filters.insert("contract_id".to_string(), Value::String(contract_id));
    }
    if let Some(unit_id) = non_empty_opt(query.unit_id.as_deref()) {
        filters.insert("unit_id".to_string(), Value::String(unit_id));
    }
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status__in".to_string(), parse_status_list(&status)?);
    }
    if let Some(due_from) = non_empty_opt(query.due_from.as_deref()) {
        let due_from = parse_date(&due_from)?;
        filters.insert("due_date__gte".to_string(), Value::String(due_from.to_string()));
    }
    if let Some(due_to) = non_empty_opt(query.due_to.as_deref()) {
        let due_to = parse_date(&due_to)?;
        filters.insert("due_date__lte".to_string(), Value::String(due_to.to_string()));
    }

    let rows = list_rows(
        pool,
        "installments",
        Some(&filters),
        clamp_limit(query.limit),
        query.offset,
        "due_date",
        true,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn get_installment(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut installment = get_row(pool, "installments", &path.id).await?;
    let remaining = remaining_balance(&installment);
    let vouchers = {
        let mut filters = crate::repository::table_service::live_filters();
        filters.insert("installment_id".to_string(), Value::String(path.id.clone()));
        list_rows(pool, "vouchers", Some(&filters), 100, 0, "voucher_date", true).await?
    };
    if let Some(obj) = installment.as_object_mut() {
        obj.insert("remaining".to_string(), json!(remaining));
        obj.insert("vouchers".to_string(), Value::Array(vouchers));
    }
    Ok(Json(installment))
}

async fn update_installment(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateInstallmentInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, FINANCE_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let mut tx = pool.begin().await.map_err(map_db_error)?;
    let before = lock_live_row(&mut *tx, "installments", &path.id).await?;
    if value_str(&before, "status") == "paid" {
        return Err(AppError::Conflict(
            "Paid installments cannot be changed.".to_string(),
        ));
    }

    let paid_amount = value_number(&before, "paid_amount");
    let amount = payload
        .amount
        .map(round2)
        .unwrap_or_else(|| value_number(&before, "amount"));
    if amount + 0.005 < paid_amount {
        return Err(AppError::BadRequest(format!(
            "amount cannot be below the {paid_amount:.2} already paid."
        )));
    }
    let due_date = match non_empty_opt(payload.due_date.as_deref()) {
        Some(raw) => Some(parse_date(&raw)?),
        None => value_date(&before, "due_date"),
    };

    let today = state.config.business_today();
    let mut patch = Map::new();
    patch.insert("amount".to_string(), json!(amount));
    if let Some(due_date) = due_date {
        patch.insert("due_date".to_string(), Value::String(due_date.to_string()));
    }
    if let Some(notes) = payload.notes {
        patch.insert("notes".to_string(), Value::String(notes));
    }
    let status = installment_status_for(amount, paid_amount, due_date, today);
    patch.insert("status".to_string(), Value::String(status.to_string()));

    let updated = update_row(&mut *tx, "installments", &path.id, &patch).await?;
    tx.commit().await.map_err(map_db_error)?;
    state.report_cache.invalidate_all();

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "update",
        "installments",
        Some(&path.id),
        Some(before),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

async fn pay_installment(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
    Json(payload): Json<PayInstallmentInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, FINANCE_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let today = state.config.business_today();
    let (paid_on, paid_at) = payment_moment(
        payload.paid_at.as_deref(),
        today,
        state.config.business_timezone,
    )?;

    let mut tx = pool.begin().await.map_err(map_db_error)?;
    let before = lock_live_row(&mut *tx, "installments", &path.id).await?;
    let contract = get_live_row(&mut *tx, "contracts", &value_str(&before, "contract_id")).await?;
    if value_str(&contract, "status") != "active" {
        return Err(AppError::Conflict(
            "Installments of a cancelled contract cannot be paid.".to_string(),
        ));
    }

    let remaining = remaining_balance(&before);
    let amount = resolve_payment_amount(payload.amount, remaining)?;
    let customer = get_live_row(&mut *tx, "customers", &value_str(&contract, "customer_id"))
        .await
        .ok();

    let mut draft = VoucherDraft::new(
        VoucherKind::Receipt,
        &payload.safe_id,
        amount,
        paid_on,
        &user_id,
    );
    draft.description = Some(format!(
        "Installment #{} of contract {}",
        before.get("sequence").and_then(Value::as_i64).unwrap_or_default(),
        value_str(&contract, "code")
    ));
    draft.party_name = customer.as_ref().map(|row| value_str(row, "full_name"));
    draft.contract_id = Some(value_str(&contract, "id"));
    draft.installment_id = Some(path.id.clone());
    draft.unit_id = Some(value_str(&before, "unit_id"));
    let voucher = record_voucher(&mut *tx, draft).await?;

    let total = value_number(&before, "amount");
    let paid_amount = round2(value_number(&before, "paid_amount") + amount);
    let status = installment_status_for(total, paid_amount, value_date(&before, "due_date"), today);

    let mut patch = Map::new();
    patch.insert("paid_amount".to_string(), json!(paid_amount));
    patch.insert("status".to_string(), Value::String(status.to_string()));
    patch.insert("paid_at".to_string(), Value::String(paid_at));
    if let Some(notes) = non_empty_opt(payload.notes.as_deref()) {
        patch.insert("notes".to_string(), Value::String(notes));
    }
    let updated = update_row(&mut *tx, "installments", &path.id, &patch).await?;
    tx.commit().await.map_err(map_db_error)?;
    state.report_cache.invalidate_all();

    tracing::info!(
        installment_id = %path.id,
        amount,
        status,
        "Installment payment recorded"
    );
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "pay",
        "installments",
        Some(&path.id),
        Some(before),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(json!({
        "installment": updated,
        "voucher": voucher,
        "remaining": round2(total - paid_amount),
    })))
}

async fn refresh_overdue(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, FINANCE_ROLES).await?;
    let pool = db_pool(&state)?;

    let today = state.config.business_today();
    let updated = mark_overdue_installments(pool, today).await?;
    if updated > 0 {
        state.report_cache.invalidate_all();
    }
    Ok(Json(json!({ "updated": updated, "as_of": today.to_string() })))
}

fn remaining_balance(installment: &Value) -> f64 {
    round2(value_number(installment, "amount") - value_number(installment, "paid_amount"))
}

/// Payment defaults to the full remaining balance and may never exceed it.
fn resolve_payment_amount(requested: Option<f64>, remaining: f64) -> AppResult<f64> {
    if remaining <= 0.0 {
        return Err(AppError::Conflict("Installment is already paid.".to_string()));
    }
    let amount = round2(requested.unwrap_or(remaining));
    if amount <= 0.0 {
        return Err(AppError::BadRequest(
            "amount must be greater than zero.".to_string(),
        ));
    }
    if amount > remaining + 0.005 {
        return Err(AppError::BadRequest(format!(
            "amount {amount:.2} exceeds the remaining balance {remaining:.2}."
        )));
    }
    Ok(amount.min(remaining))
}

fn parse_status_list(raw: &str) -> AppResult<Value> {
    let mut statuses = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        if !INSTALLMENT_STATUSES.contains(&part) {
            return Err(AppError::BadRequest(format!(
                "Unknown installment status '{part}'."
            )));
        }
        statuses.push(Value::String(part.to_string()));
    }
    Ok(Value::Array(statuses))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_status_list, remaining_balance, resolve_payment_amount};
    use crate::error::AppError;

    #[test]
    fn payment_defaults_to_remaining_balance() {
        assert_eq!(resolve_payment_amount(None, 1250.5).ok(), Some(1250.5));
        assert_eq!(resolve_payment_amount(Some(200.0), 1250.5).ok(), Some(200.0));
    }

    #[test]
    fn rejects_overpayment_and_settled_installments() {
        assert!(matches!(
            resolve_payment_amount(Some(1250.51), 1250.5),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            resolve_payment_amount(None, 0.0),
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            resolve_payment_amount(Some(0.001), 10.0),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn remaining_balance_uses_paid_amount() {
        let row = json!({"amount": 1000.0, "paid_amount": 333.33});
        assert_eq!(remaining_balance(&row), 666.67);
    }

    #[test]
    fn status_filter_accepts_comma_lists() {
        assert_eq!(
            parse_status_list("pending, overdue").expect("valid"),
            json!(["pending", "overdue"])
        );
        assert!(parse_status_list("late").is_err());
    }
}
