use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};
use sqlx::PgConnection;

use crate::{
    access::{assert_active_user, assert_role, FINANCE_ROLES},
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{
        get_live_row, list_rows, live_filters, lock_live_row, map_db_error, soft_delete_row,
        update_row,
    },
    schemas::{clamp_limit, validate_input, CreateVoucherInput, IdPath, VouchersQuery},
    services::{
        audit::write_audit_log,
        ledger::{record_voucher, reverse_voucher, VoucherDraft, VoucherKind},
        overdue::installment_status_for,
    },
    state::{db_pool, AppState},
    values::{
        non_empty_opt, parse_date, round2, value_date, value_number, value_opt_str, value_str,
    },
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/vouchers",
            axum::routing::get(list_vouchers).post(create_voucher),
        )
        .route(
            "/vouchers/{id}",
            axum::routing::get(get_voucher).delete(delete_voucher),
        )
}

async fn list_vouchers(
    State(state): State<AppState>,
    Query(query): Query<VouchersQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = live_filters();
    if let Some(kind) = non_empty_opt(query.kind.as_deref()) {
        let kind = VoucherKind::parse(&kind).ok_or_else(|| {
            AppError::BadRequest(format!("Unknown voucher kind '{kind}'."))
        })?;
        filters.insert("kind".to_string(), Value::String(kind.as_str().to_string()));
    }
    if let Some(safe_id) = non_empty_opt(query.safe_id.as_deref()) {
        filters.insert("safe_id".to_string(), Value::String(safe_id));
    }
    if let Some(contract_id) = non_empty_opt(query.contract_id.as_deref()) {
        filters.insert("contract_id".to_string(), Value::String(contract_id));
    }
    if let Some(from_date) = non_empty_opt(query.from_date.as_deref()) {
        let from_date = parse_date(&from_date)?;
        filters.insert(
            "voucher_date__gte".to_string(),
            Value::String(from_date.to_string()),
        );
    }
    if let Some(to_date) = non_empty_opt(query.to_date.as_deref()) {
        let to_date = parse_date(&to_date)?;
        filters.insert(
            "voucher_date__lte".to_string(),
            Value::String(to_date.to_string()),
        );
    }

    let rows = list_rows(
        pool,
        "vouchers",
        Some(&filters),
        clamp_limit(query.limit),
        query.offset,
        "voucher_date",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_voucher(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateVoucherInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, FINANCE_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let voucher_date = match non_empty_opt(payload.voucher_date.as_deref()) {
        Some(raw) => parse_date(&raw)?,
        None => state.config.business_today(),
    };

    let mut tx = pool.begin().await.map_err(map_db_error)?;
    let mut unit_id = non_empty_opt(payload.unit_id.as_deref());
    let contract_id = non_empty_opt(payload.contract_id.as_deref());
    if let Some(contract_id) = contract_id.as_deref() {
        let contract = get_live_row(&mut *tx, "contracts", contract_id).await?;
        let contract_unit = value_str(&contract, "unit_id");
        if let Some(requested) = unit_id.as_deref() {
            if requested != contract_unit {
                return Err(AppError::BadRequest(
                    "unit_id does not match the contract's unit.".to_string(),
                ));
            }
        }
        unit_id = Some(contract_unit);
    } else if let Some(requested) = unit_id.as_deref() {
        get_live_row(&mut *tx, "units", requested).await?;
    }

    let mut draft = VoucherDraft::new(
        payload.kind,
        payload.safe_id.trim(),
        payload.amount,
        voucher_date,
        &user_id,
    );
    draft.description = payload.description;
    draft.party_name = payload.party_name;
    draft.contract_id = contract_id;
    draft.unit_id = unit_id;
    let created = record_voucher(&mut *tx, draft).await?;
    tx.commit().await.map_err(map_db_error)?;
    state.report_cache.invalidate_all();

    let entity_id = value_str(&created, "id");
    tracing::info!(
        voucher_id = %entity_id,
        kind = payload.kind.as_str(),
        amount = payload.amount,
        "Voucher recorded"
    );
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "create",
        "vouchers",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_voucher(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;
    Ok(Json(get_live_row(pool, "vouchers", &path.id).await?))
}

/// Deleting a voucher reverses its safe movement and unwinds whatever
/// installment or broker due it settled.
async fn delete_voucher(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, FINANCE_ROLES).await?;
    let pool = db_pool(&state)?;

    let today = state.config.business_today();
    let mut tx = pool.begin().await.map_err(map_db_error)?;
    let before = lock_live_row(&mut *tx, "vouchers", &path.id).await?;
    if let Some(contract_id) = value_opt_str(&before, "contract_id") {
        let status = lock_contract_status(&mut *tx, &contract_id).await?;
        ensure_reversible(&before, status.as_deref())?;
    }

    let safe = reverse_voucher(&mut *tx, &before).await?;
    if let Some(installment_id) = value_opt_str(&before, "installment_id") {
        unwind_installment_payment(
            &mut *tx,
            &installment_id,
            value_number(&before, "amount"),
            today,
        )
        .await?;
    }
    if let Some(broker_due_id) = value_opt_str(&before, "broker_due_id") {
        reopen_broker_due(&mut *tx, &broker_due_id, &path.id).await?;
    }
    let deleted = soft_delete_row(&mut *tx, "vouchers", &path.id).await?;
    tx.commit().await.map_err(map_db_error)?;
    state.report_cache.invalidate_all();

    tracing::info!(
        voucher_id = %path.id,
        safe_balance = value_number(&safe, "balance"),
        "Voucher reversed"
    );
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "delete",
        "vouchers",
        Some(&path.id),
        Some(before),
        None,
    )
    .await;
    Ok(Json(json!({ "voucher": deleted, "safe": safe })))
}

async fn unwind_installment_payment(
    conn: &mut PgConnection,
    installment_id: &str,
    amount: f64,
    today: chrono::NaiveDate,
) -> AppResult<()> {
    // Installments of a cancelled contract may already be gone.
    let installment = match lock_live_row(&mut *conn, "installments", installment_id).await {
        Ok(row) => row,
        Err(AppError::NotFound(_)) => return Ok(()),
        Err(error) => return Err(error),
    };
    let total = value_number(&installment, "amount");
    let paid_amount = unwound_paid_amount(value_number(&installment, "paid_amount"), amount);
    let status = installment_status_for(
        total,
        paid_amount,
        value_date(&installment, "due_date"),
        today,
    );

    let mut patch = Map::new();
    patch.insert("paid_amount".to_string(), json!(paid_amount));
    patch.insert("status".to_string(), Value::String(status.to_string()));
    if status != "paid" {
        patch.insert("paid_at".to_string(), Value::Null);
    }
    update_row(&mut *conn, "installments", installment_id, &patch).await?;
    Ok(())
}

async fn reopen_broker_due(
    conn: &mut PgConnection,
    broker_due_id: &str,
    voucher_id: &str,
) -> AppResult<()> {
    let due = match lock_live_row(&mut *conn, "broker_dues", broker_due_id).await {
        Ok(row) => row,
        Err(AppError::NotFound(_)) => return Ok(()),
        Err(error) => return Err(error),
    };
    if value_opt_str(&due, "voucher_id").as_deref() != Some(voucher_id) {
        return Ok(());
    }
    let mut patch = Map::new();
    patch.insert("status".to_string(), Value::String("pending".to_string()));
    patch.insert("paid_at".to_string(), Value::Null);
    patch.insert("voucher_id".to_string(), Value::Null);
    update_row(&mut *conn, "broker_dues", broker_due_id, &patch).await?;
    Ok(())
}

/// Status of the voucher's contract, locked so a concurrent cancellation waits.
/// Soft-deleted contracts are included.
async fn lock_contract_status(
    conn: &mut PgConnection,
    contract_id: &str,
) -> AppResult<Option<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT status::text FROM contracts WHERE id = $1::uuid FOR UPDATE",
    )
    .bind(contract_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(map_db_error)
}

/// A cancelled contract's installments and broker dues are closed at what was
/// settled, so the vouchers that settled them stay.
fn ensure_reversible(voucher: &Value, contract_status: Option<&str>) -> AppResult<()> {
    let settles_schedule = value_opt_str(voucher, "installment_id").is_some()
        || value_opt_str(voucher, "broker_due_id").is_some();
    if settles_schedule && contract_status == Some("cancelled") {
        return Err(AppError::Conflict(
            "Vouchers settling a cancelled contract cannot be deleted.".to_string(),
        ));
    }
    Ok(())
}

fn unwound_paid_amount(paid_amount: f64, voucher_amount: f64) -> f64 {
    round2(paid_amount - voucher_amount).max(0.0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ensure_reversible, unwound_paid_amount};
    use crate::error::AppError;

    #[test]
    fn unwinding_never_goes_negative() {
        assert_eq!(unwound_paid_amount(500.0, 200.0), 300.0);
        assert_eq!(unwound_paid_amount(500.0, 500.0), 0.0);
        assert_eq!(unwound_paid_amount(100.0, 150.0), 0.0);
    }

    #[test]
    fn settling_vouchers_of_cancelled_contracts_stay() {
        let receipt = json!({ "id": "v1", "contract_id": "c1", "installment_id": "i1" });
        assert!(matches!(
            ensure_reversible(&receipt, Some("cancelled")),
            Err(AppError::Conflict(_))
        ));
        assert!(ensure_reversible(&receipt, Some("active")).is_ok());

        let commission = json!({ "id": "v2", "contract_id": "c1", "broker_due_id": "d1" });
        assert!(ensure_reversible(&commission, Some("cancelled")).is_err());

        let manual = json!({ "id": "v3", "contract_id": "c1", "installment_id": null });
        assert!(ensure_reversible(&manual, Some("cancelled")).is_ok());
        assert!(ensure_reversible(&manual, None).is_ok());
    }
}
