use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::{NaiveDate, Utc};
use serde_json::{json, Map, Value};
use sqlx::PgConnection;

use crate::{
    access::{assert_active_user, assert_role, ADMIN_ONLY, SALES_ROLES},
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{
        create_row, create_rows, get_live_row, list_rows, live_filters, lock_live_row,
        map_db_error, soft_delete_row, update_row,
    },
    schemas::{
        clamp_limit, remove_nulls, serialize_to_map, validate_input, CancelContractInput,
        ContractsQuery, CreateContractInput, IdPath, UpdateContractInput,
    },
    services::{
        audit::write_audit_log,
        ledger::{record_voucher, VoucherDraft, VoucherKind},
        overdue::installment_status_for,
        reports::{contract_balances, empty_contract_balance},
        schedule::{financed_amount, generate_schedule, ScheduleInput, ScheduledInstallment},
    },
    state::{db_pool, AppState},
    values::{json_map, non_empty_opt, parse_date, round2, value_str},
};

const CONTRACT_STATUSES: &[&str] = &["active", "cancelled"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/contracts",
            axum::routing::get(list_contracts).post(create_contract),
        )
        .route(
            "/contracts/{id}",
            axum::routing::get(get_contract)
                .patch(update_contract)
                .delete(delete_contract),
        )
        .route(
            "/contracts/{id}/cancel",
            axum::routing::post(cancel_contract),
        )
}

async fn list_contracts(
    State(state): State<AppState>,
    Query(query): Query<ContractsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = live_filters();
    for (key, value) in [
        ("customer_id", &query.customer_id),
        ("unit_id", &query.unit_id),
        ("broker_id", &query.broker_id),
    ] {
        if let Some(id) = non_empty_opt(value.as_deref()) {
            filters.insert(key.to_string(), Value::String(id));
        }
    }
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        if !CONTRACT_STATUSES.contains(&status.as_str()) {
            return Err(AppError::BadRequest(format!(
                "Unknown contract status '{status}'."
            )));
        }
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(from) = non_empty_opt(query.from_date.as_deref()) {
        let from = parse_date(&from)?;
        filters.insert("contract_date__gte".to_string(), Value::String(from.to_string()));
    }
    if let Some(to) = non_empty_opt(query.to_date.as_deref()) {
        let to = parse_date(&to)?;
        filters.insert("contract_date__lte".to_string(), Value::String(to.to_string()));
    }

    let rows = list_rows(
        pool,
        "contracts",
        Some(&filters),
        clamp_limit(query.limit),
        query.offset,
        "contract_date",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_contract(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateContractInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, SALES_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let today = state.config.business_today();
    let contract_date = match non_empty_opt(payload.contract_date.as_deref()) {
        Some(raw) => parse_date(&raw)?,
        None => today,
    };
    let net_price = round2(payload.total_price - payload.discount_amount);
    let schedule_input = ScheduleInput {
        contract_date,
        payment_type: payload.payment_type,
        net_price,
        down_payment: payload.down_payment,
        installment_count: payload.installment_count,
        frequency: payload.installment_frequency,
        annual_payment_count: payload.annual_payment_count,
        annual_payment_amount: payload.annual_payment_amount,
        maintenance_deposit: payload.maintenance_deposit,
    };
    let schedule = generate_schedule(&schedule_input)?;

    let broker_id = non_empty_opt(payload.broker_id.as_deref());
    let commission = broker_commission(net_price, payload.broker_percent, payload.broker_amount);
    if broker_id.is_none() && commission > 0.0 {
        return Err(AppError::BadRequest(
            "broker_percent or broker_amount requires broker_id.".to_string(),
        ));
    }
    let safe_id = non_empty_opt(payload.safe_id.as_deref());

    let mut tx = pool.begin().await.map_err(map_db_error)?;

    let unit = lock_live_row(&mut *tx, "units", &payload.unit_id).await?;
    if value_str(&unit, "status") == "sold" {
        return Err(AppError::Conflict(format!(
            "Unit '{}' is already sold.",
            value_str(&unit, "code")
        )));
    }
    let customer = get_live_row(&mut *tx, "customers", &payload.customer_id).await?;
    if let Some(broker_id) = broker_id.as_deref() {
        get_live_row(&mut *tx, "brokers", broker_id).await?;
    }

    let contract_id = uuid::Uuid::new_v4().to_string();
    let code = non_empty_opt(payload.code.as_deref())
        .unwrap_or_else(|| generated_contract_code(contract_date, &contract_id));

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.remove("safe_id");
    record.insert("id".to_string(), Value::String(contract_id.clone()));
    record.insert("code".to_string(), Value::String(code.clone()));
    record.insert(
        "contract_date".to_string(),
        Value::String(contract_date.to_string()),
    );
    record.insert("broker_amount".to_string(), json!(commission));
    record.insert("status".to_string(), Value::String("active".to_string()));
    record.insert("created_by_user_id".to_string(), Value::String(user_id.clone()));
    let contract = create_row(&mut *tx, "contracts", &record).await?;

    let unit_id = value_str(&unit, "id");
    let installment_records = installment_records(&contract_id, &unit_id, &schedule, today);
    let mut installments = create_rows(&mut *tx, "installments", &installment_records).await?;
    installments.sort_by_key(|row| row.get("sequence").and_then(Value::as_i64).unwrap_or(0));

    update_row(
        &mut *tx,
        "units",
        &unit_id,
        &json_map(&[("status", Value::String("sold".to_string()))]),
    )
    .await?;

    let broker_due = match broker_id.as_deref() {
        Some(broker_id) if commission > 0.0 => Some(
            create_row(
                &mut *tx,
                "broker_dues",
                &json_map(&[
                    ("broker_id", Value::String(broker_id.to_string())),
                    ("contract_id", Value::String(contract_id.clone())),
                    ("amount", json!(commission)),
                    ("due_date", Value::String(contract_date.to_string())),
                ]),
            )
            .await?,
        ),
        _ => None,
    };

    let down_payment_voucher = match safe_id.as_deref() {
        Some(safe_id) if round2(payload.down_payment) > 0.0 => {
            let mut draft = VoucherDraft::new(
                VoucherKind::Receipt,
                safe_id,
                payload.down_payment,
                contract_date,
                &user_id,
            );
            draft.description = Some(format!("Down payment for contract {code}"));
            draft.party_name = Some(value_str(&customer, "full_name"));
            draft.contract_id = Some(contract_id.clone());
            draft.unit_id = Some(unit_id.clone());
            Some(record_voucher(&mut *tx, draft).await?)
        }
        _ => None,
    };

    tx.commit().await.map_err(map_db_error)?;
    state.report_cache.invalidate_all();

    tracing::info!(
        contract_id = %contract_id,
        unit_id = %unit_id,
        installments = installments.len(),
        financed = financed_amount(&schedule_input).unwrap_or_default(),
        "Contract created"
    );
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "create",
        "contracts",
        Some(&contract_id),
        None,
        Some(contract.clone()),
    )
    .await;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(json!({
            "contract": contract,
            "installments": installments,
            "broker_due": broker_due,
            "down_payment_voucher": down_payment_voucher,
        })),
    ))
}

async fn get_contract(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let contract = get_live_row(pool, "contracts", &path.id).await?;
    let by_contract = json_map(&[("contract_id", Value::String(path.id.clone()))]);
    let installments = list_rows(
        pool,
        "installments",
        Some(&by_contract),
        1000,
        0,
        "sequence",
        true,
    )
    .await?;
    let broker_dues =
        list_rows(pool, "broker_dues", Some(&by_contract), 50, 0, "created_at", true).await?;
    let customer = get_live_row(pool, "customers", &value_str(&contract, "customer_id"))
        .await
        .ok();
    let unit = get_live_row(pool, "units", &value_str(&contract, "unit_id"))
        .await
        .ok();

    let balance = match uuid::Uuid::parse_str(&path.id) {
        Ok(id) => contract_balances(pool, &[id], state.config.business_today())
            .await?
            .remove(&path.id)
            .unwrap_or_else(empty_contract_balance),
        Err(_) => empty_contract_balance(),
    };

    Ok(Json(json!({
        "contract": contract,
        "customer": customer,
        "unit": unit,
        "installments": installments,
        "broker_dues": broker_dues,
        "balance": balance,
    })))
}

async fn update_contract(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateContractInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, SALES_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let before = get_live_row(pool, "contracts", &path.id).await?;
    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "contracts", &path.id, &patch).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "update",
        "contracts",
        Some(&path.id),
        Some(before),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

async fn cancel_contract(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
    payload: Option<Json<CancelContractInput>>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, SALES_ROLES).await?;
    let pool = db_pool(&state)?;
    let payload = payload.map(|Json(inner)| inner).unwrap_or_default();

    let mut tx = pool.begin().await.map_err(map_db_error)?;
    let before = lock_live_row(&mut *tx, "contracts", &path.id).await?;
    if value_str(&before, "status") == "cancelled" {
        return Err(AppError::Conflict("Contract is already cancelled.".to_string()));
    }
    let outcome = cancel_in_tx(&mut *tx, &before, payload.notes.as_deref()).await?;
    tx.commit().await.map_err(map_db_error)?;
    state.report_cache.invalidate_all();

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "cancel",
        "contracts",
        Some(&path.id),
        Some(before),
        Some(outcome.contract.clone()),
    )
    .await;
    Ok(Json(json!({
        "contract": outcome.contract,
        "removed_installments": outcome.removed_installments,
        "closed_installments": outcome.closed_installments,
        "removed_broker_dues": outcome.removed_broker_dues,
    })))
}

async fn delete_contract(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, ADMIN_ONLY).await?;
    let pool = db_pool(&state)?;

    let mut tx = pool.begin().await.map_err(map_db_error)?;
    let before = lock_live_row(&mut *tx, "contracts", &path.id).await?;
    if value_str(&before, "status") == "active" {
        cancel_in_tx(&mut *tx, &before, Some("Contract deleted")).await?;
    }
    let deleted = soft_delete_row(&mut *tx, "contracts", &path.id).await?;
    tx.commit().await.map_err(map_db_error)?;
    state.report_cache.invalidate_all();

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "delete",
        "contracts",
        Some(&path.id),
        Some(before),
        None,
    )
    .await;
    Ok(Json(deleted))
}

struct CancelOutcome {
    contract: Value,
    removed_installments: u64,
    closed_installments: u64,
    removed_broker_dues: u64,
}

/// Cancel an active contract inside the caller's transaction: unpaid
/// installments are dropped, partially paid ones are closed at the amount
/// received, pending broker dues are removed and the unit is released.
async fn cancel_in_tx(
    conn: &mut PgConnection,
    contract: &Value,
    notes: Option<&str>,
) -> AppResult<CancelOutcome> {
    let contract_id = value_str(contract, "id");
    let unit_id = value_str(contract, "unit_id");

    let removed_installments = sqlx::query(
        "DELETE FROM installments WHERE contract_id = $1::uuid AND paid_amount = 0",
    )
    .bind(&contract_id)
    .execute(&mut *conn)
    .await
    .map_err(map_db_error)?
    .rows_affected();

    let closed_installments = sqlx::query(
        "UPDATE installments
         SET amount = paid_amount, status = 'paid'
         WHERE contract_id = $1::uuid AND paid_amount > 0 AND status <> 'paid'",
    )
    .bind(&contract_id)
    .execute(&mut *conn)
    .await
    .map_err(map_db_error)?
    .rows_affected();

    // Reversed vouchers may still point at a pending due.
    sqlx::query(
        "UPDATE vouchers SET broker_due_id = NULL
         WHERE broker_due_id IN (
            SELECT id FROM broker_dues WHERE contract_id = $1::uuid AND status = 'pending'
         )",
    )
    .bind(&contract_id)
    .execute(&mut *conn)
    .await
    .map_err(map_db_error)?;
    let removed_broker_dues = sqlx::query(
        "DELETE FROM broker_dues WHERE contract_id = $1::uuid AND status = 'pending'",
    )
    .bind(&contract_id)
    .execute(&mut *conn)
    .await
    .map_err(map_db_error)?
    .rows_affected();

    let unit = lock_live_row(&mut *conn, "units", &unit_id).await;
    match unit {
        Ok(unit) if value_str(&unit, "status") == "sold" => {
            update_row(
                &mut *conn,
                "units",
                &unit_id,
                &json_map(&[("status", Value::String("available".to_string()))]),
            )
            .await?;
        }
        Ok(_) | Err(AppError::NotFound(_)) => {}
        Err(error) => return Err(error),
    }

    let mut patch = Map::new();
    patch.insert("status".to_string(), Value::String("cancelled".to_string()));
    patch.insert(
        "cancelled_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    if let Some(note) = non_empty_opt(notes) {
        patch.insert(
            "notes".to_string(),
            Value::String(append_note(&value_str(contract, "notes"), &note)),
        );
    }
    let updated = update_row(&mut *conn, "contracts", &contract_id, &patch).await?;

    tracing::info!(
        contract_id = %contract_id,
        removed_installments,
        closed_installments,
        removed_broker_dues,
        "Contract cancelled"
    );
    Ok(CancelOutcome {
        contract: updated,
        removed_installments,
        closed_installments,
        removed_broker_dues,
    })
}

/// Flat amount wins over the percentage.
fn broker_commission(net_price: f64, percent: f64, amount: f64) -> f64 {
    if round2(amount) > 0.0 {
        return round2(amount);
    }
    if percent > 0.0 {
        return round2(net_price * percent / 100.0);
    }
    0.0
}

fn generated_contract_code(contract_date: NaiveDate, contract_id: &str) -> String {
    let suffix = contract_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(6)
        .collect::<String>()
        .to_ascii_uppercase();
    format!("CT-{}-{suffix}", contract_date.format("%Y%m%d"))
}

fn installment_records(
    contract_id: &str,
    unit_id: &str,
    schedule: &[ScheduledInstallment],
    today: NaiveDate,
) -> Vec<Map<String, Value>> {
    schedule
        .iter()
        .map(|item| {
            json_map(&[
                ("contract_id", Value::String(contract_id.to_string())),
                ("unit_id", Value::String(unit_id.to_string())),
                ("sequence", json!(item.sequence)),
                ("kind", Value::String(item.kind.as_str().to_string())),
                ("amount", json!(item.amount)),
                ("paid_amount", json!(0.0)),
                ("due_date", Value::String(item.due_date.to_string())),
                (
                    "status",
                    Value::String(
                        installment_status_for(item.amount, 0.0, Some(item.due_date), today)
                            .to_string(),
                    ),
                ),
            ])
        })
        .collect()
}

fn append_note(existing: &str, note: &str) -> String {
    if existing.trim().is_empty() {
        note.trim().to_string()
    } else {
        format!("{}\n{}", existing.trim_end(), note.trim())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::{append_note, broker_commission, generated_contract_code, installment_records};
    use crate::services::schedule::{InstallmentKind, ScheduledInstallment};

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    #[test]
    fn flat_broker_amount_wins_over_percent() {
        assert_eq!(broker_commission(1_000_000.0, 2.5, 0.0), 25_000.0);
        assert_eq!(broker_commission(1_000_000.0, 2.5, 10_000.0), 10_000.0);
        assert_eq!(broker_commission(1_000_000.0, 0.0, 0.0), 0.0);
        assert_eq!(broker_commission(333_333.33, 1.5, 0.0), 5000.0);
    }

    #[test]
    fn generated_codes_embed_date_and_id_prefix() {
        let code = generated_contract_code(
            date("2026-04-09"),
            "9f1c2b3a-0000-4000-8000-000000000000",
        );
        assert_eq!(code, "CT-20260409-9F1C2B");
    }

    #[test]
    fn backdated_installments_start_overdue() {
        let schedule = vec![
            ScheduledInstallment {
                sequence: 1,
                kind: InstallmentKind::Regular,
                amount: 1000.0,
                due_date: date("2026-01-01"),
            },
            ScheduledInstallment {
                sequence: 2,
                kind: InstallmentKind::Maintenance,
                amount: 500.0,
                due_date: date("2026-12-01"),
            },
        ];
        let records = installment_records("c-1", "u-1", &schedule, date("2026-06-01"));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["status"], json!("overdue"));
        assert_eq!(records[1]["status"], json!("pending"));
        assert_eq!(records[1]["kind"], json!("maintenance"));
        assert_eq!(records[0].len(), records[1].len());
    }

    #[test]
    fn cancellation_note_is_appended() {
        assert_eq!(append_note("", " customer withdrew "), "customer withdrew");
        assert_eq!(
            append_note("signed at office", "refund pending"),
            "signed at office\nrefund pending"
        );
    }
}
