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
        clamp_limit, remove_nulls, serialize_to_map, validate_input, CreateCustomerInput, IdPath,
        NameSearchQuery, UpdateCustomerInput,
    },
    services::{
        audit::write_audit_log,
        reports::{contract_balances, empty_contract_balance},
    },
    state::{db_pool, AppState},
    values::{non_empty_opt, round2, value_number, value_str},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/customers",
            axum::routing::get(list_customers).post(create_customer),
        )
        .route(
            "/customers/{id}",
            axum::routing::get(get_customer)
                .patch(update_customer)
                .delete(delete_customer),
        )
        .route(
            "/customers/{id}/statement",
            axum::routing::get(customer_statement),
        )
}

async fn list_customers(
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
        "customers",
        Some(&filters),
        clamp_limit(query.limit),
        query.offset,
        "full_name",
        true,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_customer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateCustomerInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, SALES_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("created_by_user_id".to_string(), Value::String(user_id.clone()));
    let created = create_row(pool, "customers", &record).await?;
    state.report_cache.invalidate_all();
    let entity_id = value_str(&created, "id");

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "create",
        "customers",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_customer(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;
    Ok(Json(get_live_row(pool, "customers", &path.id).await?))
}

async fn update_customer(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateCustomerInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, SALES_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let before = get_live_row(pool, "customers", &path.id).await?;
    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "customers", &path.id, &patch).await?;
    state.report_cache.invalidate_all();

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "update",
        "customers",
        Some(&path.id),
        Some(before),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

async fn delete_customer(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, ADMIN_ONLY).await?;
    let pool = db_pool(&state)?;

    let mut filters = live_filters();
    filters.insert("customer_id".to_string(), Value::String(path.id.clone()));
    filters.insert("status".to_string(), Value::String("active".to_string()));
    if count_rows(pool, "contracts", Some(&filters)).await? > 0 {
        return Err(AppError::Conflict(
            "Customer has active contracts and cannot be deleted.".to_string(),
        ));
    }

    let deleted = soft_delete_row(pool, "customers", &path.id).await?;
    state.report_cache.invalidate_all();
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "delete",
        "customers",
        Some(&path.id),
        Some(deleted.clone()),
        None,
    )
    .await;
    Ok(Json(deleted))
}

async fn customer_statement(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let customer = get_live_row(pool, "customers", &path.id).await?;

    let mut filters = live_filters();
    filters.insert("customer_id".to_string(), Value::String(path.id.clone()));
    let contracts = list_rows(pool, "contracts", Some(&filters), 500, 0, "contract_date", true).await?;

    let contract_ids = contracts
        .iter()
        .filter_map(|contract| uuid::Uuid::parse_str(&value_str(contract, "id")).ok())
        .collect::<Vec<_>>();
    let today = state.config.business_today();
    let balances = contract_balances(pool, &contract_ids, today).await?;

    let unit_ids = contracts
        .iter()
        .map(|contract| Value::String(value_str(contract, "unit_id")))
        .collect::<Vec<_>>();
    let mut unit_filters = serde_json::Map::new();
    unit_filters.insert("id__in".to_string(), Value::Array(unit_ids));
    let units = list_rows(pool, "units", Some(&unit_filters), 500, 0, "code", true).await?;
    let unit_codes = units
        .iter()
        .map(|unit| (value_str(unit, "id"), value_str(unit, "code")))
        .collect::<HashMap<_, _>>();

    let mut totals = StatementTotals::default();
    let entries = contracts
        .into_iter()
        .map(|contract| {
            let contract_id = value_str(&contract, "id");
            let balance = balances
                .get(&contract_id)
                .cloned()
                .unwrap_or_else(empty_contract_balance);
            totals.add(&contract, &balance);
            json!({
                "contract": contract,
                "unit_code": unit_codes.get(&value_str(&contract, "unit_id")),
                "balance": balance,
            })
        })
        .collect::<Vec<_>>();

    Ok(Json(json!({
        "customer": customer,
        "as_of": today.to_string(),
        "contracts": entries,
        "totals": totals.as_json(),
    })))
}

#[derive(Debug, Default)]
struct StatementTotals {
    net_price: f64,
    installments_total: f64,
    paid: f64,
    overdue: f64,
}

impl StatementTotals {
    fn add(&mut self, contract: &Value, balance: &Value) {
        if value_str(contract, "status") == "active" {
            self.net_price +=
                value_number(contract, "total_price") - value_number(contract, "discount_amount");
        }
        self.installments_total += value_number(balance, "installments_total");
        self.paid += value_number(balance, "paid");
        self.overdue += value_number(balance, "overdue");
    }

    fn as_json(&self) -> Value {
        json!({
            "net_price": round2(self.net_price),
            "installments_total": round2(self.installments_total),
            "paid": round2(self.paid),
            "remaining": round2(self.installments_total - self.paid),
            "overdue": round2(self.overdue),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::StatementTotals;

    #[test]
    fn statement_totals_skip_cancelled_contract_value() {
        let mut totals = StatementTotals::default();
        totals.add(
            &json!({"status": "active", "total_price": 1_000_000.0, "discount_amount": 50_000.0}),
            &json!({"installments_total": 800_000.0, "paid": 200_000.0, "overdue": 25_000.0}),
        );
        totals.add(
            &json!({"status": "cancelled", "total_price": 500_000.0, "discount_amount": 0.0}),
            &json!({"installments_total": 10_000.0, "paid": 10_000.0, "overdue": 0.0}),
        );

        let summary = totals.as_json();
        assert_eq!(summary["net_price"], json!(950_000.0));
        assert_eq!(summary["paid"], json!(210_000.0));
        assert_eq!(summary["remaining"], json!(600_000.0));
        assert_eq!(summary["overdue"], json!(25_000.0));
    }
}
