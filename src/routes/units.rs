use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    access::{assert_active_user, assert_role, ADMIN_ONLY, SALES_ROLES},
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{
        count_rows, create_row, delete_row, get_live_row, list_rows, live_filters, lock_live_row,
        map_db_error, soft_delete_row, update_row,
    },
    schemas::{
        clamp_limit, remove_nulls, serialize_to_map, validate_input, CreateUnitInput, IdPath,
        UnitPartnerInput, UnitPartnerPath, UnitsQuery, UpdateUnitInput,
    },
    services::audit::write_audit_log,
    state::{db_pool, AppState},
    values::{json_map, non_empty_opt, round2, value_number, value_str},
};

const UNIT_STATUSES: &[&str] = &["available", "reserved", "sold"];
/// Statuses that can be set directly. `sold` is owned by contract creation.
const MANUAL_UNIT_STATUSES: &[&str] = &["available", "reserved"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/units", axum::routing::get(list_units).post(create_unit))
        .route(
            "/units/{id}",
            axum::routing::get(get_unit)
                .patch(update_unit)
                .delete(delete_unit),
        )
        .route(
            "/units/{id}/partners",
            axum::routing::get(list_unit_partners).post(attach_unit_partner),
        )
        .route(
            "/units/{id}/partners/{partner_id}",
            axum::routing::delete(detach_unit_partner),
        )
}

async fn list_units(
    State(state): State<AppState>,
    Query(query): Query<UnitsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = live_filters();
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(parse_status(&status)?.to_string()));
    }
    if let Some(unit_type) = non_empty_opt(query.unit_type.as_deref()) {
        filters.insert("unit_type".to_string(), Value::String(unit_type));
    }
    if let Some(building) = non_empty_opt(query.building.as_deref()) {
        filters.insert("building".to_string(), Value::String(building));
    }
    if let Some(q) = non_empty_opt(query.q.as_deref()) {
        filters.insert("code__ilike".to_string(), Value::String(format!("%{q}%")));
    }

    let rows = list_rows(
        pool,
        "units",
        Some(&filters),
        clamp_limit(query.limit),
        query.offset,
        "code",
        true,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_unit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateUnitInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, SALES_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    ensure_manual_status(&payload.status)?;
    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("code".to_string(), Value::String(payload.code.trim().to_string()));
    let created = create_row(pool, "units", &record).await?;
    let entity_id = value_str(&created, "id");
    state.report_cache.invalidate_all();

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "create",
        "units",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_unit(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut unit = get_live_row(pool, "units", &path.id).await?;
    let partners = unit_partner_rows(pool, &path.id).await?;
    if let Some(obj) = unit.as_object_mut() {
        obj.insert("partners".to_string(), Value::Array(partners));
    }
    Ok(Json(unit))
}

async fn update_unit(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateUnitInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, SALES_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let mut tx = pool.begin().await.map_err(map_db_error)?;
    // Contract creation locks the same row before marking the unit sold.
    let before = lock_live_row(&mut *tx, "units", &path.id).await?;
    ensure_status_change_allowed(&before, payload.status.as_deref())?;

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(&mut *tx, "units", &path.id, &patch).await?;
    tx.commit().await.map_err(map_db_error)?;
    state.report_cache.invalidate_all();

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "update",
        "units",
        Some(&path.id),
        Some(before),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

async fn delete_unit(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, ADMIN_ONLY).await?;
    let pool = db_pool(&state)?;

    let mut tx = pool.begin().await.map_err(map_db_error)?;
    let unit = lock_live_row(&mut *tx, "units", &path.id).await?;
    if value_str(&unit, "status") == "sold" {
        return Err(AppError::Conflict("Sold units cannot be deleted.".to_string()));
    }
    let mut filters = live_filters();
    filters.insert("unit_id".to_string(), Value::String(path.id.clone()));
    filters.insert("status".to_string(), Value::String("active".to_string()));
    if count_rows(&mut *tx, "contracts", Some(&filters)).await? > 0 {
        return Err(AppError::Conflict(
            "Unit has an active contract and cannot be deleted.".to_string(),
        ));
    }

    let deleted = soft_delete_row(&mut *tx, "units", &path.id).await?;
    tx.commit().await.map_err(map_db_error)?;
    state.report_cache.invalidate_all();
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "delete",
        "units",
        Some(&path.id),
        Some(deleted.clone()),
        None,
    )
    .await;
    Ok(Json(deleted))
}

async fn list_unit_partners(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    get_live_row(pool, "units", &path.id).await?;
    let rows = unit_partner_rows(pool, &path.id).await?;
    let total_share = round2(rows.iter().map(|row| value_number(row, "share_percent")).sum());
    Ok(Json(json!({ "data": rows, "total_share_percent": total_share })))
}

async fn attach_unit_partner(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
    Json(payload): Json<UnitPartnerInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, SALES_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let mut tx = pool.begin().await.map_err(map_db_error)?;
    // The unit row lock serializes concurrent share changes on the same unit.
    lock_live_row(&mut *tx, "units", &path.id).await?;
    get_live_row(&mut *tx, "partners", &payload.partner_id).await?;

    let existing = list_rows(
        &mut *tx,
        "unit_partners",
        Some(&json_map(&[("unit_id", Value::String(path.id.clone()))])),
        500,
        0,
        "created_at",
        true,
    )
    .await?;
    let current = existing
        .iter()
        .find(|row| value_str(row, "partner_id") == payload.partner_id)
        .cloned();
    let others = existing
        .iter()
        .filter(|row| value_str(row, "partner_id") != payload.partner_id)
        .map(|row| value_number(row, "share_percent"))
        .sum::<f64>();
    ensure_share_capacity(others, payload.share_percent)?;

    let share = json!(round2(payload.share_percent));
    let saved = match current.as_ref() {
        Some(row) => {
            let patch = json_map(&[("share_percent", share)]);
            update_row(&mut *tx, "unit_partners", &value_str(row, "id"), &patch).await?
        }
        None => {
            let record = json_map(&[
                ("unit_id", Value::String(path.id.clone())),
                ("partner_id", Value::String(payload.partner_id.clone())),
                ("share_percent", share),
            ]);
            create_row(&mut *tx, "unit_partners", &record).await?
        }
    };
    tx.commit().await.map_err(map_db_error)?;
    state.report_cache.invalidate_all();

    let entity_id = value_str(&saved, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        if current.is_some() { "update" } else { "create" },
        "unit_partners",
        Some(&entity_id),
        current,
        Some(saved.clone()),
    )
    .await;
    Ok((axum::http::StatusCode::CREATED, Json(saved)))
}

async fn detach_unit_partner(
    State(state): State<AppState>,
    Path(path): Path<UnitPartnerPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, SALES_ROLES).await?;
    let pool = db_pool(&state)?;

    let filters = json_map(&[
        ("unit_id", Value::String(path.id.clone())),
        ("partner_id", Value::String(path.partner_id.clone())),
    ]);
    let link = list_rows(pool, "unit_partners", Some(&filters), 1, 0, "created_at", true)
        .await?
        .pop()
        .ok_or_else(|| AppError::NotFound("Partner is not attached to this unit.".to_string()))?;

    let link_id = value_str(&link, "id");
    let deleted = delete_row(pool, "unit_partners", &link_id).await?;
    state.report_cache.invalidate_all();
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "delete",
        "unit_partners",
        Some(&link_id),
        Some(deleted.clone()),
        None,
    )
    .await;
    Ok(Json(deleted))
}

/// Partner links of a unit, each carrying the partner's name.
async fn unit_partner_rows(pool: &sqlx::PgPool, unit_id: &str) -> AppResult<Vec<Value>> {
    let links = list_rows(
        pool,
        "unit_partners",
        Some(&json_map(&[("unit_id", Value::String(unit_id.to_string()))])),
        500,
        0,
        "created_at",
        true,
    )
    .await?;
    if links.is_empty() {
        return Ok(links);
    }

    let partner_ids = links
        .iter()
        .map(|link| Value::String(value_str(link, "partner_id")))
        .collect::<Vec<_>>();
    let mut partner_filters = Map::new();
    partner_filters.insert("id__in".to_string(), Value::Array(partner_ids));
    let partners = list_rows(pool, "partners", Some(&partner_filters), 500, 0, "full_name", true)
        .await?
        .into_iter()
        .map(|partner| (value_str(&partner, "id"), partner))
        .collect::<HashMap<_, _>>();

    Ok(links
        .into_iter()
        .map(|mut link| {
            let partner = partners.get(&value_str(&link, "partner_id"));
            if let Some(obj) = link.as_object_mut() {
                obj.insert(
                    "partner_name".to_string(),
                    partner
                        .map(|row| Value::String(value_str(row, "full_name")))
                        .unwrap_or(Value::Null),
                );
            }
            link
        })
        .collect())
}

fn parse_status(status: &str) -> AppResult<&'static str> {
    let trimmed = status.trim();
    UNIT_STATUSES
        .iter()
        .copied()
        .find(|candidate| *candidate == trimmed)
        .ok_or_else(|| AppError::BadRequest(format!("Unknown unit status '{trimmed}'.")))
}

fn ensure_manual_status(status: &str) -> AppResult<&'static str> {
    let parsed = parse_status(status)?;
    if !MANUAL_UNIT_STATUSES.contains(&parsed) {
        return Err(AppError::BadRequest(
            "Units become sold only through a contract.".to_string(),
        ));
    }
    Ok(parsed)
}

/// Manual status edits never touch a sold unit.
fn ensure_status_change_allowed(unit: &Value, requested: Option<&str>) -> AppResult<()> {
    let Some(status) = requested else {
        return Ok(());
    };
    ensure_manual_status(status)?;
    if value_str(unit, "status") == "sold" {
        return Err(AppError::Conflict(
            "Sold units are released by cancelling their contract.".to_string(),
        ));
    }
    Ok(())
}

fn ensure_share_capacity(other_shares: f64, requested: f64) -> AppResult<()> {
    let total = round2(other_shares + requested);
    if total > 100.0 {
        return Err(AppError::Conflict(format!(
            "Partner shares would total {total:.2}%, above 100%."
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        ensure_manual_status, ensure_share_capacity, ensure_status_change_allowed, parse_status,
    };
    use crate::error::AppError;

    #[test]
    fn sold_is_not_a_manual_status() {
        assert_eq!(ensure_manual_status("reserved").ok(), Some("reserved"));
        assert!(ensure_manual_status("sold").is_err());
        assert!(parse_status("sold").is_ok());
        assert!(parse_status("rented").is_err());
    }

    #[test]
    fn locked_sold_unit_keeps_its_status() {
        let sold = json!({ "id": "u1", "status": "sold" });
        assert!(matches!(
            ensure_status_change_allowed(&sold, Some("available")),
            Err(AppError::Conflict(_))
        ));
        assert!(ensure_status_change_allowed(&sold, None).is_ok());

        let available = json!({ "id": "u2", "status": "available" });
        assert!(ensure_status_change_allowed(&available, Some("reserved")).is_ok());
        assert!(matches!(
            ensure_status_change_allowed(&available, Some("sold")),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn partner_shares_cap_at_one_hundred() {
        assert!(ensure_share_capacity(60.0, 40.0).is_ok());
        assert!(ensure_share_capacity(60.0, 40.01).is_err());
        assert!(ensure_share_capacity(33.33, 33.33).is_ok());
    }
}
