use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    access::{assert_active_user, assert_role, invalidate_user, ADMIN_ONLY, ALL_ROLES},
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{create_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit, remove_nulls, serialize_to_map, validate_input, CreateUserInput, IdPath,
        UpdateUserInput, UsersQuery,
    },
    services::audit::write_audit_log,
    state::{db_pool, AppState},
    values::value_str,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/users", axum::routing::get(list_users).post(create_user))
        .route(
            "/users/{id}",
            axum::routing::get(get_user).patch(update_user),
        )
}

async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<UsersQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, ADMIN_ONLY).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(role) = query.role.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
        filters.insert("role".to_string(), Value::String(parse_role(role)?.to_string()));
    }
    if let Some(is_active) = query.is_active {
        filters.insert("is_active".to_string(), Value::Bool(is_active));
    }

    let rows = list_rows(
        pool,
        "app_users",
        Some(&filters),
        clamp_limit(query.limit),
        query.offset,
        "full_name",
        true,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateUserInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, ADMIN_ONLY).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    if uuid::Uuid::parse_str(payload.id.trim()).is_err() {
        return Err(AppError::BadRequest(
            "id must be the identity provider's user UUID.".to_string(),
        ));
    }
    parse_role(&payload.role)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("id".to_string(), Value::String(payload.id.trim().to_string()));
    record.insert(
        "email".to_string(),
        Value::String(payload.email.trim().to_ascii_lowercase()),
    );
    let created = create_row(pool, "app_users", &record).await?;
    let entity_id = value_str(&created, "id");

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "create",
        "app_users",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_user(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    if path.id == user_id {
        return Ok(Json(assert_active_user(&state, &user_id).await?));
    }
    assert_role(&state, &user_id, ADMIN_ONLY).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "app_users", &path.id).await?;
    Ok(Json(record))
}

async fn update_user(
    State(state): State<AppState>,
    Path(path): Path<IdPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateUserInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_role(&state, &user_id, ADMIN_ONLY).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    if let Some(role) = payload.role.as_deref() {
        parse_role(role)?;
    }
    if path.id == user_id
        && (payload.is_active == Some(false)
            || payload.role.as_deref().is_some_and(|role| role.trim() != "admin"))
    {
        return Err(AppError::Conflict(
            "Admins cannot disable or demote their own account.".to_string(),
        ));
    }

    let before = get_row(pool, "app_users", &path.id).await?;
    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "app_users", &path.id, &patch).await?;
    invalidate_user(&state, &path.id).await;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "update",
        "app_users",
        Some(&path.id),
        Some(before),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

fn parse_role(role: &str) -> AppResult<&str> {
    let trimmed = role.trim();
    ALL_ROLES
        .iter()
        .copied()
        .find(|candidate| *candidate == trimmed)
        .ok_or_else(|| AppError::BadRequest(format!("Unknown role '{trimmed}'.")))
}

#[cfg(test)]
mod tests {
    use super::parse_role;

    #[test]
    fn accepts_known_roles_only() {
        assert_eq!(parse_role(" accountant ").ok(), Some("accountant"));
        assert!(parse_role("owner").is_err());
    }
}
