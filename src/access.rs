use serde_json::Value;
use sqlx::Row;

use crate::{
    error::AppError,
    repository::table_service::map_db_error,
    state::{db_pool, AppState},
};

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_ACCOUNTANT: &str = "accountant";
pub const ROLE_SALES: &str = "sales";
pub const ROLE_VIEWER: &str = "viewer";

pub const ALL_ROLES: &[&str] = &[ROLE_ADMIN, ROLE_ACCOUNTANT, ROLE_SALES, ROLE_VIEWER];

/// Roles allowed to record sales and edit customer/unit data.
pub const SALES_ROLES: &[&str] = &[ROLE_ADMIN, ROLE_SALES];
/// Roles allowed to move money.
pub const FINANCE_ROLES: &[&str] = &[ROLE_ADMIN, ROLE_ACCOUNTANT];
pub const ADMIN_ONLY: &[&str] = &[ROLE_ADMIN];

pub async fn load_app_user(state: &AppState, user_id: &str) -> Result<Value, AppError> {
    if let Some(cached) = state.user_cache.get(user_id).await {
        return Ok(cached);
    }

    let parsed_id = uuid::Uuid::parse_str(user_id.trim())
        .map_err(|_| AppError::Unauthorized("Unauthorized: malformed user id.".to_string()))?;
    let pool = db_pool(state)?;
    let row = sqlx::query(
        "SELECT row_to_json(t) AS row
         FROM app_users t
         WHERE id = $1
         LIMIT 1",
    )
    .bind(parsed_id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    let user = row
        .and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::Forbidden("Forbidden: unknown user.".to_string()))?;

    state
        .user_cache
        .insert(user_id.to_string(), user.clone())
        .await;
    Ok(user)
}

pub async fn invalidate_user(state: &AppState, user_id: &str) {
    state.user_cache.invalidate(user_id).await;
}

pub async fn assert_active_user(state: &AppState, user_id: &str) -> Result<Value, AppError> {
    let user = load_app_user(state, user_id).await?;
    if !user_is_active(&user) {
        return Err(AppError::Forbidden(
            "Forbidden: user account is disabled.".to_string(),
        ));
    }
    Ok(user)
}

pub async fn assert_role(
    state: &AppState,
    user_id: &str,
    allowed_roles: &[&str],
) -> Result<Value, AppError> {
    let user = assert_active_user(state, user_id).await?;
    let role = user_role(&user);
    if role_allowed(role, allowed_roles) {
        return Ok(user);
    }

    Err(AppError::Forbidden(format!(
        "Forbidden: role '{role}' is not allowed for this action."
    )))
}

pub fn user_role(user: &Value) -> &str {
    user.get("role").and_then(Value::as_str).unwrap_or("unknown")
}

fn user_is_active(user: &Value) -> bool {
    user.get("is_active")
        .and_then(Value::as_bool)
        .unwrap_or(true)
}

fn role_allowed(role: &str, allowed_roles: &[&str]) -> bool {
    role == ROLE_ADMIN || allowed_roles.contains(&role)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        load_app_user, role_allowed, user_is_active, user_role, FINANCE_ROLES, SALES_ROLES,
    };
    use crate::{config::test_config, error::AppError, state::AppState};

    #[test]
    fn admin_passes_every_role_check() {
        assert!(role_allowed("admin", &[]));
        assert!(role_allowed("admin", SALES_ROLES));
    }

    #[test]
    fn role_check_uses_allow_list() {
        assert!(role_allowed("accountant", FINANCE_ROLES));
        assert!(!role_allowed("sales", FINANCE_ROLES));
        assert!(!role_allowed("viewer", SALES_ROLES));
    }

    #[test]
    fn reads_role_and_active_flag() {
        let user = json!({"role": "sales", "is_active": false});
        assert_eq!(user_role(&user), "sales");
        assert!(!user_is_active(&user));
        assert_eq!(user_role(&json!({})), "unknown");
        assert!(user_is_active(&json!({})));
    }

    #[tokio::test]
    async fn malformed_user_id_is_rejected_before_the_database() {
        let state = AppState::with_pool(test_config(), None);
        assert!(matches!(
            load_app_user(&state, "not-a-uuid").await,
            Err(AppError::Unauthorized(_))
        ));
        // A well-formed id reaches the pool check.
        assert!(matches!(
            load_app_user(&state, "550e8400-e29b-41d4-a716-446655440000").await,
            Err(AppError::Dependency(_))
        ));
    }
}
