use serde_json::Value;
use sqlx::PgPool;

/// Best-effort audit trail. Failures are logged and never surface to the caller.
#[allow(clippy::too_many_arguments)]
pub async fn write_audit_log(
    pool: Option<&PgPool>,
    actor_user_id: Option<&str>,
    action: &str,
    entity_name: &str,
    entity_id: Option<&str>,
    before_state: Option<Value>,
    after_state: Option<Value>,
) {
    let Some(pool) = pool else {
        return;
    };

    let result = sqlx::query(
        "INSERT INTO audit_logs (actor_user_id, action, entity_name, entity_id, before_state, after_state)
         VALUES ($1::uuid, $2, $3, $4, $5, $6)",
    )
    .bind(actor_user_id)
    .bind(action)
    .bind(entity_name)
    .bind(entity_id)
    .bind(before_state)
    .bind(after_state)
    .execute(pool)
    .await;

    if let Err(error) = result {
        tracing::warn!(
            action,
            entity_name,
            entity_id = entity_id.unwrap_or_default(),
            error = %error,
            "Failed to write audit log"
        );
    }
}
