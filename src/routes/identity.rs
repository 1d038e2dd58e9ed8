use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::{
    access::{assert_active_user, user_role},
    auth::require_user_id,
    error::AppResult,
    state::AppState,
};

pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let user = assert_active_user(&state, &user_id).await?;
    let role = user_role(&user).to_string();
    Ok(Json(json!({
        "user": user,
        "role": role,
        "business_date": state.config.business_today().to_string(),
    })))
}
