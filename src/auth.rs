use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::{config::AppConfig, error::AppError, state::AppState};

#[derive(Debug, Clone, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: usize,
}

/// Resolve the calling user id from the request headers.
///
/// Tokens are HS256 JWTs issued by the identity provider sharing `JWT_SECRET`.
/// When dev overrides are enabled an `x-user-id` header is accepted instead.
pub async fn require_user_id(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    if state.config.auth_dev_overrides_enabled() {
        if let Some(user_id) = header_value(headers, "x-user-id") {
            tracing::debug!(user_id, "Using dev auth override");
            return Ok(user_id.to_string());
        }
    }

    let token = bearer_token(headers).ok_or_else(|| {
        AppError::Unauthorized("Unauthorized: missing bearer token.".to_string())
    })?;
    let claims = verify_token(&state.config, token)?;
    Ok(claims.sub)
}

pub fn verify_token(config: &AppConfig, token: &str) -> Result<AccessClaims, AppError> {
    let Some(secret) = config.jwt_secret.as_deref() else {
        return Err(AppError::Dependency(
            "JWT_SECRET is not configured.".to_string(),
        ));
    };

    let mut validation = Validation::new(Algorithm::HS256);
    if let Some(issuer) = config.jwt_issuer.as_deref() {
        validation.set_issuer(&[issuer]);
    }
    match config.jwt_audience.as_deref() {
        Some(audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }

    let data = decode::<AccessClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|error| {
        tracing::debug!(error = %error, "Rejected access token");
        AppError::Unauthorized("Unauthorized: invalid or expired token.".to_string())
    })?;

    if uuid::Uuid::parse_str(data.claims.sub.trim()).is_err() {
        return Err(AppError::Unauthorized(
            "Unauthorized: token subject is not a user id.".to_string(),
        ));
    }
    Ok(data.claims)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = header_value(headers, "authorization")?;
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    use super::{bearer_token, verify_token};
    use crate::{config::test_config, error::AppError};

    const USER_ID: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn token(secret: &str, sub: &str, exp_offset: i64) -> String {
        let exp = chrono::Utc::now().timestamp() + exp_offset;
        encode(
            &Header::default(),
            &json!({ "sub": sub, "exp": exp }),
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("encode token")
    }

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer   "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn accepts_valid_token() {
        let config = test_config();
        let claims = verify_token(&config, &token("test-secret", USER_ID, 600)).expect("valid");
        assert_eq!(claims.sub, USER_ID);
    }

    #[test]
    fn rejects_wrong_secret_and_expired_tokens() {
        let config = test_config();
        assert!(matches!(
            verify_token(&config, &token("other-secret", USER_ID, 600)),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            verify_token(&config, &token("test-secret", USER_ID, -3600)),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn rejects_non_uuid_subject() {
        let config = test_config();
        assert!(matches!(
            verify_token(&config, &token("test-secret", "admin", 600)),
            Err(AppError::Unauthorized(_))
        ));
    }
}
