use axum::{routing::get, Router};

use crate::state::AppState;

pub mod audit_logs;
pub mod broker_dues;
pub mod brokers;
pub mod contracts;
pub mod customers;
pub mod health;
pub mod identity;
pub mod installments;
pub mod partners;
pub mod reports;
pub mod safes;
pub mod units;
pub mod users;
pub mod vouchers;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/me", get(identity::me))
        .merge(users::router())
        .merge(customers::router())
        .merge(units::router())
        .merge(partners::router())
        .merge(brokers::router())
        .merge(contracts::router())
        .merge(installments::router())
        .merge(safes::router())
        .merge(vouchers::router())
        .merge(broker_dues::router())
        .merge(reports::router())
        .merge(audit_logs::router())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::v1_router;
    use crate::{config::test_config, state::AppState};

    fn app() -> Router {
        let state = AppState::with_pool(test_config(), None);
        Router::new().nest("/v1", v1_router()).with_state(state)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_reports_unconfigured_database() {
        let response = app()
            .oneshot(Request::get("/v1/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["database"], "unconfigured");
    }

    #[tokio::test]
    async fn protected_routes_require_bearer_token() {
        for uri in ["/v1/me", "/v1/contracts", "/v1/reports/dashboard", "/v1/safes"] {
            let response = app()
                .oneshot(Request::get(uri).body(Body::empty()).expect("request"))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
            let body = body_json(response).await;
            assert_eq!(body["error"]["code"], "unauthorized");
        }
    }

    #[tokio::test]
    async fn malformed_token_is_rejected() {
        let response = app()
            .oneshot(
                Request::get("/v1/customers")
                    .header("authorization", "Bearer not-a-jwt")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let response = app()
            .oneshot(Request::get("/v1/nope").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
