use std::future::Future;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::Value;

use crate::{
    access::assert_active_user,
    auth::require_user_id,
    error::AppResult,
    schemas::ReportRangeQuery,
    services::reports::{self, resolve_range, DateRange},
    state::{db_pool, AppState},
    values::{non_empty_opt, parse_date},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/reports/dashboard", axum::routing::get(dashboard))
        .route("/reports/sales", axum::routing::get(sales))
        .route("/reports/installments", axum::routing::get(installments))
        .route("/reports/safes", axum::routing::get(safes))
        .route("/reports/vouchers", axum::routing::get(vouchers))
        .route("/reports/brokers", axum::routing::get(brokers))
        .route("/reports/partners", axum::routing::get(partners))
}

async fn dashboard(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let today = state.config.business_today();
    let key = format!("dashboard:{today}");
    cached(&state, key, reports::dashboard(pool, today)).await
}

async fn sales(
    State(state): State<AppState>,
    Query(query): Query<ReportRangeQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let range = report_range(&state, &query)?;
    cached(&state, cache_key("sales", &range), reports::sales_report(pool, &range)).await
}

async fn installments(
    State(state): State<AppState>,
    Query(query): Query<ReportRangeQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let today = state.config.business_today();
    let range = report_range(&state, &query)?;
    // Overdue classification depends on the day, so it is part of the key.
    let key = format!("{}:{today}", cache_key("installments", &range));
    cached(
        &state,
        key,
        reports::installments_report(pool, &range, today),
    )
    .await
}

async fn safes(
    State(state): State<AppState>,
    Query(query): Query<ReportRangeQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let range = report_range(&state, &query)?;
    cached(&state, cache_key("safes", &range), reports::safes_report(pool, &range)).await
}

async fn vouchers(
    State(state): State<AppState>,
    Query(query): Query<ReportRangeQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let range = report_range(&state, &query)?;
    cached(
        &state,
        cache_key("vouchers", &range),
        reports::vouchers_report(pool, &range),
    )
    .await
}

async fn brokers(
    State(state): State<AppState>,
    Query(query): Query<ReportRangeQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let range = report_range(&state, &query)?;
    cached(
        &state,
        cache_key("brokers", &range),
        reports::brokers_report(pool, &range),
    )
    .await
}

async fn partners(
    State(state): State<AppState>,
    Query(query): Query<ReportRangeQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_active_user(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let range = report_range(&state, &query)?;
    cached(
        &state,
        cache_key("partners", &range),
        reports::partners_report(pool, &range),
    )
    .await
}

fn report_range(state: &AppState, query: &ReportRangeQuery) -> AppResult<DateRange> {
    let from = non_empty_opt(query.from_date.as_deref())
        .map(|raw| parse_date(&raw))
        .transpose()?;
    let to = non_empty_opt(query.to_date.as_deref())
        .map(|raw| parse_date(&raw))
        .transpose()?;
    resolve_range(from, to, state.config.business_today())
}

fn cache_key(endpoint: &str, range: &DateRange) -> String {
    format!("{endpoint}:{}:{}", range.from, range.to)
}

/// Serve a report from the response cache, computing and storing it on a miss.
/// Failed computations are not cached.
async fn cached<F>(state: &AppState, key: String, compute: F) -> AppResult<Json<Value>>
where
    F: Future<Output = AppResult<Value>>,
{
    if let Some(hit) = state.report_cache.get(&key).await {
        tracing::debug!(cache_key = %key, "Report cache hit");
        return Ok(Json(hit));
    }
    let payload = compute.await?;
    state.report_cache.insert(key, payload.clone()).await;
    Ok(Json(payload))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::{cache_key, cached, report_range};
    use crate::{
        config::test_config, schemas::ReportRangeQuery, services::reports::DateRange,
        state::AppState,
    };

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn cache_key_includes_endpoint_and_range() {
        let range = DateRange {
            from: date(2026, 1, 1),
            to: date(2026, 3, 31),
        };
        assert_eq!(cache_key("sales", &range), "sales:2026-01-01:2026-03-31");
    }

    #[test]
    fn rejects_inverted_ranges() {
        let state = AppState::with_pool(test_config(), None);
        let query = ReportRangeQuery {
            from_date: Some("2026-05-01".to_string()),
            to_date: Some("2026-04-01".to_string()),
        };
        assert!(report_range(&state, &query).is_err());

        let query = ReportRangeQuery {
            from_date: Some("not-a-date".to_string()),
            to_date: None,
        };
        assert!(report_range(&state, &query).is_err());
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let state = AppState::with_pool(test_config(), None);
        let first = cached(&state, "k".to_string(), async { Ok(json!({"n": 1})) })
            .await
            .expect("first");
        let second = cached(&state, "k".to_string(), async { Ok(json!({"n": 2})) })
            .await
            .expect("second");
        assert_eq!(first.0, json!({"n": 1}));
        assert_eq!(second.0, json!({"n": 1}));

        state.report_cache.invalidate_all();
        state.report_cache.run_pending_tasks().await;
        let third = cached(&state, "k".to_string(), async { Ok(json!({"n": 3})) })
            .await
            .expect("third");
        assert_eq!(third.0, json!({"n": 3}));
    }
}
