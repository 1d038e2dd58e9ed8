use std::{sync::Arc, time::Duration};

use moka::future::Cache;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<sqlx::PgPool>,
    /// `app_users` rows keyed by user id.
    pub user_cache: Cache<String, Value>,
    /// Rendered report payloads keyed by endpoint and query string.
    pub report_cache: Cache<String, Value>,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Self, sqlx::Error> {
        let db_pool = match config.database_url.as_deref() {
            Some(url) => Some(
                PgPoolOptions::new()
                    .max_connections(config.db_pool_max_connections.max(1))
                    .min_connections(config.db_pool_min_connections)
                    .acquire_timeout(Duration::from_secs(
                        config.db_pool_acquire_timeout_seconds.max(1),
                    ))
                    .idle_timeout(Duration::from_secs(config.db_pool_idle_timeout_seconds))
                    .connect_lazy(url)?,
            ),
            None => None,
        };

        Ok(Self::with_pool(config, db_pool))
    }

    pub fn with_pool(config: AppConfig, db_pool: Option<sqlx::PgPool>) -> Self {
        let user_cache = Cache::builder()
            .max_capacity(config.user_cache_max_entries)
            .time_to_live(Duration::from_secs(config.user_cache_ttl_seconds.max(1)))
            .build();
        let report_cache = Cache::builder()
            .max_capacity(config.report_response_cache_max_entries)
            .time_to_live(Duration::from_secs(
                config.report_response_cache_ttl_seconds.max(1),
            ))
            .build();

        Self {
            config: Arc::new(config),
            db_pool,
            user_cache,
            report_cache,
        }
    }
}

pub fn db_pool(state: &AppState) -> Result<&sqlx::PgPool, crate::error::AppError> {
    state.db_pool.as_ref().ok_or_else(|| {
        crate::error::AppError::Dependency(
            "Database is not configured. Set DATABASE_URL.".to_string(),
        )
    })
}
