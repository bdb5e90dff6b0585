//! lifehub-sync library interface
//!
//! Exposes the service internals for integration testing.

pub mod api;
pub mod backoff;
pub mod correlator;
pub mod db;
pub mod error;
pub mod inventory;
pub mod merge;
pub mod preview;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use lifehub_common::config::TomlConfig;
use lifehub_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::backoff::RetryPolicy;
use crate::correlator::Correlator;
use crate::inventory::default_sources;
use crate::merge::MergeEngine;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Event bus for correlation and SSE broadcasting
    pub event_bus: EventBus,
    /// Watch session registry
    pub correlator: Arc<Correlator>,
    /// Merge session registry
    pub merge: Arc<MergeEngine>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(db: SqlitePool, event_bus: EventBus, config: &TomlConfig) -> Self {
        let correlator = Correlator::new(
            db.clone(),
            event_bus.clone(),
            config.watch.second_job_policy,
            RetryPolicy::from_config(&config.backoff),
        );
        let merge = MergeEngine::new(db.clone(), event_bus.clone(), default_sources());
        Self {
            db,
            event_bus,
            correlator: Arc::new(correlator),
            merge: Arc::new(merge),
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;
    use tower_http::cors::CorsLayer;
    use tower_http::trace::TraceLayer;

    Router::new()
        .merge(api::job_routes())
        .merge(api::watch_routes())
        .merge(api::merge_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .route("/watch/:id/events", get(api::watch_event_stream))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
