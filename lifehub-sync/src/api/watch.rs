//! Watch session endpoints
//!
//! A watch is the UI's handle on one entity's preview state. Opening one
//! reconciles against the job store before any live event is consumed.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use lifehub_common::EntityRef;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::correlator::WatchInfo;
use crate::error::{ApiError, ApiResult};
use crate::preview::PreviewSnapshot;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct BeginWatchRequest {
    pub entity_type: String,
    pub entity_id: String,
}

#[derive(Debug, Serialize)]
pub struct BeginWatchResponse {
    pub watch_id: Uuid,
    pub preview: PreviewSnapshot,
}

/// POST /watch
pub async fn begin_watch(
    State(state): State<AppState>,
    Json(req): Json<BeginWatchRequest>,
) -> ApiResult<Json<BeginWatchResponse>> {
    if req.entity_type.is_empty() || req.entity_id.is_empty() {
        return Err(ApiError::BadRequest(
            "entity_type and entity_id are required".to_string(),
        ));
    }
    let entity = EntityRef::new(req.entity_type, req.entity_id);
    let watch_id = state.correlator.begin_observing(entity).await?;
    let preview = state.correlator.snapshot(watch_id).await?;
    Ok(Json(BeginWatchResponse { watch_id, preview }))
}

/// GET /watch
pub async fn list_watches(State(state): State<AppState>) -> Json<Vec<WatchInfo>> {
    Json(state.correlator.list_watches().await)
}

/// GET /watch/:id
pub async fn get_watch(
    State(state): State<AppState>,
    Path(watch_id): Path<Uuid>,
) -> ApiResult<Json<PreviewSnapshot>> {
    let preview = state.correlator.snapshot(watch_id).await?;
    Ok(Json(preview))
}

/// DELETE /watch/:id
pub async fn end_watch(
    State(state): State<AppState>,
    Path(watch_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if state.correlator.end_observing(watch_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("watch {}", watch_id)))
    }
}

pub fn watch_routes() -> Router<AppState> {
    Router::new()
        .route("/watch", post(begin_watch).get(list_watches))
        .route("/watch/:id", get(get_watch).delete(end_watch))
}
