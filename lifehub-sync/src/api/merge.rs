//! Merge session endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use lifehub_common::EntityRef;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::merge::MergeSession;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct OpenMergeRequest {
    /// Surviving entity
    pub source: EntityRef,
    /// Duplicate to absorb and archive
    pub target: EntityRef,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProposalRequest {
    pub proposal: Value,
}

/// POST /merge
pub async fn open_merge(
    State(state): State<AppState>,
    Json(req): Json<OpenMergeRequest>,
) -> ApiResult<Json<MergeSession>> {
    let session = state.merge.open(req.source, req.target).await?;
    Ok(Json(session))
}

/// GET /merge
pub async fn list_merges(State(state): State<AppState>) -> Json<Vec<MergeSession>> {
    Json(state.merge.list().await)
}

/// GET /merge/:id
pub async fn get_merge(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<MergeSession>> {
    let session = state.merge.get(session_id).await?;
    Ok(Json(session))
}

/// PUT /merge/:id/proposal
pub async fn update_proposal(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<UpdateProposalRequest>,
) -> ApiResult<Json<MergeSession>> {
    let session = state.merge.update_proposal(session_id, req.proposal).await?;
    Ok(Json(session))
}

/// POST /merge/:id/execute
///
/// The response carries the session either in `done` or `failed`; a
/// failed response includes the execution report naming which effects
/// completed, and the call can be repeated until it converges.
pub async fn execute_merge(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<MergeSession>> {
    let session = state.merge.execute(session_id).await?;
    Ok(Json(session))
}

/// POST /merge/:id/abandon
pub async fn abandon_merge(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.merge.abandon(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn merge_routes() -> Router<AppState> {
    Router::new()
        .route("/merge", post(open_merge).get(list_merges))
        .route("/merge/:id", get(get_merge))
        .route("/merge/:id/proposal", put(update_proposal))
        .route("/merge/:id/execute", post(execute_merge))
        .route("/merge/:id/abandon", post(abandon_merge))
}
