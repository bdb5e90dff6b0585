//! Job submission and worker status callbacks
//!
//! External workers do the actual generation; this service records their
//! reports and broadcasts the accepted snapshot so every watch session
//! sees the same authoritative state.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use lifehub_common::events::LifehubEvent;
use lifehub_common::{Job, JobStatus};
use serde::Deserialize;
use serde_json::Value;

use crate::db;
use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    /// Opaque job kind, e.g. "image_generation"
    pub kind: String,
    /// Fixed at creation; place the correlation hint under `correlation`
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
pub struct JobStatusReport {
    pub status: JobStatus,
    pub progress: Option<u8>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// POST /jobs
pub async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJobRequest>,
) -> ApiResult<Json<Job>> {
    let job = db::jobs::submit_job(&state.db, &req.kind, req.metadata).await?;
    tracing::info!(job_id = %job.id, kind = %job.kind, "Job submitted");

    state.event_bus.emit_lossy(LifehubEvent::JobSubmitted {
        job_id: job.id.clone(),
        kind: job.kind.clone(),
        timestamp: Utc::now(),
    });
    state.event_bus.emit_lossy(LifehubEvent::JobUpdated {
        job: job.clone(),
        timestamp: Utc::now(),
    });

    Ok(Json(job))
}

/// GET /jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    let job = db::jobs::get_job(&state.db, &id).await?;
    Ok(Json(job))
}

/// POST /jobs/:id/status — worker callback
///
/// The store validates the transition; only an accepted snapshot reaches
/// the bus.
pub async fn report_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<JobStatusReport>,
) -> ApiResult<Json<Job>> {
    let job = db::jobs::update_job_status(
        &state.db,
        &id,
        report.status,
        report.progress,
        report.result,
        report.error,
    )
    .await?;
    tracing::info!(
        job_id = %job.id,
        status = %job.status,
        progress = ?job.progress,
        "Job status reported"
    );

    state.event_bus.emit_lossy(LifehubEvent::JobUpdated {
        job: job.clone(),
        timestamp: Utc::now(),
    });

    Ok(Json(job))
}

pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/status", post(report_job_status))
}
