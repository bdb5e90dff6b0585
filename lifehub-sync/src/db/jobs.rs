//! Job store queries
//!
//! Authoritative record of background jobs. Workers report state changes
//! through [`update_job_status`]; the service layer emits the matching
//! `JobUpdated` event after a successful update so the bus only ever
//! carries snapshots the store has already accepted.

use chrono::{DateTime, Utc};
use lifehub_common::{Error, Job, JobFilter, JobStatus, Result};
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

type JobRow = (
    String,         // id
    String,         // kind
    String,         // status
    Option<i64>,    // progress
    String,         // created_metadata
    Option<String>, // result
    Option<String>, // error
    String,         // created_at
    String,         // updated_at
);

const JOB_COLUMNS: &str =
    "id, kind, status, progress, created_metadata, result, error, created_at, updated_at";

/// Submit a new job in `queued` status
///
/// `created_metadata` is fixed at creation; a correlation hint placed under
/// its `correlation` key is what makes the job discoverable by observers.
pub async fn submit_job(db: &SqlitePool, kind: &str, created_metadata: Value) -> Result<Job> {
    if !created_metadata.is_object() {
        return Err(Error::InvalidInput(
            "job metadata must be a JSON object".to_string(),
        ));
    }

    let now = Utc::now();
    let job = Job {
        id: Uuid::new_v4().to_string(),
        kind: kind.to_string(),
        status: JobStatus::Queued,
        progress: None,
        created_metadata,
        result: None,
        error: None,
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO jobs (id, kind, status, progress, created_metadata, result, error, created_at, updated_at)
        VALUES (?, ?, ?, NULL, ?, NULL, NULL, ?, ?)
        "#,
    )
    .bind(&job.id)
    .bind(&job.kind)
    .bind(job.status.as_str())
    .bind(job.created_metadata.to_string())
    .bind(job.created_at.to_rfc3339())
    .bind(job.updated_at.to_rfc3339())
    .execute(db)
    .await?;

    tracing::debug!(job_id = %job.id, kind = %job.kind, "Job submitted");

    Ok(job)
}

/// Fetch a job by id
pub async fn get_job(db: &SqlitePool, id: &str) -> Result<Job> {
    try_get_job(db, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("job {}", id)))
}

/// Fetch a job by id, `None` when absent
pub async fn try_get_job(db: &SqlitePool, id: &str) -> Result<Option<Job>> {
    let row: Option<JobRow> =
        sqlx::query_as(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(db)
            .await?;

    row.map(row_to_job).transpose()
}

/// List jobs matching a filter, oldest first
///
/// Status and kind are pushed into SQL; the correlation-hint filter is
/// applied on the parsed metadata afterwards.
pub async fn list_jobs(db: &SqlitePool, filter: &JobFilter) -> Result<Vec<Job>> {
    let mut sql = format!("SELECT {} FROM jobs", JOB_COLUMNS);
    let mut clauses: Vec<String> = Vec::new();

    // older writers stored queued rows as "pending"; a queued filter must
    // still reach them
    let mut status_names: Vec<&'static str> = Vec::new();
    for status in &filter.statuses {
        status_names.push(status.as_str());
        if *status == JobStatus::Queued {
            status_names.push("pending");
        }
    }

    if !status_names.is_empty() {
        let placeholders = vec!["?"; status_names.len()].join(", ");
        clauses.push(format!("status IN ({})", placeholders));
    }
    if filter.kind.is_some() {
        clauses.push("kind = ?".to_string());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at ASC");

    let mut query = sqlx::query_as::<_, JobRow>(&sql);
    for name in &status_names {
        query = query.bind(*name);
    }
    if let Some(kind) = &filter.kind {
        query = query.bind(kind.clone());
    }

    let rows = query.fetch_all(db).await?;
    let mut jobs = Vec::with_capacity(rows.len());
    for row in rows {
        jobs.push(row_to_job(row)?);
    }

    // hints live inside JSON columns, so this part filters in Rust;
    // terminal jobs can also match through their result payload
    if let Some(entity) = &filter.hint {
        jobs.retain(|job| {
            matches!(job.created_hint(), Some(h) if h.matches(entity))
                || matches!(job.result_hint(), Some(h) if h.matches(entity))
                || matches!(job.legacy_result_entity_id(), Some(id) if id == entity.entity_id)
        });
    }

    Ok(jobs)
}

/// Apply a worker-reported state change
///
/// Enforces the job record invariants:
/// - a terminal job never changes again
/// - `result` only with Completed, `error` only with Failed
/// - progress clamped to 0-100
pub async fn update_job_status(
    db: &SqlitePool,
    id: &str,
    new_status: JobStatus,
    progress: Option<u8>,
    result: Option<Value>,
    error: Option<String>,
) -> Result<Job> {
    let current = get_job(db, id).await?;

    if current.is_terminal() {
        return Err(Error::InvalidInput(format!(
            "job {} is already {} and cannot change",
            id, current.status
        )));
    }
    if result.is_some() && new_status != JobStatus::Completed {
        return Err(Error::InvalidInput(
            "result may only be set when status is completed".to_string(),
        ));
    }
    if error.is_some() && new_status != JobStatus::Failed {
        return Err(Error::InvalidInput(
            "error may only be set when status is failed".to_string(),
        ));
    }
    if new_status == JobStatus::Failed && error.is_none() {
        return Err(Error::InvalidInput(
            "failed status requires an error message".to_string(),
        ));
    }

    let progress = progress.map(|p| p.min(100));
    let now = Utc::now();

    sqlx::query(
        r#"
        UPDATE jobs
        SET status = ?, progress = ?, result = ?, error = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(new_status.as_str())
    .bind(progress.map(i64::from))
    .bind(result.as_ref().map(|r| r.to_string()))
    .bind(&error)
    .bind(now.to_rfc3339())
    .bind(id)
    .execute(db)
    .await?;

    tracing::debug!(job_id = %id, status = %new_status, progress = ?progress, "Job updated");

    get_job(db, id).await
}

fn row_to_job(row: JobRow) -> Result<Job> {
    let (id, kind, status, progress, created_metadata, result, error, created_at, updated_at) = row;

    let status = JobStatus::parse(&status)
        .ok_or_else(|| Error::Internal(format!("unknown job status '{}' for job {}", status, id)))?;
    let created_metadata: Value = serde_json::from_str(&created_metadata)
        .map_err(|e| Error::Internal(format!("corrupt metadata for job {}: {}", id, e)))?;
    let result = result
        .map(|r| serde_json::from_str(&r))
        .transpose()
        .map_err(|e| Error::Internal(format!("corrupt result for job {}: {}", id, e)))?;

    Ok(Job {
        id,
        kind,
        status,
        progress: progress.map(|p| p.clamp(0, 100) as u8),
        created_metadata,
        result,
        error,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("corrupt timestamp '{}': {}", s, e)))
}
