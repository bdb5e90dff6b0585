//! Background job model
//!
//! A `Job` is an opaque unit of background work owned by an external worker
//! pool. This crate only models the record the job store keeps about it:
//! status, progress, metadata fixed at creation, and the result or error
//! that appears once the job reaches a terminal status.

use crate::entity::{CorrelationHint, EntityRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, not yet picked up by a worker
    Queued,
    /// A worker is executing the job
    Running,
    /// Finished successfully; `result` is set
    Completed,
    /// Finished with an error; `error` is set
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            // legacy synonym written by older job stores
            "pending" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Background job snapshot
///
/// Invariant: `result` and `error` are mutually exclusive and only ever set
/// once `status` leaves {Queued, Running}. The job store enforces this on
/// update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque job identifier
    pub id: String,
    /// Job kind (e.g., "image_generation", "merge_analysis")
    pub kind: String,
    /// Current lifecycle status
    pub status: JobStatus,
    /// Progress percentage (0-100), absent when unknown
    pub progress: Option<u8>,
    /// Free-form key/value map fixed at creation; may include a
    /// `correlation` hint
    pub created_metadata: Value,
    /// Free-form result map, present only when Completed
    pub result: Option<Value>,
    /// Error message, present only when Failed
    pub error: Option<String>,
    /// When the job was submitted
    pub created_at: DateTime<Utc>,
    /// When the job record last changed
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Structured hint from `created_metadata`, available from submission on
    pub fn created_hint(&self) -> Option<CorrelationHint> {
        CorrelationHint::from_map(&self.created_metadata)
    }

    /// Structured hint from `result`, available only once Completed
    pub fn result_hint(&self) -> Option<CorrelationHint> {
        self.result.as_ref().and_then(CorrelationHint::from_map)
    }

    /// Legacy bare `entity_id` field in `result` (pre-structured-hint jobs)
    pub fn legacy_result_entity_id(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(CorrelationHint::legacy_result_entity_id)
    }

    /// String field out of the result map, if present
    pub fn result_field(&self, key: &str) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(|r| r.get(key))
            .and_then(Value::as_str)
    }
}

/// Filter for job store queries
///
/// Used by the reconciliation query: filter to in-flight statuses and a
/// correlation hint matching the observed entity.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Restrict to these statuses (empty = all)
    pub statuses: Vec<JobStatus>,
    /// Restrict to this job kind
    pub kind: Option<String>,
    /// Restrict to jobs whose `created_metadata` hint names this entity
    pub hint: Option<EntityRef>,
}

impl JobFilter {
    /// Filter for jobs still in flight (queued or running)
    pub fn in_flight() -> Self {
        Self {
            statuses: vec![JobStatus::Queued, JobStatus::Running],
            kind: None,
            hint: None,
        }
    }

    pub fn with_hint(mut self, entity: &EntityRef) -> Self {
        self.hint = Some(entity.clone());
        self
    }
}
