//! Preview synchronization state machine
//!
//! One `PreviewState` exists per observed entity, owned by the observing
//! session. It answers "is this entity's derived asset being regenerated
//! right now" and reconciles job completion with asset-store read latency.
//!
//! Phases: `Idle -> Discovered -> Generating -> {Completed | Failed}`,
//! back to Idle when observation stops (the state is simply dropped —
//! the job store stays authoritative).
//!
//! Invariants enforced here rather than in UI code:
//! - at most one tracked job per entity at any instant
//! - terminal events are idempotent, keyed by (job id, status)
//! - a failure never clobbers the previously rendered asset

use lifehub_common::config::SecondJobPolicy;
use lifehub_common::{EntityRef, Job, JobStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Preview lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewPhase {
    /// No tracked job; `current_asset` is the last persisted asset
    Idle,
    /// An in-flight job was found (live event or reconciliation query)
    Discovered,
    /// The tracked job is reporting progress
    Generating,
    /// The tracked job finished; result asset applied
    Completed,
    /// The tracked job failed; previous asset retained
    Failed,
}

impl fmt::Display for PreviewPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PreviewPhase::Idle => "idle",
            PreviewPhase::Discovered => "discovered",
            PreviewPhase::Generating => "generating",
            PreviewPhase::Completed => "completed",
            PreviewPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Versioned asset pointer
///
/// The version token increases monotonically per preview so the UI never
/// serves a stale cached asset, including on first render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    /// Base asset URL, without cache-busting
    pub base: String,
    /// Monotonically increasing cache-busting token
    pub version: u64,
}

impl AssetRef {
    pub fn url(&self) -> String {
        format!("{}?v={}", self.base, self.version)
    }
}

/// Serializable snapshot for API responses and SSE payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewSnapshot {
    pub entity: EntityRef,
    pub phase: PreviewPhase,
    pub tracked_job_id: Option<String>,
    pub progress: Option<u8>,
    pub asset_url: Option<String>,
    pub last_error: Option<String>,
}

/// Per-observer preview state for one entity
#[derive(Debug)]
pub struct PreviewState {
    entity: EntityRef,
    phase: PreviewPhase,
    tracked_job_id: Option<String>,
    progress: Option<u8>,
    current_asset: Option<AssetRef>,
    last_error: Option<String>,
    next_version: u64,
    /// Terminal events already applied, keyed by (job id, status)
    applied_terminal: HashSet<(String, JobStatus)>,
}

impl PreviewState {
    /// Create state for a newly observed entity
    ///
    /// `initial_asset` is the entity's last persisted asset pointer, if
    /// any; it gets version 1 so even the first render is cache-busted.
    pub fn new(entity: EntityRef, initial_asset: Option<String>) -> Self {
        let current_asset = initial_asset.map(|base| AssetRef { base, version: 1 });
        Self {
            entity,
            phase: PreviewPhase::Idle,
            tracked_job_id: None,
            progress: None,
            current_asset,
            last_error: None,
            next_version: 2,
            applied_terminal: HashSet::new(),
        }
    }

    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub fn phase(&self) -> PreviewPhase {
        self.phase
    }

    pub fn tracked_job_id(&self) -> Option<&str> {
        self.tracked_job_id.as_deref()
    }

    pub fn current_asset(&self) -> Option<&AssetRef> {
        self.current_asset.as_ref()
    }

    /// Apply a job snapshot already matched to this entity
    ///
    /// Returns whether anything observable changed. The caller (the watch
    /// task) is responsible for matching; this method is responsible for
    /// the tracking invariant and idempotence.
    pub fn apply(&mut self, job: &Job, policy: SecondJobPolicy) -> bool {
        match job.status {
            JobStatus::Queued | JobStatus::Running => self.apply_in_flight(job, policy),
            JobStatus::Completed => self.apply_completed(job, policy),
            JobStatus::Failed => self.apply_failed(job, policy),
        }
    }

    fn apply_in_flight(&mut self, job: &Job, policy: SecondJobPolicy) -> bool {
        match self.tracked_job_id.as_deref() {
            None => {
                self.tracked_job_id = Some(job.id.clone());
                self.progress = job.progress;
                self.phase = if job.progress.is_some() {
                    PreviewPhase::Generating
                } else {
                    PreviewPhase::Discovered
                };
                true
            }
            Some(tracked) if tracked == job.id => {
                let mut changed = false;
                if job.progress.is_some() && self.phase != PreviewPhase::Generating {
                    self.phase = PreviewPhase::Generating;
                    changed = true;
                }
                if job.progress != self.progress {
                    self.progress = job.progress;
                    changed = true;
                }
                changed
            }
            Some(_) => match policy {
                // second candidate while tracked: never a crash, never
                // silent corruption
                SecondJobPolicy::Ignore => {
                    tracing::debug!(
                        entity = %self.entity,
                        tracked = ?self.tracked_job_id,
                        candidate = %job.id,
                        "Ignoring second candidate job for tracked entity"
                    );
                    false
                }
                SecondJobPolicy::Replace => {
                    tracing::info!(
                        entity = %self.entity,
                        tracked = ?self.tracked_job_id,
                        candidate = %job.id,
                        "Replacing tracked job with newer candidate"
                    );
                    self.tracked_job_id = Some(job.id.clone());
                    self.progress = job.progress;
                    self.phase = if job.progress.is_some() {
                        PreviewPhase::Generating
                    } else {
                        PreviewPhase::Discovered
                    };
                    true
                }
            },
        }
    }

    fn apply_completed(&mut self, job: &Job, policy: SecondJobPolicy) -> bool {
        let key = (job.id.clone(), JobStatus::Completed);
        if self.applied_terminal.contains(&key) {
            return false;
        }
        if self.is_other_candidate(job) && policy == SecondJobPolicy::Ignore {
            return false;
        }
        self.applied_terminal.insert(key);

        if let Some(base) = job.result_field("asset_ref") {
            let version = self.next_version;
            self.next_version += 1;
            self.current_asset = Some(AssetRef {
                base: base.to_string(),
                version,
            });
        }
        self.phase = PreviewPhase::Completed;
        self.progress = Some(100);
        self.tracked_job_id = None;
        self.last_error = None;
        true
    }

    fn apply_failed(&mut self, job: &Job, policy: SecondJobPolicy) -> bool {
        let key = (job.id.clone(), JobStatus::Failed);
        if self.applied_terminal.contains(&key) {
            return false;
        }
        if self.is_other_candidate(job) && policy == SecondJobPolicy::Ignore {
            return false;
        }
        self.applied_terminal.insert(key);

        // current_asset deliberately untouched
        self.phase = PreviewPhase::Failed;
        self.progress = None;
        self.tracked_job_id = None;
        self.last_error = Some(
            job.error
                .clone()
                .unwrap_or_else(|| "generation job failed".to_string()),
        );
        true
    }

    fn is_other_candidate(&self, job: &Job) -> bool {
        matches!(self.tracked_job_id.as_deref(), Some(tracked) if tracked != job.id)
    }

    /// Record that the announced asset was not readable within the retry
    /// budget
    pub fn note_asset_delay(&mut self, message: String) {
        self.last_error = Some(message);
    }

    pub fn snapshot(&self) -> PreviewSnapshot {
        PreviewSnapshot {
            entity: self.entity.clone(),
            phase: self.phase,
            tracked_job_id: self.tracked_job_id.clone(),
            progress: self.progress,
            asset_url: self.current_asset.as_ref().map(AssetRef::url),
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn job(id: &str, status: JobStatus, progress: Option<u8>) -> Job {
        Job {
            id: id.to_string(),
            kind: "image_generation".to_string(),
            status,
            progress,
            created_metadata: json!({
                "correlation": { "entity_type": "character", "entity_id": "c1" }
            }),
            result: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn completed_job(id: &str, asset: &str) -> Job {
        let mut j = job(id, JobStatus::Completed, None);
        j.result = Some(json!({ "asset_ref": asset }));
        j
    }

    fn failed_job(id: &str, error: &str) -> Job {
        let mut j = job(id, JobStatus::Failed, None);
        j.error = Some(error.to_string());
        j
    }

    #[test]
    fn test_discovered_then_generating_then_completed() {
        let mut state = PreviewState::new(EntityRef::new("character", "c1"), None);
        assert_eq!(state.phase(), PreviewPhase::Idle);

        // live event with no progress yet
        assert!(state.apply(&job("j1", JobStatus::Queued, None), SecondJobPolicy::Ignore));
        assert_eq!(state.phase(), PreviewPhase::Discovered);
        assert_eq!(state.snapshot().progress, None);
        assert_eq!(state.tracked_job_id(), Some("j1"));

        // progress arrives
        assert!(state.apply(&job("j1", JobStatus::Running, Some(40)), SecondJobPolicy::Ignore));
        assert_eq!(state.phase(), PreviewPhase::Generating);
        assert_eq!(state.snapshot().progress, Some(40));

        // completion with asset
        assert!(state.apply(&completed_job("j1", "https://assets/c1/v2.png"), SecondJobPolicy::Ignore));
        assert_eq!(state.phase(), PreviewPhase::Completed);
        let asset = state.current_asset().unwrap();
        assert_eq!(asset.base, "https://assets/c1/v2.png");
        assert_eq!(state.tracked_job_id(), None);
    }

    #[test]
    fn test_completed_event_is_idempotent() {
        let mut state = PreviewState::new(EntityRef::new("character", "c1"), None);
        let done = completed_job("j1", "https://assets/c1/v2.png");

        assert!(state.apply(&done, SecondJobPolicy::Ignore));
        let first = state.snapshot();

        assert!(!state.apply(&done, SecondJobPolicy::Ignore));
        let second = state.snapshot();

        assert_eq!(first.asset_url, second.asset_url, "no double version bump");
        assert_eq!(first.phase, second.phase);
    }

    #[test]
    fn test_single_tracked_job_invariant_ignore() {
        let mut state = PreviewState::new(EntityRef::new("character", "c1"), None);
        state.apply(&job("j1", JobStatus::Running, Some(10)), SecondJobPolicy::Ignore);

        // second candidate ignored without corrupting tracking
        assert!(!state.apply(&job("j2", JobStatus::Queued, None), SecondJobPolicy::Ignore));
        assert_eq!(state.tracked_job_id(), Some("j1"));

        // second candidate's completion ignored too
        assert!(!state.apply(&completed_job("j2", "https://assets/other.png"), SecondJobPolicy::Ignore));
        assert_eq!(state.phase(), PreviewPhase::Generating);
    }

    #[test]
    fn test_single_tracked_job_invariant_replace() {
        let mut state = PreviewState::new(EntityRef::new("character", "c1"), None);
        state.apply(&job("j1", JobStatus::Running, Some(10)), SecondJobPolicy::Replace);

        assert!(state.apply(&job("j2", JobStatus::Queued, None), SecondJobPolicy::Replace));
        assert_eq!(state.tracked_job_id(), Some("j2"));
        assert_eq!(state.phase(), PreviewPhase::Discovered);
    }

    #[test]
    fn test_failure_keeps_previous_asset() {
        let mut state = PreviewState::new(
            EntityRef::new("character", "c1"),
            Some("https://assets/c1/v1.png".to_string()),
        );
        let initial_url = state.snapshot().asset_url.unwrap();
        assert!(initial_url.contains("?v=1"), "first render is cache-busted");

        state.apply(&job("j1", JobStatus::Running, Some(50)), SecondJobPolicy::Ignore);
        assert!(state.apply(&failed_job("j1", "provider timeout"), SecondJobPolicy::Ignore));

        let snap = state.snapshot();
        assert_eq!(snap.phase, PreviewPhase::Failed);
        assert_eq!(snap.asset_url.unwrap(), initial_url);
        assert_eq!(snap.last_error.as_deref(), Some("provider timeout"));
        assert_eq!(snap.tracked_job_id, None);
    }

    #[test]
    fn test_asset_version_monotonic() {
        let mut state = PreviewState::new(
            EntityRef::new("character", "c1"),
            Some("https://assets/c1/v1.png".to_string()),
        );
        assert_eq!(state.current_asset().unwrap().version, 1);

        state.apply(&completed_job("j1", "https://assets/c1/v2.png"), SecondJobPolicy::Ignore);
        assert_eq!(state.current_asset().unwrap().version, 2);

        state.apply(&job("j2", JobStatus::Running, None), SecondJobPolicy::Ignore);
        state.apply(&completed_job("j2", "https://assets/c1/v3.png"), SecondJobPolicy::Ignore);
        assert_eq!(state.current_asset().unwrap().version, 3);
    }

    #[test]
    fn test_late_completion_without_tracking_applies() {
        // job finished before observation began; its completion event (or
        // reconciled snapshot) must still land the asset
        let mut state = PreviewState::new(EntityRef::new("character", "c1"), None);
        assert!(state.apply(&completed_job("j0", "https://assets/c1/v2.png"), SecondJobPolicy::Ignore));
        assert_eq!(state.phase(), PreviewPhase::Completed);
        assert!(state.snapshot().asset_url.unwrap().starts_with("https://assets/c1/v2.png"));
    }
}
