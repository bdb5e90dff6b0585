//! Merge session state
//!
//! `Comparing -> Analyzing -> ProposalReady -> Executing -> Done | Failed`.
//! `Failed -> Executing` is allowed so a partial execution can be retried;
//! every other transition outside the happy path is rejected.

use crate::inventory::ReferenceItem;
use chrono::{DateTime, Utc};
use lifehub_common::{EntityRef, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    Comparing,
    Analyzing,
    ProposalReady,
    Executing,
    Done,
    Failed,
}

impl MergeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeState::Comparing => "comparing",
            MergeState::Analyzing => "analyzing",
            MergeState::ProposalReady => "proposal_ready",
            MergeState::Executing => "executing",
            MergeState::Done => "done",
            MergeState::Failed => "failed",
        }
    }

    fn can_transition_to(&self, next: MergeState) -> bool {
        use MergeState::*;
        matches!(
            (self, next),
            (Comparing, Analyzing)
                | (Comparing, Failed)
                | (Analyzing, ProposalReady)
                | (Analyzing, Failed)
                | (ProposalReady, Executing)
                | (Executing, Done)
                | (Executing, Failed)
                // retry after a partial execution failure
                | (Failed, Executing)
        )
    }
}

impl fmt::Display for MergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field provenance counts for the merge proposal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesSummary {
    pub fields_from_source: usize,
    pub fields_from_target: usize,
    pub fields_merged: usize,
}

/// Which of the three execution effects completed
///
/// Returned from every execution attempt, successful or not, so a partial
/// failure is never ambiguous about what state the store is in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub source_overwritten: bool,
    pub references_rewritten: usize,
    pub references_total: usize,
    pub target_archived: bool,
}

impl ExecutionReport {
    pub fn complete(&self) -> bool {
        self.source_overwritten
            && self.references_rewritten == self.references_total
            && self.target_archived
    }
}

/// One user-initiated merge of `target` into `source`
#[derive(Debug, Clone, Serialize)]
pub struct MergeSession {
    pub session_id: Uuid,
    /// Surviving entity
    pub source: EntityRef,
    /// Entity to be absorbed and archived
    pub target: EntityRef,
    pub state: MergeState,
    /// Inventory computed at comparison time, shown to the user;
    /// execution re-queries instead of trusting this list
    pub reference_inventory: Vec<ReferenceItem>,
    /// Merged record; seeded by analysis, then user-editable
    pub proposal: Option<Value>,
    pub changes_summary: Option<ChangesSummary>,
    pub analysis_job_id: Option<String>,
    pub last_execution: Option<ExecutionReport>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MergeSession {
    pub fn new(source: EntityRef, target: EntityRef) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            source,
            target,
            state: MergeState::Comparing,
            reference_inventory: Vec::new(),
            proposal: None,
            changes_summary: None,
            analysis_job_id: None,
            last_execution: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting transitions outside the lifecycle
    pub fn transition_to(&mut self, next: MergeState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Conflict(format!(
                "merge session {} cannot move from {} to {}",
                self.session_id, self.state, next
            )));
        }
        tracing::info!(
            session_id = %self.session_id,
            from = %self.state,
            to = %next,
            "Merge session state change"
        );
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Abandonable while no side effects have happened yet
    pub fn abandonable(&self) -> bool {
        matches!(
            self.state,
            MergeState::Comparing | MergeState::Analyzing | MergeState::ProposalReady
        )
    }
}

/// Field-union baseline proposal
///
/// Keeps the session useful even when the analysis job fails or is edited
/// from scratch: source wins scalar conflicts, arrays take the union,
/// target fills gaps.
pub fn merge_records(source: &Value, target: &Value) -> (Value, ChangesSummary) {
    let mut merged = serde_json::Map::new();
    let mut summary = ChangesSummary::default();

    let empty = serde_json::Map::new();
    let source_map = source.as_object().unwrap_or(&empty);
    let target_map = target.as_object().unwrap_or(&empty);

    for (key, source_value) in source_map {
        match target_map.get(key) {
            None => {
                merged.insert(key.clone(), source_value.clone());
                summary.fields_from_source += 1;
            }
            Some(target_value) if target_value == source_value => {
                merged.insert(key.clone(), source_value.clone());
                summary.fields_from_source += 1;
            }
            Some(target_value) if source_value.is_null() => {
                merged.insert(key.clone(), target_value.clone());
                summary.fields_from_target += 1;
            }
            Some(Value::Array(target_items)) if source_value.is_array() => {
                let mut union = source_value.as_array().cloned().unwrap_or_default();
                for item in target_items {
                    if !union.contains(item) {
                        union.push(item.clone());
                    }
                }
                merged.insert(key.clone(), Value::Array(union));
                summary.fields_merged += 1;
            }
            Some(_) => {
                merged.insert(key.clone(), source_value.clone());
                summary.fields_from_source += 1;
            }
        }
    }
    for (key, target_value) in target_map {
        if !source_map.contains_key(key) {
            merged.insert(key.clone(), target_value.clone());
            summary.fields_from_target += 1;
        }
    }

    (Value::Object(merged), summary)
}
