//! Entity merge engine
//!
//! Merges a duplicate entity (target) into a canonical one (source):
//! side-by-side comparison, an AI-assisted merge proposal produced by a
//! background analysis job, user edits, then an ordered idempotent
//! execution that rewrites every reference and archives the duplicate.

mod engine;
mod session;

pub use engine::MergeEngine;
pub use session::{ChangesSummary, ExecutionReport, MergeSession, MergeState};
