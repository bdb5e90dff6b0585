//! Merge orchestration
//!
//! Drives sessions through their lifecycle. The analysis step rides the
//! same job store and event bus as every other background job, correlated
//! under a synthetic `("merge_session", session_id)` ref; execution is an
//! ordered three-effect sequence designed so any partial failure is
//! retryable against a store without multi-record atomicity.

use crate::db;
use crate::inventory::{ReferenceInventory, ReferenceSource};
use crate::merge::session::{merge_records, ChangesSummary, ExecutionReport, MergeSession, MergeState};
use chrono::Utc;
use lifehub_common::events::{EventBus, LifehubEvent};
use lifehub_common::{CorrelationHint, EntityRef, Error, Job, JobStatus, Result};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct MergeEngine {
    db: SqlitePool,
    events: EventBus,
    sources: Vec<ReferenceSource>,
    sessions: Arc<RwLock<HashMap<Uuid, MergeSession>>>,
    shutdown: CancellationToken,
}

impl MergeEngine {
    pub fn new(db: SqlitePool, events: EventBus, sources: Vec<ReferenceSource>) -> Self {
        Self {
            db,
            events,
            sources,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    fn inventory(&self) -> ReferenceInventory {
        ReferenceInventory::new(self.db.clone(), self.sources.clone())
    }

    /// Open a session: compare both records, compute the target's
    /// reference inventory, seed a baseline proposal, submit the analysis
    /// job
    pub async fn open(&self, source: EntityRef, target: EntityRef) -> Result<MergeSession> {
        if source == target {
            return Err(Error::InvalidInput(
                "cannot merge an entity into itself".to_string(),
            ));
        }

        let source_record = db::entities::get_entity(&self.db, &source).await?;
        let target_record = db::entities::get_entity(&self.db, &target).await?;

        let mut session = MergeSession::new(source.clone(), target.clone());
        session.reference_inventory = self.inventory().find_references_to(&target).await?;

        // baseline keeps the session usable even if analysis fails
        let (baseline, summary) = merge_records(&source_record, &target_record);
        session.proposal = Some(baseline.clone());
        session.changes_summary = Some(summary);

        // subscribe before submitting so the analysis completion cannot
        // slip between the store write and the watcher starting
        let rx = self.events.subscribe();

        let hint = CorrelationHint::for_entity(&EntityRef::new(
            "merge_session",
            session.session_id.to_string(),
        ));
        let metadata = json!({
            "correlation": hint.to_value(),
            "source": source,
            "target": target,
            "baseline": baseline,
        });
        let job = db::jobs::submit_job(&self.db, "merge_analysis", metadata).await?;
        session.analysis_job_id = Some(job.id.clone());

        self.events.emit_lossy(LifehubEvent::JobSubmitted {
            job_id: job.id.clone(),
            kind: job.kind.clone(),
            timestamp: Utc::now(),
        });
        self.events.emit_lossy(LifehubEvent::JobUpdated {
            job: job.clone(),
            timestamp: Utc::now(),
        });

        session.transition_to(MergeState::Analyzing)?;
        self.publish_state(&session, MergeState::Comparing);

        let snapshot = session.clone();
        let session_id = session.session_id;
        self.sessions.write().await.insert(session_id, session);

        let watcher = AnalysisWatcher {
            db: self.db.clone(),
            events: self.events.clone(),
            sessions: Arc::clone(&self.sessions),
            session_id,
            job_id: job.id,
            cancel: self.shutdown.child_token(),
        };
        tokio::spawn(watcher.run(rx));

        Ok(snapshot)
    }

    pub async fn get(&self, session_id: Uuid) -> Result<MergeSession> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("merge session {}", session_id)))
    }

    pub async fn list(&self) -> Vec<MergeSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Replace the proposal with a user-edited record
    pub async fn update_proposal(&self, session_id: Uuid, proposal: Value) -> Result<MergeSession> {
        if !proposal.is_object() {
            return Err(Error::InvalidInput(
                "merge proposal must be a JSON object".to_string(),
            ));
        }
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::NotFound(format!("merge session {}", session_id)))?;
        if session.state != MergeState::ProposalReady {
            return Err(Error::Conflict(format!(
                "proposal is editable only in proposal_ready, session is {}",
                session.state
            )));
        }
        session.proposal = Some(proposal);
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    /// Run the three-effect execution
    ///
    /// Ordered: source overwrite first (depends on nothing downstream),
    /// then reference rewrites from a fresh inventory, then archival of
    /// the target. Every effect is idempotent; calling again after a
    /// partial failure converges. The returned session carries the
    /// [`ExecutionReport`] for the attempt.
    pub async fn execute(&self, session_id: Uuid) -> Result<MergeSession> {
        let (source, target, proposal, old_state) = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(&session_id)
                .ok_or_else(|| Error::NotFound(format!("merge session {}", session_id)))?;
            let proposal = session.proposal.clone().ok_or_else(|| {
                Error::InvalidInput("merge session has no proposal to execute".to_string())
            })?;
            let old_state = session.state;
            session.transition_to(MergeState::Executing)?;
            (session.source.clone(), session.target.clone(), proposal, old_state)
        };
        self.publish_by_id(session_id, old_state).await;

        let mut report = ExecutionReport::default();
        let outcome = self
            .run_effects(&source, &target, &proposal, &mut report)
            .await;

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::NotFound(format!("merge session {}", session_id)))?;
        session.last_execution = Some(report);
        match outcome {
            Ok(()) => {
                session.error = None;
                session.transition_to(MergeState::Done)?;
            }
            Err(e) => {
                tracing::error!(
                    session_id = %session_id,
                    error = %e,
                    "Merge execution failed partway"
                );
                session.error = Some(e.to_string());
                session.transition_to(MergeState::Failed)?;
            }
        }
        let snapshot = session.clone();
        drop(sessions);
        self.publish_state(&snapshot, MergeState::Executing);
        Ok(snapshot)
    }

    async fn run_effects(
        &self,
        source: &EntityRef,
        target: &EntityRef,
        proposal: &Value,
        report: &mut ExecutionReport,
    ) -> Result<()> {
        db::entities::put_entity(&self.db, source, proposal)
            .await
            .map_err(|e| Error::Internal(format!("source overwrite failed: {}", e)))?;
        report.source_overwritten = true;

        // fresh inventory: references rewritten by an earlier partial
        // attempt no longer match and drop out on their own
        let items = self.inventory().find_references_to(target).await?;
        report.references_total = items.len();
        for item in &items {
            db::entities::rewrite_reference(
                &self.db,
                &item.collection,
                &item.id,
                &item.field_path,
                &target.entity_id,
                &source.entity_id,
            )
            .await
            .map_err(|e| {
                Error::Internal(format!(
                    "reference rewrite failed at {}/{} field {}: {}",
                    item.collection, item.id, item.field_path, e
                ))
            })?;
            report.references_rewritten += 1;
        }

        db::entities::archive_entity(&self.db, target, &source.entity_id)
            .await
            .map_err(|e| Error::Internal(format!("target archival failed: {}", e)))?;
        report.target_archived = true;

        tracing::info!(
            source = %source,
            target = %target,
            references = report.references_total,
            "Merge executed"
        );
        Ok(())
    }

    /// Drop a session before execution; zero side effects
    pub async fn abandon(&self, session_id: Uuid) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get(&session_id)
            .ok_or_else(|| Error::NotFound(format!("merge session {}", session_id)))?;
        if !session.abandonable() {
            return Err(Error::Conflict(format!(
                "merge session in {} can no longer be abandoned",
                session.state
            )));
        }
        let old_state = session.state;
        let session = sessions
            .remove(&session_id)
            .ok_or_else(|| Error::NotFound(format!("merge session {}", session_id)))?;
        drop(sessions);

        tracing::info!(session_id = %session_id, "Merge session abandoned");
        self.events.emit_lossy(LifehubEvent::MergeSessionUpdated {
            session_id: session.session_id,
            old_state: old_state.to_string(),
            new_state: "abandoned".to_string(),
            error: None,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn publish_state(&self, session: &MergeSession, old_state: MergeState) {
        self.events.emit_lossy(LifehubEvent::MergeSessionUpdated {
            session_id: session.session_id,
            old_state: old_state.to_string(),
            new_state: session.state.to_string(),
            error: session.error.clone(),
            timestamp: Utc::now(),
        });
    }

    async fn publish_by_id(&self, session_id: Uuid, old_state: MergeState) {
        if let Some(session) = self.sessions.read().await.get(&session_id) {
            self.publish_state(session, old_state);
        }
    }
}

/// Waits for one analysis job to reach a terminal status
struct AnalysisWatcher {
    db: SqlitePool,
    events: EventBus,
    sessions: Arc<RwLock<HashMap<Uuid, MergeSession>>>,
    session_id: Uuid,
    job_id: String,
    cancel: CancellationToken,
}

impl AnalysisWatcher {
    async fn run(self, mut rx: broadcast::Receiver<LifehubEvent>) {
        // the job may already be terminal by the time we start
        match db::jobs::try_get_job(&self.db, &self.job_id).await {
            Ok(Some(job)) if job.status.is_terminal() => {
                self.apply(&job).await;
                return;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(
                session_id = %self.session_id,
                error = %e,
                "Analysis watcher could not check job store"
            ),
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(LifehubEvent::JobUpdated { job, .. })
                        if job.id == self.job_id && job.status.is_terminal() =>
                    {
                        self.apply(&job).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Ok(Some(job)) = db::jobs::try_get_job(&self.db, &self.job_id).await {
                            if job.status.is_terminal() {
                                self.apply(&job).await;
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn apply(&self, job: &Job) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(&self.session_id) else {
            // abandoned while analyzing
            return;
        };
        if session.state != MergeState::Analyzing {
            return;
        }
        let old_state = session.state;

        let result = match job.status {
            JobStatus::Completed => {
                if let Some(result) = &job.result {
                    if let Some(proposal) = result.get("proposal").filter(|p| p.is_object()) {
                        session.proposal = Some(proposal.clone());
                    }
                    if let Some(summary) = result
                        .get("changes_summary")
                        .and_then(|s| serde_json::from_value::<ChangesSummary>(s.clone()).ok())
                    {
                        session.changes_summary = Some(summary);
                    }
                }
                session.transition_to(MergeState::ProposalReady)
            }
            JobStatus::Failed => {
                session.error = Some(
                    job.error
                        .clone()
                        .unwrap_or_else(|| "merge analysis job failed".to_string()),
                );
                session.transition_to(MergeState::Failed)
            }
            // guarded by callers
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::error!(
                session_id = %self.session_id,
                error = %e,
                "Analysis watcher could not advance session"
            );
            return;
        }

        let snapshot = session.clone();
        drop(sessions);
        self.events.emit_lossy(LifehubEvent::MergeSessionUpdated {
            session_id: snapshot.session_id,
            old_state: old_state.to_string(),
            new_state: snapshot.state.to_string(),
            error: snapshot.error.clone(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::default_sources;
    use std::time::Duration;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        db::init_schema(&pool).await.unwrap();
        pool
    }

    async fn seed_outfits(pool: &SqlitePool) {
        db::entities::put_entity(
            pool,
            &EntityRef::new("outfit", "o-main"),
            &json!({ "name": "Sundress", "color": "yellow" }),
        )
        .await
        .unwrap();
        db::entities::put_entity(
            pool,
            &EntityRef::new("outfit", "o-dup"),
            &json!({ "name": "Sundress", "season": "summer" }),
        )
        .await
        .unwrap();
    }

    fn engine(pool: &SqlitePool, events: &EventBus) -> MergeEngine {
        MergeEngine::new(pool.clone(), events.clone(), default_sources())
    }

    async fn complete_analysis(pool: &SqlitePool, events: &EventBus, job_id: &str, result: Value) {
        let job = db::jobs::update_job_status(
            pool,
            job_id,
            JobStatus::Completed,
            Some(100),
            Some(result),
            None,
        )
        .await
        .unwrap();
        events.emit_lossy(LifehubEvent::JobUpdated {
            job,
            timestamp: Utc::now(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_open_computes_inventory_and_submits_analysis() {
        let pool = test_pool().await;
        seed_outfits(&pool).await;
        db::entities::put_entity(
            &pool,
            &EntityRef::new("image", "i1"),
            &json!({ "outfit_id": "o-dup" }),
        )
        .await
        .unwrap();
        let events = EventBus::new(64);
        let engine = engine(&pool, &events);

        let session = engine
            .open(
                EntityRef::new("outfit", "o-main"),
                EntityRef::new("outfit", "o-dup"),
            )
            .await
            .unwrap();

        assert_eq!(session.state, MergeState::Analyzing);
        assert_eq!(session.reference_inventory.len(), 1);
        assert!(session.proposal.is_some(), "baseline proposal seeded");

        let job = db::jobs::get_job(&pool, session.analysis_job_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(job.kind, "merge_analysis");
        let hint = job.created_hint().unwrap();
        assert_eq!(hint.entity_type, "merge_session");
        assert_eq!(hint.entity_id, session.session_id.to_string());
    }

    #[tokio::test]
    async fn test_self_merge_rejected() {
        let pool = test_pool().await;
        seed_outfits(&pool).await;
        let events = EventBus::new(64);
        let engine = engine(&pool, &events);

        let err = engine
            .open(
                EntityRef::new("outfit", "o-main"),
                EntityRef::new("outfit", "o-main"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_analysis_completion_yields_proposal() {
        let pool = test_pool().await;
        seed_outfits(&pool).await;
        let events = EventBus::new(64);
        let engine = engine(&pool, &events);

        let session = engine
            .open(
                EntityRef::new("outfit", "o-main"),
                EntityRef::new("outfit", "o-dup"),
            )
            .await
            .unwrap();

        complete_analysis(
            &pool,
            &events,
            session.analysis_job_id.as_deref().unwrap(),
            json!({
                "proposal": { "name": "Sundress", "color": "yellow", "season": "summer" },
                "changes_summary": {
                    "fields_from_source": 2,
                    "fields_from_target": 1,
                    "fields_merged": 0
                }
            }),
        )
        .await;

        let session = engine.get(session.session_id).await.unwrap();
        assert_eq!(session.state, MergeState::ProposalReady);
        assert_eq!(session.proposal.unwrap()["season"], "summer");
        assert_eq!(session.changes_summary.unwrap().fields_from_target, 1);
    }

    #[tokio::test]
    async fn test_analysis_failure_fails_session() {
        let pool = test_pool().await;
        seed_outfits(&pool).await;
        let events = EventBus::new(64);
        let engine = engine(&pool, &events);

        let session = engine
            .open(
                EntityRef::new("outfit", "o-main"),
                EntityRef::new("outfit", "o-dup"),
            )
            .await
            .unwrap();

        let job = db::jobs::update_job_status(
            &pool,
            session.analysis_job_id.as_deref().unwrap(),
            JobStatus::Failed,
            None,
            None,
            Some("provider quota exhausted".to_string()),
        )
        .await
        .unwrap();
        events.emit_lossy(LifehubEvent::JobUpdated {
            job,
            timestamp: Utc::now(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let session = engine.get(session.session_id).await.unwrap();
        assert_eq!(session.state, MergeState::Failed);
        assert_eq!(session.error.as_deref(), Some("provider quota exhausted"));
    }

    #[tokio::test]
    async fn test_execute_rewrites_references_and_archives_target() {
        let pool = test_pool().await;
        seed_outfits(&pool).await;
        db::entities::put_entity(
            &pool,
            &EntityRef::new("story", "s1"),
            &json!({ "outfits": ["o-dup"] }),
        )
        .await
        .unwrap();
        db::entities::put_entity(
            &pool,
            &EntityRef::new("image", "i1"),
            &json!({ "outfit_id": "o-dup" }),
        )
        .await
        .unwrap();
        let events = EventBus::new(64);
        let engine = engine(&pool, &events);

        let session = engine
            .open(
                EntityRef::new("outfit", "o-main"),
                EntityRef::new("outfit", "o-dup"),
            )
            .await
            .unwrap();
        complete_analysis(
            &pool,
            &events,
            session.analysis_job_id.as_deref().unwrap(),
            json!({ "proposal": { "name": "Sundress", "color": "yellow", "season": "summer" } }),
        )
        .await;

        let session = engine.execute(session.session_id).await.unwrap();
        assert_eq!(session.state, MergeState::Done);
        let report = session.last_execution.unwrap();
        assert!(report.complete());
        assert_eq!(report.references_total, 2);

        let source = db::entities::get_entity(&pool, &EntityRef::new("outfit", "o-main"))
            .await
            .unwrap();
        assert_eq!(source["season"], "summer");

        let story = db::entities::get_entity(&pool, &EntityRef::new("story", "s1"))
            .await
            .unwrap();
        assert_eq!(story["outfits"], json!(["o-main"]));
        let image = db::entities::get_entity(&pool, &EntityRef::new("image", "i1"))
            .await
            .unwrap();
        assert_eq!(image["outfit_id"], "o-main");

        let target = db::entities::try_get_entity(&pool, &EntityRef::new("outfit", "o-dup"))
            .await
            .unwrap()
            .unwrap();
        assert!(target.archived);
        assert_eq!(target.merged_into.as_deref(), Some("o-main"));
    }

    #[tokio::test]
    async fn test_abandon_before_execute_leaves_store_unchanged() {
        let pool = test_pool().await;
        seed_outfits(&pool).await;
        db::entities::put_entity(
            &pool,
            &EntityRef::new("image", "i1"),
            &json!({ "outfit_id": "o-dup" }),
        )
        .await
        .unwrap();
        let events = EventBus::new(64);
        let engine = engine(&pool, &events);

        let before_main = db::entities::get_entity(&pool, &EntityRef::new("outfit", "o-main"))
            .await
            .unwrap();
        let before_dup = db::entities::get_entity(&pool, &EntityRef::new("outfit", "o-dup"))
            .await
            .unwrap();

        let session = engine
            .open(
                EntityRef::new("outfit", "o-main"),
                EntityRef::new("outfit", "o-dup"),
            )
            .await
            .unwrap();
        engine.abandon(session.session_id).await.unwrap();

        assert!(engine.get(session.session_id).await.is_err());
        let after_main = db::entities::get_entity(&pool, &EntityRef::new("outfit", "o-main"))
            .await
            .unwrap();
        let after_dup = db::entities::try_get_entity(&pool, &EntityRef::new("outfit", "o-dup"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before_main, after_main);
        assert_eq!(before_dup, after_dup.record);
        assert!(!after_dup.archived);
        let image = db::entities::get_entity(&pool, &EntityRef::new("image", "i1"))
            .await
            .unwrap();
        assert_eq!(image["outfit_id"], "o-dup");
    }

    #[tokio::test]
    async fn test_update_proposal_requires_proposal_ready() {
        let pool = test_pool().await;
        seed_outfits(&pool).await;
        let events = EventBus::new(64);
        let engine = engine(&pool, &events);

        let session = engine
            .open(
                EntityRef::new("outfit", "o-main"),
                EntityRef::new("outfit", "o-dup"),
            )
            .await
            .unwrap();

        // still analyzing
        assert!(engine
            .update_proposal(session.session_id, json!({ "name": "edited" }))
            .await
            .is_err());

        complete_analysis(
            &pool,
            &events,
            session.analysis_job_id.as_deref().unwrap(),
            json!({ "proposal": { "name": "Sundress" } }),
        )
        .await;

        let updated = engine
            .update_proposal(session.session_id, json!({ "name": "edited" }))
            .await
            .unwrap();
        assert_eq!(updated.proposal.unwrap()["name"], "edited");
    }
}
