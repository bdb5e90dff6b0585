//! Job-to-entity correlation and watch sessions
//!
//! A watch session observes one entity. On start it subscribes to the
//! event bus FIRST, then reconciles against the job store, then consumes
//! live events — so a job transition can be delivered at most twice
//! (reconciliation plus live event), never zero times. Duplicate delivery
//! is absorbed by [`PreviewState`]'s idempotent terminal handling.
//!
//! If the broadcast receiver reports lag, the session treats its view as
//! suspect and re-reconciles against the store instead of guessing which
//! events were dropped.

use crate::backoff::{self, RetryPolicy};
use crate::db;
use crate::preview::{PreviewSnapshot, PreviewState};
use lifehub_common::config::SecondJobPolicy;
use lifehub_common::events::{EventBus, LifehubEvent};
use lifehub_common::{EntityRef, Error, Job, JobFilter, JobStatus, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How a job snapshot was matched to the observed entity
///
/// Rules are checked in this order; the first hit wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    /// Job id equals the session's currently tracked job
    TrackedJob,
    /// Correlation hint embedded in `created_metadata`
    CreatedHint,
    /// Correlation hint embedded in the result payload
    ResultHint,
    /// Top-level `entity_id` in the result (older workers)
    LegacyField,
}

/// Match a job snapshot against an observed entity
///
/// `tracked` is the watch session's currently tracked job id, if any.
pub fn match_job(job: &Job, entity: &EntityRef, tracked: Option<&str>) -> Option<MatchRule> {
    if matches!(tracked, Some(t) if t == job.id) {
        return Some(MatchRule::TrackedJob);
    }
    if matches!(job.created_hint(), Some(h) if h.matches(entity)) {
        return Some(MatchRule::CreatedHint);
    }
    if matches!(job.result_hint(), Some(h) if h.matches(entity)) {
        return Some(MatchRule::ResultHint);
    }
    if matches!(job.legacy_result_entity_id(), Some(id) if id == entity.entity_id) {
        return Some(MatchRule::LegacyField);
    }
    None
}

struct WatchEntry {
    entity: EntityRef,
    snapshot: Arc<RwLock<PreviewSnapshot>>,
    cancel: CancellationToken,
}

/// Summary of one active watch session, for listings
#[derive(Debug, Clone, serde::Serialize)]
pub struct WatchInfo {
    pub watch_id: Uuid,
    pub entity: EntityRef,
}

/// Registry of active watch sessions
///
/// Owns session lifecycle; each session runs as a spawned task that is
/// cancelled when the watch ends or the registry shuts down.
pub struct Correlator {
    db: SqlitePool,
    events: EventBus,
    policy: SecondJobPolicy,
    retry: RetryPolicy,
    watches: Arc<RwLock<HashMap<Uuid, WatchEntry>>>,
    shutdown: CancellationToken,
}

impl Correlator {
    pub fn new(db: SqlitePool, events: EventBus, policy: SecondJobPolicy, retry: RetryPolicy) -> Self {
        Self {
            db,
            events,
            policy,
            retry,
            watches: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start observing an entity; returns the watch id
    ///
    /// Subscribes to the bus before querying the store, then applies every
    /// in-flight job matching the entity so work submitted before the
    /// watch began is surfaced immediately.
    pub async fn begin_observing(&self, entity: EntityRef) -> Result<Uuid> {
        // subscribe before reconciling; events arriving during the store
        // query queue in the receiver instead of being lost
        let rx = self.events.subscribe();

        let initial_asset = match db::entities::try_get_entity(&self.db, &entity).await? {
            Some(rec) => rec
                .record
                .get("asset_ref")
                .and_then(|v| v.as_str())
                .map(String::from),
            None => None,
        };

        let mut state = PreviewState::new(entity.clone(), initial_asset);
        reconcile_in_flight(&self.db, &mut state, self.policy).await?;

        let watch_id = Uuid::new_v4();
        let snapshot = Arc::new(RwLock::new(state.snapshot()));
        let cancel = self.shutdown.child_token();

        self.watches.write().await.insert(
            watch_id,
            WatchEntry {
                entity: entity.clone(),
                snapshot: Arc::clone(&snapshot),
                cancel: cancel.clone(),
            },
        );

        tracing::info!(
            watch_id = %watch_id,
            entity = %entity,
            phase = %state.phase(),
            "Watch session started"
        );

        self.publish_preview(watch_id, &state.snapshot());

        let session = WatchSession {
            db: self.db.clone(),
            events: self.events.clone(),
            policy: self.policy,
            retry: self.retry,
            watch_id,
            snapshot,
            cancel,
        };
        tokio::spawn(session.run(state, rx));

        Ok(watch_id)
    }

    /// Stop observing; idempotent
    pub async fn end_observing(&self, watch_id: Uuid) -> bool {
        match self.watches.write().await.remove(&watch_id) {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::info!(watch_id = %watch_id, entity = %entry.entity, "Watch session ended");
                true
            }
            None => false,
        }
    }

    /// Current preview snapshot for a watch
    pub async fn snapshot(&self, watch_id: Uuid) -> Result<PreviewSnapshot> {
        let watches = self.watches.read().await;
        let entry = watches
            .get(&watch_id)
            .ok_or_else(|| Error::NotFound(format!("watch {}", watch_id)))?;
        let snapshot = entry.snapshot.read().await.clone();
        Ok(snapshot)
    }

    pub async fn list_watches(&self) -> Vec<WatchInfo> {
        self.watches
            .read()
            .await
            .iter()
            .map(|(id, entry)| WatchInfo {
                watch_id: *id,
                entity: entry.entity.clone(),
            })
            .collect()
    }

    /// Cancel every session task
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn publish_preview(&self, watch_id: Uuid, snap: &PreviewSnapshot) {
        self.events.emit_lossy(preview_event(watch_id, snap));
    }
}

fn preview_event(watch_id: Uuid, snap: &PreviewSnapshot) -> LifehubEvent {
    LifehubEvent::PreviewUpdated {
        watch_id,
        entity_type: snap.entity.entity_type.clone(),
        entity_id: snap.entity.entity_id.clone(),
        phase: snap.phase.to_string(),
        progress: snap.progress,
        asset_url: snap.asset_url.clone(),
        last_error: snap.last_error.clone(),
        timestamp: Utc::now(),
    }
}

/// Apply every in-flight job matching the entity, oldest first
async fn reconcile_in_flight(
    db: &SqlitePool,
    state: &mut PreviewState,
    policy: SecondJobPolicy,
) -> Result<()> {
    let jobs = db::jobs::list_jobs(db, &JobFilter::in_flight().with_hint(state.entity())).await?;
    for job in &jobs {
        state.apply(job, policy);
    }
    if !jobs.is_empty() {
        tracing::debug!(
            entity = %state.entity(),
            count = jobs.len(),
            phase = %state.phase(),
            "Reconciled in-flight jobs"
        );
    }
    Ok(())
}

/// Apply every job matching the entity, oldest first
///
/// Used after broadcast lag, where terminal transitions may have been
/// dropped; idempotent terminal handling makes re-application safe.
async fn reconcile_all(
    db: &SqlitePool,
    state: &mut PreviewState,
    policy: SecondJobPolicy,
) -> Result<bool> {
    let jobs = db::jobs::list_jobs(db, &JobFilter::default().with_hint(state.entity())).await?;
    let mut changed = false;
    for job in &jobs {
        changed |= state.apply(job, policy);
    }
    Ok(changed)
}

struct WatchSession {
    db: SqlitePool,
    events: EventBus,
    policy: SecondJobPolicy,
    retry: RetryPolicy,
    watch_id: Uuid,
    snapshot: Arc<RwLock<PreviewSnapshot>>,
    cancel: CancellationToken,
}

impl WatchSession {
    async fn run(self, mut state: PreviewState, mut rx: broadcast::Receiver<LifehubEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!(watch_id = %self.watch_id, "Watch session task stopping");
                    break;
                }
                event = rx.recv() => match event {
                    Ok(LifehubEvent::JobUpdated { job, .. }) => {
                        if let Err(e) = self.handle_job(&mut state, &job).await {
                            tracing::warn!(
                                watch_id = %self.watch_id,
                                job_id = %job.id,
                                error = %e,
                                "Failed to apply job update"
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(
                            watch_id = %self.watch_id,
                            missed = missed,
                            "Event stream lagged; re-reconciling from store"
                        );
                        match reconcile_all(&self.db, &mut state, self.policy).await {
                            Ok(true) => self.publish(&state).await,
                            Ok(false) => {}
                            Err(e) => tracing::error!(
                                watch_id = %self.watch_id,
                                error = %e,
                                "Re-reconciliation after lag failed"
                            ),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn handle_job(&self, state: &mut PreviewState, job: &Job) -> Result<()> {
        let Some(rule) = match_job(job, state.entity(), state.tracked_job_id()) else {
            return Ok(());
        };
        tracing::debug!(
            watch_id = %self.watch_id,
            job_id = %job.id,
            status = %job.status,
            rule = ?rule,
            "Job matched observed entity"
        );

        // the asset store can lag the completion event; confirm the
        // entity record reflects the announced asset before showing it
        let mut delay_note = None;
        if job.status == JobStatus::Completed {
            if let Some(asset) = job.result_field("asset_ref") {
                if let Err(e) = self.confirm_asset_readable(state.entity(), asset).await {
                    delay_note = Some(format!("asset not yet readable: {}", e));
                }
            }
        }

        if state.apply(job, self.policy) {
            if let Some(note) = delay_note {
                state.note_asset_delay(note);
            }
            self.publish(state).await;
        }
        Ok(())
    }

    /// Poll until the entity record carries the announced asset pointer
    async fn confirm_asset_readable(&self, entity: &EntityRef, asset: &str) -> Result<()> {
        let db = self.db.clone();
        let entity = entity.clone();
        let asset = asset.to_string();
        backoff::retry(&self.retry, "asset readability", || {
            let db = db.clone();
            let entity = entity.clone();
            let asset = asset.clone();
            async move {
                let rec = db::entities::try_get_entity(&db, &entity).await?;
                let readable = matches!(
                    rec.as_ref()
                        .and_then(|r| r.record.get("asset_ref"))
                        .and_then(|v| v.as_str()),
                    Some(stored) if stored == asset
                );
                if readable {
                    Ok(())
                } else {
                    Err(Error::NotFound(format!("asset {} for {}", asset, entity)))
                }
            }
        })
        .await
    }

    async fn publish(&self, state: &PreviewState) {
        let snap = state.snapshot();
        *self.snapshot.write().await = snap.clone();
        self.events.emit_lossy(preview_event(self.watch_id, &snap));
    }
}
