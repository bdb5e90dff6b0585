//! Event types for the lifehub event system
//!
//! Provides the central event enum and EventBus shared by all components
//! inside a service process. Events are broadcast via the EventBus and can
//! be serialized for SSE transmission.

use crate::job::Job;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Lifehub event types
///
/// All events use this central enum for type safety and exhaustive
/// matching; SSE streams filter on variants and serialize with the `type`
/// tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LifehubEvent {
    /// A job was submitted to the job store
    ///
    /// Triggers:
    /// - SSE: show pending generation indicator
    JobSubmitted {
        /// Opaque job identifier
        job_id: String,
        /// Job kind (e.g., "image_generation", "merge_analysis")
        kind: String,
        /// When the job was submitted
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A job's state changed; carries the full fresh snapshot
    ///
    /// One event per state change, in the order the job store applied
    /// them. This is the stream the correlator consumes.
    ///
    /// Triggers:
    /// - Correlator: match against observed entities
    /// - Merge engine: detect analysis completion
    /// - SSE: job monitoring views
    JobUpdated {
        /// Fresh job snapshot after the change
        job: Job,
        /// When the change was applied
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An observed entity's preview state changed
    ///
    /// Triggers:
    /// - SSE: update the entity's preview panel
    PreviewUpdated {
        /// Watch this update belongs to (previews are per-observer)
        watch_id: Uuid,
        /// Observed entity collection
        entity_type: String,
        /// Observed entity id
        entity_id: String,
        /// Preview phase ("idle", "discovered", "generating",
        /// "completed", "failed")
        phase: String,
        /// Progress percentage, if known
        progress: Option<u8>,
        /// Cache-busted asset URL, if any
        asset_url: Option<String>,
        /// Last surfaced error, if any
        last_error: Option<String>,
        /// When the preview changed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A merge session transitioned between states
    ///
    /// Triggers:
    /// - SSE: merge dialog state updates
    MergeSessionUpdated {
        /// Merge session identifier
        session_id: Uuid,
        /// State before the transition
        old_state: String,
        /// State after the transition
        new_state: String,
        /// Error detail when new_state is "failed"
        error: Option<String>,
        /// When the transition happened
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl LifehubEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            LifehubEvent::JobSubmitted { .. } => "JobSubmitted",
            LifehubEvent::JobUpdated { .. } => "JobUpdated",
            LifehubEvent::PreviewUpdated { .. } => "PreviewUpdated",
            LifehubEvent::MergeSessionUpdated { .. } => "MergeSessionUpdated",
        }
    }
}

/// Central event distribution bus for application-wide events
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers over one upstream channel
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
///
/// A lagging receiver sees `RecvError::Lagged` rather than silently losing
/// its place; the correlator treats that gap as a first-class concern and
/// re-runs its reconciliation query.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifehubEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity
    ///
    /// Capacity is the number of events buffered before the slowest
    /// subscriber starts lagging. 1000 is a sensible desktop default;
    /// tests use 10-100.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Returns a receiver that will receive all events emitted after
    /// subscription. Events emitted before subscription are not received;
    /// callers that need pre-subscription state run a reconciliation query
    /// against the job store.
    pub fn subscribe(&self) -> broadcast::Receiver<LifehubEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists,
    /// `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: LifehubEvent,
    ) -> Result<usize, broadcast::error::SendError<LifehubEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    ///
    /// Used for events where it is acceptable that no component is
    /// currently listening (e.g., preview updates with no SSE client).
    pub fn emit_lossy(&self, event: LifehubEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
