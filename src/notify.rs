//! Lifecycle notifications for UI and monitoring collaborators.
//!
//! The manager emits a [`PipelineEvent`] at every lifecycle transition.
//! Consumers attach in one of two ways:
//!
//! * **Listeners**: an [`Arc<dyn EventListener>`] called synchronously on the
//!   emitting task. Cheap, ordered, and the way the
//!   [`crate::progress::ProgressTracker`] and the CLI progress bar hook in.
//! * **Subscriptions**: [`Notifier::subscribe`] returns an unbounded channel
//!   filtered by [`EventKind`], for consumers that live on their own task
//!   (a WebSocket bridge, a database writer, …).
//!
//! Within one run, delivery order matches emission order for both styles.
//!
//! # Example
//!
//! ```rust
//! use edgequake_docpipe::notify::{EventKind, EventListener, Notifier, PipelineEvent};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct FailureCounter(AtomicUsize);
//!
//! impl EventListener for FailureCounter {
//!     fn on_event(&self, event: &PipelineEvent) {
//!         if event.kind == EventKind::StageFailed {
//!             self.0.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! }
//!
//! let notifier = Notifier::new();
//! notifier.add_listener(Arc::new(FailureCounter(AtomicUsize::new(0))));
//! ```

use crate::run::{RunStatus, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// Event type. Serialised as the dotted names used on the wire
/// (`pipeline.started`, `stage.failed`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "pipeline.started")]
    PipelineStarted,
    #[serde(rename = "pipeline.completed")]
    PipelineCompleted,
    #[serde(rename = "pipeline.failed")]
    PipelineFailed,
    #[serde(rename = "pipeline.cancelled")]
    PipelineCancelled,
    #[serde(rename = "stage.started")]
    StageStarted,
    #[serde(rename = "stage.completed")]
    StageCompleted,
    #[serde(rename = "stage.failed")]
    StageFailed,
    #[serde(rename = "stage.skipped")]
    StageSkipped,
    #[serde(rename = "task.progress")]
    TaskProgress,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::PipelineStarted,
        EventKind::PipelineCompleted,
        EventKind::PipelineFailed,
        EventKind::PipelineCancelled,
        EventKind::StageStarted,
        EventKind::StageCompleted,
        EventKind::StageFailed,
        EventKind::StageSkipped,
        EventKind::TaskProgress,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::PipelineStarted => "pipeline.started",
            EventKind::PipelineCompleted => "pipeline.completed",
            EventKind::PipelineFailed => "pipeline.failed",
            EventKind::PipelineCancelled => "pipeline.cancelled",
            EventKind::StageStarted => "stage.started",
            EventKind::StageCompleted => "stage.completed",
            EventKind::StageFailed => "stage.failed",
            EventKind::StageSkipped => "stage.skipped",
            EventKind::TaskProgress => "task.progress",
        }
    }

    /// The terminal pipeline event for a final run status.
    pub fn for_run_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Cancelled => EventKind::PipelineCancelled,
            RunStatus::Failed => EventKind::PipelineFailed,
            _ => EventKind::PipelineCompleted,
        }
    }

    /// The stage event for a terminal stage status.
    pub fn for_stage_status(status: StageStatus) -> Self {
        match status {
            StageStatus::Failed => EventKind::StageFailed,
            StageStatus::Skipped => EventKind::StageSkipped,
            StageStatus::Pending | StageStatus::Running => EventKind::StageStarted,
            StageStatus::Completed => EventKind::StageCompleted,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific event body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Pipeline {
        pipeline_name: String,
        document_id: String,
        status: RunStatus,
        total_stages: usize,
        completed: usize,
        failed: usize,
        skipped: usize,
        dry_run: bool,
    },
    Stage {
        stage_type: String,
        status: StageStatus,
        duration_ms: Option<u64>,
        /// Failure message or skip reason.
        detail: Option<String>,
    },
    Progress {
        current: u64,
        total: u64,
        fraction: f64,
        message: Option<String>,
    },
}

/// A structured lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub kind: EventKind,
    pub run_id: Uuid,
    pub stage_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl PipelineEvent {
    pub fn new(
        kind: EventKind,
        run_id: Uuid,
        stage_name: Option<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            kind,
            run_id,
            stage_name,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// A `task.progress` event. `fraction` is clamped to `0.0..=1.0`.
    pub fn progress(
        run_id: Uuid,
        stage_name: impl Into<String>,
        current: u64,
        total: u64,
        message: Option<String>,
    ) -> Self {
        let fraction = if total == 0 {
            0.0
        } else {
            (current as f64 / total as f64).clamp(0.0, 1.0)
        };
        Self::new(
            EventKind::TaskProgress,
            run_id,
            Some(stage_name.into()),
            EventPayload::Progress {
                current,
                total,
                fraction,
                message,
            },
        )
    }
}

/// Receives every event synchronously, in emission order.
///
/// Implementations must be `Send + Sync`: stages report sub-progress from
/// worker tasks while the manager emits from its own loop. Keep `on_event`
/// fast; hand heavy work to another task.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// Ignores everything.
pub struct NoopListener;

impl EventListener for NoopListener {
    fn on_event(&self, _event: &PipelineEvent) {}
}

struct Subscriber {
    kinds: Option<HashSet<EventKind>>,
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl Subscriber {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map_or(true, |k| k.contains(&kind))
    }
}

/// Fan-out point for [`PipelineEvent`]s.
#[derive(Default)]
pub struct Notifier {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.read().map(|l| l.len()).unwrap_or(0);
        let subscribers = self.subscribers.lock().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("Notifier")
            .field("listeners", &listeners)
            .field("subscribers", &subscribers)
            .finish()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Subscribe to the given kinds. An empty slice subscribes to everything.
    ///
    /// The subscription ends when the receiver is dropped.
    pub fn subscribe(&self, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<PipelineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let kinds = if kinds.is_empty() {
            None
        } else {
            Some(kinds.iter().copied().collect())
        };
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber { kinds, tx });
        rx
    }

    /// [`Notifier::subscribe`] as a `Stream`.
    pub fn subscribe_stream(&self, kinds: &[EventKind]) -> UnboundedReceiverStream<PipelineEvent> {
        UnboundedReceiverStream::new(self.subscribe(kinds))
    }

    /// Deliver an event to every listener and matching subscriber.
    pub fn emit(&self, event: PipelineEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for l in &listeners {
            l.on_event(&event);
        }

        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        // Closed receivers are pruned as we go.
        subs.retain(|s| !s.wants(event.kind) || s.tx.send(event.clone()).is_ok());
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }
}
