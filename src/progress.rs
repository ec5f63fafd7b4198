//! Progress aggregation over lifecycle notifications.
//!
//! [`ProgressTracker`] is a pure observer. It implements
//! [`EventListener`] and rebuilds its views from `pipeline.*`, `stage.*`
//! and `task.progress` events, so it can be discarded and re-attached at
//! any time without affecting the run.
//!
//! # Progress model
//!
//! Each stage contributes equally. A terminal stage (completed, failed or
//! skipped) counts as 1.0; a running stage counts as its last reported
//! sub-progress fraction, or 0.0 if it never reported any.
//!
//! `estimated_remaining` is a linear extrapolation of elapsed time over the
//! progress fraction. It is an approximation, not a guarantee: stages of
//! very different cost skew it.
//!
//! # Example
//!
//! ```rust
//! use edgequake_docpipe::progress::ProgressTracker;
//! use edgequake_docpipe::notify::Notifier;
//! use std::sync::Arc;
//!
//! let notifier = Notifier::new();
//! let tracker = Arc::new(ProgressTracker::new());
//! notifier.add_listener(tracker.clone());
//! assert!(tracker.latest().is_none());
//! ```

use crate::notify::{EventKind, EventListener, EventPayload, PipelineEvent};
use crate::run::{RunStatus, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Finished runs kept for querying.
const MAX_TRACKED_RUNS: usize = 64;

/// Most recent durations kept per stage type.
const MAX_DURATION_SAMPLES: usize = 512;

/// Progress of one stage within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub stage_name: String,
    pub stage_type: Option<String>,
    pub status: StageStatus,
    /// Fraction complete, `0.0..=1.0`.
    pub progress: f64,
    pub current_step: u64,
    pub total_steps: u64,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskProgress {
    fn new(stage_name: &str, at: DateTime<Utc>) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            stage_type: None,
            status: StageStatus::Running,
            progress: 0.0,
            current_step: 0,
            total_steps: 0,
            message: None,
            started_at: at,
            updated_at: at,
            completed_at: None,
        }
    }

    /// Contribution to the pipeline-level fraction.
    fn weight(&self) -> f64 {
        if self.status.is_terminal() {
            1.0
        } else {
            self.progress
        }
    }

    /// Linear extrapolation from elapsed time and fraction.
    pub fn estimated_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.status.is_terminal() {
            return Some(Duration::ZERO);
        }
        extrapolate(self.started_at, now, self.progress)
    }
}

/// Aggregate progress of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineProgress {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub document_id: String,
    pub status: RunStatus,
    pub total_stages: usize,
    pub tasks: BTreeMap<String, TaskProgress>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineProgress {
    /// Fraction complete, `0.0..=1.0`, weighting stages equally.
    pub fn progress(&self) -> f64 {
        if self.total_stages == 0 {
            return if self.finished_at.is_some() { 1.0 } else { 0.0 };
        }
        let sum: f64 = self.tasks.values().map(TaskProgress::weight).sum();
        (sum / self.total_stages as f64).clamp(0.0, 1.0)
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Stages that reached a terminal state.
    pub fn finished_stages(&self) -> usize {
        self.tasks.values().filter(|t| t.status.is_terminal()).count()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        let end = self.finished_at.unwrap_or(now);
        (end - self.started_at).to_std().unwrap_or_default()
    }

    /// Approximate time to completion. `None` until some progress exists.
    pub fn estimated_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.is_finished() {
            return Some(Duration::ZERO);
        }
        extrapolate(self.started_at, now, self.progress())
    }
}

/// Duration statistics for one stage type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub count: usize,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DurationStats {
    fn from_samples<'a>(samples: impl IntoIterator<Item = &'a u64>) -> Option<Self> {
        let mut sorted: Vec<u64> = samples.into_iter().copied().collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();
        let n = sorted.len();
        let mean_ms = sorted.iter().sum::<u64>() as f64 / n as f64;
        let median_ms = if n % 2 == 1 {
            sorted[n / 2] as f64
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) as f64 / 2.0
        };
        Some(Self {
            count: n,
            mean_ms,
            median_ms,
            min_ms: sorted[0],
            max_ms: sorted[n - 1],
        })
    }
}

#[derive(Default)]
struct TrackerState {
    runs: HashMap<Uuid, PipelineProgress>,
    order: Vec<Uuid>,
    durations: HashMap<String, VecDeque<u64>>,
}

impl TrackerState {
    fn task_mut(&mut self, run_id: Uuid, stage: &str, at: DateTime<Utc>) -> Option<&mut TaskProgress> {
        let run = self.runs.get_mut(&run_id)?;
        Some(
            run.tasks
                .entry(stage.to_string())
                .or_insert_with(|| TaskProgress::new(stage, at)),
        )
    }

    fn evict(&mut self) {
        while self.order.len() > MAX_TRACKED_RUNS {
            let oldest = self.order.remove(0);
            self.runs.remove(&oldest);
        }
    }
}

/// Observer that maintains [`TaskProgress`] and [`PipelineProgress`] views
/// and per-stage-type duration statistics.
#[derive(Default)]
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let runs = self.state.lock().map(|s| s.runs.len()).unwrap_or(0);
        f.debug_struct("ProgressTracker").field("runs", &runs).finish()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one run.
    pub fn run(&self, run_id: Uuid) -> Option<PipelineProgress> {
        self.lock().runs.get(&run_id).cloned()
    }

    /// Snapshot of the most recently started run.
    pub fn latest(&self) -> Option<PipelineProgress> {
        let state = self.lock();
        state
            .order
            .last()
            .and_then(|id| state.runs.get(id))
            .cloned()
    }

    /// Snapshot of one stage within a run.
    pub fn task(&self, run_id: Uuid, stage: &str) -> Option<TaskProgress> {
        self.lock()
            .runs
            .get(&run_id)
            .and_then(|r| r.tasks.get(stage))
            .cloned()
    }

    /// Duration statistics for a stage type, across every observed run.
    pub fn duration_stats(&self, stage_type: &str) -> Option<DurationStats> {
        self.lock()
            .durations
            .get(stage_type)
            .and_then(|s| DurationStats::from_samples(s))
    }

    /// Duration statistics for every stage type seen so far.
    pub fn all_duration_stats(&self) -> BTreeMap<String, DurationStats> {
        self.lock()
            .durations
            .iter()
            .filter_map(|(k, v)| DurationStats::from_samples(v).map(|s| (k.clone(), s)))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply(&self, event: &PipelineEvent) {
        let mut state = self.lock();
        let at = event.timestamp;

        match (&event.kind, &event.payload) {
            (
                EventKind::PipelineStarted,
                EventPayload::Pipeline {
                    pipeline_name,
                    document_id,
                    total_stages,
                    ..
                },
            ) => {
                state.runs.insert(
                    event.run_id,
                    PipelineProgress {
                        run_id: event.run_id,
                        pipeline_name: pipeline_name.clone(),
                        document_id: document_id.clone(),
                        status: RunStatus::Running,
                        total_stages: *total_stages,
                        tasks: BTreeMap::new(),
                        started_at: at,
                        finished_at: None,
                    },
                );
                state.order.retain(|id| *id != event.run_id);
                state.order.push(event.run_id);
                state.evict();
            }

            (
                EventKind::PipelineCompleted | EventKind::PipelineFailed | EventKind::PipelineCancelled,
                EventPayload::Pipeline { status, .. },
            ) => {
                if let Some(run) = state.runs.get_mut(&event.run_id) {
                    run.status = *status;
                    run.finished_at = Some(at);
                }
            }

            (
                kind @ (EventKind::StageStarted
                | EventKind::StageCompleted
                | EventKind::StageFailed
                | EventKind::StageSkipped),
                EventPayload::Stage {
                    stage_type,
                    status,
                    duration_ms,
                    detail,
                },
            ) => {
                let Some(stage) = event.stage_name.as_deref() else {
                    return;
                };
                if *kind == EventKind::StageCompleted {
                    if let Some(ms) = duration_ms {
                        let series = state.durations.entry(stage_type.clone()).or_default();
                        if series.len() == MAX_DURATION_SAMPLES {
                            series.pop_front();
                        }
                        series.push_back(*ms);
                    }
                }
                if let Some(task) = state.task_mut(event.run_id, stage, at) {
                    task.stage_type = Some(stage_type.clone());
                    task.status = *status;
                    task.updated_at = at;
                    if *kind == EventKind::StageStarted {
                        task.started_at = at;
                    } else {
                        task.completed_at = Some(at);
                        task.message = detail.clone();
                        if *status == StageStatus::Completed {
                            task.progress = 1.0;
                        }
                    }
                }
            }

            (
                EventKind::TaskProgress,
                EventPayload::Progress {
                    current,
                    total,
                    fraction,
                    message,
                },
            ) => {
                let Some(stage) = event.stage_name.as_deref() else {
                    return;
                };
                if let Some(task) = state.task_mut(event.run_id, stage, at) {
                    if !task.status.is_terminal() {
                        task.progress = *fraction;
                        task.current_step = *current;
                        task.total_steps = *total;
                        task.message = message.clone();
                        task.updated_at = at;
                    }
                }
            }

            _ => {}
        }
    }
}

impl EventListener for ProgressTracker {
    fn on_event(&self, event: &PipelineEvent) {
        self.apply(event);
    }
}

fn extrapolate(started: DateTime<Utc>, now: DateTime<Utc>, fraction: f64) -> Option<Duration> {
    if fraction <= 0.0 {
        return None;
    }
    let elapsed = (now - started).to_std().unwrap_or_default().as_secs_f64();
    let remaining = elapsed * (1.0 - fraction) / fraction;
    Some(Duration::from_secs_f64(remaining.max(0.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn pipeline_event(kind: EventKind, run_id: Uuid, status: RunStatus, total: usize) -> PipelineEvent {
        PipelineEvent::new(
            kind,
            run_id,
            None,
            EventPayload::Pipeline {
                pipeline_name: "p".into(),
                document_id: "doc".into(),
                status,
                total_stages: total,
                completed: 0,
                failed: 0,
                skipped: 0,
                dry_run: false,
            },
        )
    }

    fn stage_event(
        kind: EventKind,
        run_id: Uuid,
        stage: &str,
        status: StageStatus,
        duration_ms: Option<u64>,
    ) -> PipelineEvent {
        PipelineEvent::new(
            kind,
            run_id,
            Some(stage.into()),
            EventPayload::Stage {
                stage_type: "ocr".into(),
                status,
                duration_ms,
                detail: None,
            },
        )
    }

    #[test]
    fn pipeline_progress_weights_stages_equally() {
        let t = ProgressTracker::new();
        let run = Uuid::new_v4();
        t.on_event(&pipeline_event(EventKind::PipelineStarted, run, RunStatus::Running, 4));
        t.on_event(&stage_event(EventKind::StageStarted, run, "a", StageStatus::Running, None));
        t.on_event(&stage_event(EventKind::StageCompleted, run, "a", StageStatus::Completed, Some(10)));
        t.on_event(&stage_event(EventKind::StageStarted, run, "b", StageStatus::Running, None));
        t.on_event(&PipelineEvent::progress(run, "b", 1, 2, Some("page 1".into())));

        let p = t.run(run).unwrap();
        // (1.0 + 0.5) / 4
        assert!((p.progress() - 0.375).abs() < 1e-9);
        let b = t.task(run, "b").unwrap();
        assert_eq!((b.current_step, b.total_steps), (1, 2));
        assert_eq!(b.message.as_deref(), Some("page 1"));
    }

    #[test]
    fn terminal_pipeline_event_finishes_run() {
        let t = ProgressTracker::new();
        let run = Uuid::new_v4();
        t.on_event(&pipeline_event(EventKind::PipelineStarted, run, RunStatus::Running, 1));
        t.on_event(&stage_event(EventKind::StageSkipped, run, "a", StageStatus::Skipped, None));
        t.on_event(&pipeline_event(EventKind::PipelineFailed, run, RunStatus::Failed, 1));

        let p = t.latest().unwrap();
        assert_eq!(p.status, RunStatus::Failed);
        assert!(p.is_finished());
        assert_eq!(p.progress(), 1.0);
        assert_eq!(p.estimated_remaining(Utc::now()), Some(Duration::ZERO));
    }

    #[test]
    fn duration_stats_per_stage_type() {
        let t = ProgressTracker::new();
        let run = Uuid::new_v4();
        t.on_event(&pipeline_event(EventKind::PipelineStarted, run, RunStatus::Running, 3));
        for (name, ms) in [("a", 10), ("b", 30), ("c", 20)] {
            t.on_event(&stage_event(EventKind::StageCompleted, run, name, StageStatus::Completed, Some(ms)));
        }
        let s = t.duration_stats("ocr").unwrap();
        assert_eq!(s.count, 3);
        assert_eq!(s.median_ms, 20.0);
        assert_eq!(s.mean_ms, 20.0);
        assert_eq!((s.min_ms, s.max_ms), (10, 30));
        assert!(t.duration_stats("tables").is_none());
        assert_eq!(t.all_duration_stats().len(), 1);
    }

    #[test]
    fn duration_series_keeps_only_recent_samples() {
        let t = ProgressTracker::new();
        let run = Uuid::new_v4();
        t.on_event(&pipeline_event(EventKind::PipelineStarted, run, RunStatus::Running, 1));
        let total = MAX_DURATION_SAMPLES as u64 + 10;
        for ms in 1..=total {
            t.on_event(&stage_event(EventKind::StageCompleted, run, "a", StageStatus::Completed, Some(ms)));
        }
        let s = t.duration_stats("ocr").unwrap();
        assert_eq!(s.count, MAX_DURATION_SAMPLES);
        assert_eq!(s.min_ms, 11);
        assert_eq!(s.max_ms, total);
    }

    #[test]
    fn even_sample_median_is_midpoint() {
        let s = DurationStats::from_samples(&[4, 1, 3, 2]).unwrap();
        assert_eq!(s.median_ms, 2.5);
    }

    #[test]
    fn linear_extrapolation() {
        let start = Utc::now();
        let now = start + ChronoDuration::seconds(10);
        assert_eq!(extrapolate(start, now, 0.25), Some(Duration::from_secs(30)));
        assert_eq!(extrapolate(start, now, 0.0), None);
    }

    #[test]
    fn events_for_unknown_runs_are_ignored() {
        let t = ProgressTracker::new();
        t.on_event(&stage_event(EventKind::StageStarted, Uuid::new_v4(), "a", StageStatus::Running, None));
        assert!(t.latest().is_none());
    }
}
