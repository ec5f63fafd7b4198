//! Run state: [`PipelineRun`] and the per-stage [`StageResult`] records.
//!
//! A `PipelineRun` is owned by the [`crate::manager::PipelineManager`] for
//! the duration of one `execute()` call and is only ever mutated by the
//! manager's single execution loop. A `StageResult` is created when a stage
//! begins and finalised exactly once when it ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Free-form document metadata, visible to stages and condition expressions.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Lifecycle status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    /// `true` once the stage can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Overall status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of one stage in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_name: String,
    pub status: StageStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Whatever the stage produced; `Null` for failed and skipped stages.
    #[serde(default)]
    pub output_data: serde_json::Value,
    /// Human-readable failure description (`failed` only).
    #[serde(default)]
    pub error: Option<String>,
    /// Numeric measurements (`duration_ms`, `attempts`, stage-defined keys).
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Set when the result came from a validation-only dry run.
    #[serde(default)]
    pub dry_run: bool,
}

impl StageResult {
    /// A fresh `running` result stamped with the current time.
    pub fn started(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            status: StageStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            output_data: serde_json::Value::Null,
            error: None,
            metrics: BTreeMap::new(),
            dry_run: false,
        }
    }

    /// Finalise as `completed` with the given output.
    pub fn complete(mut self, output: serde_json::Value) -> Self {
        self.output_data = output;
        self.finish(StageStatus::Completed)
    }

    /// Finalise as `failed` with the given error message.
    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.finish(StageStatus::Failed)
    }

    /// A `skipped` result; the reason is kept in `output_data.reason`.
    pub fn skipped(stage_name: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut r = Self::started(stage_name);
        r.output_data = serde_json::json!({ "reason": reason.into() });
        r.finish(StageStatus::Skipped)
    }

    /// A `failed` result for a stage that never started running.
    pub fn failed(stage_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self::started(stage_name).fail(error)
    }

    fn finish(mut self, status: StageStatus) -> Self {
        let end = Utc::now();
        let ms = (end - self.start_time).num_milliseconds().max(0);
        self.status = status;
        self.end_time = Some(end);
        self.metrics.insert("duration_ms".into(), ms as f64);
        self
    }

    /// Wall-clock duration in milliseconds, if finished.
    pub fn duration_ms(&self) -> Option<u64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0) as u64)
    }

    pub fn is_completed(&self) -> bool {
        self.status == StageStatus::Completed
    }
}

/// One execution of a pipeline against one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub document_id: String,
    pub pipeline_name: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stage_results: HashMap<String, StageResult>,
    pub status: RunStatus,
    /// Stages whose `completed` result was restored from a checkpoint.
    #[serde(default)]
    pub resumed_stages: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

impl PipelineRun {
    pub fn new(
        pipeline_name: impl Into<String>,
        document_id: impl Into<String>,
        metadata: Metadata,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            document_id: document_id.into(),
            pipeline_name: pipeline_name.into(),
            metadata,
            created_at: Utc::now(),
            finished_at: None,
            stage_results: HashMap::new(),
            status: RunStatus::Pending,
            resumed_stages: Vec::new(),
            dry_run: false,
        }
    }

    /// Status of a stage, or `None` if it has no result yet.
    pub fn stage_status(&self, name: &str) -> Option<StageStatus> {
        self.stage_results.get(name).map(|r| r.status)
    }

    /// Number of results with the given status.
    pub fn count(&self, status: StageStatus) -> usize {
        self.stage_results
            .values()
            .filter(|r| r.status == status)
            .count()
    }

    /// Final status precedence: `cancelled` > `failed` > `completed`.
    ///
    /// Any `failed` result fails the run, whether or not the stage was
    /// critical.
    pub fn derive_status(&self, cancelled: bool) -> RunStatus {
        if cancelled {
            RunStatus::Cancelled
        } else if self.count(StageStatus::Failed) > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        }
    }

    /// Record a terminal result, replacing any earlier entry for the stage.
    pub fn record(&mut self, result: StageResult) {
        self.stage_results.insert(result.stage_name.clone(), result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_sets_end_time_and_duration_metric() {
        let r = StageResult::started("ocr").complete(serde_json::json!({"pages": 3}));
        assert_eq!(r.status, StageStatus::Completed);
        assert!(r.end_time.is_some());
        assert!(r.metrics.contains_key("duration_ms"));
        assert_eq!(r.output_data["pages"], 3);
    }

    #[test]
    fn skipped_keeps_reason() {
        let r = StageResult::skipped("tables", "dependency 'ocr' failed");
        assert_eq!(r.status, StageStatus::Skipped);
        assert_eq!(r.output_data["reason"], "dependency 'ocr' failed");
        assert!(r.error.is_none());
    }

    #[test]
    fn status_precedence() {
        let mut run = PipelineRun::new("p", "doc", Metadata::new());
        run.record(StageResult::started("a").complete(serde_json::Value::Null));
        assert_eq!(run.derive_status(false), RunStatus::Completed);

        run.record(StageResult::failed("b", "boom"));
        assert_eq!(run.derive_status(false), RunStatus::Failed);
        assert_eq!(run.derive_status(true), RunStatus::Cancelled);
    }

    #[test]
    fn status_serialises_lowercase() {
        let json = serde_json::to_string(&StageStatus::Skipped).unwrap();
        assert_eq!(json, "\"skipped\"");
        let back: RunStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(back, RunStatus::Cancelled);
    }

    #[test]
    fn run_round_trips_through_json() {
        let mut run = PipelineRun::new("p", "doc-1", Metadata::new());
        run.record(StageResult::skipped("x", "condition false"));
        let json = serde_json::to_string(&run).unwrap();
        let back: PipelineRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back, run);
    }
}
