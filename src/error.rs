//! Error types for the edgequake-docpipe library.
//!
//! Two distinct error families reflect two distinct failure modes:
//!
//! * [`PipelineError`]: **fatal**: the run cannot continue or cannot start
//!   at all (invalid pipeline definition, re-entrant `execute()`, a critical
//!   stage failed, the global timeout elapsed). Returned as
//!   `Err(PipelineError)` from [`crate::manager::PipelineManager::execute`].
//!
//! * [`StageError`]: **non-fatal**: a single stage failed but the run goes
//!   on. Recorded inside [`crate::run::StageResult`] so operators can see
//!   exactly which stage failed and why, while downstream dependents are
//!   skipped rather than fed partial input.
//!
//! A stage error only escalates into a [`PipelineError`] when the failing
//! stage is marked critical.

use crate::run::PipelineRun;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pipeline engine.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Construction ──────────────────────────────────────────────────────
    /// The pipeline definition is malformed, cyclic or references unknown
    /// stages. Raised before any stage runs and never retried.
    #[error(transparent)]
    Config(#[from] ConfigError),

    // ── Control ───────────────────────────────────────────────────────────
    /// `execute()` was called while a previous run on the same manager is
    /// still active. No state was mutated.
    #[error("A pipeline run is already active on this manager")]
    AlreadyRunning,

    /// Admission was denied. Retryable by the submitter after backoff.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    // ── Run termination ───────────────────────────────────────────────────
    /// A stage marked `critical` failed; remaining stages were not started.
    ///
    /// The run carries every `StageResult` recorded before the abort.
    #[error("Critical stage '{stage}' failed: {message}")]
    CriticalStageFailed {
        stage: String,
        message: String,
        run: Box<PipelineRun>,
    },

    /// The pipeline exceeded its global wall-clock budget.
    #[error("Pipeline timed out after {secs}s")]
    Timeout { secs: u64, run: Box<PipelineRun> },

    // ── Persistence ───────────────────────────────────────────────────────
    /// The checkpoint store rejected a read or write.
    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// The partially-executed run attached to a terminating error, if any.
    pub fn run(&self) -> Option<&PipelineRun> {
        match self {
            PipelineError::CriticalStageFailed { run, .. } | PipelineError::Timeout { run, .. } => {
                Some(run)
            }
            _ => None,
        }
    }
}

/// A malformed pipeline definition.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Two stages share the same name.
    #[error("Duplicate stage name '{name}'")]
    DuplicateStage { name: String },

    /// A stage depends on a name that is not defined.
    #[error("Stage '{stage}' depends on undefined stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    /// A stage lists itself as a dependency.
    #[error("Stage '{stage}' depends on itself")]
    SelfDependency { stage: String },

    /// The dependency graph contains one or more cycles.
    #[error("Dependency cycle detected: {}", format_cycles(.cycles))]
    Cycle { cycles: Vec<Vec<String>> },

    /// A `condition` expression failed to parse.
    #[error("Invalid condition on stage '{stage}': {detail}")]
    InvalidCondition { stage: String, detail: String },

    /// The stage `type` has no registered constructor.
    #[error("Stage '{stage}' uses unknown type '{stage_type}'")]
    UnknownStageType { stage: String, stage_type: String },

    /// A value is out of range or otherwise unusable.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// The configuration document could not be deserialised.
    #[error("Failed to parse pipeline configuration: {0}")]
    Parse(String),

    /// The configuration file could not be read.
    #[error("Failed to read pipeline configuration '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|c| c.join(" → "))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Resource admission was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    /// Projected usage would cross a hard limit right now.
    #[error("Resources unavailable: {reason}")]
    Denied { reason: String },

    /// The request can never fit, even on an idle host.
    #[error("Resource request exceeds capacity: {reason}")]
    ExceedsCapacity { reason: String },
}

/// A non-fatal error for a single stage.
///
/// Converted into a `failed` [`crate::run::StageResult`] at the dispatch
/// boundary; the run continues unless the stage is critical.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum StageError {
    /// `initialize()` failed (model load, connection pool, …).
    #[error("Stage '{stage}': initialization failed: {detail}")]
    Initialization { stage: String, detail: String },

    /// `validate()` rejected the run context.
    #[error("Stage '{stage}': validation failed: {detail}")]
    Validation { stage: String, detail: String },

    /// A declared dependency has no `completed` result.
    #[error("Stage '{stage}': dependency '{dependency}' has not completed")]
    DependencyNotCompleted { stage: String, dependency: String },

    /// `execute()` returned an error.
    #[error("Stage '{stage}': {detail}")]
    Execution { stage: String, detail: String },

    /// The stage exceeded its per-stage timeout and was abandoned.
    #[error("Stage '{stage}': timed out after {secs}s")]
    Timeout { stage: String, secs: u64 },

    /// The stage panicked; the worker survived.
    #[error("Stage '{stage}': panicked: {detail}")]
    Panicked { stage: String, detail: String },

    /// The stage can never be admitted.
    #[error("Stage '{stage}': {detail}")]
    Resource { stage: String, detail: String },

    /// The task was dropped before it produced a result.
    #[error("Stage '{stage}': cancelled before completion")]
    Cancelled { stage: String },
}

impl StageError {
    /// Shorthand for the most common plugin-side error.
    pub fn execution(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        StageError::Execution {
            stage: stage.into(),
            detail: detail.into(),
        }
    }

    /// Shorthand for a validation failure.
    pub fn validation(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        StageError::Validation {
            stage: stage.into(),
            detail: detail.into(),
        }
    }
}
