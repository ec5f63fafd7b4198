//! The stage plugin contract and its lifecycle guard.
//!
//! Anything that implements [`Stage`] can be registered as a pipeline stage,
//! whether it extracts tables, runs OCR or translates text. The engine never
//! calls a `Stage` directly; it goes through [`ManagedStage`], which enforces
//! the lifecycle:
//!
//! ```text
//! uninitialized ──initialize()──▶ initialized ──validate()+execute()──▶ completed
//!                                       │                          └──▶ failed
//!                                       └──────────(not run)──────────▶ skipped
//! ```
//!
//! * `initialize()` runs at most once per instance until `cleanup()`.
//! * `validate()` runs before both `execute()` and `dry_run()`.
//! * `cleanup()` is safe to call any number of times.

use crate::config::StageSpec;
use crate::error::StageError;
use crate::notify::{Notifier, PipelineEvent};
use crate::resources::ResourceRequirements;
use crate::run::{Metadata, StageResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// What a successful `execute()` or `dry_run()` produces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub data: Value,
    pub metrics: BTreeMap<String, f64>,
}

impl StageOutput {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }
}

/// A pluggable unit of pipeline work.
///
/// Only [`Stage::execute`] is required. Errors are returned, not panicked;
/// a panic is still caught at the dispatch boundary and recorded as a
/// failed result, but the stage gets no chance to describe it.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Expensive one-time setup (model loads, connection pools).
    async fn initialize(&self) -> Result<(), StageError> {
        Ok(())
    }

    /// Check the run context before `execute` or `dry_run`.
    ///
    /// The default verifies that every declared dependency completed.
    async fn validate(&self, ctx: &StageContext) -> Result<(), StageError> {
        ctx.ensure_dependencies_completed()
    }

    /// Do the work.
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageError>;

    /// Validation-only pass. Must have no observable side effects.
    async fn dry_run(&self, _ctx: &StageContext) -> Result<StageOutput, StageError> {
        Ok(StageOutput::default())
    }

    /// Release whatever `initialize` acquired.
    async fn cleanup(&self) -> Result<(), StageError> {
        Ok(())
    }

    /// Override the requirements declared in the stage's configuration.
    fn resource_requirements(&self) -> Option<ResourceRequirements> {
        None
    }
}

/// Everything a stage can see about the run it is part of.
#[derive(Clone)]
pub struct StageContext {
    pub run_id: Uuid,
    pub document_id: String,
    pub stage_name: String,
    pub metadata: Arc<Metadata>,
    /// Declared dependencies, in declaration order.
    pub dependencies: Vec<String>,
    /// Results of the declared dependencies at dispatch time.
    pub dependency_results: Arc<HashMap<String, StageResult>>,
    pub params: Value,
    pub batch_size: Option<usize>,
    pub max_parallel: usize,
    cancel: CancellationToken,
    notifier: Option<Arc<Notifier>>,
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("run_id", &self.run_id)
            .field("document_id", &self.document_id)
            .field("stage_name", &self.stage_name)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

impl StageContext {
    /// A context for `spec` within the given run.
    pub fn new(
        run_id: Uuid,
        document_id: impl Into<String>,
        spec: &StageSpec,
        metadata: Arc<Metadata>,
        dependency_results: HashMap<String, StageResult>,
    ) -> Self {
        Self {
            run_id,
            document_id: document_id.into(),
            stage_name: spec.name.clone(),
            metadata,
            dependencies: spec.dependencies.clone(),
            dependency_results: Arc::new(dependency_results),
            params: spec.params.clone(),
            batch_size: spec.batch_size,
            max_parallel: spec.max_parallel,
            cancel: CancellationToken::new(),
            notifier: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Output of a completed dependency.
    pub fn dependency_output(&self, name: &str) -> Option<&Value> {
        self.dependency_results
            .get(name)
            .filter(|r| r.is_completed())
            .map(|r| &r.output_data)
    }

    /// `Err` naming the first declared dependency without a completed result.
    pub fn ensure_dependencies_completed(&self) -> Result<(), StageError> {
        for dep in &self.dependencies {
            let ok = self
                .dependency_results
                .get(dep)
                .is_some_and(StageResult::is_completed);
            if !ok {
                return Err(StageError::DependencyNotCompleted {
                    stage: self.stage_name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        Ok(())
    }

    /// Whether the run has been cancelled. Long stages should poll this.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Emit a `task.progress` notification for this stage.
    pub fn report_progress(&self, current: u64, total: u64, message: Option<&str>) {
        if let Some(n) = &self.notifier {
            n.emit(PipelineEvent::progress(
                self.run_id,
                self.stage_name.clone(),
                current,
                total,
                message.map(str::to_owned),
            ));
        }
    }
}

/// Lifecycle state of a [`ManagedStage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Uninitialized,
    Initialized,
    Executing,
    Completed,
    Failed,
    Skipped,
}

/// A registered stage instance wrapped in its lifecycle guard.
pub struct ManagedStage {
    spec: StageSpec,
    stage: Arc<dyn Stage>,
    init: tokio::sync::Mutex<Option<Result<(), StageError>>>,
    state: Mutex<StageState>,
}

impl std::fmt::Debug for ManagedStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedStage")
            .field("name", &self.spec.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ManagedStage {
    pub fn new(spec: StageSpec, stage: Arc<dyn Stage>) -> Self {
        Self {
            spec,
            stage,
            init: tokio::sync::Mutex::new(None),
            state: Mutex::new(StageState::Uninitialized),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    pub fn state(&self) -> StageState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_state(&self, state: StageState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// The stage's own override, else what its configuration declares.
    pub fn requirements(&self) -> ResourceRequirements {
        self.stage
            .resource_requirements()
            .unwrap_or_else(|| self.spec.resources.clone())
    }

    /// Run `initialize()` unless it already ran. A failed initialization is
    /// remembered and returned again until `cleanup()`.
    pub async fn ensure_initialized(&self) -> Result<(), StageError> {
        let mut init = self.init.lock().await;
        if let Some(done) = init.as_ref() {
            return done.clone();
        }
        debug!(stage = %self.spec.name, "initializing");
        let outcome = self.stage.initialize().await.map_err(|e| match e {
            e @ StageError::Initialization { .. } => e,
            other => StageError::Initialization {
                stage: self.spec.name.clone(),
                detail: other.to_string(),
            },
        });
        if outcome.is_ok() {
            self.set_state(StageState::Initialized);
        }
        *init = Some(outcome.clone());
        outcome
    }

    /// initialize → validate → execute.
    pub async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        let outcome = async {
            self.ensure_initialized().await?;
            self.stage.validate(ctx).await?;
            self.set_state(StageState::Executing);
            self.stage.execute(ctx).await
        }
        .await;
        self.set_state(if outcome.is_ok() {
            StageState::Completed
        } else {
            StageState::Failed
        });
        outcome
    }

    /// validate → dry_run, packaged as a result tagged `dry_run`.
    pub async fn dry_run(&self, ctx: &StageContext) -> StageResult {
        let started = StageResult::started(&self.spec.name);
        let outcome = match self.stage.validate(ctx).await {
            Ok(()) => self.stage.dry_run(ctx).await,
            Err(e) => Err(e),
        };
        let mut result = finish_result(started, outcome);
        result.dry_run = true;
        result
    }

    /// Mark the stage as not run in this pass.
    pub fn mark_skipped(&self) {
        self.set_state(StageState::Skipped);
    }

    /// Run `cleanup()` if the stage was initialized. Idempotent; a later run
    /// initializes the stage afresh.
    pub async fn cleanup(&self) -> Result<(), StageError> {
        let mut init = self.init.lock().await;
        if init.take().is_none() {
            return Ok(());
        }
        self.set_state(StageState::Uninitialized);
        debug!(stage = %self.spec.name, "cleanup");
        self.stage.cleanup().await
    }
}

/// Fold a stage outcome into a finished [`StageResult`].
pub fn finish_result(
    mut started: StageResult,
    outcome: Result<StageOutput, StageError>,
) -> StageResult {
    match outcome {
        Ok(out) => {
            started.metrics.extend(out.metrics);
            started.complete(out.data)
        }
        Err(e) => started.fail(e.to_string()),
    }
}
