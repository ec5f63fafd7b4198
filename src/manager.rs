//! The pipeline manager: one validated definition, one execution loop.
//!
//! ## Execution model
//!
//! ```text
//! execute(doc, metadata)
//!  │
//!  ├─ 1. Lock     one run per manager (AlreadyRunning otherwise)
//!  ├─ 2. Restore  completed stages from the document's checkpoint
//!  ├─ 3. Loop     walk stages in topological order:
//!  │               cancel? ─ paused? ─ deps completed? ─ condition? ─
//!  │               admission (poll + backoff) ─ dispatch ─ record ─ checkpoint
//!  └─ 4. Finish   derive status, emit pipeline.{completed,failed,cancelled}
//! ```
//!
//! Up to `max_parallel_stages` stages are in flight at once; independent
//! stages run concurrently, bounded further by the worker pool and resource
//! admission. The [`PipelineRun`] is only ever mutated by the loop itself.
//!
//! ## Failure semantics
//!
//! A failing stage is recorded as `failed` and its dependents are `skipped`.
//! When the stage is critical, no further stages are dispatched, stages
//! already in flight are drained, and `execute` returns
//! [`PipelineError::CriticalStageFailed`] carrying the run. A non-critical
//! failure still yields a `failed` run status, returned as `Ok(run)`.

use crate::checkpoint::{load_checkpoint, save_checkpoint, CheckpointStore, MemoryCheckpointStore};
use crate::dag::PipelineDefinition;
use crate::error::{PipelineError, ResourceError, StageError};
use crate::notify::{EventKind, EventListener, EventPayload, Notifier, PipelineEvent};
use crate::pool::{PoolConfig, PoolStats, WorkerPool};
use crate::progress::ProgressTracker;
use crate::registry::StageRegistry;
use crate::resources::ResourceMonitor;
use crate::run::{Metadata, PipelineRun, RunStatus, StageResult, StageStatus};
use crate::stage::{ManagedStage, StageContext};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// First admission retry delay.
const ADMISSION_BACKOFF_START: Duration = Duration::from_millis(50);

/// Admission retry delay cap.
const ADMISSION_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Per-call execution switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Restore from and persist to the checkpoint store. Default: true.
    pub checkpoint: bool,
    /// Validate only: call `validate()`/`dry_run()`, never `execute()`.
    pub dry_run: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            checkpoint: true,
            dry_run: false,
        }
    }
}

impl ExecuteOptions {
    /// A validation-only pass.
    pub fn dry_run() -> Self {
        Self {
            checkpoint: false,
            dry_run: true,
        }
    }

    /// A real run that neither restores nor persists checkpoints.
    pub fn without_checkpoint() -> Self {
        Self {
            checkpoint: false,
            dry_run: false,
        }
    }
}

// ── Run control ──────────────────────────────────────────────────────────

struct ControlInner {
    paused: watch::Sender<bool>,
    cancel: Mutex<Option<CancellationToken>>,
    running: AtomicBool,
}

/// Cloneable pause/resume/cancel handle for a manager's runs.
///
/// Pause holds the loop before it starts another stage; stages in flight
/// are not preempted. Cancel is cooperative: in-flight stages finish (or
/// observe [`StageContext::is_cancelled`]) and the run ends `cancelled`.
#[derive(Clone)]
pub struct RunControl {
    inner: Arc<ControlInner>,
}

impl std::fmt::Debug for RunControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunControl")
            .field("paused", &self.is_paused())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Default for RunControl {
    fn default() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(ControlInner {
                paused,
                cancel: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }
}

impl RunControl {
    pub fn pause(&self) {
        self.inner.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.inner.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    /// Request cancellation of the active run. Returns `false` when no run
    /// is active.
    pub fn cancel(&self) -> bool {
        match self.lock_cancel().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.lock_cancel() = Some(token.clone());
        self.inner.running.store(true, Ordering::SeqCst);
        token
    }

    fn end(&self) {
        *self.lock_cancel() = None;
        self.inner.running.store(false, Ordering::SeqCst);
    }

    fn pause_receiver(&self) -> watch::Receiver<bool> {
        self.inner.paused.subscribe()
    }

    fn lock_cancel(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.inner.cancel.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Clears the control's active-run state even if `execute` is dropped.
struct ActiveRun<'a>(&'a RunControl);

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.0.end();
    }
}

// ── Manager ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LoopOutcome {
    cancelled: bool,
    timed_out: bool,
    stalled: bool,
    critical: Option<(String, String)>,
}

type InFlight<'a> = FuturesUnordered<BoxFuture<'a, StageResult>>;

/// Executes a [`PipelineDefinition`] against documents.
pub struct PipelineManager {
    definition: Arc<PipelineDefinition>,
    stages: HashMap<String, Arc<ManagedStage>>,
    pool: Arc<WorkerPool>,
    monitor: Arc<ResourceMonitor>,
    store: Arc<dyn CheckpointStore>,
    notifier: Arc<Notifier>,
    progress: Arc<ProgressTracker>,
    control: RunControl,
    execution_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    sampling: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineManager")
            .field("pipeline", &self.definition.name())
            .field("stages", &self.stages.len())
            .field("control", &self.control)
            .finish()
    }
}

impl PipelineManager {
    pub fn builder(definition: PipelineDefinition) -> PipelineManagerBuilder {
        PipelineManagerBuilder {
            definition,
            registry: None,
            monitor: None,
            store: None,
            notifier: None,
            listeners: Vec::new(),
            pool_config: None,
        }
    }

    /// A manager with default collaborators.
    pub fn new(
        definition: PipelineDefinition,
        registry: StageRegistry,
    ) -> Result<Self, PipelineError> {
        Self::builder(definition).registry(registry).build()
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn stage(&self, name: &str) -> Option<&Arc<ManagedStage>> {
        self.stages.get(name)
    }

    /// Subscribe to lifecycle events; see [`Notifier::subscribe`].
    pub fn subscribe(
        &self,
        kinds: &[EventKind],
    ) -> tokio::sync::mpsc::UnboundedReceiver<PipelineEvent> {
        self.notifier.subscribe(kinds)
    }

    /// Run the pipeline against one document.
    ///
    /// # Errors
    /// * [`PipelineError::AlreadyRunning`] if a run is active on this manager.
    /// * [`PipelineError::CriticalStageFailed`] if a critical stage failed.
    /// * [`PipelineError::Timeout`] if the global timeout elapsed.
    ///
    /// Non-critical failures are not errors: inspect `run.status` and
    /// `run.stage_results`.
    pub async fn execute(
        &self,
        document_id: &str,
        metadata: Metadata,
        options: ExecuteOptions,
    ) -> Result<PipelineRun, PipelineError> {
        let _exclusive = self
            .execution_lock
            .try_lock()
            .map_err(|_| PipelineError::AlreadyRunning)?;
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::Internal("manager has been shut down".into()));
        }
        self.ensure_sampling();

        let cancel = self.control.begin();
        let _active = ActiveRun(&self.control);

        let run = PipelineRun::new(self.definition.name(), document_id, metadata);
        let span = info_span!(
            "pipeline",
            run_id = %run.run_id,
            pipeline = %self.definition.name(),
            document_id = %document_id,
        );
        self.run_pipeline(run, options, cancel).instrument(span).await
    }

    /// Stop accepting runs, cancel the active one, clean up every stage and
    /// stop the worker pool. Idempotent.
    pub async fn shutdown(&self) {
        self.control.cancel();
        let _exclusive = self.execution_lock.lock().await;
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        for name in self.definition.topological_order().into_iter().rev() {
            if let Some(stage) = self.stages.get(name) {
                if let Err(e) = stage.cleanup().await {
                    warn!(stage = %name, error = %e, "cleanup failed");
                }
            }
        }
        self.pool.shutdown().await;

        let sampler = self
            .sampling
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(h) = sampler {
            let _ = h.await;
        }
        info!(pipeline = %self.definition.name(), "pipeline manager shut down");
    }

    fn ensure_sampling(&self) {
        let mut sampling = self.sampling.lock().unwrap_or_else(|e| e.into_inner());
        if sampling.is_none() {
            *sampling = Some(self.monitor.start_sampling(self.shutdown.child_token()));
        }
    }

    async fn run_pipeline(
        &self,
        mut run: PipelineRun,
        options: ExecuteOptions,
        cancel: CancellationToken,
    ) -> Result<PipelineRun, PipelineError> {
        let config = self.definition.config();
        let persist = options.checkpoint && config.checkpoint_enabled && !options.dry_run;
        run.dry_run = options.dry_run;
        run.status = RunStatus::Running;

        if persist {
            self.restore(&mut run).await;
        }
        info!(
            stages = self.definition.stages().len(),
            resumed = run.resumed_stages.len(),
            dry_run = options.dry_run,
            "pipeline started"
        );
        self.emit_pipeline(EventKind::PipelineStarted, &run);
        for name in run.resumed_stages.clone() {
            if let Some(result) = run.stage_results.get(&name) {
                self.emit_stage(run.run_id, &name, result, Some("restored from checkpoint"));
            }
        }

        let deadline = config
            .global_timeout_duration()
            .map(|d| Instant::now() + d);
        let outcome = self
            .drive(&mut run, &cancel, options.dry_run, persist, deadline)
            .await;

        run.finished_at = Some(Utc::now());

        if outcome.timed_out {
            run.status = RunStatus::Failed;
            let secs = config.global_timeout.unwrap_or_default();
            error!(secs, "pipeline timed out");
            if persist {
                self.persist(&run).await;
            }
            self.emit_pipeline(EventKind::PipelineFailed, &run);
            return Err(PipelineError::Timeout {
                secs,
                run: Box::new(run),
            });
        }

        if outcome.stalled {
            run.status = RunStatus::Failed;
            self.emit_pipeline(EventKind::PipelineFailed, &run);
            return Err(PipelineError::Internal(
                "execution loop stalled with undispatchable stages".into(),
            ));
        }

        run.status = run.derive_status(outcome.cancelled);
        self.emit_pipeline(EventKind::for_run_status(run.status), &run);
        info!(
            status = %run.status,
            completed = run.count(StageStatus::Completed),
            failed = run.count(StageStatus::Failed),
            skipped = run.count(StageStatus::Skipped),
            "pipeline finished"
        );

        match outcome.critical {
            Some((stage, message)) => Err(PipelineError::CriticalStageFailed {
                stage,
                message,
                run: Box::new(run),
            }),
            None => Ok(run),
        }
    }

    async fn restore(&self, run: &mut PipelineRun) {
        let cp = match load_checkpoint(
            self.store.as_ref(),
            &run.document_id,
            self.definition.name(),
        )
        .await
        {
            Ok(Some(cp)) => cp,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "checkpoint load failed; starting fresh");
                return;
            }
        };

        let completed: HashMap<&str, &StageResult> = cp
            .completed()
            .map(|r| (r.stage_name.as_str(), r))
            .collect();
        for name in self.definition.topological_order() {
            if let Some(result) = completed.get(name) {
                run.record((*result).clone());
                run.resumed_stages.push(name.to_string());
            }
        }
        if !run.resumed_stages.is_empty() {
            info!(
                resumed = ?run.resumed_stages,
                from_run = %cp.run_id,
                "resuming from checkpoint"
            );
        }
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
        dry_run: bool,
        persist: bool,
        deadline: Option<Instant>,
    ) -> LoopOutcome {
        let max_in_flight = self.definition.config().max_parallel_stages.max(1);
        let stage_cancel = cancel.child_token();
        let metadata = Arc::new(run.metadata.clone());

        let mut pending: Vec<String> = self
            .definition
            .topological_order()
            .into_iter()
            .filter(|n| !run.stage_results.contains_key(*n))
            .map(str::to_string)
            .collect();
        let mut in_flight: InFlight<'_> = FuturesUnordered::new();
        let mut running: BTreeSet<String> = BTreeSet::new();
        let mut paused_rx = self.control.pause_receiver();
        let mut outcome = LoopOutcome::default();
        let mut halted = false;

        loop {
            if !halted && cancel.is_cancelled() {
                info!("cancellation requested; no further stages will start");
                outcome.cancelled = true;
                halted = true;
            }

            let paused = *paused_rx.borrow_and_update();
            if !halted && !paused {
                self.dispatch_ready(
                    run,
                    &mut pending,
                    &mut in_flight,
                    &mut running,
                    max_in_flight,
                    &metadata,
                    &stage_cancel,
                    dry_run,
                    persist,
                )
                .await;
            }

            if in_flight.is_empty() {
                if halted || pending.is_empty() {
                    break;
                }
                if !paused {
                    error!(pending = ?pending, "no stage can be dispatched");
                    outcome.stalled = true;
                    break;
                }
                debug!("paused");
            }

            let global_deadline = async move {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                Some(result) = in_flight.next(), if !in_flight.is_empty() => {
                    running.remove(&result.stage_name);
                    let failed = result.status == StageStatus::Failed;
                    let name = result.stage_name.clone();
                    let message = result.error.clone().unwrap_or_default();
                    self.finish_stage(run, result, persist).await;

                    let critical = self
                        .stages
                        .get(&name)
                        .is_some_and(|s| s.spec().critical);
                    // A stage interrupted by cancellation is not a critical abort.
                    if failed && critical && outcome.critical.is_none() && !cancel.is_cancelled() {
                        error!(stage = %name, error = %message, "critical stage failed; aborting");
                        outcome.critical = Some((name, message));
                        halted = true;
                        stage_cancel.cancel();
                    }
                }
                _ = paused_rx.changed() => {}
                _ = cancel.cancelled(), if !halted => {}
                _ = global_deadline => {
                    outcome.timed_out = true;
                    stage_cancel.cancel();
                    for name in std::mem::take(&mut running) {
                        let secs = self.definition.config().global_timeout.unwrap_or_default();
                        let result = StageResult::started(&name)
                            .fail(format!("Pipeline timed out after {secs}s"));
                        self.finish_stage(run, result, false).await;
                    }
                    break;
                }
            }
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_ready<'a>(
        &'a self,
        run: &mut PipelineRun,
        pending: &mut Vec<String>,
        in_flight: &mut InFlight<'a>,
        running: &mut BTreeSet<String>,
        max_in_flight: usize,
        metadata: &Arc<Metadata>,
        stage_cancel: &CancellationToken,
        dry_run: bool,
        persist: bool,
    ) {
        let mut i = 0;
        while i < pending.len() {
            let Some(stage) = self.stages.get(&pending[i]).cloned() else {
                pending.remove(i);
                continue;
            };
            let spec = stage.spec();

            let mut blocked = false;
            let mut broken: Option<String> = None;
            for dep in &spec.dependencies {
                match run.stage_status(dep) {
                    Some(StageStatus::Completed) => {}
                    Some(status) if status.is_terminal() => {
                        broken = Some(format!("dependency '{dep}' {status}"));
                        break;
                    }
                    _ => blocked = true,
                }
            }

            if let Some(reason) = broken {
                pending.remove(i);
                self.skip(run, &stage, reason, persist).await;
                continue;
            }
            if blocked {
                i += 1;
                continue;
            }

            if let Some(cond) = self.definition.condition(&spec.name) {
                if !cond.evaluate(&run.metadata) {
                    let expr = spec.condition.clone().unwrap_or_default();
                    pending.remove(i);
                    self.skip(run, &stage, format!("condition '{expr}' is false"), persist)
                        .await;
                    continue;
                }
            }

            if in_flight.len() >= max_in_flight {
                i += 1;
                continue;
            }

            let name = pending.remove(i);
            let dependency_results: HashMap<String, StageResult> = spec
                .dependencies
                .iter()
                .filter_map(|d| run.stage_results.get(d).map(|r| (d.clone(), r.clone())))
                .collect();
            let ctx = StageContext::new(
                run.run_id,
                run.document_id.clone(),
                spec,
                Arc::clone(metadata),
                dependency_results,
            )
            .with_cancellation(stage_cancel.clone())
            .with_notifier(Arc::clone(&self.notifier));

            let started = StageResult::started(&name);
            self.emit_stage(run.run_id, &name, &started, None);
            run.record(started);
            running.insert(name.clone());
            debug!(stage = %name, in_flight = in_flight.len() + 1, "stage dispatched");

            in_flight.push(
                self.run_stage(stage, ctx, stage_cancel.clone(), dry_run)
                    .boxed(),
            );
        }
    }

    /// Admission, dispatch and completion of one stage.
    async fn run_stage(
        &self,
        stage: Arc<ManagedStage>,
        ctx: StageContext,
        cancel: CancellationToken,
        dry_run: bool,
    ) -> StageResult {
        let name = stage.name().to_string();
        if dry_run {
            return stage.dry_run(&ctx).await;
        }

        let requirements = stage.requirements();
        if let Err(e) = self.monitor.fits_capacity(&requirements) {
            warn!(stage = %name, error = %e, "stage can never be admitted");
            return resource_failure(&name, &e);
        }

        let spec = stage.spec();
        let mut backoff = ADMISSION_BACKOFF_START;
        loop {
            if cancel.is_cancelled() {
                return StageResult::skipped(&name, "run cancelled before admission");
            }
            if self.pool.is_shut_down() {
                return StageResult::failed(
                    &name,
                    StageError::Cancelled { stage: name.clone() }.to_string(),
                );
            }

            let availability = self.monitor.check_availability(&requirements);
            if availability.available {
                match self.pool.submit_task(
                    Arc::clone(&stage),
                    ctx.clone(),
                    spec.priority,
                    spec.timeout_duration(),
                ) {
                    Ok(handle) => return handle.result().await,
                    Err(e @ ResourceError::ExceedsCapacity { .. }) => {
                        return resource_failure(&name, &e);
                    }
                    Err(ResourceError::Denied { reason }) => {
                        debug!(stage = %name, %reason, "admission lost a race; retrying");
                    }
                }
            } else {
                debug!(
                    stage = %name,
                    reason = availability.reason.as_deref().unwrap_or(""),
                    backoff_ms = backoff.as_millis() as u64,
                    "waiting for resources"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => {}
            }
            backoff = (backoff * 2).min(ADMISSION_BACKOFF_MAX);
        }
    }

    async fn skip(&self, run: &mut PipelineRun, stage: &ManagedStage, reason: String, persist: bool) {
        stage.mark_skipped();
        let result = StageResult::skipped(stage.name(), reason);
        self.finish_stage(run, result, persist).await;
    }

    async fn finish_stage(&self, run: &mut PipelineRun, result: StageResult, persist: bool) {
        match result.status {
            StageStatus::Completed => info!(
                stage = %result.stage_name,
                duration_ms = result.duration_ms().unwrap_or_default(),
                dry_run = result.dry_run,
                "stage completed"
            ),
            StageStatus::Failed => warn!(
                stage = %result.stage_name,
                error = result.error.as_deref().unwrap_or(""),
                "stage failed"
            ),
            StageStatus::Skipped => info!(
                stage = %result.stage_name,
                reason = result.output_data["reason"].as_str().unwrap_or(""),
                "stage skipped"
            ),
            _ => {}
        }
        self.emit_stage(run.run_id, &result.stage_name, &result, None);
        run.record(result);
        if persist {
            self.persist(run).await;
        }
    }

    async fn persist(&self, run: &PipelineRun) {
        let ttl = self.definition.config().checkpoint_ttl_duration();
        if let Err(e) = save_checkpoint(self.store.as_ref(), run, ttl).await {
            warn!(error = %e, "checkpoint save failed; continuing");
        }
    }

    fn emit_stage(&self, run_id: uuid::Uuid, name: &str, result: &StageResult, note: Option<&str>) {
        let stage_type = self
            .stages
            .get(name)
            .map(|s| s.spec().type_id().to_string())
            .unwrap_or_else(|| name.to_string());
        let detail = note
            .map(str::to_owned)
            .or_else(|| result.error.clone())
            .or_else(|| result.output_data["reason"].as_str().map(str::to_owned));
        // Restored results carry no fresh timing.
        let duration_ms = if note.is_some() { None } else { result.duration_ms() };
        self.notifier.emit(PipelineEvent::new(
            EventKind::for_stage_status(result.status),
            run_id,
            Some(name.to_string()),
            EventPayload::Stage {
                stage_type,
                status: result.status,
                duration_ms,
                detail,
            },
        ));
    }

    fn emit_pipeline(&self, kind: EventKind, run: &PipelineRun) {
        self.notifier.emit(PipelineEvent::new(
            kind,
            run.run_id,
            None,
            EventPayload::Pipeline {
                pipeline_name: run.pipeline_name.clone(),
                document_id: run.document_id.clone(),
                status: run.status,
                total_stages: self.definition.stages().len(),
                completed: run.count(StageStatus::Completed),
                failed: run.count(StageStatus::Failed),
                skipped: run.count(StageStatus::Skipped),
                dry_run: run.dry_run,
            },
        ));
    }
}

fn resource_failure(name: &str, e: &ResourceError) -> StageResult {
    StageResult::failed(
        name,
        StageError::Resource {
            stage: name.to_string(),
            detail: e.to_string(),
        }
        .to_string(),
    )
}

// ── Builder ──────────────────────────────────────────────────────────────

/// Wires a [`PipelineManager`] from a definition and optional collaborators.
///
/// Defaults: built-in stage registry, a monitor sampling the real host
/// under the definition's resource limits, a pool sized by the
/// definition's `workers` section, an in-memory checkpoint store and a
/// fresh notifier.
pub struct PipelineManagerBuilder {
    definition: PipelineDefinition,
    registry: Option<StageRegistry>,
    monitor: Option<Arc<ResourceMonitor>>,
    store: Option<Arc<dyn CheckpointStore>>,
    notifier: Option<Arc<Notifier>>,
    listeners: Vec<Arc<dyn EventListener>>,
    pool_config: Option<PoolConfig>,
}

impl PipelineManagerBuilder {
    pub fn registry(mut self, registry: StageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn monitor(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Override the definition's `workers` section.
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = Some(config);
        self
    }

    /// Construct every stage and the collaborators.
    ///
    /// # Errors
    /// [`PipelineError::Config`] if a stage type is not registered or its
    /// constructor rejects the stage's parameters.
    pub fn build(self) -> Result<PipelineManager, PipelineError> {
        let registry = self.registry.unwrap_or_else(StageRegistry::with_builtins);
        let stages = registry.instantiate(&self.definition)?;

        let config = self.definition.config();
        let monitor = self
            .monitor
            .unwrap_or_else(|| Arc::new(ResourceMonitor::new(config.resources.clone())));
        let pool_config = self.pool_config.unwrap_or_else(|| config.workers.clone());
        let pool = Arc::new(WorkerPool::new(pool_config, Arc::clone(&monitor)));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new()));
        let notifier = self.notifier.unwrap_or_default();

        let progress = Arc::new(ProgressTracker::new());
        notifier.add_listener(Arc::clone(&progress) as Arc<dyn EventListener>);
        for l in self.listeners {
            notifier.add_listener(l);
        }

        Ok(PipelineManager {
            definition: Arc::new(self.definition),
            stages,
            pool,
            monitor,
            store,
            notifier,
            progress,
            control: RunControl::default(),
            execution_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            sampling: Mutex::new(None),
        })
    }
}
