//! Worker pool: queues, execution substrates and worker health.
//!
//! ## Architecture
//!
//! ```text
//! submit_task ──admission──▶ priority heap ─┐
//!                     │                      ├─▶ async workers ─┬─▶ async   (on the worker)
//!                     └────▶ FIFO queue ────┘                    ├─▶ thread  (spawn_blocking, bounded)
//!                                                                └─▶ process (dedicated OS thread, bounded)
//! ```
//!
//! Admission happens at submission: a task that the [`ResourceMonitor`]
//! refuses is rejected with a [`ResourceError`] and never queued. An
//! admitted task holds an [`AllocationGuard`] until its result is produced,
//! so the allocation is released on success, failure, timeout and panic.
//!
//! ## Retry Strategy
//!
//! Failed attempts are retried up to the stage's `max_retries` with
//! exponential backoff (`retry_backoff_ms * 2^(attempt-1)`). Validation and
//! dependency errors are not retried; they would fail identically.
//!
//! ## Substrates
//!
//! Async stages run on the worker itself. Thread stages run on Tokio's
//! blocking pool. Process stages each get a dedicated OS thread driving a
//! private current-thread runtime, so CPU-heavy or blocking code never
//! occupies an executor thread and a panic or stall stays confined to that
//! thread. Each substrate other than async is bounded by its slot count.
//!
//! ## Cancellation
//!
//! A task whose run was cancelled while it waited in a queue is resolved as
//! skipped at dequeue and its stage is never executed.
//!
//! ## Timeouts
//!
//! The per-stage timeout bounds each attempt. On expiry the attempt is
//! abandoned and counted as failed, whatever the substrate. Work on a
//! blocking thread cannot be interrupted and runs to completion with its
//! result discarded. A process-substrate attempt is signalled to abort: its
//! future is dropped at the next await point, which kills any child it owns,
//! and its slot is held until the thread exits.

mod queue;
mod stats;

pub use stats::{PoolStats, WorkerStats};

use crate::config::{ExecutorKind, Priority};
use crate::error::{ResourceError, StageError};
use crate::resources::{AllocationGuard, ResourceMonitor, ResourceRequirements};
use crate::run::StageResult;
use crate::stage::{finish_result, ManagedStage, StageContext, StageOutput};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use queue::TaskQueues;
use serde::{Deserialize, Serialize};
use stats::StatsTable;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of async worker loops. Default: number of CPUs.
    pub async_workers: usize,
    /// Concurrent blocking-thread executions. Default: number of CPUs.
    pub thread_slots: usize,
    /// Concurrent process-substrate executions. Default: half the CPUs.
    pub process_slots: usize,
    /// How long an idle worker waits on the FIFO queue before re-checking
    /// the priority heap and the shutdown signal. Default: 100 ms.
    pub poll_interval_ms: u64,
    /// Base delay for retry backoff. Default: 500 ms.
    pub retry_backoff_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            async_workers: cpus,
            thread_slots: cpus,
            process_slots: (cpus / 2).max(1),
            poll_interval_ms: 100,
            retry_backoff_ms: 500,
        }
    }
}

/// A unit of work owned by the pool between submission and completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTask {
    pub task_id: Uuid,
    pub stage_name: String,
    pub run_id: Uuid,
    pub priority: Priority,
    pub executor: ExecutorKind,
    pub submitted_at: DateTime<Utc>,
    pub resource_requirements: ResourceRequirements,
    pub timeout: Option<Duration>,
}

/// Awaitable handle for a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: Uuid,
    stage_name: String,
    rx: oneshot::Receiver<StageResult>,
}

impl TaskHandle {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Wait for the task's result. A task dropped by a shutting-down pool
    /// resolves to a failed result.
    pub async fn result(self) -> StageResult {
        match self.rx.await {
            Ok(r) => r,
            Err(_) => StageResult::failed(
                &self.stage_name,
                StageError::Cancelled {
                    stage: self.stage_name.clone(),
                }
                .to_string(),
            ),
        }
    }
}

struct Job {
    task: WorkerTask,
    stage: Arc<ManagedStage>,
    ctx: StageContext,
    max_retries: u32,
    reply: oneshot::Sender<StageResult>,
    allocation: AllocationGuard,
}

struct Shared {
    config: PoolConfig,
    monitor: Arc<ResourceMonitor>,
    queues: TaskQueues<Job>,
    stats: StatsTable,
    thread_slots: Arc<Semaphore>,
    process_slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

/// Runs admitted stage tasks on async workers and bounded thread/process
/// substrates.
///
/// Workers are spawned on the first submission, so the pool can be built
/// outside a Tokio runtime.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.shared.config)
            .field("queued", &self.shared.queues.len())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig, monitor: Arc<ResourceMonitor>) -> Self {
        let thread_slots = Arc::new(Semaphore::new(config.thread_slots.max(1)));
        let process_slots = Arc::new(Semaphore::new(config.process_slots.max(1)));
        Self {
            shared: Arc::new(Shared {
                config,
                monitor,
                queues: TaskQueues::default(),
                stats: StatsTable::default(),
                thread_slots,
                process_slots,
                shutdown: CancellationToken::new(),
            }),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.shared.monitor
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Admit and enqueue a stage execution.
    ///
    /// Fails fast with a [`ResourceError`] when the monitor refuses the
    /// stage's requirements; nothing is queued in that case. Must be called
    /// from within a Tokio runtime.
    pub fn submit_task(
        &self,
        stage: Arc<ManagedStage>,
        ctx: StageContext,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<TaskHandle, ResourceError> {
        if self.is_shut_down() {
            return Err(ResourceError::Denied {
                reason: "worker pool is shut down".into(),
            });
        }

        let requirements = stage.requirements();
        let monitor = &self.shared.monitor;
        monitor.fits_capacity(&requirements)?;

        let task_id = Uuid::new_v4();
        let allocation = monitor.acquire(task_id, &requirements)?;
        self.ensure_started();

        let task = WorkerTask {
            task_id,
            stage_name: stage.name().to_string(),
            run_id: ctx.run_id,
            priority,
            executor: stage.spec().executor,
            submitted_at: Utc::now(),
            resource_requirements: requirements,
            timeout,
        };
        debug!(
            %task_id,
            stage = %task.stage_name,
            priority = ?priority,
            executor = %task.executor,
            "task submitted"
        );

        let (tx, rx) = oneshot::channel();
        let handle = TaskHandle {
            task_id,
            stage_name: task.stage_name.clone(),
            rx,
        };
        let max_retries = stage.spec().max_retries;
        self.shared.queues.push(
            priority,
            Job {
                task,
                stage,
                ctx,
                max_retries,
                reply: tx,
                allocation,
            },
        );
        monitor.set_queued_tasks(self.shared.queues.len());
        Ok(handle)
    }

    pub fn stats(&self) -> PoolStats {
        let workers = self.shared.stats.snapshot();
        let (tasks_completed, tasks_failed, average_processing_time_ms) =
            stats::aggregate(&workers);
        PoolStats {
            workers,
            tasks_completed,
            tasks_failed,
            average_processing_time_ms,
            queued_priority: self.shared.queues.len_priority(),
            queued_regular: self.shared.queues.len_regular(),
            thread_slots_available: self.shared.thread_slots.available_permits(),
            process_slots_available: self.shared.process_slots.available_permits(),
        }
    }

    /// Stop the workers. Tasks still queued are dropped and their handles
    /// resolve to failed results; running tasks finish first.
    pub async fn shutdown(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.shutdown.cancel();
        self.shared.queues.wake_all();

        let workers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for w in workers {
            let _ = w.await;
        }
        let dropped = self.shared.queues.drain();
        if !dropped.is_empty() {
            warn!(count = dropped.len(), "dropping queued tasks on shutdown");
        }
        self.shared.monitor.set_queued_tasks(0);
        info!("worker pool stopped");
    }

    fn ensure_started(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let n = self.shared.config.async_workers.max(1);
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for id in 0..n {
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(worker_loop(id, shared)));
        }
        debug!(workers = n, "worker pool started");
    }
}

async fn worker_loop(id: usize, shared: Arc<Shared>) {
    shared.stats.register(id);
    let poll = Duration::from_millis(shared.config.poll_interval_ms.max(1));

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }
        shared.stats.heartbeat(id);

        let job = match shared.queues.try_pop_priority() {
            Some(job) => job,
            None => {
                let next = tokio::select! {
                    job = shared.queues.pop_regular_timeout(poll) => job,
                    _ = shared.shutdown.cancelled() => break,
                };
                match next {
                    Some(job) => job,
                    None => continue,
                }
            }
        };
        shared.monitor.set_queued_tasks(shared.queues.len());

        let Job {
            task,
            stage,
            ctx,
            max_retries,
            reply,
            allocation,
        } = job;

        if ctx.is_cancelled() {
            debug!(
                worker = id,
                task_id = %task.task_id,
                stage = %task.stage_name,
                "run cancelled while queued"
            );
            drop(allocation);
            let _ = reply.send(StageResult::skipped(
                &task.stage_name,
                "run cancelled before execution",
            ));
            continue;
        }

        let started = Instant::now();
        let result = run_task(&shared, &task, &stage, &ctx, max_retries).await;
        shared
            .stats
            .record(id, result.is_completed(), started.elapsed());

        debug!(
            worker = id,
            task_id = %task.task_id,
            stage = %task.stage_name,
            status = %result.status,
            "task finished"
        );
        drop(allocation);
        // The submitter may have given up waiting (global timeout).
        let _ = reply.send(result);
    }
    debug!(worker = id, "worker exiting");
}

async fn run_task(
    shared: &Shared,
    task: &WorkerTask,
    stage: &Arc<ManagedStage>,
    ctx: &StageContext,
    max_retries: u32,
) -> StageResult {
    let started = StageResult::started(&task.stage_name);
    let mut attempts: u32 = 0;

    let outcome = loop {
        attempts += 1;
        let outcome = run_attempt(shared, task, stage, ctx).await;
        match outcome {
            Ok(out) => break Ok(out),
            Err(e) if attempts <= max_retries && is_retryable(&e) && !ctx.is_cancelled() => {
                let backoff = shared
                    .config
                    .retry_backoff_ms
                    .saturating_mul(2u64.saturating_pow(attempts - 1));
                warn!(
                    stage = %task.stage_name,
                    task_id = %task.task_id,
                    attempt = attempts,
                    max_retries,
                    backoff_ms = backoff,
                    error = %e,
                    "stage attempt failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(backoff)) => {}
                    _ = ctx.cancellation_token().cancelled() => break Err(e),
                }
            }
            Err(e) => break Err(e),
        }
    };

    let mut result = finish_result(started, outcome);
    result
        .metrics
        .insert("attempts".into(), f64::from(attempts));
    result
}

fn is_retryable(e: &StageError) -> bool {
    matches!(
        e,
        StageError::Execution { .. } | StageError::Timeout { .. } | StageError::Panicked { .. }
    )
}

async fn run_attempt(
    shared: &Shared,
    task: &WorkerTask,
    stage: &Arc<ManagedStage>,
    ctx: &StageContext,
) -> Result<StageOutput, StageError> {
    let attempt = async {
        match task.executor {
            ExecutorKind::Async => run_async(stage, ctx).await,
            ExecutorKind::Thread => run_on_thread(shared, stage, ctx).await,
            ExecutorKind::Process => run_in_process_slot(shared, stage, ctx).await,
        }
    };

    match task.timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(r) => r,
            Err(_) => {
                warn!(stage = %task.stage_name, secs = limit.as_secs(), "stage attempt timed out");
                Err(StageError::Timeout {
                    stage: task.stage_name.clone(),
                    secs: limit.as_secs(),
                })
            }
        },
        None => attempt.await,
    }
}

async fn run_async(stage: &ManagedStage, ctx: &StageContext) -> Result<StageOutput, StageError> {
    match AssertUnwindSafe(stage.execute(ctx)).catch_unwind().await {
        Ok(r) => r,
        Err(payload) => Err(StageError::Panicked {
            stage: stage.name().to_string(),
            detail: panic_message(payload.as_ref()),
        }),
    }
}

async fn run_on_thread(
    shared: &Shared,
    stage: &Arc<ManagedStage>,
    ctx: &StageContext,
) -> Result<StageOutput, StageError> {
    let permit = Arc::clone(&shared.thread_slots)
        .acquire_owned()
        .await
        .map_err(|_| StageError::Cancelled {
            stage: stage.name().to_string(),
        })?;
    let runtime = tokio::runtime::Handle::current();
    let owned_stage = Arc::clone(stage);
    let owned_ctx = ctx.clone();

    let joined = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        runtime.block_on(async move { owned_stage.execute(&owned_ctx).await })
    })
    .await;
    joined.unwrap_or_else(|e| Err(join_error(stage.name(), e)))
}

async fn run_in_process_slot(
    shared: &Shared,
    stage: &Arc<ManagedStage>,
    ctx: &StageContext,
) -> Result<StageOutput, StageError> {
    let permit = Arc::clone(&shared.process_slots)
        .acquire_owned()
        .await
        .map_err(|_| StageError::Cancelled {
            stage: stage.name().to_string(),
        })?;
    let name = stage.name().to_string();
    let owned_stage = Arc::clone(stage);
    let owned_ctx = ctx.clone();
    let abort = CancellationToken::new();
    let abort_on_thread = abort.clone();
    let (tx, rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("docpipe-process".into())
        .spawn(move || {
            let _permit = permit;
            let stage_name = owned_stage.name().to_string();
            let outcome = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => {
                    let attempt = AssertUnwindSafe(async {
                        tokio::select! {
                            r = owned_stage.execute(&owned_ctx) => r,
                            _ = abort_on_thread.cancelled() => Err(StageError::Cancelled {
                                stage: stage_name.clone(),
                            }),
                        }
                    })
                    .catch_unwind();
                    rt.block_on(attempt).unwrap_or_else(|payload| {
                        Err(StageError::Panicked {
                            stage: stage_name.clone(),
                            detail: panic_message(payload.as_ref()),
                        })
                    })
                }
                Err(e) => Err(StageError::execution(
                    &stage_name,
                    format!("failed to build stage runtime: {e}"),
                )),
            };
            // The waiter is gone once the attempt timed out.
            let _ = tx.send(outcome);
        })
        .map_err(|e| StageError::execution(&name, format!("failed to spawn stage thread: {e}")))?;

    let _abort = abort.drop_guard();
    rx.await.unwrap_or(Err(StageError::Cancelled { stage: name }))
}

fn join_error(stage: &str, e: JoinError) -> StageError {
    if e.is_panic() {
        let payload = e.into_panic();
        StageError::Panicked {
            stage: stage.to_string(),
            detail: panic_message(payload.as_ref()),
        }
    } else {
        StageError::Cancelled {
            stage: stage.to_string(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageSpec;
    use crate::resources::{FixedSampler, HostUsage, ResourceLimits};
    use crate::run::{Metadata, StageStatus};
    use crate::stage::Stage;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Stage for Flaky {
        async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StageError::execution(&ctx.stage_name, "transient"));
            }
            Ok(StageOutput::new(serde_json::json!("done")))
        }
    }

    struct Sleepy(Duration);

    #[async_trait]
    impl Stage for Sleepy {
        async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, StageError> {
            tokio::time::sleep(self.0).await;
            Ok(StageOutput::default())
        }
    }

    struct Panicky;

    #[async_trait]
    impl Stage for Panicky {
        async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, StageError> {
            panic!("kaboom");
        }
    }

    struct Blocking;

    #[async_trait]
    impl Stage for Blocking {
        async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, StageError> {
            std::thread::sleep(Duration::from_millis(10));
            Ok(StageOutput::new(serde_json::json!("blocked")))
        }
    }

    /// Holds its OS thread without yielding to the runtime.
    struct Stalls(Duration);

    #[async_trait]
    impl Stage for Stalls {
        async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, StageError> {
            std::thread::sleep(self.0);
            Ok(StageOutput::new(serde_json::json!("stalled")))
        }
    }

    struct Counted(Arc<AtomicU32>);

    #[async_trait]
    impl Stage for Counted {
        async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, StageError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(StageOutput::default())
        }
    }

    fn monitor() -> Arc<ResourceMonitor> {
        let sampler = FixedSampler::new(HostUsage::idle(8, 16_000));
        Arc::new(ResourceMonitor::with_sampler(
            ResourceLimits::default(),
            Box::new(sampler),
        ))
    }

    fn pool(monitor: Arc<ResourceMonitor>) -> WorkerPool {
        WorkerPool::new(
            PoolConfig {
                async_workers: 2,
                thread_slots: 2,
                process_slots: 1,
                poll_interval_ms: 10,
                retry_backoff_ms: 1,
            },
            monitor,
        )
    }

    fn managed(spec: StageSpec, stage: impl Stage + 'static) -> (Arc<ManagedStage>, StageContext) {
        let ctx = StageContext::new(
            Uuid::new_v4(),
            "doc",
            &spec,
            Arc::new(Metadata::new()),
            HashMap::new(),
        );
        (Arc::new(ManagedStage::new(spec, Arc::new(stage))), ctx)
    }

    #[tokio::test]
    async fn retries_until_success_and_records_attempts() {
        let m = monitor();
        let p = pool(Arc::clone(&m));
        let (stage, ctx) = managed(
            StageSpec::new("flaky")
                .max_retries(3)
                .resources(ResourceRequirements::new(1.0, 64)),
            Flaky {
                failures_left: AtomicU32::new(2),
                calls: AtomicU32::new(0),
            },
        );
        let handle = p.submit_task(stage, ctx, Priority::Normal, None).unwrap();
        let result = handle.result().await;
        assert_eq!(result.status, StageStatus::Completed);
        assert_eq!(result.metrics["attempts"], 3.0);
        assert_eq!(m.active_allocations(), 0);
        p.shutdown().await;
    }

    #[tokio::test]
    async fn timeout_marks_failed() {
        let p = pool(monitor());
        let (stage, ctx) = managed(StageSpec::new("slow"), Sleepy(Duration::from_secs(5)));
        let handle = p
            .submit_task(stage, ctx, Priority::High, Some(Duration::from_millis(20)))
            .unwrap();
        let result = handle.result().await;
        assert_eq!(result.status, StageStatus::Failed);
        assert!(result.error.unwrap().contains("timed out"));
        p.shutdown().await;
    }

    #[tokio::test]
    async fn panic_becomes_failed_result_and_worker_survives() {
        let p = pool(monitor());
        let (bad, ctx) = managed(StageSpec::new("bad"), Panicky);
        let result = p
            .submit_task(bad, ctx, Priority::Normal, None)
            .unwrap()
            .result()
            .await;
        assert_eq!(result.status, StageStatus::Failed);
        assert!(result.error.unwrap().contains("kaboom"));

        let (good, ctx) = managed(StageSpec::new("good"), Sleepy(Duration::from_millis(1)));
        let result = p
            .submit_task(good, ctx, Priority::Normal, None)
            .unwrap()
            .result()
            .await;
        assert_eq!(result.status, StageStatus::Completed);

        let stats = p.stats();
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(stats.tasks_completed, 1);
        p.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn thread_and_process_substrates_run_stages() {
        let p = pool(monitor());
        let (t, ctx) = managed(
            StageSpec::new("t").executor(ExecutorKind::Thread),
            Blocking,
        );
        let r = p.submit_task(t, ctx, Priority::Normal, None).unwrap().result().await;
        assert_eq!(r.status, StageStatus::Completed);
        assert_eq!(r.output_data, serde_json::json!("blocked"));

        let (pr, ctx) = managed(
            StageSpec::new("p").executor(ExecutorKind::Process),
            Panicky,
        );
        let r = p.submit_task(pr, ctx, Priority::Normal, None).unwrap().result().await;
        assert_eq!(r.status, StageStatus::Failed);
        assert!(r.error.unwrap().contains("kaboom"));
        p.shutdown().await;
    }

    // Current-thread runtime: the timeout can only fire if the stage is off
    // the executor.
    #[tokio::test]
    async fn blocking_process_stage_times_out() {
        let p = pool(monitor());
        let (stage, ctx) = managed(
            StageSpec::new("stall").executor(ExecutorKind::Process),
            Stalls(Duration::from_millis(400)),
        );
        let started = Instant::now();
        let result = p
            .submit_task(stage, ctx, Priority::Normal, Some(Duration::from_millis(50)))
            .unwrap()
            .result()
            .await;
        assert_eq!(result.status, StageStatus::Failed);
        assert!(result.error.unwrap().contains("timed out"));
        assert!(started.elapsed() < Duration::from_millis(300));
        p.shutdown().await;
    }

    #[tokio::test]
    async fn process_stage_runs_off_the_async_workers() {
        let p = pool(monitor());
        let (stage, ctx) = managed(
            StageSpec::new("p").executor(ExecutorKind::Process),
            Stalls(Duration::from_millis(5)),
        );
        let r = p.submit_task(stage, ctx, Priority::Normal, None).unwrap().result().await;
        assert_eq!(r.status, StageStatus::Completed);
        assert_eq!(r.output_data, serde_json::json!("stalled"));
        p.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_while_queued_is_skipped_without_executing() {
        let m = monitor();
        let p = WorkerPool::new(
            PoolConfig {
                async_workers: 1,
                thread_slots: 1,
                process_slots: 1,
                poll_interval_ms: 10,
                retry_backoff_ms: 1,
            },
            Arc::clone(&m),
        );
        // Occupy the only worker so the next task stays queued.
        let (busy, ctx) = managed(StageSpec::new("busy"), Sleepy(Duration::from_millis(100)));
        let busy = p.submit_task(busy, ctx, Priority::Normal, None).unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let (queued, ctx) = managed(StageSpec::new("queued"), Counted(Arc::clone(&calls)));
        let handle = p
            .submit_task(queued, ctx.with_cancellation(token.clone()), Priority::Normal, None)
            .unwrap();
        token.cancel();

        let result = handle.result().await;
        assert_eq!(result.status, StageStatus::Skipped);
        assert_eq!(result.output_data["reason"], "run cancelled before execution");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(busy.result().await.status, StageStatus::Completed);
        assert_eq!(m.active_allocations(), 0);
        p.shutdown().await;
    }

    #[tokio::test]
    async fn denied_admission_never_queues() {
        let m = monitor();
        let p = pool(Arc::clone(&m));
        let (stage, ctx) = managed(
            StageSpec::new("huge").resources(ResourceRequirements::new(0.5, 15_000)),
            Sleepy(Duration::from_millis(1)),
        );
        let err = p.submit_task(stage, ctx, Priority::Normal, None).unwrap_err();
        assert!(matches!(err, ResourceError::ExceedsCapacity { .. }));
        assert_eq!(p.stats().queued(), 0);
        assert_eq!(m.active_allocations(), 0);
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_denied() {
        let p = pool(monitor());
        p.shutdown().await;
        let (stage, ctx) = managed(StageSpec::new("s"), Sleepy(Duration::from_millis(1)));
        assert!(p.submit_task(stage, ctx, Priority::Normal, None).is_err());
    }
}
