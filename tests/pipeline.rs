//! End-to-end tests for the pipeline engine.
//!
//! Every test drives the public API with scripted stages, an in-memory (or
//! temp-dir) checkpoint store and a fixed-usage resource sampler, so
//! admission decisions are deterministic regardless of the host's load.
//!
//! Run with:
//!   cargo test --test pipeline

use async_trait::async_trait;
use edgequake_docpipe::{
    ConfigError, EventKind, ExecuteOptions, FileCheckpointStore, FixedSampler, HostUsage,
    MemoryCheckpointStore, Metadata, PipelineConfig, PipelineDefinition, PipelineError,
    PipelineManager, PoolConfig, ResourceError, ResourceLimits, ResourceMonitor,
    ResourceRequirements, RunStatus, Stage, StageContext, StageError, StageOutput, StageRegistry,
    StageSpec, StageStatus, WorkerPool,
};
use edgequake_docpipe::{ManagedStage, Priority};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tracing_subscriber::EnvFilter;

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Counters shared between a scripted stage and the test body.
#[derive(Debug, Default)]
struct Probe {
    calls: AtomicUsize,
    dry_runs: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Probe {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// A stage whose behaviour is set by the test.
struct Scripted {
    probe: Arc<Probe>,
    delay: Duration,
    /// Fail this many leading attempts, then succeed.
    failures: usize,
    always_fail: bool,
    progress_steps: u64,
}

impl Scripted {
    fn new(probe: Arc<Probe>) -> Self {
        Self {
            probe,
            delay: Duration::ZERO,
            failures: 0,
            always_fail: false,
            progress_steps: 0,
        }
    }
}

#[async_trait]
impl Stage for Scripted {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        let attempt = self.probe.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.peak.fetch_max(now, Ordering::SeqCst);

        for step in 1..=self.progress_steps {
            ctx.report_progress(step, self.progress_steps, Some("working"));
        }

        let interrupted = tokio::select! {
            _ = tokio::time::sleep(self.delay) => false,
            _ = ctx.cancellation_token().cancelled() => true,
        };
        self.probe.active.fetch_sub(1, Ordering::SeqCst);

        if interrupted {
            return Err(StageError::Cancelled {
                stage: ctx.stage_name.clone(),
            });
        }
        if self.always_fail || attempt <= self.failures {
            return Err(StageError::execution(
                &ctx.stage_name,
                format!("scripted failure on attempt {attempt}"),
            ));
        }
        Ok(StageOutput::new(json!({ "stage": ctx.stage_name, "attempt": attempt })))
    }

    async fn dry_run(&self, _ctx: &StageContext) -> Result<StageOutput, StageError> {
        self.probe.dry_runs.fetch_add(1, Ordering::SeqCst);
        Ok(StageOutput::new(json!({ "validated": true })))
    }
}

/// Registry of scripted stages keyed by stage name (the default type id).
#[derive(Default)]
struct Script {
    registry: StageRegistry,
    probes: HashMap<String, Arc<Probe>>,
}

impl Script {
    fn stage(mut self, name: &str, configure: impl FnOnce(&mut Scripted)) -> Self {
        let probe = Arc::new(Probe::default());
        let mut stage = Scripted::new(Arc::clone(&probe));
        configure(&mut stage);
        self.registry.register_instance(name, Arc::new(stage));
        self.probes.insert(name.to_string(), probe);
        self
    }

    fn ok(self, name: &str) -> Self {
        self.stage(name, |_| {})
    }

    fn probe(&self, name: &str) -> Arc<Probe> {
        Arc::clone(&self.probes[name])
    }
}

/// Route library logs through the test harness; `RUST_LOG=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn idle_host() -> HostUsage {
    HostUsage::idle(8, 16_000)
}

fn monitor_with(limits: ResourceLimits) -> Arc<ResourceMonitor> {
    Arc::new(ResourceMonitor::with_sampler(
        limits,
        Box::new(FixedSampler::new(idle_host())),
    ))
}

fn fast_pool() -> PoolConfig {
    PoolConfig {
        async_workers: 4,
        thread_slots: 2,
        process_slots: 2,
        poll_interval_ms: 10,
        retry_backoff_ms: 5,
    }
}

fn manager(
    definition: PipelineDefinition,
    script: &Script,
    store: Arc<MemoryCheckpointStore>,
) -> PipelineManager {
    init_tracing();
    PipelineManager::builder(definition)
        .registry(script.registry.clone())
        .monitor(monitor_with(ResourceLimits::default()))
        .checkpoint_store(store)
        .pool_config(fast_pool())
        .build()
        .expect("manager builds")
}

fn status(run: &edgequake_docpipe::PipelineRun, stage: &str) -> Option<StageStatus> {
    run.stage_status(stage)
}

/// Poll until `probe` has seen at least one call.
async fn wait_for_call(probe: &Probe) {
    for _ in 0..200 {
        if probe.calls() > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("stage never started");
}

// ── Scheduling and failure policy ────────────────────────────────────────────

#[tokio::test]
async fn non_critical_failure_skips_dependents_and_keeps_siblings() {
    let script = Script::default()
        .ok("a")
        .stage("b", |s| s.always_fail = true)
        .ok("c")
        .ok("d");
    let definition = PipelineConfig::builder("diamond")
        .stage(StageSpec::new("a"))
        .stage(StageSpec::new("b").depends_on(["a"]).critical(false))
        .stage(StageSpec::new("c").depends_on(["a"]))
        .stage(StageSpec::new("d").depends_on(["b", "c"]))
        .build()
        .unwrap();
    let manager = manager(definition, &script, Arc::new(MemoryCheckpointStore::new()));

    let run = manager
        .execute("doc-1", Metadata::new(), ExecuteOptions::default())
        .await
        .expect("non-critical failures do not abort");

    assert_eq!(status(&run, "a"), Some(StageStatus::Completed));
    assert_eq!(status(&run, "b"), Some(StageStatus::Failed));
    assert_eq!(status(&run, "c"), Some(StageStatus::Completed));
    assert_eq!(status(&run, "d"), Some(StageStatus::Skipped));
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.stage_results["d"].output_data["reason"],
        "dependency 'b' failed"
    );
    assert!(run.stage_results["b"]
        .error
        .as_deref()
        .unwrap()
        .contains("scripted failure"));
    assert_eq!(script.probe("d").calls(), 0);

    manager.shutdown().await;
}

#[test]
fn cycle_is_rejected_before_anything_runs() {
    let err = PipelineConfig::builder("loop")
        .stage(StageSpec::new("x").depends_on(["z"]))
        .stage(StageSpec::new("y").depends_on(["x"]))
        .stage(StageSpec::new("z").depends_on(["y"]))
        .build()
        .unwrap_err();

    match err {
        ConfigError::Cycle { cycles } => {
            assert_eq!(cycles.len(), 1);
            let mut members = cycles[0].clone();
            members.sort();
            members.dedup();
            assert_eq!(members, vec!["x", "y", "z"]);
        }
        other => panic!("expected a cycle error, got {other}"),
    }
}

#[tokio::test]
async fn critical_failure_aborts_and_attaches_the_run() {
    let script = Script::default()
        .stage("a", |s| s.always_fail = true)
        .ok("b");
    let definition = PipelineConfig::builder("abort")
        .stage(StageSpec::new("a"))
        .stage(StageSpec::new("b").depends_on(["a"]))
        .build()
        .unwrap();
    let manager = manager(definition, &script, Arc::new(MemoryCheckpointStore::new()));

    let err = manager
        .execute("doc", Metadata::new(), ExecuteOptions::default())
        .await
        .unwrap_err();

    match &err {
        PipelineError::CriticalStageFailed { stage, run, .. } => {
            assert_eq!(stage, "a");
            assert_eq!(run.status, RunStatus::Failed);
            assert_eq!(status(run, "a"), Some(StageStatus::Failed));
            assert!(status(run, "b").is_none(), "no stage starts after the abort");
        }
        other => panic!("expected CriticalStageFailed, got {other}"),
    }
    assert!(err.run().is_some());
    assert_eq!(script.probe("b").calls(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn false_condition_skips_without_failing_the_run() {
    let script = Script::default().ok("parse").ok("translate").ok("index");
    let definition = PipelineConfig::builder("conditional")
        .stage(StageSpec::new("parse"))
        .stage(
            StageSpec::new("translate")
                .depends_on(["parse"])
                .condition("language != 'en'"),
        )
        .stage(
            StageSpec::new("index")
                .depends_on(["parse"])
                .condition("pages > 10 && has_text"),
        )
        .build()
        .unwrap();
    let manager = manager(definition, &script, Arc::new(MemoryCheckpointStore::new()));

    let mut metadata = Metadata::new();
    metadata.insert("language".into(), json!("en"));
    metadata.insert("pages".into(), json!(42));
    metadata.insert("has_text".into(), json!(true));

    let run = manager
        .execute("doc", metadata, ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(status(&run, "translate"), Some(StageStatus::Skipped));
    assert_eq!(
        run.stage_results["translate"].output_data["reason"],
        "condition 'language != 'en'' is false"
    );
    assert_eq!(status(&run, "index"), Some(StageStatus::Completed));
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(script.probe("translate").calls(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn dependency_output_is_visible_downstream() {
    struct Reader(Arc<std::sync::Mutex<Option<serde_json::Value>>>);

    #[async_trait]
    impl Stage for Reader {
        async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
            *self.0.lock().unwrap() = ctx.dependency_output("parse").cloned();
            Ok(StageOutput::default())
        }
    }

    let seen = Arc::new(std::sync::Mutex::new(None));
    let mut script = Script::default().ok("parse");
    script
        .registry
        .register_instance("tables", Arc::new(Reader(Arc::clone(&seen))));
    let definition = PipelineConfig::builder("handoff")
        .stage(StageSpec::new("parse"))
        .stage(StageSpec::new("tables").depends_on(["parse"]))
        .build()
        .unwrap();
    let manager = manager(definition, &script, Arc::new(MemoryCheckpointStore::new()));

    manager
        .execute("doc", Metadata::new(), ExecuteOptions::default())
        .await
        .unwrap();

    let output = seen.lock().unwrap().clone().expect("parse output passed on");
    assert_eq!(output["stage"], "parse");

    manager.shutdown().await;
}

// ── Retries and timeouts ─────────────────────────────────────────────────────

#[tokio::test]
async fn retries_until_success_and_records_attempts() {
    let script = Script::default().stage("flaky", |s| s.failures = 2);
    let definition = PipelineConfig::builder("retry")
        .stage(StageSpec::new("flaky").max_retries(2))
        .build()
        .unwrap();
    let manager = manager(definition, &script, Arc::new(MemoryCheckpointStore::new()));

    let run = assert_ok!(
        manager
            .execute("doc", Metadata::new(), ExecuteOptions::default())
            .await
    );

    let result = &run.stage_results["flaky"];
    assert_eq!(result.status, StageStatus::Completed);
    assert_eq!(result.metrics["attempts"], 3.0);
    assert_eq!(script.probe("flaky").calls(), 3);

    manager.shutdown().await;
}

#[tokio::test]
async fn retries_are_bounded() {
    let script = Script::default().stage("broken", |s| s.always_fail = true);
    let definition = PipelineConfig::builder("retry")
        .stage(StageSpec::new("broken").max_retries(1).critical(false))
        .build()
        .unwrap();
    let manager = manager(definition, &script, Arc::new(MemoryCheckpointStore::new()));

    let run = manager
        .execute("doc", Metadata::new(), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(status(&run, "broken"), Some(StageStatus::Failed));
    assert_eq!(script.probe("broken").calls(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn stage_timeout_fails_only_that_stage() {
    let script = Script::default()
        .stage("slow", |s| s.delay = Duration::from_secs(30))
        .ok("fast");
    let definition = PipelineConfig::builder("timeouts")
        .stage(StageSpec::new("slow").timeout_secs(1).critical(false))
        .stage(StageSpec::new("fast"))
        .build()
        .unwrap();
    let manager = manager(definition, &script, Arc::new(MemoryCheckpointStore::new()));

    let run = tokio::time::timeout(
        Duration::from_secs(10),
        manager.execute("doc", Metadata::new(), ExecuteOptions::default()),
    )
    .await
    .expect("stage timeout bounds the run")
    .unwrap();

    let slow = &run.stage_results["slow"];
    assert_eq!(slow.status, StageStatus::Failed);
    assert!(slow.error.as_deref().unwrap().contains("timed out after 1s"));
    assert_eq!(status(&run, "fast"), Some(StageStatus::Completed));

    manager.shutdown().await;
}

#[tokio::test]
async fn global_timeout_returns_err_with_partial_run() {
    let script = Script::default()
        .ok("first")
        .stage("forever", |s| s.delay = Duration::from_secs(60));
    let definition = PipelineConfig::builder("budget")
        .global_timeout_secs(1)
        .stage(StageSpec::new("first"))
        .stage(StageSpec::new("forever").depends_on(["first"]))
        .build()
        .unwrap();
    let manager = manager(definition, &script, Arc::new(MemoryCheckpointStore::new()));

    let err = manager
        .execute("doc", Metadata::new(), ExecuteOptions::default())
        .await
        .unwrap_err();

    match err {
        PipelineError::Timeout { secs, run } => {
            assert_eq!(secs, 1);
            assert_eq!(status(&run, "first"), Some(StageStatus::Completed));
            let forever = &run.stage_results["forever"];
            assert_eq!(forever.status, StageStatus::Failed);
            assert_eq!(
                forever.error.as_deref(),
                Some("Pipeline timed out after 1s")
            );
        }
        other => panic!("expected Timeout, got {other}"),
    }

    manager.shutdown().await;
}

// ── Checkpoint and resume ────────────────────────────────────────────────────

#[tokio::test]
async fn resume_skips_completed_stages() {
    let script = Script::default()
        .ok("a")
        .ok("b")
        .stage("c", |s| s.failures = 1);
    let definition = PipelineConfig::builder("resume")
        .stage(StageSpec::new("a"))
        .stage(StageSpec::new("b").depends_on(["a"]))
        .stage(StageSpec::new("c").depends_on(["b"]).critical(false))
        .build()
        .unwrap();
    let store = Arc::new(MemoryCheckpointStore::new());
    let manager = manager(definition, &script, Arc::clone(&store));

    let first = manager
        .execute("doc-7", Metadata::new(), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Failed);
    assert_eq!(status(&first, "c"), Some(StageStatus::Failed));
    assert!(store.write_count() > 0);

    let second = manager
        .execute("doc-7", Metadata::new(), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.resumed_stages, vec!["a", "b"]);
    assert_eq!(script.probe("a").calls(), 1);
    assert_eq!(script.probe("b").calls(), 1);
    assert_eq!(script.probe("c").calls(), 2);

    // Nothing left to do: the restored set is the final set.
    let third = manager
        .execute("doc-7", Metadata::new(), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(third.status, RunStatus::Completed);
    assert_eq!(third.resumed_stages.len(), 3);
    let mut keys: Vec<_> = third.stage_results.keys().cloned().collect();
    keys.sort();
    assert_eq!(keys, vec!["a", "b", "c"]);
    assert_eq!(script.probe("c").calls(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn checkpoints_are_per_document() {
    let script = Script::default().ok("a");
    let definition = PipelineConfig::builder("per-doc")
        .stage(StageSpec::new("a"))
        .build()
        .unwrap();
    let manager = manager(definition, &script, Arc::new(MemoryCheckpointStore::new()));

    for doc in ["one", "two"] {
        let run = manager
            .execute(doc, Metadata::new(), ExecuteOptions::default())
            .await
            .unwrap();
        assert!(run.resumed_stages.is_empty());
    }
    assert_eq!(script.probe("a").calls(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn without_checkpoint_neither_restores_nor_persists() {
    let script = Script::default().ok("a");
    let definition = PipelineConfig::builder("ephemeral")
        .stage(StageSpec::new("a"))
        .build()
        .unwrap();
    let store = Arc::new(MemoryCheckpointStore::new());
    let manager = manager(definition, &script, Arc::clone(&store));

    for _ in 0..2 {
        manager
            .execute("doc", Metadata::new(), ExecuteOptions::without_checkpoint())
            .await
            .unwrap();
    }
    assert_eq!(store.write_count(), 0);
    assert_eq!(script.probe("a").calls(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn file_store_resumes_across_managers() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::default().ok("a").stage("b", |s| s.failures = 1);
    let definition = || {
        PipelineConfig::builder("durable")
            .stage(StageSpec::new("a"))
            .stage(StageSpec::new("b").depends_on(["a"]).critical(false))
            .build()
            .unwrap()
    };
    let build = |store: FileCheckpointStore| {
        PipelineManager::builder(definition())
            .registry(script.registry.clone())
            .monitor(monitor_with(ResourceLimits::default()))
            .checkpoint_store(Arc::new(store))
            .pool_config(fast_pool())
            .build()
            .unwrap()
    };

    let first = build(FileCheckpointStore::open(dir.path()).await.unwrap());
    let run = first
        .execute("report.pdf", Metadata::new(), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(status(&run, "b"), Some(StageStatus::Failed));
    first.shutdown().await;

    let second = build(FileCheckpointStore::open(dir.path()).await.unwrap());
    let run = second
        .execute("report.pdf", Metadata::new(), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(run.resumed_stages, vec!["a"]);
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(script.probe("a").calls(), 1);
    second.shutdown().await;
}

// ── Dry run ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn dry_run_never_executes_or_persists() {
    let script = Script::default().ok("a").ok("b");
    let definition = PipelineConfig::builder("dry")
        .stage(StageSpec::new("a").resources(ResourceRequirements::new(2.0, 512)))
        .stage(StageSpec::new("b").depends_on(["a"]))
        .build()
        .unwrap();
    let store = Arc::new(MemoryCheckpointStore::new());
    let manager = manager(definition, &script, Arc::clone(&store));

    let run = assert_ok!(
        manager
            .execute("doc", Metadata::new(), ExecuteOptions::dry_run())
            .await
    );

    assert!(run.dry_run);
    assert_eq!(run.status, RunStatus::Completed);
    for name in ["a", "b"] {
        let result = &run.stage_results[name];
        assert_eq!(result.status, StageStatus::Completed);
        assert!(result.dry_run);
        assert_eq!(script.probe(name).calls(), 0);
        assert_eq!(script.probe(name).dry_runs.load(Ordering::SeqCst), 1);
    }
    assert_eq!(store.write_count(), 0);
    assert_eq!(manager.monitor().active_allocations(), 0);
    assert_eq!(manager.pool_stats().tasks_completed, 0);

    manager.shutdown().await;
}

// ── Resource admission ───────────────────────────────────────────────────────

#[tokio::test]
async fn impossible_memory_request_fails_without_queueing() {
    let script = Script::default().ok("huge");
    let definition = PipelineConfig::builder("oversized")
        .stage(
            StageSpec::new("huge")
                .resources(ResourceRequirements::new(1.0, 15_000))
                .critical(false),
        )
        .build()
        .unwrap();
    let manager = manager(definition, &script, Arc::new(MemoryCheckpointStore::new()));

    let run = manager
        .execute("doc", Metadata::new(), ExecuteOptions::default())
        .await
        .unwrap();

    let huge = &run.stage_results["huge"];
    assert_eq!(huge.status, StageStatus::Failed);
    assert!(huge.error.as_deref().unwrap().contains("memory"));
    assert_eq!(script.probe("huge").calls(), 0);
    let stats = manager.pool_stats();
    assert_eq!(stats.queued(), 0);
    assert_eq!(stats.tasks_completed + stats.tasks_failed, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn pool_rejects_oversized_task_at_submission() {
    let monitor = monitor_with(ResourceLimits::default());
    let pool = WorkerPool::new(fast_pool(), Arc::clone(&monitor));
    let probe = Arc::new(Probe::default());
    let spec = StageSpec::new("huge").resources(ResourceRequirements::new(1.0, 15_000));
    let stage = Arc::new(ManagedStage::new(
        spec.clone(),
        Arc::new(Scripted::new(Arc::clone(&probe))),
    ));
    let ctx = StageContext::new(
        uuid::Uuid::new_v4(),
        "doc",
        &spec,
        Arc::new(Metadata::new()),
        HashMap::new(),
    );

    let err = assert_err!(pool.submit_task(stage, ctx, Priority::Normal, None));

    assert!(matches!(err, ResourceError::ExceedsCapacity { .. }));
    assert_eq!(pool.stats().queued(), 0);
    assert_eq!(monitor.active_allocations(), 0);
    assert_eq!(probe.calls(), 0);
    pool.shutdown().await;
}

#[tokio::test]
async fn allocated_cores_never_exceed_the_limit() {
    let names = ["s1", "s2", "s3", "s4", "s5", "s6"];
    let shared = Arc::new(Probe::default());
    let mut script = Script::default();
    for name in names {
        let mut stage = Scripted::new(Arc::clone(&shared));
        stage.delay = Duration::from_millis(60);
        script.registry.register_instance(name, Arc::new(stage));
    }
    let mut builder = PipelineConfig::builder("saturate").max_parallel_stages(6);
    for name in names {
        builder = builder.stage(
            StageSpec::new(name).resources(ResourceRequirements::new(2.0, 128)),
        );
    }
    let definition = builder.build().unwrap();

    let limits = ResourceLimits {
        max_cpu_cores: Some(4.0),
        max_cpu_percent: 100.0,
        soft_cpu_percent: 100.0,
        ..ResourceLimits::default()
    };
    let monitor = monitor_with(limits);
    let manager = PipelineManager::builder(definition)
        .registry(script.registry.clone())
        .monitor(Arc::clone(&monitor))
        .checkpoint_store(Arc::new(MemoryCheckpointStore::new()))
        .pool_config(fast_pool())
        .build()
        .unwrap();

    let run = manager
        .execute("doc", Metadata::new(), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(shared.calls(), names.len());
    assert!(
        shared.peak.load(Ordering::SeqCst) <= 2,
        "at most two 2-core stages fit under a 4-core cap"
    );
    assert_eq!(monitor.active_allocations(), 0);
    assert_eq!(monitor.allocated_total().cpu_cores, 0.0);

    manager.shutdown().await;
}

#[tokio::test]
async fn max_parallel_stages_of_one_is_sequential() {
    let shared = Arc::new(Probe::default());
    let mut script = Script::default();
    for name in ["x", "y", "z"] {
        let mut stage = Scripted::new(Arc::clone(&shared));
        stage.delay = Duration::from_millis(20);
        script.registry.register_instance(name, Arc::new(stage));
    }
    let definition = PipelineConfig::builder("serial")
        .max_parallel_stages(1)
        .stage(StageSpec::new("x"))
        .stage(StageSpec::new("y"))
        .stage(StageSpec::new("z"))
        .build()
        .unwrap();
    let manager = manager(definition, &script, Arc::new(MemoryCheckpointStore::new()));

    let run = manager
        .execute("doc", Metadata::new(), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(shared.peak.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

// ── Run control ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn second_execute_while_running_is_rejected() {
    let script = Script::default().stage("slow", |s| s.delay = Duration::from_millis(200));
    let definition = PipelineConfig::builder("exclusive")
        .stage(StageSpec::new("slow"))
        .build()
        .unwrap();
    let manager = manager(definition, &script, Arc::new(MemoryCheckpointStore::new()));
    let probe = script.probe("slow");

    let (first, second) = tokio::join!(
        manager.execute("doc", Metadata::new(), ExecuteOptions::default()),
        async {
            wait_for_call(&probe).await;
            manager
                .execute("other", Metadata::new(), ExecuteOptions::default())
                .await
        }
    );

    assert_eq!(first.unwrap().status, RunStatus::Completed);
    assert!(matches!(second, Err(PipelineError::AlreadyRunning)));

    manager.shutdown().await;
}

#[tokio::test]
async fn cancel_stops_further_stages() {
    let script = Script::default()
        .stage("a", |s| s.delay = Duration::from_secs(30))
        .ok("b");
    let definition = PipelineConfig::builder("cancellable")
        .stage(StageSpec::new("a"))
        .stage(StageSpec::new("b").depends_on(["a"]))
        .build()
        .unwrap();
    let manager = manager(definition, &script, Arc::new(MemoryCheckpointStore::new()));
    let control = manager.control();
    let probe = script.probe("a");

    let (run, cancelled) = tokio::join!(
        manager.execute("doc", Metadata::new(), ExecuteOptions::default()),
        async {
            wait_for_call(&probe).await;
            control.cancel()
        }
    );

    assert!(cancelled);
    let run = run.expect("cancellation is not an error");
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(status(&run, "b").is_none());
    assert_eq!(script.probe("b").calls(), 0);
    assert!(!manager.control().is_running());

    manager.shutdown().await;
}

#[tokio::test]
async fn cancel_skips_stages_still_waiting_for_a_worker() {
    init_tracing();
    let script = Script::default()
        .stage("a", |s| s.delay = Duration::from_secs(30))
        .ok("b");
    let definition = PipelineConfig::builder("one-worker")
        .max_parallel_stages(2)
        .stage(StageSpec::new("a"))
        .stage(StageSpec::new("b").critical(false))
        .build()
        .unwrap();
    let manager = PipelineManager::builder(definition)
        .registry(script.registry.clone())
        .monitor(monitor_with(ResourceLimits::default()))
        .checkpoint_store(Arc::new(MemoryCheckpointStore::new()))
        .pool_config(PoolConfig {
            async_workers: 1,
            ..fast_pool()
        })
        .build()
        .unwrap();
    let control = manager.control();
    let probe = script.probe("a");

    let (run, _) = tokio::join!(
        manager.execute("doc", Metadata::new(), ExecuteOptions::default()),
        async {
            wait_for_call(&probe).await;
            control.cancel()
        }
    );
    let run = assert_ok!(run);
    assert_eq!(run.status, RunStatus::Cancelled);

    // Give the worker time to reach the queued task.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(script.probe("b").calls(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn pause_holds_dispatch_until_resume() {
    let script = Script::default().ok("a").ok("b");
    let definition = PipelineConfig::builder("pausable")
        .stage(StageSpec::new("a"))
        .stage(StageSpec::new("b").depends_on(["a"]))
        .build()
        .unwrap();
    let manager = manager(definition, &script, Arc::new(MemoryCheckpointStore::new()));
    let control = manager.control();
    let probe = script.probe("a");
    control.pause();

    let (run, calls_while_paused) = tokio::join!(
        manager.execute("doc", Metadata::new(), ExecuteOptions::default()),
        async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let seen = probe.calls();
            assert!(control.is_running());
            control.resume();
            seen
        }
    );

    assert_eq!(calls_while_paused, 0);
    assert_eq!(run.unwrap().status, RunStatus::Completed);
    assert_eq!(script.probe("b").calls(), 1);

    manager.shutdown().await;
}

// ── Notifications and progress ───────────────────────────────────────────────

#[tokio::test]
async fn lifecycle_events_and_progress() {
    let script = Script::default()
        .stage("ocr", |s| s.progress_steps = 4)
        .ok("tables");
    let definition = PipelineConfig::builder("observed")
        .stage(StageSpec::new("ocr"))
        .stage(StageSpec::new("tables").depends_on(["ocr"]))
        .build()
        .unwrap();
    let manager = manager(definition, &script, Arc::new(MemoryCheckpointStore::new()));
    let mut events = manager.subscribe(&[]);
    let mut failures = manager.subscribe(&[EventKind::StageFailed]);

    let run = manager
        .execute("doc", Metadata::new(), ExecuteOptions::default())
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.run_id, run.run_id);
        kinds.push(event.kind);
    }
    assert_eq!(kinds.first(), Some(&EventKind::PipelineStarted));
    assert_eq!(kinds.last(), Some(&EventKind::PipelineCompleted));
    let count = |k: EventKind| kinds.iter().filter(|x| **x == k).count();
    assert_eq!(count(EventKind::StageStarted), 2);
    assert_eq!(count(EventKind::StageCompleted), 2);
    assert_eq!(count(EventKind::TaskProgress), 4);
    assert!(failures.try_recv().is_err());

    let progress = manager.progress().run(run.run_id).expect("run tracked");
    assert!(progress.is_finished());
    assert!((progress.progress() - 1.0).abs() < f64::EPSILON);
    let ocr = manager.progress().task(run.run_id, "ocr").unwrap();
    assert_eq!(ocr.status, StageStatus::Completed);
    assert!(manager.progress().duration_stats("ocr").is_some());

    manager.shutdown().await;
}

// ── Configuration files ──────────────────────────────────────────────────────

#[tokio::test]
async fn yaml_definition_runs_with_builtin_stages() {
    let yaml = r#"
name: ingest
max_parallel_stages: 2
checkpoint_enabled: false
stages:
  - name: parse
    type: noop
    params: { format: pdf }
  - name: tables
    type: noop
    dependencies: [parse]
    priority: high
  - name: images
    type: noop
    dependencies: [parse]
    condition: "has_images"
"#;
    let definition = PipelineConfig::from_yaml_str(yaml)
        .unwrap()
        .validate()
        .unwrap();
    assert_eq!(definition.topological_order(), vec!["parse", "tables", "images"]);

    let manager = PipelineManager::builder(definition)
        .monitor(monitor_with(ResourceLimits::default()))
        .pool_config(fast_pool())
        .build()
        .unwrap();
    let run = manager
        .execute("doc", Metadata::new(), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.stage_results["parse"].output_data["format"], "pdf");
    assert_eq!(status(&run, "images"), Some(StageStatus::Skipped));

    manager.shutdown().await;
}
