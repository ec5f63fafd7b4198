//! # edgequake-docpipe
//!
//! A DAG-based document processing pipeline engine: validated stage graphs,
//! a concurrent worker pool, resource-aware admission control, checkpoint
//! and resume, and progress aggregation.
//!
//! ## Why this crate?
//!
//! Document processing is a chain of heterogeneous steps (parse, OCR,
//! extract tables, extract images, translate, index) with real
//! dependencies between them and very different costs. Running them as a
//! script wastes the machine and loses everything on a crash. This crate
//! runs them as a graph: independent stages run concurrently, every stage
//! is admitted only if the host can take it, and progress is checkpointed
//! after every stage so a restarted run picks up where it stopped.
//!
//! ## Execution Overview
//!
//! ```text
//! PipelineConfig (YAML / JSON / builder)
//!  │
//!  ├─ 1. Validate   unique names, known deps, acyclic, conditions parse
//!  ├─ 2. Construct  stage types resolved through the StageRegistry
//!  ├─ 3. Restore    completed stages from the document's checkpoint
//!  ├─ 4. Schedule   topological order, deps re-checked, conditions evaluated
//!  ├─ 5. Admit      ResourceMonitor: current + allocated + requested ≤ limits
//!  ├─ 6. Execute    WorkerPool: async / thread / process substrates
//!  └─ 7. Record     StageResult, checkpoint, lifecycle notification
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_docpipe::{
//!     ExecuteOptions, Metadata, PipelineConfig, PipelineManager, StageRegistry, StageSpec,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let definition = PipelineConfig::builder("ingest")
//!         .stage(StageSpec::new("parse").stage_type("noop"))
//!         .stage(StageSpec::new("tables").stage_type("noop").depends_on(["parse"]))
//!         .build()?;
//!
//!     let manager = PipelineManager::new(definition, StageRegistry::with_builtins())?;
//!     let run = manager
//!         .execute("report-2024.pdf", Metadata::new(), ExecuteOptions::default())
//!         .await?;
//!     println!("{} → {}", run.document_id, run.status);
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docpipe` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-docpipe = { version = "0.1", default-features = false }
//! ```
//!
//! ## Failure Policy
//!
//! | Situation | Stage result | Run status | `execute` returns |
//! |-----------|--------------|------------|-------------------|
//! | Non-critical stage fails | `failed`, dependents `skipped` | `failed` | `Ok(run)` |
//! | Critical stage fails | `failed` | `failed` | `Err(CriticalStageFailed)` |
//! | Global timeout | in-flight `failed` | `failed` | `Err(Timeout)` |
//! | Cancelled | remaining not started | `cancelled` | `Ok(run)` |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod checkpoint;
pub mod condition;
pub mod config;
pub mod dag;
pub mod error;
pub mod manager;
pub mod notify;
pub mod pool;
pub mod progress;
pub mod registry;
pub mod resources;
pub mod run;
pub mod stage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use checkpoint::{
    Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
pub use condition::Condition;
pub use config::{ExecutorKind, PipelineConfig, PipelineConfigBuilder, Priority, StageSpec};
pub use dag::{PipelineDefinition, StageGraph};
pub use error::{ConfigError, PipelineError, ResourceError, StageError};
pub use manager::{ExecuteOptions, PipelineManager, PipelineManagerBuilder, RunControl};
pub use notify::{EventKind, EventListener, EventPayload, Notifier, PipelineEvent};
pub use pool::{PoolConfig, PoolStats, TaskHandle, WorkerPool, WorkerStats, WorkerTask};
pub use progress::{DurationStats, PipelineProgress, ProgressTracker, TaskProgress};
pub use registry::{StageConstructor, StageRegistry};
pub use resources::{
    FixedSampler, HostUsage, ResourceLimits, ResourceMonitor, ResourceRequirements,
    SystemSampler, UsageSampler,
};
pub use run::{Metadata, PipelineRun, RunStatus, StageResult, StageStatus};
pub use stage::{ManagedStage, Stage, StageContext, StageOutput};
