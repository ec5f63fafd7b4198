//! Pipeline configuration: the serialisable document that defines a pipeline.
//!
//! A [`PipelineConfig`] carries the pipeline's global limits and an ordered
//! list of [`StageSpec`] entries. It can be loaded from YAML or JSON, or
//! assembled in code via [`PipelineConfig::builder`]. Either way it only
//! becomes usable once validated into a [`PipelineDefinition`] (unique
//! names, resolvable dependencies, acyclic graph, parseable conditions).
//! Validation always happens at load time, never mid-run.
//!
//! # Example
//! ```rust
//! use edgequake_docpipe::{PipelineConfig, StageSpec};
//!
//! let definition = PipelineConfig::builder("ingest")
//!     .max_parallel_stages(2)
//!     .stage(StageSpec::new("parse").stage_type("noop"))
//!     .stage(StageSpec::new("tables").stage_type("noop").depends_on(["parse"]))
//!     .stage(
//!         StageSpec::new("images")
//!             .stage_type("noop")
//!             .depends_on(["parse"])
//!             .condition("has_images"),
//!     )
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(definition.topological_order(), vec!["parse", "tables", "images"]);
//! ```

use crate::dag::PipelineDefinition;
use crate::error::ConfigError;
use crate::pool::PoolConfig;
use crate::resources::{ResourceLimits, ResourceRequirements};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default number of stages allowed in flight at once.
pub const DEFAULT_MAX_PARALLEL_STAGES: usize = 4;

/// Default checkpoint time-to-live: one day.
pub const DEFAULT_CHECKPOINT_TTL_SECS: u64 = 86_400;

// ── Enums ────────────────────────────────────────────────────────────────

/// Execution substrate a stage runs on inside the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Cooperative async worker. Right for I/O-bound stages. (default)
    #[default]
    Async,
    /// Bounded blocking thread pool. For blocking, CPU-light work.
    Thread,
    /// Bounded process slots. For stages that spawn isolated child
    /// processes (see the built-in `command` stage type).
    Process,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Async => write!(f, "async"),
            Self::Thread => write!(f, "thread"),
            Self::Process => write!(f, "process"),
        }
    }
}

/// Dispatch priority. `High` and `Critical` go through the priority queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Whether tasks of this priority bypass the FIFO queue.
    pub fn is_expedited(self) -> bool {
        self >= Priority::High
    }
}

// ── Stage spec ───────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_max_parallel() -> usize {
    1
}

/// Declaration of one stage in a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Unique stage name.
    pub name: String,

    /// Registry identifier used to construct the stage. Defaults to `name`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub stage_type: Option<String>,

    /// Names of stages that must complete before this one may start.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// What the stage needs from the host while it runs.
    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Per-attempt timeout in seconds. `None` means no limit.
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Extra attempts after the first failure. Default: 0.
    #[serde(default)]
    pub max_retries: u32,

    /// Whether a failure aborts the run. Default: true.
    #[serde(default = "default_true", alias = "is_critical")]
    pub critical: bool,

    /// Optional condition expression; the stage is skipped when false.
    #[serde(default, alias = "condition_expr")]
    pub condition: Option<String>,

    /// Parallelism hint handed to the stage implementation. Default: 1.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Batch-size hint handed to the stage implementation.
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Worker-pool substrate. Default: async.
    #[serde(default)]
    pub executor: ExecutorKind,

    /// Queue priority. Default: normal.
    #[serde(default)]
    pub priority: Priority,

    /// Free-form parameters for the stage constructor.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl StageSpec {
    /// A critical, dependency-free stage with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stage_type: None,
            dependencies: Vec::new(),
            resources: ResourceRequirements::default(),
            timeout: None,
            max_retries: 0,
            critical: true,
            condition: None,
            max_parallel: 1,
            batch_size: None,
            executor: ExecutorKind::default(),
            priority: Priority::default(),
            params: serde_json::Value::Null,
        }
    }

    pub fn stage_type(mut self, ty: impl Into<String>) -> Self {
        self.stage_type = Some(ty.into());
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn resources(mut self, req: ResourceRequirements) -> Self {
        self.resources = req;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn critical(mut self, v: bool) -> Self {
        self.critical = v;
        self
    }

    pub fn condition(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    pub fn max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = n.max(1);
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = Some(n.max(1));
        self
    }

    pub fn executor(mut self, kind: ExecutorKind) -> Self {
        self.executor = kind;
        self
    }

    pub fn priority(mut self, p: Priority) -> Self {
        self.priority = p;
        self
    }

    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Registry identifier, falling back to the stage name.
    pub fn type_id(&self) -> &str {
        self.stage_type.as_deref().unwrap_or(&self.name)
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

// ── Pipeline config ──────────────────────────────────────────────────────

fn default_version() -> String {
    "1".to_string()
}

fn default_max_parallel_stages() -> usize {
    DEFAULT_MAX_PARALLEL_STAGES
}

fn default_checkpoint_ttl() -> u64 {
    DEFAULT_CHECKPOINT_TTL_SECS
}

/// The full pipeline configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Upper bound on concurrently dispatched stages. Default: 4.
    #[serde(default = "default_max_parallel_stages")]
    pub max_parallel_stages: usize,

    /// Persist run state after every stage. Default: true.
    #[serde(default = "default_true")]
    pub checkpoint_enabled: bool,

    /// Checkpoint time-to-live in seconds. Default: 86 400.
    #[serde(default = "default_checkpoint_ttl")]
    pub checkpoint_ttl: u64,

    /// Global wall-clock budget for a run, in seconds.
    #[serde(default)]
    pub global_timeout: Option<u64>,

    /// Worker pool sizing.
    #[serde(default)]
    pub workers: PoolConfig,

    /// Admission-control limits.
    #[serde(default)]
    pub resources: ResourceLimits,

    /// Stages in declaration order. Declaration order breaks ties in the
    /// topological order, so it is significant.
    pub stages: Vec<StageSpec>,
}

impl PipelineConfig {
    /// Start building a pipeline in code.
    pub fn builder(name: impl Into<String>) -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: PipelineConfig {
                name: name.into(),
                version: default_version(),
                max_parallel_stages: DEFAULT_MAX_PARALLEL_STAGES,
                checkpoint_enabled: true,
                checkpoint_ttl: DEFAULT_CHECKPOINT_TTL_SECS,
                global_timeout: None,
                workers: PoolConfig::default(),
                resources: ResourceLimits::default(),
                stages: Vec::new(),
            },
        }
    }

    /// Parse a YAML document.
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read a configuration file. `.json` files are parsed as JSON,
    /// everything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        }
    }

    pub fn checkpoint_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.checkpoint_ttl)
    }

    pub fn global_timeout_duration(&self) -> Option<Duration> {
        self.global_timeout.map(Duration::from_secs)
    }

    /// Validate into an immutable [`PipelineDefinition`].
    pub fn validate(self) -> Result<PipelineDefinition, ConfigError> {
        PipelineDefinition::new(self)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn version(mut self, v: impl Into<String>) -> Self {
        self.config.version = v.into();
        self
    }

    pub fn max_parallel_stages(mut self, n: usize) -> Self {
        self.config.max_parallel_stages = n;
        self
    }

    pub fn checkpoint_enabled(mut self, v: bool) -> Self {
        self.config.checkpoint_enabled = v;
        self
    }

    pub fn checkpoint_ttl_secs(mut self, secs: u64) -> Self {
        self.config.checkpoint_ttl = secs;
        self
    }

    pub fn global_timeout_secs(mut self, secs: u64) -> Self {
        self.config.global_timeout = Some(secs);
        self
    }

    pub fn workers(mut self, workers: PoolConfig) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn resources(mut self, limits: ResourceLimits) -> Self {
        self.config.resources = limits;
        self
    }

    pub fn stage(mut self, spec: StageSpec) -> Self {
        self.config.stages.push(spec);
        self
    }

    /// The raw, unvalidated configuration.
    pub fn into_config(self) -> PipelineConfig {
        self.config
    }

    /// Build and validate.
    pub fn build(self) -> Result<PipelineDefinition, ConfigError> {
        PipelineDefinition::new(self.config)
    }
}
