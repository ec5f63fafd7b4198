//! Stage-type registry: maps a `type` identifier to a constructor.
//!
//! Pipelines name their stage implementations by string (`type: ocr`), and
//! the registry turns each [`StageSpec`] into a live [`Stage`] at manager
//! construction time. Nothing is loaded dynamically: every type must be
//! registered up front.
//!
//! Two built-ins ship with [`StageRegistry::with_builtins`]:
//!
//! | Type      | Behaviour |
//! |-----------|-----------|
//! | `noop`    | Completes immediately, echoing `params` as its output |
//! | `command` | Runs `params.program` with `params.args`; fails on non-zero exit |

use crate::config::StageSpec;
use crate::dag::PipelineDefinition;
use crate::error::{ConfigError, StageError};
use crate::stage::{ManagedStage, Stage, StageContext, StageOutput};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Builds a stage from its configuration.
pub type StageConstructor =
    Arc<dyn Fn(&StageSpec) -> Result<Arc<dyn Stage>, StageError> + Send + Sync>;

/// Registry of stage constructors keyed by type identifier.
#[derive(Clone, Default)]
pub struct StageRegistry {
    constructors: HashMap<String, StageConstructor>,
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("types", &self.type_ids())
            .finish()
    }
}

impl StageRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with `noop` and `command`.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.register(NoopStage::TYPE_ID, |spec| {
            Ok(Arc::new(NoopStage::new(spec.params.clone())) as Arc<dyn Stage>)
        });
        r.register(CommandStage::TYPE_ID, |spec| {
            Ok(Arc::new(CommandStage::from_spec(spec)?) as Arc<dyn Stage>)
        });
        r
    }

    /// Register a constructor, replacing any previous one for `type_id`.
    pub fn register<F>(&mut self, type_id: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&StageSpec) -> Result<Arc<dyn Stage>, StageError> + Send + Sync + 'static,
    {
        self.constructors
            .insert(type_id.into(), Arc::new(constructor));
        self
    }

    /// Register a shared instance returned for every spec of this type.
    pub fn register_instance(
        &mut self,
        type_id: impl Into<String>,
        stage: Arc<dyn Stage>,
    ) -> &mut Self {
        self.register(type_id, move |_| Ok(Arc::clone(&stage)))
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.constructors.contains_key(type_id)
    }

    /// Registered identifiers, sorted.
    pub fn type_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Construct the stage for one spec.
    pub fn create(&self, spec: &StageSpec) -> Result<Arc<dyn Stage>, ConfigError> {
        let ctor = self
            .constructors
            .get(spec.type_id())
            .ok_or_else(|| ConfigError::UnknownStageType {
                stage: spec.name.clone(),
                stage_type: spec.type_id().to_string(),
            })?;
        ctor(spec).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Construct every stage of a definition, keyed by stage name.
    pub fn instantiate(
        &self,
        definition: &PipelineDefinition,
    ) -> Result<HashMap<String, Arc<ManagedStage>>, ConfigError> {
        let mut out = HashMap::with_capacity(definition.stages().len());
        for spec in definition.stages() {
            let stage = self.create(spec)?;
            debug!(stage = %spec.name, stage_type = %spec.type_id(), "stage constructed");
            out.insert(
                spec.name.clone(),
                Arc::new(ManagedStage::new(spec.clone(), stage)),
            );
        }
        Ok(out)
    }
}

// ── Built-in: noop ───────────────────────────────────────────────────────

/// Completes immediately and echoes its parameters.
#[derive(Debug, Clone)]
pub struct NoopStage {
    params: serde_json::Value,
}

impl NoopStage {
    pub const TYPE_ID: &'static str = "noop";

    pub fn new(params: serde_json::Value) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Stage for NoopStage {
    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, StageError> {
        Ok(StageOutput::new(self.params.clone()))
    }
}

// ── Built-in: command ────────────────────────────────────────────────────

/// Longest stdout excerpt kept in the stage output.
const STDOUT_EXCERPT_CHARS: usize = 4096;

#[derive(Debug, Clone, Deserialize)]
struct CommandParams {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    current_dir: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// Runs an external program as a child process.
///
/// The child is killed if the stage is abandoned (timeout or cancellation
/// dropping the future). Meant for the `process` executor.
#[derive(Debug, Clone)]
pub struct CommandStage {
    name: String,
    params: CommandParams,
}

impl CommandStage {
    pub const TYPE_ID: &'static str = "command";

    pub fn from_spec(spec: &StageSpec) -> Result<Self, StageError> {
        let params: CommandParams =
            serde_json::from_value(spec.params.clone()).map_err(|e| StageError::Initialization {
                stage: spec.name.clone(),
                detail: format!("invalid command params: {e}"),
            })?;
        if params.program.trim().is_empty() {
            return Err(StageError::Initialization {
                stage: spec.name.clone(),
                detail: "command params: 'program' is empty".into(),
            });
        }
        Ok(Self {
            name: spec.name.clone(),
            params,
        })
    }
}

#[async_trait]
impl Stage for CommandStage {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        let mut cmd = tokio::process::Command::new(&self.params.program);
        cmd.args(&self.params.args)
            .envs(&self.params.env)
            .env("DOCPIPE_DOCUMENT_ID", &ctx.document_id)
            .env("DOCPIPE_RUN_ID", ctx.run_id.to_string())
            .kill_on_drop(true);
        if let Some(dir) = &self.params.current_dir {
            cmd.current_dir(dir);
        }

        let started = Instant::now();
        let output = tokio::select! {
            out = cmd.output() => out.map_err(|e| {
                StageError::execution(&self.name, format!("failed to spawn '{}': {e}", self.params.program))
            })?,
            _ = ctx.cancellation_token().cancelled() => {
                return Err(StageError::Cancelled { stage: self.name.clone() });
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as f64;

        let code = output.status.code();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StageError::execution(
                &self.name,
                format!(
                    "'{}' exited with {}: {}",
                    self.params.program,
                    code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                    stderr.trim()
                ),
            ));
        }

        let stdout: String = String::from_utf8_lossy(&output.stdout)
            .chars()
            .take(STDOUT_EXCERPT_CHARS)
            .collect();
        Ok(StageOutput::new(serde_json::json!({
            "exit_code": code,
            "stdout": stdout.trim_end(),
            "stdout_bytes": output.stdout.len(),
            "stderr_bytes": output.stderr.len(),
        }))
        .with_metric("process_ms", elapsed_ms))
    }
}
