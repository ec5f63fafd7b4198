//! Checkpoint persistence for resume-after-crash.
//!
//! The manager serialises a [`Checkpoint`] (the run's stage results plus
//! its identity and metadata) into a [`CheckpointStore`] after every stage,
//! keyed by `pipeline_checkpoint:<document_id>`. On the next `execute()` for
//! the same document, completed stages are restored instead of re-run.
//!
//! Writes overwrite the whole record under the key, so a crash loses at
//! most the stage that was in flight.
//!
//! Two stores ship with the crate:
//!
//! * [`MemoryCheckpointStore`]: process-local, TTL-aware. The default.
//! * [`FileCheckpointStore`]: one JSON file per key in a directory, with the
//!   expiry recorded alongside the payload.

use crate::error::PipelineError;
use crate::run::{Metadata, PipelineRun, StageResult, StageStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Current checkpoint record format.
pub const CHECKPOINT_VERSION: u32 = 1;

const KEY_PREFIX: &str = "pipeline_checkpoint:";

/// Minimal key-value interface the manager persists through.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The value under `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PipelineError>;

    /// Store `value` under `key` for `ttl`, replacing any previous value.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), PipelineError>;
}

/// Store key for a document's checkpoint.
pub fn checkpoint_key(document_id: &str) -> String {
    format!("{KEY_PREFIX}{document_id}")
}

/// Persisted snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub run_id: Uuid,
    pub document_id: String,
    pub pipeline_name: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub saved_at: DateTime<Utc>,
    pub stage_results: HashMap<String, StageResult>,
}

impl Checkpoint {
    pub fn from_run(run: &PipelineRun) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            run_id: run.run_id,
            document_id: run.document_id.clone(),
            pipeline_name: run.pipeline_name.clone(),
            metadata: run.metadata.clone(),
            saved_at: Utc::now(),
            stage_results: run.stage_results.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        serde_json::to_vec(self).map_err(|e| PipelineError::Checkpoint(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PipelineError> {
        serde_json::from_slice(bytes).map_err(|e| PipelineError::Checkpoint(e.to_string()))
    }

    /// Completed results only; those are the ones a resumed run may reuse.
    pub fn completed(&self) -> impl Iterator<Item = &StageResult> {
        self.stage_results
            .values()
            .filter(|r| r.status == StageStatus::Completed && !r.dry_run)
    }
}

/// Persist a run's current state.
pub async fn save_checkpoint(
    store: &dyn CheckpointStore,
    run: &PipelineRun,
    ttl: Duration,
) -> Result<(), PipelineError> {
    let bytes = Checkpoint::from_run(run).to_bytes()?;
    store.set(&checkpoint_key(&run.document_id), bytes, ttl).await?;
    debug!(run_id = %run.run_id, document_id = %run.document_id, "checkpoint saved");
    Ok(())
}

/// Load a document's checkpoint for `pipeline_name`.
///
/// Records written by another pipeline, in another format version, or that
/// fail to decode are ignored with a warning.
pub async fn load_checkpoint(
    store: &dyn CheckpointStore,
    document_id: &str,
    pipeline_name: &str,
) -> Result<Option<Checkpoint>, PipelineError> {
    let Some(bytes) = store.get(&checkpoint_key(document_id)).await? else {
        return Ok(None);
    };
    let cp = match Checkpoint::from_bytes(&bytes) {
        Ok(cp) => cp,
        Err(e) => {
            warn!(%document_id, error = %e, "ignoring unreadable checkpoint");
            return Ok(None);
        }
    };
    if cp.version != CHECKPOINT_VERSION {
        warn!(%document_id, version = cp.version, "ignoring checkpoint with unsupported version");
        return Ok(None);
    }
    if cp.pipeline_name != pipeline_name {
        warn!(
            %document_id,
            found = %cp.pipeline_name,
            expected = %pipeline_name,
            "ignoring checkpoint from a different pipeline"
        );
        return Ok(None);
    }
    Ok(Some(cp))
}

// ── In-memory store ──────────────────────────────────────────────────────

/// Process-local store with TTL expiry.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
    writes: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|(_, exp)| *exp > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some((_, exp)) if *exp <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), PipelineError> {
        let expires = Instant::now()
            .checked_add(ttl)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(u32::MAX as u64));
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), (value, expires));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── File store ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    key: String,
    expires_at: DateTime<Utc>,
    /// UTF-8 payload (checkpoint records are JSON).
    value: String,
}

/// One JSON envelope per key under a directory.
///
/// Payloads must be UTF-8. Expired envelopes are deleted when read.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Use `dir`, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            PipelineError::Checkpoint(format!("cannot create '{}': {e}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        let path = self.path_for(key);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PipelineError::Checkpoint(format!(
                    "cannot read '{}': {e}",
                    path.display()
                )))
            }
        };
        let env: Envelope = serde_json::from_str(&text).map_err(|e| {
            PipelineError::Checkpoint(format!("corrupt envelope '{}': {e}", path.display()))
        })?;
        if env.key != key {
            return Ok(None);
        }
        if env.expires_at <= Utc::now() {
            debug!(%key, "checkpoint expired");
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }
        Ok(Some(env.value.into_bytes()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), PipelineError> {
        let value = String::from_utf8(value)
            .map_err(|_| PipelineError::Checkpoint("checkpoint payload is not UTF-8".into()))?;
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(365 * 100));
        let env = Envelope {
            key: key.to_string(),
            expires_at: Utc::now() + ttl,
            value,
        };
        let json =
            serde_json::to_vec(&env).map_err(|e| PipelineError::Checkpoint(e.to_string()))?;

        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await.map_err(|e| {
            PipelineError::Checkpoint(format!("cannot write '{}': {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            PipelineError::Checkpoint(format!("cannot replace '{}': {e}", path.display()))
        })?;
        Ok(())
    }
}
