//! Checkpoint store for crash-resumable harvesting.
//!
//! One JSON file per (run, source) records which item identifiers every
//! sink has already acknowledged. Files are replaced atomically: the new
//! state is written to a temp file in the same directory, synced, and then
//! renamed over the canonical path, so a crash can only ever leave the old
//! or the new state behind.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::HarvestConfig;
use crate::model::SourceType;

/// Persisted progress for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub source_type: SourceType,
    pub completed_ids: BTreeSet<String>,
    #[serde(default)]
    pub cursor: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointState {
    pub fn new(source_type: SourceType) -> Self {
        Self {
            source_type,
            completed_ids: BTreeSet::new(),
            cursor: None,
            updated_at: Utc::now(),
        }
    }
}

/// Errors reading or writing durable checkpoint state.
#[derive(thiserror::Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint at {path} is unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Checkpoint at {path} belongs to source '{found}', expected '{expected}'")]
    SourceMismatch {
        path: PathBuf,
        expected: SourceType,
        found: SourceType,
    },
}

/// Durable, concurrency-safe record of exported identifiers.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    run_id: String,
    states: Mutex<HashMap<SourceType, CheckpointState>>,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            run_id: run_id.into(),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Store rooted at `config.checkpoint_dir` for `config.run_id`.
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self::new(config.checkpoint_dir.clone(), config.run_id.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Canonical file for `source`.
    pub fn path_for(&self, source: SourceType) -> PathBuf {
        self.dir
            .join(format!("{}.{}.checkpoint.json", self.run_id, source))
    }

    /// Loads the last persisted state for `source`, or `None` if the source
    /// was never checkpointed under this run id. The loaded state becomes
    /// the in-memory state.
    pub fn load(&self, source: SourceType) -> Result<Option<CheckpointState>, CheckpointError> {
        let path = self.path_for(source);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(source = %source, "No checkpoint found");
                return Ok(None);
            }
            Err(source_err) => {
                return Err(CheckpointError::Io {
                    path,
                    source: source_err,
                })
            }
        };

        let state: CheckpointState =
            serde_json::from_str(&raw).map_err(|e| CheckpointError::Corrupt {
                path: path.clone(),
                source: e,
            })?;
        if state.source_type != source {
            return Err(CheckpointError::SourceMismatch {
                path,
                expected: source,
                found: state.source_type,
            });
        }

        info!(
            source = %source,
            completed = state.completed_ids.len(),
            cursor = ?state.cursor,
            "Loaded checkpoint"
        );
        self.lock().insert(source, state.clone());
        Ok(Some(state))
    }

    /// Marks `id` as exported by every sink. Idempotent.
    pub fn record_completed(&self, source: SourceType, id: &str) {
        let mut states = self.lock();
        let state = states
            .entry(source)
            .or_insert_with(|| CheckpointState::new(source));
        state.completed_ids.insert(id.to_string());
        state.updated_at = Utc::now();
    }

    pub fn is_completed(&self, source: SourceType, id: &str) -> bool {
        self.lock()
            .get(&source)
            .map(|s| s.completed_ids.contains(id))
            .unwrap_or(false)
    }

    pub fn set_cursor(&self, source: SourceType, cursor: Option<String>) {
        let mut states = self.lock();
        let state = states
            .entry(source)
            .or_insert_with(|| CheckpointState::new(source));
        state.cursor = cursor;
        state.updated_at = Utc::now();
    }

    /// Current in-memory state (not necessarily persisted yet).
    pub fn snapshot(&self, source: SourceType) -> CheckpointState {
        self.lock()
            .get(&source)
            .cloned()
            .unwrap_or_else(|| CheckpointState::new(source))
    }

    /// Flushes the in-memory state of `source` to disk atomically.
    pub fn persist(&self, source: SourceType) -> Result<(), CheckpointError> {
        let snapshot = self.snapshot(source);
        let path = self.path_for(source);
        let staged = self.stage(&snapshot)?;
        staged.persist(&path).map_err(|e| CheckpointError::Io {
            path: path.clone(),
            source: e.error,
        })?;
        debug!(
            source = %source,
            completed = snapshot.completed_ids.len(),
            path = %path.display(),
            "Checkpoint persisted"
        );
        Ok(())
    }

    /// Writes `state` to a synced temp file next to the canonical path.
    fn stage(&self, state: &CheckpointState) -> Result<NamedTempFile, CheckpointError> {
        let io_err = |source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(io_err)?;

        let json = serde_json::to_vec_pretty(state).map_err(|e| CheckpointError::Io {
            path: self.dir.clone(),
            source: e.into(),
        })?;

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{}.{}.", self.run_id, state.source_type))
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        Ok(tmp)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SourceType, CheckpointState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}
