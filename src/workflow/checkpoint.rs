//! Durable run snapshots.
//!
//! Each run owns exactly one file, `<dir>/<run_id>.json`. Writes go to a
//! temporary file in the same directory which is synced and then renamed over
//! the target, so readers only ever see a complete checkpoint.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;

use super::state::{HistoryEntry, WorkflowState};
use crate::error::{BatonError, Result};

const CHECKPOINT_VERSION: u32 = 1;

/// On-disk form of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub run_id: String,
    pub workflow: String,
    pub current_step: String,
    pub state: BTreeMap<String, Value>,
    pub history: Vec<HistoryEntry>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn capture(run_id: &str, workflow: &str, state: &WorkflowState) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            run_id: run_id.to_string(),
            workflow: workflow.to_string(),
            current_step: state.current_step.clone(),
            state: state.data.clone(),
            history: state.history.clone(),
            saved_at: Utc::now(),
        }
    }

    pub fn into_state(self) -> WorkflowState {
        WorkflowState {
            current_step: self.current_step,
            data: self.state,
            history: self.history,
        }
    }
}

/// Directory of checkpoints, one per run id.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &str) -> Result<PathBuf> {
        validate_run_id(run_id)?;
        Ok(self.dir.join(format!("{run_id}.json")))
    }

    pub fn exists(&self, run_id: &str) -> Result<bool> {
        Ok(self.path_for(run_id)?.exists())
    }

    /// Atomically replace the checkpoint for `checkpoint.run_id`.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let path = self.path_for(&checkpoint.run_id)?;
        let io_err = |source| BatonError::CheckpointIo {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        serde_json::to_writer_pretty(&mut tmp, checkpoint)?;
        tmp.write_all(b"\n").map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;

        tracing::debug!(run_id = %checkpoint.run_id, step = %checkpoint.current_step, path = %path.display(), "checkpoint saved");
        Ok(path)
    }

    pub fn load(&self, run_id: &str) -> Result<Checkpoint> {
        let path = self.path_for(run_id)?;
        if !path.exists() {
            return Err(BatonError::CheckpointNotFound(run_id.to_string()));
        }
        Self::load_path(&path)
    }

    pub fn load_path(path: &Path) -> Result<Checkpoint> {
        let contents = std::fs::read_to_string(path).map_err(|source| BatonError::CheckpointIo {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Run ids with a checkpoint in this directory, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn remove(&self, run_id: &str) -> Result<()> {
        let path = self.path_for(run_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BatonError::CheckpointIo { path, source }),
        }
    }
}

/// Run ids become file names, so only a conservative character set is allowed.
fn validate_run_id(run_id: &str) -> Result<()> {
    let valid = !run_id.is_empty()
        && run_id.len() <= 128
        && !run_id.starts_with('.')
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(BatonError::InvalidRunId(run_id.to_string()))
    }
}
