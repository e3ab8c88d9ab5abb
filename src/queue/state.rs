//! The queue's process-local runtime record.
//!
//! A single document holding the pause bit and last-dispatch bookkeeping,
//! persisted under the town root. It is advisory: the labels in the store are
//! the authoritative queue, and this record is rebuilt from defaults if the
//! file is missing. Writes are atomic (temp file + rename) so a crashed
//! writer never leaves a torn document.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::queue_state_path;

/// Errors loading or saving the runtime record.
#[derive(Debug, Error)]
pub enum QueueStateError {
    #[error("queue state {path} not readable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("queue state {path} malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("writing queue state {path}: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Queue runtime state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueState {
    /// Town-wide pause bit; affects the queue dispatcher only.
    pub paused: bool,
    /// Who paused the queue.
    pub paused_by: Option<String>,
    pub last_dispatch_at: Option<DateTime<Utc>>,
    pub last_dispatch_count: usize,
}

impl QueueState {
    /// Loads the record, or defaults when the file does not exist.
    pub fn load(town_root: &Path) -> Result<Self, QueueStateError> {
        let path = queue_state_path(town_root);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|source| QueueStateError::Malformed {
                    path: path.clone(),
                    source,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(QueueState::default()),
            Err(source) => Err(QueueStateError::Unreadable { path, source }),
        }
    }

    /// Saves the record atomically.
    pub fn save(&self, town_root: &Path) -> Result<(), QueueStateError> {
        let path = queue_state_path(town_root);
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
            std::fs::rename(&tmp, &path)
        };
        write().map_err(|source| QueueStateError::Unwritable {
            path: path.clone(),
            source,
        })
    }

    pub fn set_paused(&mut self, actor: impl Into<String>) {
        self.paused = true;
        self.paused_by = Some(actor.into());
    }

    pub fn set_resumed(&mut self) {
        self.paused = false;
        self.paused_by = None;
    }

    pub fn record_dispatch(&mut self, count: usize) {
        self.last_dispatch_at = Some(Utc::now());
        self.last_dispatch_count = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let state = QueueState::load(dir.path()).unwrap();
        assert!(!state.paused);
        assert_eq!(state.last_dispatch_count, 0);
    }

    #[test]
    fn pause_resume_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();

        let mut state = QueueState::load(dir.path()).unwrap();
        state.set_paused("operator");
        state.save(dir.path()).unwrap();

        let mut reloaded = QueueState::load(dir.path()).unwrap();
        assert!(reloaded.paused);
        assert_eq!(reloaded.paused_by.as_deref(), Some("operator"));

        reloaded.set_resumed();
        reloaded.save(dir.path()).unwrap();
        let again = QueueState::load(dir.path()).unwrap();
        assert!(!again.paused);
        assert!(again.paused_by.is_none());
    }

    #[test]
    fn record_dispatch_updates_bookkeeping() {
        let mut state = QueueState::default();
        state.record_dispatch(3);
        assert!(state.last_dispatch_at.is_some());
        assert_eq!(state.last_dispatch_count, 3);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = queue_state_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{oops").unwrap();
        assert!(matches!(
            QueueState::load(dir.path()),
            Err(QueueStateError::Malformed { .. })
        ));
    }
}
