//! The rig routing map: bead ID prefix → rig name.
//!
//! The routing file is JSON-per-line, each line `{"prefix": ..., "rig": ...}`.
//! It is read on demand (batch enrollment, convoy feeding) rather than cached,
//! so an operator can add a rig without restarting the daemon.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::RigName;

/// Errors loading or querying the routing map.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("routing file {path} not readable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("routing file {path} line {line}: {source}")]
    BadLine {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// One line of the routing file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub prefix: String,
    pub rig: RigName,
}

/// In-memory view of the routing file.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    path: PathBuf,
    by_prefix: HashMap<String, RigName>,
}

impl RoutingTable {
    /// Loads the routing file. Blank lines are ignored; a malformed line is an
    /// error naming the line, since silently dropping a route would misroute
    /// every bead behind that prefix.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RoutingError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|source| RoutingError::Unreadable {
            path: path.clone(),
            source,
        })?;

        let mut by_prefix = HashMap::new();
        for (i, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: RouteEntry =
                serde_json::from_str(line).map_err(|source| RoutingError::BadLine {
                    path: path.clone(),
                    line: i + 1,
                    source,
                })?;
            by_prefix.insert(entry.prefix, entry.rig);
        }

        Ok(RoutingTable { path, by_prefix })
    }

    /// Builds a table from entries directly (tests, defaults).
    pub fn from_entries(path: impl Into<PathBuf>, entries: Vec<RouteEntry>) -> Self {
        RoutingTable {
            path: path.into(),
            by_prefix: entries.into_iter().map(|e| (e.prefix, e.rig)).collect(),
        }
    }

    /// Resolves a bead ID prefix to its rig, if mapped.
    pub fn resolve(&self, prefix: &str) -> Option<&RigName> {
        self.by_prefix.get(prefix)
    }

    /// The file this table was read from, for error messages.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
