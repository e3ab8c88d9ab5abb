//! CLI command handlers for the `gt` binary.

pub mod convoy;
pub mod daemon;
pub mod queue;
pub mod sling;

use std::path::PathBuf;

use thiserror::Error;

use crate::config::routing_path;
use crate::store::{RoutingError, RoutingTable};

/// Errors surfaced to the operator. Every variant renders as an actionable
/// diagnostic; main maps them all to a non-zero exit.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("not in a gastown workspace (no .gastown directory above {0})")]
    NoTownRoot(PathBuf),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    QueueState(#[from] crate::queue::QueueStateError),

    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),

    #[error(transparent)]
    Enroll(#[from] crate::convoy::EnrollError),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Daemon(#[from] crate::daemon::DaemonError),

    #[error("{0}")]
    Invalid(String),
}

/// Result type for command handlers.
pub type Result<T> = std::result::Result<T, CommandError>;

/// Walks up from the current directory to the town root (the directory
/// containing `.gastown/`).
pub fn find_town_root() -> Result<PathBuf> {
    let start = std::env::current_dir().map_err(|_| CommandError::NoTownRoot(PathBuf::from(".")))?;
    let mut dir = start.clone();
    loop {
        if dir.join(".gastown").is_dir() {
            return Ok(dir);
        }
        if !dir.pop() {
            return Err(CommandError::NoTownRoot(start));
        }
    }
}

/// Loads the routing table from the town root.
pub fn load_routing(town_root: &std::path::Path) -> Result<RoutingTable> {
    Ok(RoutingTable::load(routing_path(town_root))?)
}

/// The actor identity recorded on feed events from the CLI.
pub fn detect_actor() -> String {
    std::env::var("GASTOWN_ACTOR")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "operator".to_string())
}
