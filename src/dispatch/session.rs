//! Worker session backend: spawn, workspace prep, start, census.
//!
//! Session lifecycle internals (terminal multiplexing, clone layout) are
//! outside the core; this trait is the seam the dispatch primitive and the
//! queue's capacity census consume. The production backend wraps tmux; tests
//! use an in-memory mock with injectable spawn failures.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::types::{RigName, SessionName};

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("spawning worker session: {0}")]
    Spawn(String),

    #[error("starting session {0}: {1}")]
    Start(SessionName, String),

    #[error("preparing workspace for {0}: {1}")]
    Workspace(SessionName, String),

    #[error("session operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Options for spawning a worker session.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Re-sling over an existing binding.
    pub force: bool,
    /// Agent program override.
    pub agent: Option<String>,
    /// Raw spawn arguments recovered from queue metadata.
    pub args: Option<String>,
}

/// A spawned worker session, before and after start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedSession {
    pub name: SessionName,
    pub rig: RigName,
    /// The agent identity beads are bound to (`<rig>/polecats/<name>`).
    pub agent_id: String,
    /// The session's isolated working directory.
    pub work_dir: PathBuf,
}

/// The seam between the dispatch primitive and the session machinery.
pub trait SessionBackend: Send + Sync {
    /// Spawns an isolated worker session in the given rig. The session exists
    /// but is not running an agent until [`start`](Self::start).
    fn spawn(
        &self,
        rig: &RigName,
        opts: &SpawnOptions,
    ) -> impl Future<Output = Result<SpawnedSession>> + Send;

    /// Creates session-scoped workspace artifacts (store branch, attached
    /// files). Called only after all store mutations for the sling succeed.
    fn prepare_workspace(&self, session: &SpawnedSession)
        -> impl Future<Output = Result<()>> + Send;

    /// Starts the agent in the session (terminal pane, first prompt).
    fn start(&self, session: &SpawnedSession) -> impl Future<Output = Result<()>> + Send;

    /// Counts live worker sessions town-wide (the `-p-` name pattern).
    ///
    /// A census failure reports zero: the dispatcher would rather briefly
    /// overestimate capacity than wedge on a multiplexer hiccup.
    fn active_workers(&self) -> impl Future<Output = usize> + Send;
}

// Shared references forward, so loops can borrow one backend.
impl<T: SessionBackend> SessionBackend for &T {
    async fn spawn(&self, rig: &RigName, opts: &SpawnOptions) -> Result<SpawnedSession> {
        (**self).spawn(rig, opts).await
    }

    async fn prepare_workspace(&self, session: &SpawnedSession) -> Result<()> {
        (**self).prepare_workspace(session).await
    }

    async fn start(&self, session: &SpawnedSession) -> Result<()> {
        (**self).start(session).await
    }

    async fn active_workers(&self) -> usize {
        (**self).active_workers().await
    }
}

/// Timeout for multiplexer commands.
const TMUX_TIMEOUT: Duration = Duration::from_secs(10);

/// Production backend over tmux.
///
/// Worker sessions are named `gt-<rig>-p-<name>`; the `-p-` infix is the
/// census pattern.
#[derive(Debug, Clone)]
pub struct TmuxBackend {
    town_root: PathBuf,
    agent_command: String,
}

impl TmuxBackend {
    pub fn new(town_root: impl Into<PathBuf>) -> Self {
        TmuxBackend {
            town_root: town_root.into(),
            agent_command: "claude".to_string(),
        }
    }

    pub fn with_agent_command(mut self, cmd: impl Into<String>) -> Self {
        self.agent_command = cmd.into();
        self
    }

    async fn tmux(&self, args: &[&str]) -> Result<String> {
        let output = tokio::time::timeout(TMUX_TIMEOUT, Command::new("tmux").args(args).output())
            .await
            .map_err(|_| SessionError::Timeout(TMUX_TIMEOUT))?
            .map_err(|e| SessionError::Spawn(format!("running tmux: {e}")))?;
        if !output.status.success() {
            return Err(SessionError::Spawn(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl SessionBackend for TmuxBackend {
    async fn spawn(&self, rig: &RigName, opts: &SpawnOptions) -> Result<SpawnedSession> {
        // Millisecond suffix keeps names unique without a registry.
        let suffix = chrono::Utc::now().timestamp_millis() % 0xfff_fff;
        let name = SessionName::new(format!("gt-{rig}-p-{suffix:07x}"));
        let work_dir = self
            .town_root
            .join(rig.as_str())
            .join("polecats")
            .join(format!("{suffix:07x}"));

        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| SessionError::Spawn(format!("creating work dir: {e}")))?;

        self.tmux(&[
            "new-session",
            "-d",
            "-s",
            name.as_str(),
            "-c",
            &work_dir.to_string_lossy(),
        ])
        .await?;

        debug!(session = %name, rig = %rig, force = opts.force, "spawned worker session");

        Ok(SpawnedSession {
            agent_id: format!("{rig}/polecats/{suffix:07x}"),
            name,
            rig: rig.clone(),
            work_dir,
        })
    }

    async fn prepare_workspace(&self, session: &SpawnedSession) -> Result<()> {
        // The store branch follows the session name, so a crashed worker's
        // writes stay isolated from the rig's main branch.
        let output = Command::new("bd")
            .args(["branch", "create", session.name.as_str()])
            .current_dir(&session.work_dir)
            .output()
            .await
            .map_err(|e| SessionError::Workspace(session.name.clone(), e.to_string()))?;
        if !output.status.success() {
            return Err(SessionError::Workspace(
                session.name.clone(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn start(&self, session: &SpawnedSession) -> Result<()> {
        self.tmux(&[
            "send-keys",
            "-t",
            session.name.as_str(),
            &self.agent_command,
            "Enter",
        ])
        .await
        .map_err(|e| SessionError::Start(session.name.clone(), e.to_string()))?;
        Ok(())
    }

    async fn active_workers(&self) -> usize {
        match self.tmux(&["list-sessions", "-F", "#{session_name}"]).await {
            Ok(out) => out
                .lines()
                .filter(|line| SessionName::new(*line).is_worker())
                .count(),
            Err(e) => {
                warn!(error = %e, "worker census failed, reporting zero");
                0
            }
        }
    }
}
