//! The dispatch primitive: hand one bead to a fresh worker session.
//!
//! Slinging a bead spawns an isolated worker, ensures exactly one enclosing
//! convoy, binds the bead to the session, and starts the agent. The step
//! order is the crash-safety story: the bind (step 4) is the durable claim,
//! so a crash between steps leaves a state where the next attempt for the
//! same bead observes the binding and aborts cleanly with "already hooked".
//!
//! Late-stage failures (workspace prep, session start) log a warning and do
//! not roll back: the worker exists, the binding is recorded, and the fix is
//! a retry knob, not an abort.

use std::time::Duration;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::convoy::manager::find_tracking_convoy;
use crate::feed::FeedWriter;
use crate::gate;
use crate::store::{BeadPatch, StoreClient, StoreError};
use crate::types::{BeadId, BeadStatus, RigName};

use super::session::{SessionBackend, SessionError, SpawnOptions, SpawnedSession};

/// Attempts to bind a bead before giving up; the store's single-writer lock
/// makes the first write racy under load.
const HOOK_ATTEMPTS: u32 = 3;
const HOOK_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Errors from the dispatch primitive.
#[derive(Debug, Error)]
pub enum SlingError {
    /// The bead is already bound to a live session.
    #[error("{bead} is already {status} (use --force to re-sling)")]
    AlreadyBound { bead: BeadId, status: BeadStatus },

    /// The bead is closed; closed work never dispatches.
    #[error("{0} is closed")]
    Closed(BeadId),

    /// The bead's type is an aggregate, not a dispatchable leaf.
    #[error("{bead} has non-dispatchable type {issue_type:?}")]
    NotDispatchable { bead: BeadId, issue_type: String },

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Worker session could not be spawned.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// The bead could not be bound to the spawned session.
    #[error("binding {bead} to {session}: {source}")]
    Bind {
        bead: BeadId,
        session: String,
        #[source]
        source: StoreError,
    },
}

/// Result type for sling operations.
pub type Result<T> = std::result::Result<T, SlingError>;

/// Options for one sling.
#[derive(Debug, Clone, Default)]
pub struct SlingOptions {
    /// Re-sling a bead that is already bound.
    pub force: bool,
    /// Skip the auto-convoy step (the caller manages enrollment).
    pub no_convoy: bool,
    /// Raw spawn arguments (recovered from queue metadata).
    pub args: Option<String>,
    /// Actor recorded on the feed event and the bead's dispatcher field.
    pub actor: String,
    /// Agent program override.
    pub agent: Option<String>,
}

/// Dispatches one bead to a fresh worker session in `rig`.
///
/// Pre-conditions beyond what this function checks (notably the block gate)
/// are the caller's: both feed paths and the queue verify readiness before
/// invoking the primitive.
#[instrument(skip(store, sessions, feed, opts), fields(bead = %bead_id, rig = %rig))]
pub async fn sling_bead<S, B>(
    store: &S,
    sessions: &B,
    feed: &FeedWriter,
    bead_id: &BeadId,
    rig: &RigName,
    opts: SlingOptions,
) -> Result<SpawnedSession>
where
    S: StoreClient,
    B: SessionBackend,
{
    // Step 1: refuse to double-dispatch a bound bead.
    let bead = store.get(bead_id).await?;
    if bead.status.is_bound() && !opts.force {
        return Err(SlingError::AlreadyBound {
            bead: bead_id.clone(),
            status: bead.status,
        });
    }
    if bead.status.is_closed() {
        return Err(SlingError::Closed(bead_id.clone()));
    }
    if !gate::is_dispatchable_type(&bead.issue_type) {
        return Err(SlingError::NotDispatchable {
            bead: bead_id.clone(),
            issue_type: bead.issue_type.clone(),
        });
    }

    // Step 2: spawn the isolated worker.
    let spawn_opts = SpawnOptions {
        force: opts.force,
        agent: opts.agent.clone(),
        args: opts.args.clone(),
    };
    let session = sessions.spawn(rig, &spawn_opts).await?;

    // Step 3: exactly one enclosing convoy. Reuse an existing tracker; create
    // a single-member auto-convoy otherwise. A failure here is logged, not
    // fatal; the bead still dispatches, it just isn't tracked.
    if !opts.no_convoy {
        match find_tracking_convoy(store, bead_id).await {
            Ok(Some(existing)) => {
                info!(convoy = %existing, "already tracked");
            }
            Ok(None) => {
                match store
                    .create_convoy(&format!("Convoy: {}", bead.title), std::slice::from_ref(bead_id))
                    .await
                {
                    Ok(convoy) => info!(convoy = %convoy, "created auto-convoy"),
                    Err(e) => warn!(error = %e, "could not create auto-convoy"),
                }
            }
            Err(e) => warn!(error = %e, "could not check convoy tracking"),
        }
    }

    // Step 4: bind the bead to the session. This is the durable claim; it
    // gets retries because the store may briefly hold a writer lock.
    hook_with_retry(store, bead_id, &session).await?;

    // Step 5: feed event.
    feed.sling(&opts.actor, bead_id, &session.name);

    // Step 6: ancillary metadata. Best effort.
    let mut patch = BeadPatch::default().with_field("dispatcher", &opts.actor);
    if let Some(args) = &opts.args {
        patch = patch.with_field("args", args);
    }
    if let Err(e) = store.update(bead_id, patch).await {
        warn!(error = %e, "could not store dispatch fields");
    }

    // Step 7: workspace artifacts, only after the store mutations are in.
    if let Err(e) = sessions.prepare_workspace(&session).await {
        warn!(error = %e, "could not prepare workspace");
    }

    // Step 8: start the agent. The worker exists either way; a start failure
    // is a retry knob, not an abort.
    match sessions.start(&session).await {
        Ok(()) => info!(session = %session.name, "session started"),
        Err(e) => warn!(error = %e, "could not start session"),
    }

    Ok(session)
}

async fn hook_with_retry<S: StoreClient>(
    store: &S,
    bead_id: &BeadId,
    session: &SpawnedSession,
) -> Result<()> {
    let mut last_err = None;
    for attempt in 1..=HOOK_ATTEMPTS {
        let patch = BeadPatch::default()
            .with_status(BeadStatus::Hooked)
            .with_field("holder", &session.agent_id)
            .with_field("work_dir", session.work_dir.to_string_lossy());
        match store.update(bead_id, patch).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, error = %e, "hook attempt failed");
                last_err = Some(e);
                if attempt < HOOK_ATTEMPTS {
                    tokio::time::sleep(HOOK_RETRY_DELAY).await;
                }
            }
        }
    }
    Err(SlingError::Bind {
        bead: bead_id.clone(),
        session: session.name.to_string(),
        source: last_err.unwrap_or(StoreError::Unavailable("hook failed".to_string())),
    })
}
