//! Convoy tracking and the feed machinery.
//!
//! A convoy is an aggregate bead whose `parent-child` dependencies enumerate
//! its members, in dispatch order. As members close, the convoy advances by
//! dispatching the next ready member; when every member is closed it
//! auto-closes.
//!
//! Two independent paths call into this module and deliberately stay
//! separate:
//!
//! - the **event-driven feed** reacts to `close` events from the store's
//!   event stream (fast path);
//! - the **stranded sweep** reconciles convoys whose close event was missed
//!   or whose prior dispatch crashed before binding (backstop).
//!
//! Keeping them apart preserves the distinction between "event was missed"
//! and "event was processed but dispatch crashed" when debugging a stalled
//! convoy.
//!
//! # Invariant
//!
//! Both paths dispatch at most one member per (convoy, invocation), so convoy
//! feeding can never overrun the queue dispatcher's capacity accounting.

use std::collections::HashSet;

use tracing::{debug, info, instrument, warn};

use crate::dispatch::{sling_bead, SessionBackend, SlingOptions};
use crate::feed::FeedWriter;
use crate::gate;
use crate::store::{BeadPatch, ListFilter, RoutingTable, StoreClient, StoreError};
use crate::types::{Bead, BeadId, BeadStatus, ConvoyId, RigName, TYPE_CONVOY};

/// Close reason recorded when a convoy auto-closes.
const AUTO_CLOSE_REASON: &str = "all members complete";

/// Everything a feed invocation needs, bundled so both paths share one
/// signature.
pub struct FeedContext<'a, S, B> {
    pub store: &'a S,
    pub sessions: &'a B,
    pub feed: &'a FeedWriter,
    pub routing: &'a RoutingTable,
    /// Rigs currently not accepting dispatches.
    pub parked: &'a HashSet<RigName>,
    /// Actor recorded on feed events ("daemon" for patrol-driven feeding).
    pub actor: &'a str,
}

/// What a single feed invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedOutcome {
    /// One member was dispatched.
    Dispatched { member: BeadId },
    /// Every member is closed; the convoy was auto-closed.
    AutoClosed,
    /// Nothing to do: no ready member, or dispatch attempts all failed.
    Idle,
}

/// Lists all open convoys in the store.
pub async fn list_open_convoys<S: StoreClient>(store: &S) -> Result<Vec<Bead>, StoreError> {
    store
        .list(
            ListFilter::default()
                .with_type(TYPE_CONVOY)
                .with_status(BeadStatus::Open),
        )
        .await
}

/// Finds the open convoy tracking `bead`, if any.
///
/// At most one open convoy may track a member; the first match wins and any
/// duplicate is a store-side integrity problem, not something to mask here.
pub async fn find_tracking_convoy<S: StoreClient>(
    store: &S,
    bead: &BeadId,
) -> Result<Option<ConvoyId>, StoreError> {
    let convoys = list_open_convoys(store).await?;
    for convoy in convoys {
        if convoy.tracked_members().iter().any(|m| m == bead) {
            return Ok(Some(ConvoyId::new(convoy.id.as_str())));
        }
    }
    Ok(None)
}

/// Event-path feed: advance a convoy after one of its members closed.
///
/// Iterates members in stored order, skipping closed, bound, aggregate-typed,
/// blocked, and parked-rig members; attempts dispatch on each candidate and
/// returns on the first success. Dispatch failure moves on to the next
/// candidate. If every member is closed, the convoy auto-closes.
#[instrument(skip_all, fields(convoy = %convoy.id))]
pub async fn feed_next_ready_issue<S, B>(
    ctx: &FeedContext<'_, S, B>,
    convoy: &Bead,
) -> Result<FeedOutcome, StoreError>
where
    S: StoreClient,
    B: SessionBackend,
{
    feed_members(ctx, convoy).await
}

/// Sweep-path feed: dispatch the first ready member of a stranded convoy.
///
/// Same iteration discipline as the event path; the difference is upstream
/// (the caller has established the convoy is stranded rather than reacting
/// to a close event).
#[instrument(skip_all, fields(convoy = %convoy.id))]
pub async fn feed_first_ready<S, B>(
    ctx: &FeedContext<'_, S, B>,
    convoy: &Bead,
) -> Result<FeedOutcome, StoreError>
where
    S: StoreClient,
    B: SessionBackend,
{
    feed_members(ctx, convoy).await
}

/// Shared member iteration for both feed paths. One dispatch per invocation.
async fn feed_members<S, B>(
    ctx: &FeedContext<'_, S, B>,
    convoy: &Bead,
) -> Result<FeedOutcome, StoreError>
where
    S: StoreClient,
    B: SessionBackend,
{
    let members = convoy.tracked_members();
    if members.is_empty() {
        debug!("convoy has no members");
        return Ok(FeedOutcome::Idle);
    }

    let mut all_closed = true;
    for member_id in &members {
        let member = match ctx.store.get(member_id).await {
            Ok(m) => m,
            Err(StoreError::NotFound(_)) => {
                warn!(member = %member_id, "tracked member missing from store");
                continue;
            }
            Err(e) => {
                warn!(member = %member_id, error = %e, "could not read member");
                all_closed = false;
                continue;
            }
        };

        if member.status.is_closed() {
            continue;
        }
        all_closed = false;

        if member.status.is_bound() {
            debug!(member = %member_id, "already bound, skipping");
            continue;
        }
        if !gate::is_dispatchable_type(&member.issue_type) {
            debug!(member = %member_id, issue_type = %member.issue_type, "not a leaf, skipping");
            continue;
        }
        if gate::is_blocked(&member, ctx.store).await {
            debug!(member = %member_id, "blocked, skipping");
            continue;
        }

        let Some(rig) = ctx.routing.resolve(member_id.prefix()) else {
            warn!(member = %member_id, prefix = member_id.prefix(), "no rig route, skipping");
            continue;
        };
        if ctx.parked.contains(rig) {
            debug!(member = %member_id, rig = %rig, "rig parked, skipping");
            continue;
        }

        let opts = SlingOptions {
            // The convoy already tracks this member; the primitive must not
            // enroll it again.
            no_convoy: true,
            actor: ctx.actor.to_string(),
            ..Default::default()
        };
        match sling_bead(ctx.store, ctx.sessions, ctx.feed, member_id, rig, opts).await {
            Ok(session) => {
                info!(member = %member_id, session = %session.name, "convoy advanced");
                return Ok(FeedOutcome::Dispatched {
                    member: member_id.clone(),
                });
            }
            Err(e) => {
                warn!(member = %member_id, error = %e, "dispatch failed, trying next member");
                continue;
            }
        }
    }

    if all_closed {
        auto_close(ctx, convoy).await?;
        return Ok(FeedOutcome::AutoClosed);
    }

    Ok(FeedOutcome::Idle)
}

/// Returns true if the convoy is stranded: at least one member is ready (both
/// gates) and no member is bound to an active session.
///
/// A stranded convoy means either a member's close event was missed or a
/// prior dispatch crashed before binding; the sweep recovers both.
pub async fn is_stranded<S: StoreClient>(store: &S, convoy: &Bead) -> Result<bool, StoreError> {
    let mut any_ready = false;
    for member_id in convoy.tracked_members() {
        let member = match store.get(&member_id).await {
            Ok(m) => m,
            Err(StoreError::NotFound(_)) => continue,
            Err(e) => {
                warn!(member = %member_id, error = %e, "could not read member");
                continue;
            }
        };
        if member.status.is_bound() {
            return Ok(false);
        }
        if member.status.is_closed() {
            continue;
        }
        if gate::is_dispatchable_type(&member.issue_type) && !gate::is_blocked(&member, store).await
        {
            any_ready = true;
        }
    }
    Ok(any_ready)
}

/// Auto-closes the convoy if every member is closed. Returns true if it
/// closed. Unlike the feed paths this never dispatches, so the sweep can call
/// it on convoys that are not stranded.
pub async fn close_if_complete<S, B>(
    ctx: &FeedContext<'_, S, B>,
    convoy: &Bead,
) -> Result<bool, StoreError>
where
    S: StoreClient,
    B: SessionBackend,
{
    let members = convoy.tracked_members();
    if members.is_empty() {
        return Ok(false);
    }
    for member_id in &members {
        match ctx.store.get(member_id).await {
            Ok(m) if m.status.is_closed() => continue,
            Ok(_) => return Ok(false),
            Err(StoreError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    auto_close(ctx, convoy).await?;
    Ok(true)
}

/// Closes a convoy whose members are all done.
async fn auto_close<S, B>(ctx: &FeedContext<'_, S, B>, convoy: &Bead) -> Result<(), StoreError>
where
    S: StoreClient,
    B: SessionBackend,
{
    info!(convoy = %convoy.id, "auto-closing convoy");
    ctx.store
        .update(
            &convoy.id,
            BeadPatch::default().close(Some(AUTO_CLOSE_REASON.to_string())),
        )
        .await?;
    ctx.feed
        .convoy_close(ctx.actor, &ConvoyId::new(convoy.id.as_str()));
    Ok(())
}
