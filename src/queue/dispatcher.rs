//! The queue dispatch cycle: admission-controlled conversion of queued beads
//! into live workers.
//!
//! The cycle is triggered by the `queue_dispatch` patrol on cadence, or
//! ad-hoc via `gt queue run`. Capacity is town-wide: the ceiling minus the
//! live worker census. Each dispatched bead is first **claimed** (queue
//! labels removed, embedded metadata stripped) and then handed to the
//! dispatch primitive; a failure after the claim re-queues the bead.
//!
//! Delivery is at-least-once: a crash after the claim but before the
//! re-queue leaves the bead unqueued. The store owns durability (this crate
//! deliberately adds no write-ahead log), and that gap is recovered by
//! operator monitoring, not by the core.

use std::path::Path;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::{ConfigError, TownSettings};
use crate::dispatch::{sling_bead, SessionBackend, SlingOptions};
use crate::feed::FeedWriter;
use crate::store::{BeadPatch, StoreClient, StoreError};
use crate::types::{Bead, BeadId, RigName};

use super::labels::{
    self, parse_metadata, queue_args, queue_rig, rig_label, strip_metadata, LABEL_QUEUED,
};
use super::state::{QueueState, QueueStateError};

/// Errors that abort a whole dispatch cycle.
///
/// Per-bead failures never abort the cycle; they re-queue and continue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    State(#[from] QueueStateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Overrides and mode flags for one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleOptions {
    /// Override `batch_size` (None = config).
    pub batch_override: Option<usize>,
    /// Override `max_concurrent` (None = config).
    pub max_override: Option<usize>,
    /// Plan only; mutate nothing.
    pub dry_run: bool,
    /// Actor recorded on feed events.
    pub actor: String,
}

/// One planned dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDispatch {
    pub bead: BeadId,
    pub rig: RigName,
}

/// What a cycle observed and did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub paused: bool,
    pub disabled: bool,
    pub active: usize,
    pub max_concurrent: usize,
    pub ready: usize,
    pub planned: Vec<PlannedDispatch>,
    pub dispatched: usize,
}

/// Runs one dispatch cycle.
#[instrument(skip_all, fields(dry_run = opts.dry_run))]
pub async fn run_cycle<S, B>(
    town_root: &Path,
    store: &S,
    sessions: &B,
    feed: &FeedWriter,
    opts: CycleOptions,
) -> Result<CycleReport>
where
    S: StoreClient,
    B: SessionBackend,
{
    let mut report = CycleReport::default();

    // Step 1: the pause bit gates the whole cycle.
    let mut state = QueueState::load(town_root)?;
    if state.paused {
        info!(paused_by = ?state.paused_by, "queue is paused, skipping dispatch");
        report.paused = true;
        return Ok(report);
    }

    // Step 2: limits.
    let settings = TownSettings::load_or_create(town_root)?;
    if !settings.queue.enabled && !opts.dry_run {
        info!("queue dispatch is not enabled in town settings");
        report.disabled = true;
        return Ok(report);
    }
    let max_concurrent = opts.max_override.unwrap_or(settings.queue.max_concurrent);
    let batch_size = opts.batch_override.unwrap_or(settings.queue.batch_size);
    let spawn_delay = settings.queue.spawn_delay();

    // Step 3-4: capacity.
    let active = sessions.active_workers().await;
    report.active = active;
    report.max_concurrent = max_concurrent;
    if active >= max_concurrent {
        info!(active, max_concurrent, "no capacity");
        return Ok(report);
    }
    let capacity = max_concurrent - active;

    // Step 5: ready queued beads (unblocked, per the store's own query).
    let ready = store.query_ready(Some(LABEL_QUEUED)).await?;
    report.ready = ready.len();

    // Step 6: plan. Beads without a rig label cannot dispatch; they stay
    // queued and get flagged in the log for the operator.
    let mut candidates: Vec<(Bead, RigName)> = Vec::new();
    for bead in ready {
        match queue_rig(&bead.labels) {
            Some(rig) => candidates.push((bead, rig)),
            None => warn!(bead = %bead.id, "queued without a rig label, skipping"),
        }
    }
    let n = capacity.min(batch_size).min(candidates.len());
    report.planned = candidates[..n]
        .iter()
        .map(|(b, rig)| PlannedDispatch {
            bead: b.id.clone(),
            rig: rig.clone(),
        })
        .collect();

    if opts.dry_run || n == 0 {
        return Ok(report);
    }

    info!(
        count = n,
        capacity,
        max_concurrent,
        ready = report.ready,
        "dispatching queued beads"
    );

    // Steps 7-9: claim, dispatch, re-queue on failure.
    for (i, (bead, rig)) in candidates[..n].iter().enumerate() {
        match dispatch_one(store, sessions, feed, bead, rig, &opts).await {
            Ok(()) => report.dispatched += 1,
            Err(e) => warn!(bead = %bead.id, error = %e, "dispatch failed"),
        }

        if i + 1 < n && !spawn_delay.is_zero() {
            // Successive spawns contend on the store's writer lock.
            tokio::time::sleep(spawn_delay).await;
        }
    }

    // Step 10: bookkeeping. Advisory only; a write failure is logged.
    if report.dispatched > 0 {
        state.record_dispatch(report.dispatched);
        if let Err(e) = state.save(town_root) {
            warn!(error = %e, "could not save queue state");
        }
    }

    info!(
        dispatched = report.dispatched,
        planned = n,
        "dispatch cycle complete"
    );
    Ok(report)
}

/// Claims one bead and hands it to the dispatch primitive. On failure after
/// the claim, re-queues.
async fn dispatch_one<S, B>(
    store: &S,
    sessions: &B,
    feed: &FeedWriter,
    bead: &Bead,
    rig: &RigName,
    opts: &CycleOptions,
) -> Result<()>
where
    S: StoreClient,
    B: SessionBackend,
{
    // Recover spawn args from the args label, falling back to embedded
    // metadata.
    let args = queue_args(&bead.labels).or_else(|| parse_metadata(&bead.description)?.args);

    // Claim: drop every queue label and strip embedded metadata in one patch.
    let mut claim = BeadPatch::default();
    for label in &bead.labels {
        if labels::is_queue_label(label) {
            claim = claim.remove_label(label.clone());
        }
    }
    let cleaned = strip_metadata(&bead.description);
    if cleaned != bead.description {
        claim = claim.with_description(cleaned);
    }
    store.update(&bead.id, claim).await?;

    let sling_opts = SlingOptions {
        args: args.clone(),
        actor: opts.actor.clone(),
        ..Default::default()
    };
    match sling_bead(store, sessions, feed, &bead.id, rig, sling_opts).await {
        Ok(session) => {
            feed.queue_dispatch(&opts.actor, &bead.id, rig, &session.name);
            Ok(())
        }
        Err(e) => {
            // Re-queue: put the labels back so the next cycle retries.
            let requeue = BeadPatch::default()
                .add_label(LABEL_QUEUED)
                .add_label(rig_label(rig));
            if let Err(re) = store.update(&bead.id, requeue).await {
                warn!(bead = %bead.id, error = %re, "could not re-queue after failed dispatch");
            }
            feed.requeue(&opts.actor, &bead.id, rig, &e.to_string());
            warn!(bead = %bead.id, error = %e, "re-queued after dispatch failure");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{queued_bead, MockSessions, MockStore};
    use crate::types::BeadStatus;

    fn opts() -> CycleOptions {
        CycleOptions {
            actor: "test".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dispatches_up_to_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let store = MockStore::new();
        for i in 0..5 {
            store.insert(queued_bead(&format!("gt-t{i}"), "gastown"));
        }
        let sessions = MockSessions::new();
        sessions.set_external_active(2);
        let feed = FeedWriter::disabled();

        let mut o = opts();
        o.max_override = Some(3);
        o.batch_override = Some(10);
        let report = run_cycle(dir.path(), &store, &sessions, &feed, o)
            .await
            .unwrap();

        // capacity = 3 - 2 = 1: exactly one dispatch, labels elsewhere untouched.
        assert_eq!(report.dispatched, 1);
        let still_queued = store
            .all_beads()
            .into_iter()
            .filter(|b| b.has_label(LABEL_QUEUED))
            .count();
        assert_eq!(still_queued, 4);
    }

    #[tokio::test]
    async fn no_capacity_means_no_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = MockStore::new();
        store.insert(queued_bead("gt-t1", "gastown"));
        let sessions = MockSessions::new();
        sessions.set_external_active(3);
        let feed = FeedWriter::disabled();

        let mut o = opts();
        o.max_override = Some(3);
        let report = run_cycle(dir.path(), &store, &sessions, &feed, o)
            .await
            .unwrap();

        assert_eq!(report.dispatched, 0);
        assert_eq!(sessions.spawn_count(), 0);
    }

    #[tokio::test]
    async fn paused_queue_skips_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = QueueState::default();
        state.set_paused("operator");
        state.save(dir.path()).unwrap();

        let store = MockStore::new();
        store.insert(queued_bead("gt-t1", "gastown"));
        let sessions = MockSessions::new();
        let feed = FeedWriter::disabled();

        let report = run_cycle(dir.path(), &store, &sessions, &feed, opts())
            .await
            .unwrap();

        assert!(report.paused);
        assert_eq!(sessions.spawn_count(), 0);
    }

    #[tokio::test]
    async fn dry_run_plans_without_mutating() {
        let dir = tempfile::tempdir().unwrap();
        let store = MockStore::new();
        store.insert(queued_bead("gt-t1", "gastown"));
        store.insert(queued_bead("gt-t2", "gastown"));
        let sessions = MockSessions::new();
        let feed = FeedWriter::disabled();

        let mut o = opts();
        o.dry_run = true;
        let report = run_cycle(dir.path(), &store, &sessions, &feed, o)
            .await
            .unwrap();

        assert_eq!(report.planned.len(), 2);
        assert_eq!(report.dispatched, 0);
        assert_eq!(sessions.spawn_count(), 0);
        assert!(store.get_sync("gt-t1").has_label(LABEL_QUEUED));
    }

    #[tokio::test]
    async fn spawn_failure_re_queues_claimed_bead() {
        let dir = tempfile::tempdir().unwrap();
        let store = MockStore::new();
        store.insert(queued_bead("gt-t1", "gastown"));
        let sessions = MockSessions::new();
        sessions.fail_next_spawn();
        let feed = FeedWriter::disabled();

        let report = run_cycle(dir.path(), &store, &sessions, &feed, opts())
            .await
            .unwrap();

        assert_eq!(report.dispatched, 0);
        let bead = store.get_sync("gt-t1");
        // The claim removed the labels; the re-queue restored them.
        assert!(bead.has_label(LABEL_QUEUED));
        assert!(bead.has_label("queued:rig:gastown"));
        assert_eq!(bead.status, BeadStatus::Open);

        // Next cycle retries the same bead.
        let report = run_cycle(dir.path(), &store, &sessions, &feed, opts())
            .await
            .unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(store.get_sync("gt-t1").status, BeadStatus::Hooked);
    }

    #[tokio::test]
    async fn claim_strips_queue_metadata_from_description() {
        let dir = tempfile::tempdir().unwrap();
        let store = MockStore::new();
        let mut bead = queued_bead("gt-t1", "gastown");
        bead.description = format!(
            "Fix it.\n\n{}",
            labels::render_metadata(&labels::QueueMetadata {
                args: Some("--fast".to_string()),
                submitted_by: None,
            })
        );
        store.insert(bead);
        let sessions = MockSessions::new();
        let feed = FeedWriter::disabled();

        run_cycle(dir.path(), &store, &sessions, &feed, opts())
            .await
            .unwrap();

        let bead = store.get_sync("gt-t1");
        assert_eq!(bead.description, "Fix it.");
        assert!(!bead.has_label(LABEL_QUEUED));
    }

    #[test]
    fn never_exceeds_max_concurrent() {
        use proptest::prelude::*;

        // Random arrival/completion schedules must never push the live worker
        // count past the ceiling.
        proptest!(ProptestConfig::with_cases(64), |(
            max_concurrent in 1usize..6,
            arrivals in proptest::collection::vec(0usize..4, 1..8),
            completions in proptest::collection::vec(0usize..3, 1..8),
        )| {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                // Zero out the inter-spawn delay so multi-dispatch cycles
                // don't sleep wall-clock time.
                let mut settings = crate::config::TownSettings::default();
                settings.queue.spawn_delay = "0s".to_string();
                settings.save(dir.path()).unwrap();
                let store = MockStore::new();
                let sessions = MockSessions::new();
                let feed = FeedWriter::disabled();
                let mut seq = 0usize;

                for (round, arrived) in arrivals.iter().enumerate() {
                    for _ in 0..*arrived {
                        store.insert(queued_bead(&format!("gt-t{seq}"), "gastown"));
                        seq += 1;
                    }

                    let mut o = opts();
                    o.max_override = Some(max_concurrent);
                    o.batch_override = Some(8);
                    run_cycle(dir.path(), &store, &sessions, &feed, o)
                        .await
                        .unwrap();

                    prop_assert!(
                        sessions.active_count_sync() <= max_concurrent,
                        "active {} exceeded ceiling {}",
                        sessions.active_count_sync(),
                        max_concurrent
                    );

                    let done = completions.get(round).copied().unwrap_or(0);
                    sessions.complete_workers(done);
                }
                Ok(())
            }).unwrap();
        });
    }
}
