//! The stranded sweep (reconciliation backstop).
//!
//! A convoy is stranded when it has at least one ready member and no member
//! bound to an active session: either a member's close event was missed, or
//! a prior dispatch crashed before binding. The sweep walks every open convoy
//! on every observed store and dispatches the first ready member of each
//! stranded one.
//!
//! Deliberately separate from the event-driven feed (see
//! [`super::event_feed`]); the two paths share the gates and the member
//! iteration, nothing else.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::convoy::manager::{
    close_if_complete, feed_first_ready, is_stranded, list_open_convoys, FeedContext, FeedOutcome,
};
use crate::dispatch::SessionBackend;
use crate::store::StoreClient;
use crate::types::{RigName, HQ_PREFIX};

use super::event_feed::{EventSource, FeedDeps};
use super::patrol::ticker;

/// What one sweep cycle did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Open convoys examined.
    pub examined: usize,
    /// Convoys found stranded.
    pub stranded: usize,
    /// Members dispatched.
    pub dispatched: usize,
    /// Convoys auto-closed (every member already closed).
    pub auto_closed: usize,
    /// Sources skipped because their rig is parked.
    pub skipped_parked: usize,
}

/// Runs one stranded sweep over every source.
#[instrument(skip_all)]
pub async fn sweep_cycle<S, B>(
    sources: &[EventSource<S>],
    deps: &FeedDeps<'_, B>,
) -> SweepReport
where
    S: StoreClient,
    B: SessionBackend,
{
    let mut report = SweepReport::default();

    for source in sources {
        if source.name != HQ_PREFIX && deps.parked.contains(&RigName::new(&source.name)) {
            debug!(store = %source.name, "rig parked, skipping stranded sweep");
            report.skipped_parked += 1;
            continue;
        }

        let convoys = match list_open_convoys(&source.client).await {
            Ok(convoys) => convoys,
            Err(e) => {
                warn!(store = %source.name, error = %e, "could not list convoys");
                continue;
            }
        };

        for convoy in convoys {
            report.examined += 1;

            let ctx = FeedContext {
                store: &source.client,
                sessions: deps.sessions,
                feed: deps.feed,
                routing: deps.routing,
                parked: deps.parked,
                actor: deps.actor,
            };

            match is_stranded(&source.client, &convoy).await {
                Ok(true) => {}
                Ok(false) => {
                    // Not stranded, but possibly complete. This path never
                    // dispatches.
                    match close_if_complete(&ctx, &convoy).await {
                        Ok(true) => report.auto_closed += 1,
                        Ok(false) => {}
                        Err(e) => warn!(convoy = %convoy.id, error = %e, "auto-close check failed"),
                    }
                    continue;
                }
                Err(e) => {
                    warn!(convoy = %convoy.id, error = %e, "stranded check failed");
                    continue;
                }
            }

            report.stranded += 1;
            info!(store = %source.name, convoy = %convoy.id, "stranded convoy, feeding");

            match feed_first_ready(&ctx, &convoy).await {
                Ok(FeedOutcome::Dispatched { member }) => {
                    info!(convoy = %convoy.id, member = %member, "stranded sweep dispatched");
                    report.dispatched += 1;
                }
                Ok(FeedOutcome::AutoClosed) => report.auto_closed += 1,
                Ok(FeedOutcome::Idle) => {}
                Err(e) => warn!(convoy = %convoy.id, error = %e, "stranded feed failed"),
            }
        }
    }

    report
}

/// The `stranded_scan` patrol loop.
pub async fn run_loop<S, B>(
    sources: Vec<EventSource<S>>,
    sessions: B,
    town_root: std::path::PathBuf,
    period: Duration,
    cancel: CancellationToken,
) where
    S: StoreClient,
    B: SessionBackend,
{
    let writer = crate::feed::FeedWriter::new(crate::config::feed_path(&town_root));
    let mut tick = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let Some((routing, parked)) =
                    super::event_feed::load_cycle_inputs(&town_root, |p| p.stranded_scan.is_enabled())
                else {
                    continue;
                };
                let deps = FeedDeps {
                    sessions: &sessions,
                    feed: &writer,
                    routing: &routing,
                    parked: &parked,
                    actor: "daemon",
                };
                let report = sweep_cycle(&sources, &deps).await;
                if report.stranded > 0 || report.auto_closed > 0 {
                    info!(?report, "stranded sweep cycle");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedWriter;
    use crate::store::RoutingTable;
    use crate::test_utils::{bead, bead_with_deps, test_routing, MockSessions, MockStore};
    use crate::types::{BeadStatus, DepKind, Dependency};
    use std::collections::HashSet;

    fn deps<'a>(
        sessions: &'a MockSessions,
        feed: &'a FeedWriter,
        routing: &'a RoutingTable,
        parked: &'a HashSet<RigName>,
    ) -> FeedDeps<'a, MockSessions> {
        FeedDeps {
            sessions,
            feed,
            routing,
            parked,
            actor: "daemon",
        }
    }

    #[tokio::test]
    async fn stranded_convoy_gets_fed() {
        let store = MockStore::new();
        store.insert(bead("gt-a", "closed"));
        store.insert(bead("gt-b", "open"));
        store.insert_convoy("hq-cv-1", &["gt-a", "gt-b"]);

        let sessions = MockSessions::new();
        let feed = FeedWriter::disabled();
        let routing = test_routing();
        let parked = HashSet::new();
        let sources = vec![EventSource::new("hq", &store)];

        let report = sweep_cycle(&sources, &deps(&sessions, &feed, &routing, &parked)).await;

        assert_eq!(report.stranded, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(store.get_sync("gt-b").status, BeadStatus::Hooked);
    }

    #[tokio::test]
    async fn active_convoy_is_left_alone() {
        let store = MockStore::new();
        store.insert(bead("gt-a", "hooked"));
        store.insert(bead("gt-b", "open"));
        store.insert_convoy("hq-cv-1", &["gt-a", "gt-b"]);

        let sessions = MockSessions::new();
        let feed = FeedWriter::disabled();
        let routing = test_routing();
        let parked = HashSet::new();
        let sources = vec![EventSource::new("hq", &store)];

        let report = sweep_cycle(&sources, &deps(&sessions, &feed, &routing, &parked)).await;

        assert_eq!(report.stranded, 0);
        assert_eq!(report.dispatched, 0);
        assert_eq!(sessions.spawn_count(), 0);
    }

    #[tokio::test]
    async fn blocked_member_leaves_convoy_waiting() {
        // CV tracks [I1, I2]; I2 blocks on I1 (open). The sweep must not
        // dispatch I2 while I1 is open; after I1 closes it must.
        let store = MockStore::new();
        store.insert(bead("gt-i1", "closed"));
        store.insert(bead_with_deps(
            "gt-i2",
            "open",
            vec![Dependency::new(DepKind::Blocks, "gt-i1")],
        ));
        store.insert_convoy("hq-cv-1", &["gt-i1", "gt-i2"]);
        // Re-open I1 to set up the "waiting" state.
        store.insert(bead("gt-i1", "open"));

        let sessions = MockSessions::new();
        let feed = FeedWriter::disabled();
        let routing = test_routing();
        let parked = HashSet::new();
        let sources = vec![EventSource::new("hq", &store)];
        let d = deps(&sessions, &feed, &routing, &parked);

        // I1 itself is ready, so the sweep dispatches it (not I2).
        let report = sweep_cycle(&sources, &d).await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(store.get_sync("gt-i1").status, BeadStatus::Hooked);
        assert_eq!(store.get_sync("gt-i2").status, BeadStatus::Open);

        // I1 finishes; next sweep picks up I2.
        store.insert(bead("gt-i1", "closed"));
        let report = sweep_cycle(&sources, &d).await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(store.get_sync("gt-i2").status, BeadStatus::Hooked);
    }

    #[tokio::test]
    async fn completed_convoy_auto_closes() {
        let store = MockStore::new();
        store.insert(bead("gt-a", "closed"));
        store.insert(bead("gt-b", "closed"));
        store.insert_convoy("hq-cv-1", &["gt-a", "gt-b"]);

        let sessions = MockSessions::new();
        let feed = FeedWriter::disabled();
        let routing = test_routing();
        let parked = HashSet::new();
        let sources = vec![EventSource::new("hq", &store)];

        let report = sweep_cycle(&sources, &deps(&sessions, &feed, &routing, &parked)).await;

        assert_eq!(report.auto_closed, 1);
        assert_eq!(store.get_sync("hq-cv-1").status, BeadStatus::Closed);
    }

    #[tokio::test]
    async fn parked_store_skipped_hq_never() {
        let hq_store = MockStore::new();
        hq_store.insert(bead("gt-a", "open"));
        hq_store.insert_convoy("hq-cv-1", &["gt-a"]);

        let rig_store = MockStore::new();
        rig_store.insert(bead("bd-a", "open"));
        rig_store.insert_convoy("hq-cv-2", &["bd-a"]);

        let sessions = MockSessions::new();
        let feed = FeedWriter::disabled();
        let routing = test_routing();
        let mut parked = HashSet::new();
        parked.insert(RigName::new("hq"));
        parked.insert(RigName::new("beads"));

        let sources = vec![
            EventSource::new("hq", &hq_store),
            EventSource::new("beads", &rig_store),
        ];
        let report = sweep_cycle(&sources, &deps(&sessions, &feed, &routing, &parked)).await;

        assert_eq!(report.skipped_parked, 1);
        assert_eq!(hq_store.get_sync("gt-a").status, BeadStatus::Hooked);
        assert_eq!(rig_store.get_sync("bd-a").status, BeadStatus::Open);
    }
}
