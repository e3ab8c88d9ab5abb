//! The event-driven convoy feed (fast path).
//!
//! Every cycle polls each store's event stream since its watermark and runs
//! the convoy feed for every open convoy one of whose members closed. The
//! watermark lives only in memory: the very first poll for a store is a
//! seed-only warm-up that establishes the watermark and processes nothing,
//! so a restarted daemon never replays history.
//!
//! This path is deliberately separate from the stranded sweep
//! ([`super::stranded`]): the sweep reconciles what this path misses, and
//! merging them would lose the ability to tell "event was missed" from
//! "event was processed but dispatch crashed".

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::convoy::manager::{feed_next_ready_issue, list_open_convoys, FeedContext, FeedOutcome};
use crate::dispatch::SessionBackend;
use crate::feed::FeedWriter;
use crate::store::{RoutingTable, StoreClient};
use crate::types::{RigName, Watermark, HQ_PREFIX};

use super::patrol::ticker;

/// One observed store: a name (matching its rig, `hq` for the town store),
/// a client, and the in-memory watermark.
pub struct EventSource<S> {
    pub name: String,
    pub client: S,
    watermark: Watermark,
}

impl<S> EventSource<S> {
    pub fn new(name: impl Into<String>, client: S) -> Self {
        EventSource {
            name: name.into(),
            client,
            watermark: None,
        }
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }
}

/// What one poll cycle did, across all sources.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Sources that completed their warm-up this cycle.
    pub seeded: usize,
    /// Close events processed.
    pub closes: usize,
    /// Members dispatched by convoy feeding.
    pub dispatched: usize,
    /// Convoys auto-closed.
    pub auto_closed: usize,
    /// Sources skipped because their rig is parked.
    pub skipped_parked: usize,
}

/// Shared per-cycle dependencies for the feed paths.
pub struct FeedDeps<'a, B> {
    pub sessions: &'a B,
    pub feed: &'a FeedWriter,
    pub routing: &'a RoutingTable,
    pub parked: &'a HashSet<RigName>,
    pub actor: &'a str,
}

/// The event-driven feed over a set of store sources.
pub struct EventFeed<S> {
    sources: Vec<EventSource<S>>,
}

impl<S: StoreClient> EventFeed<S> {
    pub fn new(sources: Vec<EventSource<S>>) -> Self {
        EventFeed { sources }
    }

    /// Runs one poll cycle over every source.
    ///
    /// Per-source errors are logged and skipped; the cycle always completes.
    #[instrument(skip_all)]
    pub async fn poll_cycle<B: SessionBackend>(&mut self, deps: &FeedDeps<'_, B>) -> PollReport {
        let mut report = PollReport::default();

        for source in &mut self.sources {
            // Parked rigs are skipped, but never the hq store.
            if source.name != HQ_PREFIX && deps.parked.contains(&RigName::new(&source.name)) {
                debug!(store = %source.name, "rig parked, skipping event poll");
                report.skipped_parked += 1;
                continue;
            }

            // Warm-up: seed the watermark, process nothing.
            let Some(watermark) = source.watermark else {
                match source.client.latest_event_at().await {
                    Ok(latest) => {
                        source.watermark = Some(latest.unwrap_or_else(Utc::now));
                        info!(store = %source.name, watermark = ?source.watermark,
                            "seeded event watermark");
                        report.seeded += 1;
                    }
                    Err(e) => {
                        warn!(store = %source.name, error = %e, "could not seed watermark");
                    }
                }
                continue;
            };

            let events = match source.client.events_since(watermark).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(store = %source.name, error = %e, "event poll failed");
                    continue;
                }
            };
            if events.is_empty() {
                continue;
            }

            // Advance the watermark over the whole batch up front. A dispatch
            // crash below loses the event; the stranded sweep is the backstop.
            if let Some(max_at) = events.iter().map(|e| e.at).max() {
                source.watermark = Some(max_at);
            }

            let closed: Vec<_> = events.into_iter().filter(|e| e.is_close()).collect();
            if closed.is_empty() {
                continue;
            }
            report.closes += closed.len();

            let convoys = match list_open_convoys(&source.client).await {
                Ok(convoys) => convoys,
                Err(e) => {
                    warn!(store = %source.name, error = %e, "could not list convoys");
                    continue;
                }
            };

            // One feed invocation per affected convoy per cycle, even when
            // several members closed at once.
            let mut fed = HashSet::new();
            for event in &closed {
                for convoy in &convoys {
                    if fed.contains(&convoy.id) {
                        continue;
                    }
                    if !convoy.tracked_members().iter().any(|m| m == &event.target) {
                        continue;
                    }
                    fed.insert(convoy.id.clone());

                    let ctx = FeedContext {
                        store: &source.client,
                        sessions: deps.sessions,
                        feed: deps.feed,
                        routing: deps.routing,
                        parked: deps.parked,
                        actor: deps.actor,
                    };
                    match feed_next_ready_issue(&ctx, convoy).await {
                        Ok(FeedOutcome::Dispatched { member }) => {
                            info!(store = %source.name, convoy = %convoy.id, member = %member,
                                "event feed dispatched");
                            report.dispatched += 1;
                        }
                        Ok(FeedOutcome::AutoClosed) => report.auto_closed += 1,
                        Ok(FeedOutcome::Idle) => {}
                        Err(e) => {
                            warn!(convoy = %convoy.id, error = %e, "convoy feed failed");
                        }
                    }
                }
            }
        }

        report
    }
}

/// The `event_poll` patrol loop.
///
/// Settings and the routing table are re-read every tick, so parking a rig or
/// adding a route takes effect on the next cadence.
pub async fn run_loop<S, B>(
    mut feed: EventFeed<S>,
    sessions: B,
    town_root: std::path::PathBuf,
    period: Duration,
    cancel: CancellationToken,
) where
    S: StoreClient,
    B: SessionBackend,
{
    let writer = FeedWriter::new(crate::config::feed_path(&town_root));
    let mut tick = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let Some((routing, parked)) = load_cycle_inputs(&town_root, |p| p.event_poll.is_enabled()) else {
                    continue;
                };
                let deps = FeedDeps {
                    sessions: &sessions,
                    feed: &writer,
                    routing: &routing,
                    parked: &parked,
                    actor: "daemon",
                };
                let report = feed.poll_cycle(&deps).await;
                if report.dispatched > 0 || report.auto_closed > 0 {
                    info!(?report, "event poll cycle");
                }
            }
        }
    }
}

/// Loads settings and routing for one feed cycle. Returns `None` (with a log
/// line) when the patrol is disabled or an input cannot be read.
pub(super) fn load_cycle_inputs(
    town_root: &std::path::Path,
    enabled: impl Fn(&crate::config::PatrolSettings) -> bool,
) -> Option<(RoutingTable, HashSet<RigName>)> {
    let settings = match crate::config::TownSettings::load_or_create(town_root) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "could not load town settings");
            return None;
        }
    };
    if !enabled(&settings.patrols) {
        return None;
    }
    let routing = match RoutingTable::load(crate::config::routing_path(town_root)) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "could not load routing table");
            return None;
        }
    };
    Some((routing, settings.parked_rigs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{bead, test_routing, MockSessions, MockStore};
    use crate::types::BeadStatus;

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
    async fn warm_up_seeds_without_processing() {
        let store = MockStore::new();
        store.insert(bead("gt-a", "closed"));
        store.insert(bead("gt-b", "open"));
        store.insert_convoy("hq-cv-1", &["gt-a", "gt-b"]);
        store.push_event("close", "gt-a", 10);

        let sessions = MockSessions::new();
        let feed_writer = FeedWriter::disabled();
        let routing = test_routing();
        let parked = HashSet::new();
        let mut feed = EventFeed::new(vec![EventSource::new("hq", &store)]);

        let report = feed
            .poll_cycle(&deps(&sessions, &feed_writer, &routing, &parked))
            .await;

        // First cycle: watermark only, zero dispatches.
        assert_eq!(report.seeded, 1);
        assert_eq!(report.closes, 0);
        assert_eq!(report.dispatched, 0);
        assert_eq!(sessions.spawn_count(), 0);
    }

    #[tokio::test]
    async fn close_event_advances_convoy() {
        let store = MockStore::new();
        store.insert(bead("gt-a", "closed"));
        store.insert(bead("gt-b", "open"));
        store.insert_convoy("hq-cv-1", &["gt-a", "gt-b"]);
        store.push_event("create", "gt-a", 0);

        let sessions = MockSessions::new();
        let feed_writer = FeedWriter::disabled();
        let routing = test_routing();
        let parked = HashSet::new();
        let mut feed = EventFeed::new(vec![EventSource::new("hq", &store)]);
        let d = deps(&sessions, &feed_writer, &routing, &parked);

        // Warm-up cycle seeds the watermark from the newest event.
        feed.poll_cycle(&d).await;
        // gt-a's close arrives after the watermark.
        store.push_event("close", "gt-a", 3600);

        let report = feed.poll_cycle(&d).await;
        assert_eq!(report.closes, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(store.get_sync("gt-b").status, BeadStatus::Hooked);
    }

    #[tokio::test]
    async fn non_member_close_feeds_nothing() {
        let store = MockStore::new();
        store.insert(bead("gt-a", "open"));
        store.insert(bead("gt-zzz", "closed"));
        store.insert_convoy("hq-cv-1", &["gt-a"]);
        store.push_event("create", "gt-a", 0);

        let sessions = MockSessions::new();
        let feed_writer = FeedWriter::disabled();
        let routing = test_routing();
        let parked = HashSet::new();
        let mut feed = EventFeed::new(vec![EventSource::new("hq", &store)]);
        let d = deps(&sessions, &feed_writer, &routing, &parked);

        feed.poll_cycle(&d).await;
        store.push_event("close", "gt-zzz", 3600);

        let report = feed.poll_cycle(&d).await;
        assert_eq!(report.closes, 1);
        assert_eq!(report.dispatched, 0);
    }

    #[tokio::test]
    async fn two_closes_one_convoy_one_dispatch() {
        let store = MockStore::new();
        store.insert(bead("gt-a", "closed"));
        store.insert(bead("gt-b", "closed"));
        store.insert(bead("gt-c", "open"));
        store.insert(bead("gt-d", "open"));
        store.insert_convoy("hq-cv-1", &["gt-a", "gt-b", "gt-c", "gt-d"]);
        store.push_event("create", "gt-a", 0);

        let sessions = MockSessions::new();
        let feed_writer = FeedWriter::disabled();
        let routing = test_routing();
        let parked = HashSet::new();
        let mut feed = EventFeed::new(vec![EventSource::new("hq", &store)]);
        let d = deps(&sessions, &feed_writer, &routing, &parked);

        feed.poll_cycle(&d).await;
        store.push_event("close", "gt-a", 3600);
        store.push_event("close", "gt-b", 3601);

        let report = feed.poll_cycle(&d).await;
        assert_eq!(report.closes, 2);
        // The convoy is fed exactly once per invocation of the cycle.
        assert_eq!(report.dispatched, 1);
        assert_eq!(sessions.spawn_count(), 1);
    }

    #[tokio::test]
    async fn parked_rig_store_is_skipped_but_hq_is_not() {
        let hq_store = MockStore::new();
        hq_store.insert(bead("gt-a", "closed"));
        hq_store.insert(bead("gt-b", "open"));
        hq_store.insert_convoy("hq-cv-1", &["gt-a", "gt-b"]);
        hq_store.push_event("create", "gt-a", 0);

        let rig_store = MockStore::new();
        rig_store.insert(bead("bd-a", "closed"));
        rig_store.insert(bead("bd-b", "open"));
        rig_store.insert_convoy("hq-cv-2", &["bd-a", "bd-b"]);
        rig_store.push_event("create", "bd-a", 0);

        let sessions = MockSessions::new();
        let feed_writer = FeedWriter::disabled();
        let routing = test_routing();
        let mut parked = HashSet::new();
        // Both the hq rig and the beads rig are parked.
        parked.insert(RigName::new("hq"));
        parked.insert(RigName::new("beads"));

        let mut feed = EventFeed::new(vec![
            EventSource::new("hq", &hq_store),
            EventSource::new("beads", &rig_store),
        ]);
        let d = deps(&sessions, &feed_writer, &routing, &parked);

        feed.poll_cycle(&d).await;
        hq_store.push_event("close", "gt-a", 3600);
        rig_store.push_event("close", "bd-a", 3600);

        let report = feed.poll_cycle(&d).await;
        // The beads store was skipped both cycles; hq was polled.
        assert_eq!(report.skipped_parked, 1);
        assert_eq!(report.closes, 1);
        assert_eq!(hq_store.get_sync("gt-b").status, BeadStatus::Hooked);
        assert_eq!(rig_store.get_sync("bd-b").status, BeadStatus::Open);
    }

    #[tokio::test]
    async fn event_read_failure_keeps_watermark_for_retry() {
        let store = MockStore::new();
        store.insert(bead("gt-a", "open"));
        let sessions = MockSessions::new();
        let feed_writer = FeedWriter::disabled();
        let routing = test_routing();
        let parked = HashSet::new();
        let mut feed = EventFeed::new(vec![EventSource::new("hq", &store)]);
        let d = deps(&sessions, &feed_writer, &routing, &parked);

        feed.poll_cycle(&d).await;
        let wm = feed.sources[0].watermark();
        assert!(wm.is_some());

        store.fail_event_reads();
        let report = feed.poll_cycle(&d).await;
        assert_eq!(report, PollReport::default());
        assert_eq!(feed.sources[0].watermark(), wm);
    }
}
