//! End-to-end scenarios driving the feed paths and the queue cycle against
//! the in-memory backends.

use std::collections::HashSet;

use crate::convoy::enroll_batch;
use crate::feed::{FeedEvent, FeedKind, FeedWriter};
use crate::queue::{self, CycleOptions, LABEL_QUEUED};
use crate::store::{BeadPatch, RoutingTable, StoreClient};
use crate::test_utils::{bead, bead_with_deps, ids, queued_bead, test_routing, MockSessions, MockStore};
use crate::types::{BeadId, BeadStatus, DepKind, Dependency, RigName};

use super::event_feed::{EventFeed, EventSource, FeedDeps};
use super::stranded::sweep_cycle;

struct Harness {
    sessions: MockSessions,
    routing: RoutingTable,
    parked: HashSet<RigName>,
    feed_dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Harness {
            sessions: MockSessions::new(),
            routing: test_routing(),
            parked: HashSet::new(),
            feed_dir: tempfile::tempdir().unwrap(),
        }
    }

    fn writer(&self) -> FeedWriter {
        FeedWriter::new(self.feed_dir.path().join("feed.jsonl"))
    }

    fn deps<'a>(&'a self, writer: &'a FeedWriter) -> FeedDeps<'a, MockSessions> {
        FeedDeps {
            sessions: &self.sessions,
            feed: writer,
            routing: &self.routing,
            parked: &self.parked,
            actor: "daemon",
        }
    }

    fn feed_events(&self) -> Vec<FeedEvent> {
        let path = self.feed_dir.path().join("feed.jsonl");
        let Ok(content) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }
}

/// Marks a bead closed through the store surface and emits its close event.
async fn close_bead(store: &MockStore, id: &str, at_offset: i64) {
    store
        .update(&BeadId::new(id), BeadPatch::default().close(None))
        .await
        .unwrap();
    store.push_event("close", id, at_offset);
}

/// Simulates the bound worker finishing: one session retires, and the bead it
/// held closes.
async fn finish_work(store: &MockStore, sessions: &MockSessions, id: &str, at_offset: i64) {
    sessions.complete_workers(1);
    close_bead(store, id, at_offset).await;
}

#[tokio::test]
async fn single_convoy_auto_advances_to_completion() {
    let store = MockStore::new();
    for id in ["gt-i1", "gt-i2", "gt-i3"] {
        store.insert(bead(id, "open"));
    }
    store.insert_convoy("hq-cv-1", &["gt-i1", "gt-i2", "gt-i3"]);
    store.push_event("create", "gt-i1", 0);

    let h = Harness::new();
    let writer = h.writer();
    let d = h.deps(&writer);
    let mut feed = EventFeed::new(vec![EventSource::new("hq", &store)]);

    // Warm-up, then the sweep dispatches the first member (nothing is bound
    // yet, so the convoy is stranded by definition).
    feed.poll_cycle(&d).await;
    let sources = [EventSource::new("hq", &store)];
    sweep_cycle(&sources, &d).await;
    assert_eq!(store.get_sync("gt-i1").status, BeadStatus::Hooked);

    // i1 closes; the event feed advances to i2.
    finish_work(&store, &h.sessions, "gt-i1", 100).await;
    feed.poll_cycle(&d).await;
    assert_eq!(store.get_sync("gt-i2").status, BeadStatus::Hooked);

    // i2 closes; i3 dispatches.
    finish_work(&store, &h.sessions, "gt-i2", 200).await;
    feed.poll_cycle(&d).await;
    assert_eq!(store.get_sync("gt-i3").status, BeadStatus::Hooked);

    // i3 closes; the convoy auto-closes.
    finish_work(&store, &h.sessions, "gt-i3", 300).await;
    feed.poll_cycle(&d).await;
    assert_eq!(store.get_sync("hq-cv-1").status, BeadStatus::Closed);

    // Three slings, one convoy close.
    let events = h.feed_events();
    let slings = events.iter().filter(|e| e.kind == FeedKind::Sling).count();
    let closes = events
        .iter()
        .filter(|e| e.kind == FeedKind::ConvoyClose)
        .count();
    assert_eq!(slings, 3);
    assert_eq!(closes, 1);
}

#[tokio::test]
async fn blocked_member_waits_for_its_blocker() {
    // CV tracks [I1, I2]; I2 blocks on I1. I2 must not dispatch while I1 is
    // open, and must dispatch once I1 closes.
    let store = MockStore::new();
    store.insert(bead("gt-i1", "open"));
    store.insert(bead_with_deps(
        "gt-i2",
        "open",
        vec![Dependency::new(DepKind::Blocks, "gt-i1")],
    ));
    store.insert_convoy("hq-cv-1", &["gt-i1", "gt-i2"]);
    store.push_event("create", "gt-i1", 0);

    let h = Harness::new();
    let writer = h.writer();
    let d = h.deps(&writer);
    let mut feed = EventFeed::new(vec![EventSource::new("hq", &store)]);
    let sources = [EventSource::new("hq", &store)];

    feed.poll_cycle(&d).await;
    sweep_cycle(&sources, &d).await;
    assert_eq!(store.get_sync("gt-i1").status, BeadStatus::Hooked);
    assert_eq!(store.get_sync("gt-i2").status, BeadStatus::Open);

    finish_work(&store, &h.sessions, "gt-i1", 100).await;
    feed.poll_cycle(&d).await;
    assert_eq!(store.get_sync("gt-i2").status, BeadStatus::Hooked);
}

#[tokio::test]
async fn parent_child_dependency_does_not_block_dispatch() {
    let store = MockStore::new();
    store.insert(crate::test_utils::typed_bead("gt-parent", "open", "epic"));
    store.insert(bead_with_deps(
        "gt-child",
        "open",
        vec![Dependency::new(DepKind::ParentChild, "gt-parent")],
    ));
    store.insert_convoy("hq-cv-1", &["gt-child"]);

    let h = Harness::new();
    let writer = h.writer();
    let d = h.deps(&writer);
    let sources = [EventSource::new("hq", &store)];

    sweep_cycle(&sources, &d).await;

    // The child dispatched while its parent epic stayed open.
    assert_eq!(store.get_sync("gt-child").status, BeadStatus::Hooked);
    assert_eq!(store.get_sync("gt-parent").status, BeadStatus::Open);
}

#[tokio::test]
async fn batch_enrollment_rejects_tracked_conflict_without_side_effects() {
    let store = MockStore::new();
    store.insert(bead("gt-x", "open"));
    store.insert(bead("gt-y", "open"));
    store.insert(bead("gt-z", "open"));
    store.insert_convoy("hq-cv-1", &["gt-x"]);
    let routing = test_routing();

    let err = enroll_batch(&store, &routing, &ids(&["gt-x", "gt-y", "gt-z"]), None, None)
        .await
        .unwrap_err();

    let rendered = err.to_string();
    assert!(rendered.contains("hq-cv-1"));
    assert!(rendered.contains("gt-x: open"));
    assert!(rendered.contains("gt-y: n/a"));
    assert!(rendered.contains("gt-z: n/a"));

    // No new convoy; Y and Z untouched.
    assert_eq!(store.convoys_created(), 0);
    assert!(store.get_sync("gt-y").labels.is_empty());
    assert!(store.get_sync("gt-z").labels.is_empty());
}

#[tokio::test]
async fn queue_respects_capacity_ceiling_across_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let store = MockStore::new();
    for i in 0..5 {
        store.insert(queued_bead(&format!("gt-t{i}"), "gastown"));
    }
    let sessions = MockSessions::new();
    sessions.set_external_active(2);
    let feed = FeedWriter::disabled();

    let opts = || CycleOptions {
        max_override: Some(3),
        batch_override: Some(10),
        actor: "test".to_string(),
        ..Default::default()
    };

    let report = queue::run_cycle(dir.path(), &store, &sessions, &feed, opts())
        .await
        .unwrap();
    assert_eq!(report.dispatched, 1);
    let queued: Vec<_> = store
        .all_beads()
        .into_iter()
        .filter(|b| b.has_label(LABEL_QUEUED))
        .collect();
    assert_eq!(queued.len(), 4);

    // No completions: the next cycle has zero capacity and dispatches
    // nothing.
    let report = queue::run_cycle(dir.path(), &store, &sessions, &feed, opts())
        .await
        .unwrap();
    assert_eq!(report.dispatched, 0);
}

#[tokio::test]
async fn queue_re_queues_and_retries_after_spawn_failure() {
    let dir = tempfile::tempdir().unwrap();
    let store = MockStore::new();
    store.insert(queued_bead("gt-t1", "gastown"));
    let sessions = MockSessions::new();
    sessions.fail_next_spawn();
    let feed = FeedWriter::disabled();

    let opts = || CycleOptions {
        actor: "test".to_string(),
        ..Default::default()
    };

    let report = queue::run_cycle(dir.path(), &store, &sessions, &feed, opts())
        .await
        .unwrap();
    assert_eq!(report.dispatched, 0);
    let b = store.get_sync("gt-t1");
    assert!(b.has_label(LABEL_QUEUED));
    assert!(b.has_label("queued:rig:gastown"));

    let report = queue::run_cycle(dir.path(), &store, &sessions, &feed, opts())
        .await
        .unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(store.get_sync("gt-t1").status, BeadStatus::Hooked);
}
