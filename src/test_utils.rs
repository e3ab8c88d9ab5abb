//! Shared test utilities: in-memory store and session backends with
//! injectable failures, plus bead construction helpers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::dispatch::session::{
    Result as SessionResult, SessionBackend, SessionError, SpawnOptions, SpawnedSession,
};
use crate::queue::labels::{rig_label, LABEL_QUEUED};
use crate::store::client::{BeadPatch, ListFilter, Result as StoreResult, StoreClient, StoreError};
use crate::store::routing::{RouteEntry, RoutingTable};
use crate::types::{
    Bead, BeadId, BeadStatus, ConvoyId, DepKind, Dependency, RigName, SessionName, StoreEvent,
    TYPE_CONVOY,
};

/// A fixed timestamp so tests are deterministic.
pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-06-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn parse_status(status: &str) -> BeadStatus {
    match status {
        "open" => BeadStatus::Open,
        "in_progress" => BeadStatus::InProgress,
        "closed" => BeadStatus::Closed,
        "pinned" => BeadStatus::Pinned,
        "hooked" => BeadStatus::Hooked,
        other => panic!("unknown status in test helper: {other}"),
    }
}

/// A plain task bead.
pub fn bead(id: &str, status: &str) -> Bead {
    Bead {
        id: BeadId::new(id),
        title: format!("bead {id}"),
        description: String::new(),
        status: parse_status(status),
        issue_type: "task".to_string(),
        priority: 2,
        labels: Vec::new(),
        close_reason: None,
        created_at: t0(),
        updated_at: t0(),
        closed_at: (status == "closed").then(t0),
        dependencies: Vec::new(),
    }
}

/// A bead with an explicit issue type.
pub fn typed_bead(id: &str, status: &str, issue_type: &str) -> Bead {
    Bead {
        issue_type: issue_type.to_string(),
        ..bead(id, status)
    }
}

/// A bead with dependencies.
pub fn bead_with_deps(id: &str, status: &str, deps: Vec<Dependency>) -> Bead {
    Bead {
        dependencies: deps,
        ..bead(id, status)
    }
}

/// A bead labelled for the work queue.
pub fn queued_bead(id: &str, rig: &str) -> Bead {
    Bead {
        labels: vec![LABEL_QUEUED.to_string(), rig_label(&RigName::new(rig))],
        ..bead(id, "open")
    }
}

/// BeadIds from string literals.
pub fn ids(strs: &[&str]) -> Vec<BeadId> {
    strs.iter().map(|s| BeadId::new(*s)).collect()
}

/// A routing table mapping the prefixes tests use.
pub fn test_routing() -> RoutingTable {
    RoutingTable::from_entries(
        "/town/.gastown/routing.jsonl",
        vec![
            RouteEntry {
                prefix: "gt".to_string(),
                rig: RigName::new("gastown"),
            },
            RouteEntry {
                prefix: "bd".to_string(),
                rig: RigName::new("beads"),
            },
        ],
    )
}

#[derive(Default)]
struct MockStoreInner {
    beads: HashMap<BeadId, Bead>,
    /// Insertion order, so list results are stable.
    order: Vec<BeadId>,
    events: Vec<StoreEvent>,
    convoys_created: usize,
    convoy_seq: usize,
}

/// In-memory store with injectable failures.
///
/// Mutation goes through the same [`StoreClient`] surface production code
/// uses; the `_sync` accessors exist for test assertions only.
pub struct MockStore {
    inner: Mutex<MockStoreInner>,
    fail_gets: AtomicBool,
    fail_updates: AtomicBool,
    fail_ready: AtomicBool,
    fail_events: AtomicBool,
}

impl MockStore {
    pub fn new() -> Self {
        MockStore {
            inner: Mutex::new(MockStoreInner::default()),
            fail_gets: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
            fail_ready: AtomicBool::new(false),
            fail_events: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, bead: Bead) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.beads.contains_key(&bead.id) {
            inner.order.push(bead.id.clone());
        }
        inner.beads.insert(bead.id.clone(), bead);
    }

    /// Inserts an open convoy tracking `members` in order.
    pub fn insert_convoy(&self, id: &str, members: &[&str]) {
        let mut convoy = typed_bead(id, "open", TYPE_CONVOY);
        convoy.dependencies = members
            .iter()
            .map(|m| Dependency::new(DepKind::ParentChild, *m))
            .collect();
        self.insert(convoy);
    }

    /// Appends an event to the stream, `offset_secs` after [`t0`].
    pub fn push_event(&self, event_kind: &str, target: &str, offset_secs: i64) {
        let kind = match event_kind {
            "close" => crate::types::EventKind::Close,
            "create" => crate::types::EventKind::Create,
            "update" => crate::types::EventKind::Update,
            other => crate::types::EventKind::Other(other.to_string()),
        };
        self.inner.lock().unwrap().events.push(StoreEvent {
            kind,
            target: BeadId::new(target),
            at: t0() + Duration::seconds(offset_secs),
            actor: None,
        });
    }

    pub fn get_sync(&self, id: &str) -> Bead {
        self.inner
            .lock()
            .unwrap()
            .beads
            .get(&BeadId::new(id))
            .cloned()
            .unwrap_or_else(|| panic!("no bead {id} in mock store"))
    }

    pub fn all_beads(&self) -> Vec<Bead> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .map(|id| inner.beads[id].clone())
            .collect()
    }

    /// Convoys created through `create_convoy` (pre-inserted ones not
    /// counted).
    pub fn convoys_created(&self) -> usize {
        self.inner.lock().unwrap().convoys_created
    }

    pub fn fail_gets(&self) {
        self.fail_gets.store(true, Ordering::SeqCst);
    }

    pub fn fail_updates(&self) {
        self.fail_updates.store(true, Ordering::SeqCst);
    }

    pub fn fail_ready_queries(&self) {
        self.fail_ready.store(true, Ordering::SeqCst);
    }

    pub fn fail_event_reads(&self) {
        self.fail_events.store(true, Ordering::SeqCst);
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable("injected failure".to_string())
    }

    fn is_blocked_by_open_dep(inner: &MockStoreInner, bead: &Bead) -> bool {
        bead.dependencies.iter().any(|d| {
            d.kind.is_blocking()
                && inner
                    .beads
                    .get(&d.target)
                    .map(|t| !t.status.is_closed())
                    .unwrap_or(false)
        })
    }
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreClient for MockStore {
    async fn query_ready(&self, label: Option<&str>) -> StoreResult<Vec<Bead>> {
        if self.fail_ready.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .order
            .iter()
            .map(|id| &inner.beads[id])
            .filter(|b| !b.status.is_closed() && !b.status.is_bound())
            .filter(|b| label.map(|l| b.has_label(l)).unwrap_or(true))
            .filter(|b| !Self::is_blocked_by_open_dep(&inner, b))
            .cloned()
            .collect())
    }

    async fn list(&self, filter: ListFilter) -> StoreResult<Vec<Bead>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Bead> = inner
            .order
            .iter()
            .map(|id| &inner.beads[id])
            .filter(|b| {
                filter
                    .label
                    .as_deref()
                    .map(|l| b.has_label(l))
                    .unwrap_or(true)
            })
            .filter(|b| filter.status.map(|s| b.status == s).unwrap_or(true))
            .filter(|b| {
                filter
                    .issue_type
                    .as_deref()
                    .map(|t| b.issue_type == t)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn get(&self, id: &BeadId) -> StoreResult<Bead> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner
            .lock()
            .unwrap()
            .beads
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn update(&self, id: &BeadId, patch: BeadPatch) -> StoreResult<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let mut inner = self.inner.lock().unwrap();
        let bead = inner
            .beads
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        for label in &patch.remove_labels {
            bead.labels.retain(|l| l != label);
        }
        for label in &patch.add_labels {
            if !bead.labels.contains(label) {
                bead.labels.push(label.clone());
            }
        }
        if let Some(desc) = patch.description {
            bead.description = desc;
        }
        if let Some(status) = patch.status {
            bead.status = status;
            if status.is_closed() {
                bead.closed_at = Some(Utc::now());
            }
        }
        if let Some(reason) = patch.close_reason {
            bead.close_reason = Some(reason);
        }
        bead.updated_at = Utc::now();
        Ok(())
    }

    async fn create_convoy(&self, title: &str, members: &[BeadId]) -> StoreResult<ConvoyId> {
        let mut inner = self.inner.lock().unwrap();
        inner.convoy_seq += 1;
        inner.convoys_created += 1;
        let id = format!("hq-cv-auto{}", inner.convoy_seq);
        let mut convoy = typed_bead(&id, "open", TYPE_CONVOY);
        convoy.title = title.to_string();
        convoy.dependencies = members
            .iter()
            .map(|m| Dependency {
                kind: DepKind::ParentChild,
                target: m.clone(),
            })
            .collect();
        inner.order.push(convoy.id.clone());
        inner.beads.insert(convoy.id.clone(), convoy);
        Ok(ConvoyId::new(id))
    }

    async fn track_member(&self, convoy: &ConvoyId, member: &BeadId) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let convoy_bead = inner
            .beads
            .get_mut(&convoy.as_bead())
            .ok_or_else(|| StoreError::NotFound(convoy.as_bead()))?;
        convoy_bead.dependencies.push(Dependency {
            kind: DepKind::ParentChild,
            target: member.clone(),
        });
        Ok(())
    }

    async fn events_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<StoreEvent>> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(self
            .inner
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.at > since)
            .cloned()
            .collect())
    }

    async fn latest_event_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(self
            .inner
            .lock()
            .unwrap()
            .events
            .iter()
            .map(|e| e.at)
            .max())
    }
}

#[derive(Default)]
struct MockSessionsInner {
    spawned: Vec<SpawnedSession>,
    started: Vec<SessionName>,
    /// Worker sessions considered live (spawned and not yet completed).
    active: usize,
    seq: usize,
}

/// In-memory session backend.
///
/// Every spawn adds a live worker; tests retire workers with
/// [`complete_workers`](MockSessions::complete_workers) to simulate agents
/// finishing.
pub struct MockSessions {
    inner: Mutex<MockSessionsInner>,
    fail_next: AtomicUsize,
    fail_all: AtomicBool,
}

impl MockSessions {
    pub fn new() -> Self {
        MockSessions {
            inner: Mutex::new(MockSessionsInner::default()),
            fail_next: AtomicUsize::new(0),
            fail_all: AtomicBool::new(false),
        }
    }

    /// The next spawn fails (stackable).
    pub fn fail_next_spawn(&self) {
        self.fail_next.fetch_add(1, Ordering::SeqCst);
    }

    pub fn fail_all_spawns(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    /// Workers already running that this backend did not spawn.
    pub fn set_external_active(&self, n: usize) {
        self.inner.lock().unwrap().active = n;
    }

    /// Retires up to `n` live workers.
    pub fn complete_workers(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.active = inner.active.saturating_sub(n);
    }

    pub fn spawn_count(&self) -> usize {
        self.inner.lock().unwrap().spawned.len()
    }

    pub fn started(&self) -> Vec<SessionName> {
        self.inner.lock().unwrap().started.clone()
    }

    pub fn active_count_sync(&self) -> usize {
        self.inner.lock().unwrap().active
    }
}

impl Default for MockSessions {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBackend for MockSessions {
    async fn spawn(&self, rig: &RigName, _opts: &SpawnOptions) -> SessionResult<SpawnedSession> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(SessionError::Spawn("injected spawn failure".to_string()));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SessionError::Spawn("injected spawn failure".to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        inner.active += 1;
        let session = SpawnedSession {
            name: SessionName::new(format!("gt-{rig}-p-mock{}", inner.seq)),
            rig: rig.clone(),
            agent_id: format!("{rig}/polecats/mock{}", inner.seq),
            work_dir: std::path::PathBuf::from(format!("/tmp/mock/{rig}/{}", inner.seq)),
        };
        inner.spawned.push(session.clone());
        Ok(session)
    }

    async fn prepare_workspace(&self, _session: &SpawnedSession) -> SessionResult<()> {
        Ok(())
    }

    async fn start(&self, session: &SpawnedSession) -> SessionResult<()> {
        self.inner
            .lock()
            .unwrap()
            .started
            .push(session.name.clone());
        Ok(())
    }

    async fn active_workers(&self) -> usize {
        self.active_count_sync()
    }
}
