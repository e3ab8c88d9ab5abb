//! Store events and the per-store watermark.
//!
//! The daemon's event-driven feed polls the store's event stream and advances
//! convoys on `close` events. The watermark is the timestamp of the last
//! processed event, held only in memory: on restart the first poll is a
//! seed-only cycle that establishes the watermark without processing anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::BeadId;

/// The kind of a store event.
///
/// The store emits more kinds than the core consumes; only `close` drives the
/// convoy feed, so everything else is folded into `Other` and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Close,
    Create,
    Update,
    #[serde(untagged)]
    Other(String),
}

/// A single event from the store's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEvent {
    pub kind: EventKind,
    pub target: BeadId,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl StoreEvent {
    pub fn is_close(&self) -> bool {
        self.kind == EventKind::Close
    }
}

/// Last-processed event timestamp for one store.
///
/// `None` means the daemon has not yet completed its warm-up cycle for this
/// store; the first poll seeds the value and processes no events.
pub type Watermark = Option<DateTime<Utc>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_events_are_recognised() {
        let ev = StoreEvent {
            kind: EventKind::Close,
            target: BeadId::new("gt-abc"),
            at: Utc::now(),
            actor: None,
        };
        assert!(ev.is_close());
    }

    #[test]
    fn unknown_kinds_fold_into_other() {
        let ev: StoreEvent = serde_json::from_str(
            r#"{"kind":"comment","target":"gt-abc","at":"2025-06-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(ev.kind, EventKind::Other("comment".to_string()));
        assert!(!ev.is_close());
    }
}
