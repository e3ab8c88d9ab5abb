//! The town event feed: structured records of every admission, dispatch,
//! close, and re-queue.
//!
//! The feed is an append-only JSONL file under the town root. Writes are
//! best-effort observability: a failure is logged and never propagated, so a
//! full disk cannot stall a dispatch cycle.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::types::{BeadId, ConvoyId, RigName, SessionName};

/// Feed event kinds the core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    /// A bead was handed to a worker session.
    Sling,
    /// The queue dispatcher claimed and dispatched a bead.
    QueueDispatch,
    /// A convoy auto-closed (all members done).
    ConvoyClose,
    /// A claimed bead was put back in the queue after a dispatch failure.
    Requeue,
}

/// One feed record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedEvent {
    pub kind: FeedKind,
    pub actor: String,
    pub at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Appends feed events to the town feed file.
#[derive(Debug, Clone)]
pub struct FeedWriter {
    path: Option<PathBuf>,
}

impl FeedWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FeedWriter {
            path: Some(path.into()),
        }
    }

    /// A writer that drops everything; used where no town root is available.
    pub fn disabled() -> Self {
        FeedWriter { path: None }
    }

    /// Appends one event. Never fails; errors are logged and swallowed.
    pub fn emit(&self, kind: FeedKind, actor: &str, payload: serde_json::Value) {
        let Some(path) = &self.path else { return };
        let event = FeedEvent {
            kind,
            actor: actor.to_string(),
            at: Utc::now(),
            payload,
        };
        if let Err(e) = append_line(path, &event) {
            warn!(?kind, error = %e, "feed write failed");
        }
    }

    pub fn sling(&self, actor: &str, bead: &BeadId, session: &SessionName) {
        self.emit(
            FeedKind::Sling,
            actor,
            json!({ "bead": bead, "session": session }),
        );
    }

    pub fn queue_dispatch(&self, actor: &str, bead: &BeadId, rig: &RigName, session: &SessionName) {
        self.emit(
            FeedKind::QueueDispatch,
            actor,
            json!({ "bead": bead, "rig": rig, "session": session }),
        );
    }

    pub fn convoy_close(&self, actor: &str, convoy: &ConvoyId) {
        self.emit(FeedKind::ConvoyClose, actor, json!({ "convoy": convoy }));
    }

    pub fn requeue(&self, actor: &str, bead: &BeadId, rig: &RigName, error: &str) {
        self.emit(
            FeedKind::Requeue,
            actor,
            json!({ "bead": bead, "rig": rig, "error": error }),
        );
    }
}

fn append_line(path: &PathBuf, event: &FeedEvent) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    file.write_all(&line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_jsonl_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        let feed = FeedWriter::new(&path);

        feed.sling(
            "daemon",
            &BeadId::new("gt-abc"),
            &SessionName::new("gt-gastown-p-furiosa"),
        );
        feed.convoy_close("daemon", &ConvoyId::new("hq-cv-1"));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: FeedEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.kind, FeedKind::Sling);
        assert_eq!(first.payload["bead"], "gt-abc");

        let second: FeedEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.kind, FeedKind::ConvoyClose);
    }

    #[test]
    fn disabled_writer_is_a_no_op() {
        // No path, no panic, no file.
        let feed = FeedWriter::disabled();
        feed.requeue(
            "daemon",
            &BeadId::new("gt-abc"),
            &RigName::new("gastown"),
            "spawn failed",
        );
    }

    #[test]
    fn unwritable_path_does_not_propagate() {
        let feed = FeedWriter::new("/dev/null/nope/feed.jsonl");
        feed.convoy_close("daemon", &ConvoyId::new("hq-cv-1"));
    }
}
