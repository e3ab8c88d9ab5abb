//! The bead: a persistent unit of work in the external issue store.
//!
//! Beads are created, closed, and mutated only through the store; the core
//! never constructs them locally. The structs here mirror the store's JSON
//! wire format (the `bd` CLI's `--json` output).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::BeadId;

/// Bead lifecycle status.
///
/// `pinned` and `hooked` indicate a live binding to a worker session; the
/// dispatch primitive refuses to re-dispatch a bead in either state unless
/// explicitly forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Open,
    InProgress,
    Closed,
    Pinned,
    Hooked,
}

impl BeadStatus {
    pub fn is_closed(self) -> bool {
        matches!(self, BeadStatus::Closed)
    }

    /// Returns true if this status indicates a live worker-session binding.
    pub fn is_bound(self) -> bool {
        matches!(self, BeadStatus::Pinned | BeadStatus::Hooked)
    }
}

impl fmt::Display for BeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BeadStatus::Open => "open",
            BeadStatus::InProgress => "in_progress",
            BeadStatus::Closed => "closed",
            BeadStatus::Pinned => "pinned",
            BeadStatus::Hooked => "hooked",
        };
        write!(f, "{s}")
    }
}

/// Dependency kinds between beads.
///
/// Only `blocks`, `conditional-blocks`, and `waits-for` gate dispatch.
/// `parent-child` is the tracking relation (convoy membership, epic children)
/// and never blocks: a child task may proceed while its parent epic is open,
/// matching the store's own readiness query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepKind {
    Blocks,
    ConditionalBlocks,
    WaitsFor,
    ParentChild,
    Related,
}

impl DepKind {
    /// Returns true if an open dependency of this kind blocks dispatch.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            DepKind::Blocks | DepKind::ConditionalBlocks | DepKind::WaitsFor
        )
    }
}

/// A single outgoing dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub kind: DepKind,
    pub target: BeadId,
}

impl Dependency {
    pub fn new(kind: DepKind, target: impl Into<BeadId>) -> Self {
        Dependency {
            kind,
            target: target.into(),
        }
    }
}

/// The issue type that marks a bead as convoy-shaped.
pub const TYPE_CONVOY: &str = "convoy";

/// A bead as read from the store.
///
/// The issue type is deliberately kept as a raw string: legacy beads carry an
/// empty type that means `task`, and the normalisation happens in the type
/// gate only; the store is never mutated to fill it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bead {
    pub id: BeadId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: BeadStatus,
    #[serde(default)]
    pub issue_type: String,
    /// Priority, 0 highest. P0/P1 beads are exempt from stale auto-close.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

fn default_priority() -> u8 {
    2
}

impl Bead {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Returns true if this bead is a convoy aggregate.
    pub fn is_convoy(&self) -> bool {
        self.issue_type == TYPE_CONVOY
    }

    /// The members this bead tracks, in stored dependency order.
    ///
    /// Only meaningful for convoys: members are the targets of `parent-child`
    /// dependencies, and the stored order is the dispatch order.
    pub fn tracked_members(&self) -> Vec<BeadId> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DepKind::ParentChild)
            .map(|d| d.target.clone())
            .collect()
    }

    /// Outgoing dependencies of blocking kinds.
    pub fn blocking_deps(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(|d| d.kind.is_blocking())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::bead;

    #[test]
    fn bound_statuses() {
        assert!(BeadStatus::Pinned.is_bound());
        assert!(BeadStatus::Hooked.is_bound());
        assert!(!BeadStatus::Open.is_bound());
        assert!(!BeadStatus::InProgress.is_bound());
        assert!(!BeadStatus::Closed.is_bound());
    }

    #[test]
    fn dep_kind_serde_is_kebab_case() {
        let json = serde_json::to_string(&DepKind::ConditionalBlocks).unwrap();
        assert_eq!(json, r#""conditional-blocks""#);
        let parsed: DepKind = serde_json::from_str(r#""waits-for""#).unwrap();
        assert_eq!(parsed, DepKind::WaitsFor);
    }

    #[test]
    fn tracked_members_preserve_stored_order() {
        let mut cv = bead("hq-cv-1", "open");
        cv.issue_type = TYPE_CONVOY.to_string();
        cv.dependencies = vec![
            Dependency::new(DepKind::ParentChild, "gt-b"),
            Dependency::new(DepKind::Related, "gt-x"),
            Dependency::new(DepKind::ParentChild, "gt-a"),
        ];
        let members = cv.tracked_members();
        assert_eq!(members, vec![BeadId::new("gt-b"), BeadId::new("gt-a")]);
    }

    #[test]
    fn bead_deserializes_with_missing_optional_fields() {
        let json = r#"{
            "id": "gt-abc",
            "title": "Fix the flux capacitor",
            "status": "open",
            "created_at": "2025-06-01T00:00:00Z",
            "updated_at": "2025-06-01T00:00:00Z"
        }"#;
        let b: Bead = serde_json::from_str(json).unwrap();
        assert_eq!(b.issue_type, "");
        assert_eq!(b.priority, 2);
        assert!(b.labels.is_empty());
        assert!(b.dependencies.is_empty());
        assert!(b.closed_at.is_none());
    }
}
