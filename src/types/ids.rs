//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., using a
//! `RigName` where a `BeadId` is expected) and make the code more self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The routing prefix of the town-level store.
///
/// Beads whose prefix routes here belong to the shared `hq` store rather than
/// any single rig. The convoy feed paths must never skip this store, even when
/// its rig is flagged parked.
pub const HQ_PREFIX: &str = "hq";

/// A bead (issue) identifier.
///
/// Bead IDs are prefix-encoded: the text before the first `-` names the store
/// the bead lives in, which the routing table maps to a rig.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BeadId(pub String);

impl BeadId {
    pub fn new(s: impl Into<String>) -> Self {
        BeadId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the routing prefix (the text before the first `-`).
    ///
    /// IDs without a `-` return the whole string: a malformed prefix resolves
    /// to nothing in the routing table, which surfaces as a validation error
    /// rather than a panic.
    pub fn prefix(&self) -> &str {
        match self.0.split_once('-') {
            Some((prefix, _)) => prefix,
            None => &self.0,
        }
    }

    /// Returns true if this bead lives in the town-level `hq` store.
    pub fn is_town_level(&self) -> bool {
        self.prefix() == HQ_PREFIX
    }
}

impl fmt::Display for BeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BeadId {
    fn from(s: &str) -> Self {
        BeadId(s.to_string())
    }
}

/// A convoy identifier.
///
/// Convoys are beads of type `convoy` with a distinct ID prefix, so this is a
/// separate newtype even though a convoy is stored as a bead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConvoyId(pub String);

impl ConvoyId {
    pub fn new(s: impl Into<String>) -> Self {
        ConvoyId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The same ID viewed as a bead, for store operations.
    pub fn as_bead(&self) -> BeadId {
        BeadId(self.0.clone())
    }
}

impl fmt::Display for ConvoyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named workspace (repository + store + branch family) a worker runs inside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RigName(pub String);

impl RigName {
    pub fn new(s: impl Into<String>) -> Self {
        RigName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RigName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RigName {
    fn from(s: &str) -> Self {
        RigName(s.to_string())
    }
}

/// A worker session name in the terminal multiplexer.
///
/// Worker sessions follow the `gt-<rig>-p-<name>` convention; the `-p-` infix
/// is what the active-worker census matches on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionName(pub String);

impl SessionName {
    pub fn new(s: impl Into<String>) -> Self {
        SessionName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this name matches the worker-session pattern.
    pub fn is_worker(&self) -> bool {
        self.0.contains("-p-")
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
