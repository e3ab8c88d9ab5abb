//! Core domain types for the orchestrator.
//!
//! This module contains the fundamental types used throughout the crate,
//! designed to encode invariants via the type system.

pub mod bead;
pub mod event;
pub mod ids;

// Re-export commonly used types at the module level
pub use bead::{Bead, BeadStatus, DepKind, Dependency, TYPE_CONVOY};
pub use event::{EventKind, StoreEvent, Watermark};
pub use ids::{BeadId, ConvoyId, RigName, SessionName, HQ_PREFIX};
