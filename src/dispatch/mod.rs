//! Dispatch: the primitive that turns a ready bead into a live worker.

pub mod session;
pub mod sling;

pub use session::{SessionBackend, SessionError, SpawnOptions, SpawnedSession, TmuxBackend};
pub use sling::{sling_bead, SlingError, SlingOptions};
