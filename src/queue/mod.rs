//! The work queue: label-based admission and the capacity-controlled
//! dispatch cycle.

pub mod dispatcher;
pub mod labels;
pub mod state;

pub use dispatcher::{run_cycle, CycleOptions, CycleReport, PlannedDispatch, QueueError};
pub use labels::{QueueMetadata, LABEL_QUEUED};
pub use state::{QueueState, QueueStateError};
