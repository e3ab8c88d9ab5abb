//! Convoys: aggregates of beads that auto-advance as members close.

pub mod enroll;
pub mod manager;

pub use enroll::{enroll_batch, EnrollError, EnrollOutcome};
pub use manager::{
    close_if_complete, feed_first_ready, feed_next_ready_issue, find_tracking_convoy, is_stranded,
    list_open_convoys, FeedContext, FeedOutcome,
};
