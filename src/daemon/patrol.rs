//! Patrol scheduling primitives.
//!
//! Each patrol is an independent tokio task firing on its own cadence. The
//! loops share nothing but immutable config and the tracing subscriber; all
//! cross-loop communication goes through the durable store. A patrol never
//! overlaps itself (the loop body runs to completion before the next tick is
//! honored), and a panic in one patrol is confined to that patrol's task.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long shutdown waits for in-flight patrol bodies to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(120);

/// Builds a patrol ticker: first fire after one full period, and delayed
/// (not bursty) catch-up when a body overruns its cadence.
pub fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Handle to the set of running patrol tasks.
pub struct PatrolScheduler {
    cancel: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl PatrolScheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        PatrolScheduler {
            cancel,
            handles: Vec::new(),
        }
    }

    /// Registers a running patrol task.
    pub fn register(&mut self, slug: &'static str, handle: JoinHandle<()>) {
        info!(patrol = slug, "patrol started");
        self.handles.push((slug, handle));
    }

    /// A child token for one patrol loop.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Signals shutdown and waits for every patrol to exit, up to the grace
    /// period. In-flight store and subprocess operations finish on their own
    /// timeouts.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (slug, handle) in self.handles {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => info!(patrol = slug, "patrol stopped"),
                Ok(Err(e)) => warn!(patrol = slug, error = %e, "patrol task panicked"),
                Err(_) => warn!(patrol = slug, "patrol did not stop within grace period"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticker_first_fire_waits_one_period() {
        let mut t = ticker(Duration::from_secs(30));
        let start = Instant::now();
        t.tick().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn shutdown_cancels_and_joins() {
        let cancel = CancellationToken::new();
        let mut scheduler = PatrolScheduler::new(cancel.clone());
        let child = scheduler.child_token();
        let handle = tokio::spawn(async move {
            child.cancelled().await;
        });
        scheduler.register("test_patrol", handle);
        scheduler.shutdown().await;
        assert!(cancel.is_cancelled());
    }
}
