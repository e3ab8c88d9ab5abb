//! The town daemon: a set of independently-scheduled patrol loops.
//!
//! The daemon owns no business state. Patrols observe the durable store,
//! apply the gates, and drive dispatch; everything they know is rebuilt from
//! the store on restart (the event watermark is deliberately in-memory only,
//! with a seed-only first cycle). Shutdown is a broadcast cancellation token;
//! in-flight operations finish on their own timeouts.

pub mod backup;
pub mod event_feed;
pub mod janitor;
pub mod molecule;
pub mod patrol;
pub mod reaper;
pub mod stale_pid;
pub mod stranded;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{routing_path, ConfigError, TownSettings};
use crate::dispatch::TmuxBackend;
use crate::feed::FeedWriter;
use crate::queue;
use crate::store::{BdClient, ListFilter, RoutingError, RoutingTable, StoreClient, StoreError};

use event_feed::{EventFeed, EventSource};
use molecule::MoleculeClient;
use patrol::{ticker, PatrolScheduler};

/// Default patrol cadences; each is overridable per patrol in town settings.
const EVENT_POLL_PERIOD: Duration = Duration::from_secs(5);
const STRANDED_SCAN_PERIOD: Duration = Duration::from_secs(30);
const QUEUE_DISPATCH_PERIOD: Duration = Duration::from_secs(10);
const WISP_REAPER_PERIOD: Duration = Duration::from_secs(30 * 60);
const DOLT_BACKUP_PERIOD: Duration = Duration::from_secs(15 * 60);
const JANITOR_DOG_PERIOD: Duration = Duration::from_secs(15 * 60);

/// Errors that prevent the daemon from starting.
///
/// Startup is the one place this crate refuses to degrade: a missing config,
/// an unreadable routing file, or an unreachable store means the operator
/// must intervene, not that the daemon should limp along silently.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("store unreachable at startup: {0}")]
    StoreUnreachable(#[from] StoreError),
}

/// The long-running daemon process.
pub struct Daemon {
    town_root: PathBuf,
}

impl Daemon {
    pub fn new(town_root: impl Into<PathBuf>) -> Self {
        Daemon {
            town_root: town_root.into(),
        }
    }

    /// Working directory for one store's `bd` client.
    fn store_dir(&self, name: &str) -> PathBuf {
        if name == "hq" {
            self.town_root.clone()
        } else {
            self.town_root.join(name)
        }
    }

    /// Starts every enabled patrol and runs until `shutdown` fires (or
    /// ctrl-c when driven from the CLI).
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        // Fail-fast startup checks: settings, routing, store reachability.
        let settings = TownSettings::load_or_create(&self.town_root)?;
        let routing = RoutingTable::load(routing_path(&self.town_root))?;
        info!(routes = ?routing.path(), "routing table loaded");

        let hq = BdClient::new(self.store_dir("hq"));
        hq.list(ListFilter::default().with_limit(1)).await?;
        info!("store reachable");

        let roster = settings.store_roster();
        info!(stores = ?roster, "observing stores");

        let molecules = MoleculeClient::new(&self.town_root);
        let mut scheduler = PatrolScheduler::new(shutdown.clone());

        // Event poll: the fast path feeding convoys off close events.
        {
            let sources: Vec<EventSource<BdClient>> = roster
                .iter()
                .map(|name| EventSource::new(name.clone(), BdClient::new(self.store_dir(name))))
                .collect();
            let feed = EventFeed::new(sources);
            let sessions = TmuxBackend::new(&self.town_root);
            let town_root = self.town_root.clone();
            let period = settings
                .patrols
                .event_poll
                .interval_or(EVENT_POLL_PERIOD, "event_poll");
            let cancel = scheduler.child_token();
            scheduler.register(
                "event_poll",
                tokio::spawn(event_feed::run_loop(feed, sessions, town_root, period, cancel)),
            );
        }

        // Stranded scan: the reconciliation backstop.
        {
            let sources: Vec<EventSource<BdClient>> = roster
                .iter()
                .map(|name| EventSource::new(name.clone(), BdClient::new(self.store_dir(name))))
                .collect();
            let sessions = TmuxBackend::new(&self.town_root);
            let town_root = self.town_root.clone();
            let period = settings
                .patrols
                .stranded_scan
                .interval_or(STRANDED_SCAN_PERIOD, "stranded_scan");
            let cancel = scheduler.child_token();
            scheduler.register(
                "stranded_scan",
                tokio::spawn(stranded::run_loop(sources, sessions, town_root, period, cancel)),
            );
        }

        // Queue dispatch: admission under the capacity ceiling.
        {
            let town_root = self.town_root.clone();
            let period = settings
                .patrols
                .queue_dispatch
                .interval_or(QUEUE_DISPATCH_PERIOD, "queue_dispatch");
            let cancel = scheduler.child_token();
            scheduler.register(
                "queue_dispatch",
                tokio::spawn(queue_dispatch_loop(town_root, period, cancel)),
            );
        }

        // Wisp reaper.
        {
            let period = settings
                .patrols
                .wisp_reaper
                .interval_or(WISP_REAPER_PERIOD, "wisp_reaper");
            scheduler.register(
                "wisp_reaper",
                tokio::spawn(reaper::run_loop(
                    self.town_root.clone(),
                    molecules.clone(),
                    period,
                    scheduler.child_token(),
                )),
            );
        }

        // Dolt backup.
        {
            let period = settings
                .patrols
                .dolt_backup
                .interval_or(DOLT_BACKUP_PERIOD, "dolt_backup");
            scheduler.register(
                "dolt_backup",
                tokio::spawn(backup::run_loop(
                    self.town_root.clone(),
                    molecules.clone(),
                    period,
                    scheduler.child_token(),
                )),
            );
        }

        // Janitor dog.
        {
            let period = settings
                .patrols
                .janitor_dog
                .interval_or(JANITOR_DOG_PERIOD, "janitor_dog");
            scheduler.register(
                "janitor_dog",
                tokio::spawn(janitor::run_loop(
                    self.town_root.clone(),
                    molecules.clone(),
                    period,
                    scheduler.child_token(),
                )),
            );
        }

        info!("daemon running");
        shutdown.cancelled().await;
        info!("shutdown requested, stopping patrols");
        scheduler.shutdown().await;
        Ok(())
    }
}

/// The `queue_dispatch` patrol loop: one queue cycle per tick.
async fn queue_dispatch_loop(town_root: PathBuf, period: Duration, cancel: CancellationToken) {
    let store = BdClient::new(&town_root);
    let sessions = TmuxBackend::new(&town_root);
    let feed = FeedWriter::new(crate::config::feed_path(&town_root));
    let mut tick = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let enabled = TownSettings::load_or_create(&town_root)
                    .map(|s| s.patrols.queue_dispatch.is_enabled())
                    .unwrap_or(false);
                if !enabled {
                    continue;
                }
                let opts = queue::CycleOptions {
                    actor: "daemon".to_string(),
                    ..Default::default()
                };
                match queue::run_cycle(&town_root, &store, &sessions, &feed, opts).await {
                    Ok(report) if report.dispatched > 0 => {
                        info!(dispatched = report.dispatched, "queue dispatch cycle");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "queue dispatch cycle failed"),
                }
            }
        }
    }
}
