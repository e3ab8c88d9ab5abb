//! `gt queue`: inspect and drive the work queue.

use std::collections::BTreeMap;

use clap::Subcommand;
use serde_json::json;

use crate::config::feed_path;
use crate::dispatch::{SessionBackend, TmuxBackend};
use crate::feed::FeedWriter;
use crate::queue::labels::{self, queue_rig, LABEL_QUEUED};
use crate::queue::{run_cycle, CycleOptions, QueueState};
use crate::store::{BdClient, BeadPatch, ListFilter, StoreClient};
use crate::types::Bead;

use super::{detect_actor, find_town_root, Result};

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// Show queue state: pending, capacity, active workers
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List queued beads grouped by rig
    List {
        #[arg(long)]
        json: bool,
    },
    /// Pause all queue dispatch (town-wide)
    Pause,
    /// Resume queue dispatch
    Resume,
    /// Remove beads from the queue
    Clear {
        /// Remove only this bead
        #[arg(long)]
        bead: Option<String>,
    },
    /// Manually trigger a dispatch cycle
    Run {
        /// Override batch size
        #[arg(long)]
        batch: Option<usize>,
        /// Preview without dispatching
        #[arg(long)]
        dry_run: bool,
        /// Override the worker ceiling
        #[arg(long)]
        max_polecats: Option<usize>,
    },
}

impl QueueCommand {
    pub async fn execute(self) -> Result<()> {
        let town_root = find_town_root()?;
        let store = BdClient::new(&town_root);

        match self {
            QueueCommand::Status { json } => {
                let state = QueueState::load(&town_root)?;
                let queued = list_queued(&store).await?;
                let ready = store.query_ready(Some(LABEL_QUEUED)).await?;
                let active = TmuxBackend::new(&town_root).active_workers().await;

                if json {
                    let out = json!({
                        "paused": state.paused,
                        "paused_by": state.paused_by,
                        "queued_total": queued.len(),
                        "queued_ready": ready.len(),
                        "active_workers": active,
                        "last_dispatch_at": state.last_dispatch_at,
                        "last_dispatch_count": state.last_dispatch_count,
                    });
                    println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
                    return Ok(());
                }

                println!("Work Queue Status\n");
                if state.paused {
                    println!(
                        "  State:    PAUSED (by {})",
                        state.paused_by.as_deref().unwrap_or("unknown")
                    );
                } else {
                    println!("  State:    active");
                }
                println!("  Queued:   {} total, {} ready", queued.len(), ready.len());
                println!("  Active:   {active} worker(s)");
                if let Some(at) = state.last_dispatch_at {
                    println!(
                        "  Last dispatch: {at} ({} bead(s))",
                        state.last_dispatch_count
                    );
                }
                Ok(())
            }

            QueueCommand::List { json } => {
                let queued = list_queued(&store).await?;
                let ready = store.query_ready(Some(LABEL_QUEUED)).await?;
                let ready_ids: Vec<_> = ready.iter().map(|b| b.id.clone()).collect();

                if json {
                    let out: Vec<_> = queued
                        .iter()
                        .map(|b| {
                            json!({
                                "id": b.id,
                                "title": b.title,
                                "status": b.status,
                                "target_rig": queue_rig(&b.labels),
                                "blocked": !ready_ids.contains(&b.id),
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
                    return Ok(());
                }

                if queued.is_empty() {
                    println!("Queue is empty.");
                    println!("Queue work with: gt sling <bead...> --queue");
                    return Ok(());
                }

                let mut by_rig: BTreeMap<String, Vec<&Bead>> = BTreeMap::new();
                for b in &queued {
                    let rig = queue_rig(&b.labels)
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "(no rig)".to_string());
                    by_rig.entry(rig).or_default().push(b);
                }

                println!("Queued Work ({} beads)\n", queued.len());
                for (rig, beads) in by_rig {
                    println!("  {rig} ({}):", beads.len());
                    for b in beads {
                        let indicator = if ready_ids.contains(&b.id) { "○" } else { "⏸" };
                        println!("    {indicator} {}: {}", b.id, b.title);
                    }
                    println!();
                }
                Ok(())
            }

            QueueCommand::Pause => {
                let mut state = QueueState::load(&town_root)?;
                if state.paused {
                    println!(
                        "Queue is already paused (by {})",
                        state.paused_by.as_deref().unwrap_or("unknown")
                    );
                    return Ok(());
                }
                state.set_paused(detect_actor());
                state.save(&town_root)?;
                println!("⏸ Queue paused");
                Ok(())
            }

            QueueCommand::Resume => {
                let mut state = QueueState::load(&town_root)?;
                if !state.paused {
                    println!("Queue is not paused");
                    return Ok(());
                }
                state.set_resumed();
                state.save(&town_root)?;
                println!("▶ Queue resumed");
                Ok(())
            }

            QueueCommand::Clear { bead } => {
                let targets = match bead {
                    Some(id) => vec![store.get(&crate::types::BeadId::new(&id)).await?],
                    None => list_queued(&store).await?,
                };
                if targets.is_empty() {
                    println!("Queue is already empty.");
                    return Ok(());
                }
                let mut cleared = 0;
                for b in &targets {
                    let mut patch = BeadPatch::default();
                    for label in &b.labels {
                        if labels::is_queue_label(label) {
                            patch = patch.remove_label(label.clone());
                        }
                    }
                    if patch.is_empty() {
                        continue;
                    }
                    match store.update(&b.id, patch).await {
                        Ok(()) => cleared += 1,
                        Err(e) => eprintln!("warning: could not clear {}: {e}", b.id),
                    }
                }
                println!("✓ Cleared {cleared} bead(s) from queue");
                Ok(())
            }

            QueueCommand::Run {
                batch,
                dry_run,
                max_polecats,
            } => {
                let sessions = TmuxBackend::new(&town_root);
                let feed = FeedWriter::new(feed_path(&town_root));
                let opts = CycleOptions {
                    batch_override: batch,
                    max_override: max_polecats,
                    dry_run,
                    actor: detect_actor(),
                };
                let report = run_cycle(&town_root, &store, &sessions, &feed, opts).await?;

                if report.paused {
                    println!("⏸ Queue is paused, nothing dispatched");
                } else if report.disabled {
                    println!("Queue dispatch is not enabled in town settings");
                } else if dry_run {
                    println!(
                        "Would dispatch {} bead(s) (active: {}/{}, ready: {})",
                        report.planned.len(),
                        report.active,
                        report.max_concurrent,
                        report.ready
                    );
                    for p in &report.planned {
                        println!("  {} → {}", p.bead, p.rig);
                    }
                } else {
                    println!(
                        "✓ Dispatched {}/{} bead(s) (active was {}/{}, ready {})",
                        report.dispatched,
                        report.planned.len(),
                        report.active,
                        report.max_concurrent,
                        report.ready
                    );
                }
                Ok(())
            }
        }
    }
}

async fn list_queued(store: &BdClient) -> Result<Vec<Bead>> {
    Ok(store
        .list(ListFilter::default().with_label(LABEL_QUEUED))
        .await?)
}
