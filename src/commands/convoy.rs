//! `gt convoy`: inspect and manage tracking convoys.

use std::collections::HashSet;

use clap::Subcommand;
use serde_json::json;

use crate::config::{feed_path, TownSettings};
use crate::convoy::manager::{
    close_if_complete, find_tracking_convoy, is_stranded, list_open_convoys, FeedContext,
};
use crate::convoy::enroll_batch;
use crate::dispatch::TmuxBackend;
use crate::feed::FeedWriter;
use crate::store::{BdClient, BeadPatch, ListFilter, StoreClient};
use crate::types::{Bead, BeadId, BeadStatus, ConvoyId, TYPE_CONVOY};

use super::{detect_actor, find_town_root, load_routing, CommandError, Result};

#[derive(Debug, Subcommand)]
pub enum ConvoyCommand {
    /// Create a convoy tracking the given beads, in order
    Create {
        title: String,
        #[arg(required = true)]
        beads: Vec<String>,
    },
    /// Add a bead to an existing convoy
    Add { convoy: String, bead: String },
    /// Auto-close convoys whose members have all finished
    Check { convoy: Option<String> },
    /// Show a convoy and its members
    Status { convoy: String },
    /// List convoys
    List {
        /// Include closed convoys
        #[arg(long)]
        all: bool,
    },
    /// List stranded convoys (ready members, no live worker)
    Stranded {
        #[arg(long)]
        json: bool,
    },
    /// Close a convoy
    Close {
        convoy: String,
        #[arg(long)]
        reason: String,
    },
    /// Close a completed convoy (errors if members are still open)
    Land { convoy: String },
}

impl ConvoyCommand {
    pub async fn execute(self) -> Result<()> {
        let town_root = find_town_root()?;
        let store = BdClient::new(&town_root);

        match self {
            ConvoyCommand::Create { title, beads } => {
                let routing = load_routing(&town_root)?;
                let ids: Vec<BeadId> = beads.iter().map(BeadId::new).collect();
                let outcome = enroll_batch(&store, &routing, &ids, None, Some(title)).await?;
                println!("✓ Convoy {} created ({} members)", outcome.convoy, ids.len());
                Ok(())
            }

            ConvoyCommand::Add { convoy, bead } => {
                let bead_id = BeadId::new(&bead);
                if let Some(existing) = find_tracking_convoy(&store, &bead_id).await? {
                    return Err(CommandError::Invalid(format!(
                        "{bead} is already tracked by convoy {existing}"
                    )));
                }
                let convoy_id = ConvoyId::new(&convoy);
                store.track_member(&convoy_id, &bead_id).await?;
                println!("✓ {bead} added to {convoy}");
                Ok(())
            }

            ConvoyCommand::Check { convoy } => {
                let settings = TownSettings::load_or_create(&town_root)?;
                let routing = load_routing(&town_root)?;
                let sessions = TmuxBackend::new(&town_root);
                let feed = FeedWriter::new(feed_path(&town_root));
                let actor = detect_actor();
                let ctx = FeedContext {
                    store: &store,
                    sessions: &sessions,
                    feed: &feed,
                    routing: &routing,
                    parked: &settings.parked_rigs,
                    actor: &actor,
                };

                let convoys = match convoy {
                    Some(id) => vec![store.get(&BeadId::new(&id)).await?],
                    None => list_open_convoys(&store).await?,
                };
                let mut closed = 0;
                for convoy in &convoys {
                    if close_if_complete(&ctx, convoy).await? {
                        println!("✓ {} auto-closed (all members complete)", convoy.id);
                        closed += 1;
                    }
                }
                println!("Checked {} convoy(s), closed {closed}", convoys.len());
                Ok(())
            }

            ConvoyCommand::Status { convoy } => {
                let convoy_bead = store.get(&BeadId::new(&convoy)).await?;
                print_convoy_status(&store, &convoy_bead).await
            }

            ConvoyCommand::List { all } => {
                let convoys = if all {
                    store
                        .list(ListFilter::default().with_type(TYPE_CONVOY))
                        .await?
                } else {
                    list_open_convoys(&store).await?
                };
                if convoys.is_empty() {
                    println!("No convoys.");
                    return Ok(());
                }
                for convoy in convoys {
                    let members = convoy.tracked_members();
                    println!(
                        "{} [{}] {} ({} members)",
                        convoy.id,
                        convoy.status,
                        convoy.title,
                        members.len()
                    );
                }
                Ok(())
            }

            ConvoyCommand::Stranded { json } => {
                let convoys = list_open_convoys(&store).await?;
                let mut stranded = Vec::new();
                for convoy in convoys {
                    if is_stranded(&store, &convoy).await? {
                        stranded.push(convoy);
                    }
                }
                if json {
                    let out: Vec<_> = stranded
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c.id,
                                "title": c.title,
                                "members": c.tracked_members(),
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
                } else if stranded.is_empty() {
                    println!("No stranded convoys.");
                } else {
                    for convoy in &stranded {
                        println!("{} {} ({} members)", convoy.id, convoy.title, convoy.tracked_members().len());
                    }
                }
                Ok(())
            }

            ConvoyCommand::Close { convoy, reason } => {
                store
                    .update(&BeadId::new(&convoy), BeadPatch::default().close(Some(reason)))
                    .await?;
                println!("✓ Convoy {convoy} closed");
                Ok(())
            }

            ConvoyCommand::Land { convoy } => {
                let convoy_bead = store.get(&BeadId::new(&convoy)).await?;
                let mut open = Vec::new();
                for member in convoy_bead.tracked_members() {
                    let b = store.get(&member).await?;
                    if !b.status.is_closed() {
                        open.push(format!("{member}: {}", b.status));
                    }
                }
                if !open.is_empty() {
                    return Err(CommandError::Invalid(format!(
                        "cannot land {convoy}: members still open: {}",
                        open.join(", ")
                    )));
                }
                store
                    .update(
                        &BeadId::new(&convoy),
                        BeadPatch::default().close(Some("landed".to_string())),
                    )
                    .await?;
                println!("✓ Convoy {convoy} landed");
                Ok(())
            }
        }
    }
}

async fn print_convoy_status(store: &BdClient, convoy: &Bead) -> Result<()> {
    println!("{} [{}] {}", convoy.id, convoy.status, convoy.title);
    if let Some(reason) = &convoy.close_reason {
        println!("  reason: {reason}");
    }
    let members = convoy.tracked_members();
    let mut done = 0;
    let mut seen: HashSet<BeadId> = HashSet::new();
    for member in &members {
        if !seen.insert(member.clone()) {
            continue;
        }
        match store.get(member).await {
            Ok(b) => {
                if b.status == BeadStatus::Closed {
                    done += 1;
                }
                println!("  {} [{}] {}", b.id, b.status, b.title);
            }
            Err(_) => println!("  {member} [missing]"),
        }
    }
    println!("  {done}/{} members complete", members.len());
    Ok(())
}
