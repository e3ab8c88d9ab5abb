//! `gt sling`: batch enrollment of beads into a tracking convoy.
//!
//! Sling validates and enrolls; it never dispatches. The daemon's feed paths
//! pick up the new convoy on their next cadence (stranded sweep for the first
//! member, event feed thereafter). With `--queue` the beads are additionally
//! labelled for the capacity-controlled queue.

use clap::Args;

use crate::convoy::enroll_batch;
use crate::queue::labels::{rig_label, LABEL_QUEUED};
use crate::store::{BdClient, BeadPatch, StoreClient};
use crate::types::{BeadId, RigName};

use super::{detect_actor, find_town_root, load_routing, Result};

#[derive(Debug, Args)]
pub struct SlingArgs {
    /// Beads to enroll, in dispatch order.
    #[arg(required = true)]
    pub beads: Vec<String>,

    /// Target rig (deprecated: the rig is inferred from bead prefixes).
    pub rig: Option<String>,

    /// Admit the beads to the work queue instead of relying on the sweep.
    #[arg(long)]
    pub queue: bool,

    /// Title for the created convoy.
    #[arg(long)]
    pub title: Option<String>,
}

impl SlingArgs {
    pub async fn execute(self) -> Result<()> {
        let town_root = find_town_root()?;
        let routing = load_routing(&town_root)?;
        let store = BdClient::new(&town_root);

        // The last positional may be a rig name rather than a bead; the
        // original CLI shape was `sling <bead...> <rig>`. A token without a
        // `-` cannot be a bead ID.
        let (bead_strs, explicit_rig) = match (&self.rig, self.beads.split_last()) {
            (Some(rig), _) => (self.beads.clone(), Some(RigName::new(rig.clone()))),
            (None, Some((last, rest))) if !rest.is_empty() && !last.contains('-') => {
                (rest.to_vec(), Some(RigName::new(last.clone())))
            }
            _ => (self.beads.clone(), None),
        };
        let ids: Vec<BeadId> = bead_strs.iter().map(BeadId::new).collect();

        if explicit_rig.is_some() {
            eprintln!("note: passing a rig to sling is deprecated; the rig is inferred from bead prefixes");
        }

        let outcome = enroll_batch(
            &store,
            &routing,
            &ids,
            explicit_rig.as_ref(),
            self.title.clone(),
        )
        .await?;

        println!(
            "✓ Convoy {} tracking {} bead(s) → {}",
            outcome.convoy,
            ids.len(),
            outcome.rig
        );

        if self.queue {
            let actor = detect_actor();
            for id in &ids {
                let patch = BeadPatch::default()
                    .add_label(LABEL_QUEUED)
                    .add_label(rig_label(&outcome.rig));
                store.update(id, patch).await?;
                println!("  ○ {id} queued for {}", outcome.rig);
            }
            println!("  Queued by {actor}; the daemon dispatches as capacity allows");
        } else {
            println!("  The daemon feeds the convoy on its next sweep");
        }

        Ok(())
    }
}
