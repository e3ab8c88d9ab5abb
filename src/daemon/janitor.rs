//! The janitor dog patrol.
//!
//! The janitor's cleanup steps live in a declarative formula
//! (`mol-dog-janitor`) that an external agent interprets and executes. The
//! patrol's only job is to pour the molecule on cadence; there is no
//! imperative cleanup logic here.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::TownSettings;

use super::molecule::MoleculeClient;
use super::patrol::ticker;

/// The formula the janitor pours.
const JANITOR_FORMULA: &str = "mol-dog-janitor";

/// Runs one janitor cycle: pour the molecule, then close the root.
pub async fn janitor_cycle(molecules: &MoleculeClient) {
    info!(formula = JANITOR_FORMULA, "janitor: pouring molecule");
    let mol = molecules.pour(JANITOR_FORMULA, &[]).await;
    if !mol.is_live() {
        warn!("janitor: pour failed, will retry next cycle");
    }
    mol.close().await;
}

/// The `janitor_dog` patrol loop.
pub async fn run_loop(
    town_root: std::path::PathBuf,
    molecules: MoleculeClient,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut tick = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let enabled = TownSettings::load_or_create(&town_root)
                    .map(|s| s.patrols.janitor_dog.is_enabled())
                    .unwrap_or(false);
                if enabled {
                    janitor_cycle(&molecules).await;
                }
            }
        }
    }
}
