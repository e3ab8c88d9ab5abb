//! `gt daemon`: run the patrol daemon in the foreground.

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::daemon::Daemon;

use super::{find_town_root, Result};

#[derive(Debug, Args)]
pub struct DaemonArgs {}

impl DaemonArgs {
    pub async fn execute(self) -> Result<()> {
        let town_root = find_town_root()?;
        info!(town_root = %town_root.display(), "starting daemon");

        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received");
                signal_token.cancel();
            }
        });

        Daemon::new(town_root).run(shutdown).await?;
        Ok(())
    }
}
