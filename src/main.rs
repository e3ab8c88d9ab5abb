//! gastown - Main entry point.
//!
//! The `gt` binary fronts the coordination engine: batch enrollment (sling),
//! convoy management, the work queue, and the patrol daemon.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gastown::commands::convoy::ConvoyCommand;
use gastown::commands::daemon::DaemonArgs;
use gastown::commands::queue::QueueCommand;
use gastown::commands::sling::SlingArgs;

#[derive(Debug, Parser)]
#[command(
    name = "gt",
    version,
    about = "Multi-agent work orchestrator: convoys, the work queue, and the patrol daemon"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Enroll beads into a tracking convoy
    Sling(SlingArgs),
    /// Inspect and manage convoys
    Convoy {
        #[command(subcommand)]
        command: ConvoyCommand,
    },
    /// Inspect and drive the work queue
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    /// Run the patrol daemon in the foreground
    Daemon(DaemonArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("GASTOWN_LOG")
                .unwrap_or_else(|_| "gastown=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Sling(args) => args.execute().await,
        Commands::Convoy { command } => command.execute().await,
        Commands::Queue { command } => command.execute().await,
        Commands::Daemon(args) => args.execute().await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
