//! Arena — template source versioning and synchronization CLI.
//!
//! # Usage
//!
//! ```text
//! arena source list [--json]
//! arena source delete <namespace>/<name> [--purge]
//! arena reconcile <namespace>/<name>
//! arena status [--json]
//! arena gc <root> [--max-versions N]
//! arena daemon start|stop|status
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, gc::GcArgs, reconcile::ReconcileArgs, source::SourceCommand,
    status::StatusArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "arena",
    version,
    about = "Fetch, version and index template sources",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect and remove template sources.
    Source {
        #[command(subcommand)]
        command: SourceCommand,
    },

    /// Reconcile one source in-process until its fetch has been stored.
    Reconcile(ReconcileArgs),

    /// Show phase, readiness and stored version of every source.
    Status(StatusArgs),

    /// Prune old versions below a target directory.
    Gc(GcArgs),

    /// Run or control the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Logs go to stderr so `--json` output stays parseable.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    match cli.command {
        Commands::Source { command } => commands::source::run(command),
        Commands::Reconcile(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Gc(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
