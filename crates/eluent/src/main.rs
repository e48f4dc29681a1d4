//! Eluent CLI entry point.
//!
//! Thin shell around the command layer: parse arguments, initialize
//! logging, detect the repository, dispatch, exit with a stable code.

use clap::Parser;
use eluent::cli::{Cli, Commands};
use eluent::commands::{self, CommandContext};
use eluent::output::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let ctx = match CommandContext::detect(cli.quiet, cli.json) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(ExitCode::Failure.code());
        }
    };

    let exit_code = match &cli.command {
        Commands::Sync(args) => commands::run_sync(&ctx, args),
        Commands::Claim {
            atom_id,
            agent_id,
            offline,
            force,
        } => commands::run_claim(&ctx, atom_id, agent_id.as_deref(), *offline, *force),
        Commands::Release { atom_id } => commands::run_release(&ctx, atom_id),
        Commands::Heartbeat { atom_id, agent_id } => {
            commands::run_heartbeat(&ctx, atom_id, agent_id.as_deref())
        }
    };

    if exit_code != ExitCode::Success {
        std::process::exit(exit_code.code());
    }
}

/// Logging goes to stderr, filtered by `ELUENT_LOG` (default: warnings).
fn init_tracing() {
    let filter = EnvFilter::try_from_env("ELUENT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
