//! Command-line interface definitions using clap.

use clap::{ArgGroup, Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "eluent")]
#[command(about = "Local-first, git-backed work-item tracker", long_about = None)]
pub struct Cli {
    /// Emit machine-readable JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress informational output
    #[arg(long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ledger synchronization operations
    Sync(SyncArgs),

    /// Claim an atom for exclusive work
    Claim {
        atom_id: String,

        /// Agent identity (defaults to ELUENT_AGENT_ID, then the host name)
        #[arg(long)]
        agent_id: Option<String>,

        /// Claim locally without contacting the remote
        #[arg(long)]
        offline: bool,

        /// Take over an atom held by another agent
        #[arg(long)]
        force: bool,
    },

    /// Release a claimed atom back to open
    Release { atom_id: String },

    /// Refresh a held claim so it is not auto-released as stale
    Heartbeat {
        atom_id: String,

        #[arg(long)]
        agent_id: Option<String>,
    },
}

#[derive(Args)]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .args(["setup_ledger", "ledger_only", "reconcile", "status", "force_resync", "cleanup_ledger"])
))]
pub struct SyncArgs {
    /// Initialize the ledger branch and worktree
    #[arg(long)]
    pub setup_ledger: bool,

    /// Pull then push the ledger, then mirror it into the working tree
    #[arg(long)]
    pub ledger_only: bool,

    /// Replay claims queued while offline
    #[arg(long)]
    pub reconcile: bool,

    /// Print sync state and health
    #[arg(long)]
    pub status: bool,

    /// Tear down and rebuild the ledger from the remote
    #[arg(long)]
    pub force_resync: bool,

    /// Remove the ledger worktree and all sync state
    #[arg(long)]
    pub cleanup_ledger: bool,

    /// Skip confirmation prompts for destructive modes
    #[arg(long)]
    pub yes: bool,
}
