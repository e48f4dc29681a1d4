//! Eluent: a local-first, git-backed work-item tracker.
//!
//! This crate houses the ledger coordination core: the mechanism by which
//! many concurrent agents, spread across machines, acquire exclusive claims
//! on atoms without a central server, using a dedicated git branch as the
//! distributed log. The library is consumed by the CLI binary and by
//! embedding callers (daemons, agent execution loops).

pub mod agent_identity;
pub mod cli;
pub mod commands;
pub mod config;
pub mod domain;
pub mod errors;
pub mod output;
pub mod sync;

// Re-export commonly used types
pub use config::EluentConfig;
pub use domain::{AtomRecord, AtomStatus};
pub use output::ExitCode;
pub use sync::{
    ClaimResult, GitGateway, GlobalPaths, LedgerError, LedgerSettings, LedgerState, LedgerSyncer,
    SetupResult, SyncResult, SyncerRegistry,
};
