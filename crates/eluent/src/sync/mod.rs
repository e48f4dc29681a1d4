//! Ledger coordination core.
//!
//! Many concurrent agents, spread across machines, acquire exclusive claims
//! on atoms without a central server. A dedicated git branch is the
//! distributed log: each host mirrors it in a private out-of-tree worktree,
//! mutates atom claim fields there, and pushes. The remote's non-fast-forward
//! rejection is the compare-and-set that makes one writer win.
//!
//! Components, leaves first:
//!
//! - [`global_paths`]: per-user, per-repo locations for worktree, state, lock
//! - [`git_gateway`]: the subset of git plumbing the core needs
//! - [`state`]: durable sync metadata with corruption recovery
//! - [`syncer`]: the ledger protocol (setup, pull, push, claim, release)
//! - [`claim_flow`]: the bounded retry/backoff machine behind claims

pub mod claim_flow;
pub mod clock;
pub mod git_gateway;
pub mod global_paths;
pub mod ledger_file;
pub mod lock;
pub mod registry;
pub mod state;
pub mod syncer;

pub use claim_flow::{Attempt, ClaimFlow, ClaimOutcome};
pub use clock::{Clock, SystemClock};
pub use git_gateway::{GitError, GitGateway, WorktreeInfo};
pub use global_paths::GlobalPaths;
pub use lock::{LedgerLock, LockGuard};
pub use registry::SyncerRegistry;
pub use state::{LedgerState, LedgerStateStore, OfflineClaim};
pub use syncer::{LedgerSettings, LedgerSyncer, OfflinePolicy, ReconcileReport, ReconcileStatus};

use thiserror::Error;

/// Typed failure kinds surfaced by the ledger core.
///
/// Every public syncer operation returns a value record carrying one of
/// these on failure; exceptions never cross the API boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Atom absent from the ledger at read time
    #[error("atom not found: {atom_id}")]
    AtomNotFound { atom_id: String },

    /// Atom is in a terminal state and cannot be claimed
    #[error("cannot claim atom {atom_id} in {status} state")]
    AtomTerminal { atom_id: String, status: String },

    /// Another agent currently holds the claim
    #[error("atom {atom_id} already claimed by {owner}")]
    ClaimConflict { atom_id: String, owner: String },

    /// The optimistic-locking retry ceiling was reached
    #[error("max retries exceeded after {retries} push rejections")]
    MaxRetriesExceeded { retries: u32 },

    /// Feature disabled or ledger branch not set
    #[error("ledger sync is not configured: set sync.ledger_branch in .eluent/config.toml")]
    NotConfigured,

    /// Worktree or state cannot be brought to a valid state
    #[error("ledger is unhealthy: {reason}")]
    Unhealthy { reason: String },

    /// Remote not reachable
    #[error("remote unreachable: {reason}")]
    NetworkUnreachable { reason: String },

    /// A network operation exceeded its deadline
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Branch name failed validation
    #[error("invalid branch name '{name}': {reason}")]
    BranchInvalid { name: String, reason: String },

    /// Stale or broken worktree that recovery could not repair
    #[error("ledger worktree corrupt: {reason}")]
    WorktreeCorrupt { reason: String },

    /// Unexpected git exit
    #[error("git failure: {reason}")]
    GitFailure { reason: String },

    /// State file was unparsable (recovered by reset)
    #[error("sync state corrupt: {reason}")]
    StateCorrupt { reason: String },

    /// State file written by a newer version of the tool
    #[error("sync state schema {found} is newer than supported {supported}: upgrade eluent")]
    SchemaTooNew { found: u32, supported: u32 },

    /// Catch-all for programmer errors surfaced as values
    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Stable machine-readable kind name, used in JSON output and exit-code
    /// mapping.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::AtomNotFound { .. } => "atom_not_found",
            LedgerError::AtomTerminal { .. } => "atom_terminal",
            LedgerError::ClaimConflict { .. } => "claim_conflict",
            LedgerError::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            LedgerError::NotConfigured => "ledger_not_configured",
            LedgerError::Unhealthy { .. } => "ledger_unhealthy",
            LedgerError::NetworkUnreachable { .. } => "network_unreachable",
            LedgerError::Timeout { .. } => "timeout",
            LedgerError::BranchInvalid { .. } => "branch_invalid",
            LedgerError::WorktreeCorrupt { .. } => "worktree_corrupt",
            LedgerError::GitFailure { .. } => "git_failure",
            LedgerError::StateCorrupt { .. } => "state_corrupt",
            LedgerError::SchemaTooNew { .. } => "schema_too_new",
            LedgerError::Internal(_) => "internal_error",
        }
    }
}

/// Result of a claim attempt, returned to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimResult {
    /// Whether the claim is held by the requesting agent afterwards
    pub success: bool,
    /// Failure kind, populated iff `success` is false
    pub error: Option<LedgerError>,
    /// On success the requesting agent; on conflict the current owner
    pub claimed_by: Option<String>,
    /// Number of remote push rejections observed
    pub retries: u32,
    /// True when the claim was queued locally while offline
    pub offline_claim: bool,
}

impl ClaimResult {
    pub fn ok(agent_id: &str, retries: u32) -> Self {
        Self {
            success: true,
            error: None,
            claimed_by: Some(agent_id.to_string()),
            retries,
            offline_claim: false,
        }
    }

    pub fn offline(agent_id: &str) -> Self {
        Self {
            success: true,
            error: None,
            claimed_by: Some(agent_id.to_string()),
            retries: 0,
            offline_claim: true,
        }
    }

    pub fn failed(error: LedgerError, retries: u32) -> Self {
        let claimed_by = match &error {
            LedgerError::ClaimConflict { owner, .. } => Some(owner.clone()),
            _ => None,
        };
        Self {
            success: false,
            error: Some(error),
            claimed_by,
            retries,
            offline_claim: false,
        }
    }
}

/// Result of `setup`, distinguishing first-time initialization from an
/// idempotent re-invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupResult {
    pub success: bool,
    pub error: Option<LedgerError>,
    pub created_branch: bool,
    pub created_worktree: bool,
}

impl SetupResult {
    pub fn ok(created_branch: bool, created_worktree: bool) -> Self {
        Self {
            success: true,
            error: None,
            created_branch,
            created_worktree,
        }
    }

    pub fn failed(error: LedgerError, created_branch: bool, created_worktree: bool) -> Self {
        Self {
            success: false,
            error: Some(error),
            created_branch,
            created_worktree,
        }
    }
}

/// Result of pull/push/release style operations.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    pub success: bool,
    pub error: Option<LedgerError>,
    /// Atom ids with unresolved conflicts (reserved for the merge engine)
    pub conflicts: Vec<String>,
    /// Number of local changes applied by the operation
    pub changes_applied: usize,
}

impl SyncResult {
    pub fn ok(changes_applied: usize) -> Self {
        Self {
            success: true,
            error: None,
            conflicts: Vec::new(),
            changes_applied,
        }
    }

    pub fn failed(error: LedgerError) -> Self {
        Self {
            success: false,
            error: Some(error),
            conflicts: Vec::new(),
            changes_applied: 0,
        }
    }
}
