//! Human-facing rendering of ledger failures.
//!
//! The core returns typed [`LedgerError`](crate::sync::LedgerError) values
//! and never prints. This module turns one into terminal output: the error
//! line tagged with its machine-readable kind, followed by next-step hints
//! chosen by kind. Hints are static; anything variable (owner, atom id,
//! retry count) already lives in the error's own message.

use std::fmt;

use crate::sync::LedgerError;

/// A failure prepared for the terminal: error line plus next-step hints.
pub struct Diagnosis<'a> {
    error: &'a LedgerError,
    hints: &'static [&'static str],
}

/// Attach next-step hints to an error by kind.
pub fn diagnose(error: &LedgerError) -> Diagnosis<'_> {
    let hints: &'static [&'static str] = match error {
        LedgerError::ClaimConflict { .. } => &[
            "pick a different atom, or coordinate with the current owner",
            "take over an abandoned claim with: eluent claim <atom-id> --force",
        ],
        LedgerError::MaxRetriesExceeded { .. } => &[
            "retry shortly; backoff usually clears transient contention",
            "raise sync.claim_retries in .eluent/config.toml if contention is expected",
        ],
        LedgerError::NotConfigured => &[
            "set sync.ledger_branch (e.g. \"eluent-sync\") in .eluent/config.toml",
            "then initialize with: eluent sync --setup-ledger",
        ],
        LedgerError::Unhealthy { .. } | LedgerError::WorktreeCorrupt { .. } => &[
            "re-initialize with: eluent sync --setup-ledger",
            "if that fails, rebuild from the remote: eluent sync --force-resync",
        ],
        LedgerError::NetworkUnreachable { .. } | LedgerError::Timeout { .. } => &[
            "check connectivity and the remote URL: git remote -v",
            "set sync.offline_mode = \"local\" to queue claims while offline",
        ],
        LedgerError::SchemaTooNew { .. } => {
            &["upgrade eluent; the sync state was written by a newer version"]
        }
        LedgerError::BranchInvalid { .. } => {
            &["fix sync.ledger_branch in .eluent/config.toml; see git-check-ref-format(1)"]
        }
        _ => &[],
    };
    Diagnosis { error, hints }
}

impl fmt::Display for Diagnosis<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error[{}]: {}", self.error.kind(), self.error)?;
        for hint in self.hints {
            write!(f, "\n  hint: {hint}")?;
        }
        Ok(())
    }
}
