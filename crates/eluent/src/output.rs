//! Exit codes and output formatting for CLI commands.
//!
//! Output is deterministic and machine-friendly: `--json` switches every
//! command to a JSON envelope on stdout, `--quiet` suppresses informational
//! chatter, and exit codes are stable so orchestrators can branch on them.

use std::fmt::Display;
use std::io::{self, Write};

use crate::sync::LedgerError;

/// Stable process exit codes.
///
/// Claim conflicts, retry exhaustion, configuration gaps, and atom lookup
/// failures each get their own code so agent drivers need not parse stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Command succeeded
    Success = 0,
    /// Failure, including claim conflicts
    Failure = 1,
    /// Claim retry ceiling reached
    MaxRetries = 2,
    /// Ledger sync not configured
    NotConfigured = 3,
    /// Atom not found in the ledger
    AtomNotFound = 4,
    /// Atom is in a terminal state
    AtomTerminal = 5,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn description(self) -> &'static str {
        match self {
            ExitCode::Success => "Command succeeded",
            ExitCode::Failure => "Command failed (claim conflicts included)",
            ExitCode::MaxRetries => "Claim retry ceiling reached",
            ExitCode::NotConfigured => "Ledger sync is not configured",
            ExitCode::AtomNotFound => "Atom not found in the ledger",
            ExitCode::AtomTerminal => "Atom is in a terminal state",
        }
    }

    /// Map a core error kind onto its exit code.
    pub fn for_error(error: &LedgerError) -> Self {
        match error {
            LedgerError::MaxRetriesExceeded { .. } => ExitCode::MaxRetries,
            LedgerError::NotConfigured => ExitCode::NotConfigured,
            LedgerError::AtomNotFound { .. } => ExitCode::AtomNotFound,
            LedgerError::AtomTerminal { .. } => ExitCode::AtomTerminal,
            _ => ExitCode::Failure,
        }
    }
}

/// Context for controlling output verbosity.
pub struct OutputContext {
    quiet: bool,
    json: bool,
}

impl OutputContext {
    pub fn new(quiet: bool, json: bool) -> Self {
        Self { quiet, json }
    }

    /// Essential output (suppressed only by `--json`).
    pub fn print_data(&self, msg: impl Display) {
        if !self.json {
            writeln_safe(&msg.to_string());
        }
    }

    /// Informational message (suppressed by `--quiet` or `--json`).
    pub fn print_info(&self, msg: impl Display) {
        if !self.quiet && !self.json {
            writeln_safe(&msg.to_string());
        }
    }

    /// Warning to stderr (suppressed by `--quiet` or `--json`).
    pub fn print_warning(&self, msg: impl Display) {
        if !self.quiet && !self.json {
            writeln_safe_stderr(&format!("Warning: {}", msg));
        }
    }

    /// Error to stderr (always shown).
    pub fn print_error(&self, msg: impl Display) {
        writeln_safe_stderr(&format!("{}", msg));
    }

    /// Emit the JSON envelope when in `--json` mode.
    pub fn print_json(&self, value: &serde_json::Value) {
        if self.json {
            writeln_safe(&value.to_string());
        }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

/// Success envelope for `--json` output.
pub fn json_success(data: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "success": true, "data": data })
}

/// Error envelope for `--json` output.
pub fn json_error(error: &LedgerError) -> serde_json::Value {
    serde_json::json!({
        "success": false,
        "error": { "kind": error.kind(), "message": error.to_string() }
    })
}

/// Safe println that tolerates a closed pipe.
fn writeln_safe(msg: &str) {
    let _ = writeln!(io::stdout(), "{}", msg);
}

fn writeln_safe_stderr(msg: &str) {
    let _ = writeln!(io::stderr(), "{}", msg);
}
