//! Per-repository, user-scoped filesystem locations for ledger sync.
//!
//! The ledger worktree, sync-state file, and lock file live outside the
//! repository, under a per-user root, so they survive clones and never show
//! up in `git status`. Layout:
//!
//! ```text
//! <root>/<repo-name>/.sync-worktree/     checkout of the ledger branch
//! <root>/<repo-name>/.ledger-sync-state  durable sync metadata (JSON)
//! <root>/<repo-name>/.ledger.lock        advisory cross-process lock
//! ```
//!
//! Root resolution: explicit override (from `sync.global_path_override`),
//! then the `ELUENT_HOME` environment variable, then `~/.eluent`.

use super::LedgerError;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Environment variable overriding the per-user root directory.
pub const HOME_ENV_VAR: &str = "ELUENT_HOME";

const WORKTREE_DIR: &str = ".sync-worktree";
const STATE_FILE: &str = ".ledger-sync-state";
const LOCK_FILE: &str = ".ledger.lock";

/// Resolved filesystem locations for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalPaths {
    user_root: PathBuf,
    repo_root: PathBuf,
}

impl GlobalPaths {
    /// Resolve paths for a repository by logical name.
    ///
    /// The name is sanitized for the filesystem; sanitization warns once.
    ///
    /// # Errors
    ///
    /// Fails when no root can be determined (no override, no `ELUENT_HOME`,
    /// and no home directory).
    pub fn new(repo_name: &str, override_root: Option<&Path>) -> Result<Self, LedgerError> {
        let user_root = match override_root {
            Some(root) => root.to_path_buf(),
            None => match std::env::var_os(HOME_ENV_VAR) {
                Some(dir) if !dir.is_empty() => PathBuf::from(dir),
                _ => dirs::home_dir()
                    .map(|home| home.join(".eluent"))
                    .ok_or_else(|| {
                        LedgerError::Internal(
                            "could not determine a home directory for the ledger root".to_string(),
                        )
                    })?,
            },
        };

        let sanitized = sanitize_repo_name(repo_name);
        if sanitized != repo_name {
            warn!(
                repo = repo_name,
                sanitized = %sanitized,
                "repository name contained reserved characters; sanitized for filesystem use"
            );
        }

        let repo_root = user_root.join(&sanitized);
        Ok(Self {
            user_root,
            repo_root,
        })
    }

    /// The per-user root (`~/.eluent` unless overridden).
    pub fn user_root(&self) -> &Path {
        &self.user_root
    }

    /// The per-repository directory under the root.
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Directory holding the out-of-tree checkout of the ledger branch.
    pub fn worktree_dir(&self) -> PathBuf {
        self.repo_root.join(WORKTREE_DIR)
    }

    /// The durable sync-state file.
    pub fn state_file(&self) -> PathBuf {
        self.repo_root.join(STATE_FILE)
    }

    /// The advisory lock file serializing ledger operations on this host.
    pub fn lock_file(&self) -> PathBuf {
        self.repo_root.join(LOCK_FILE)
    }

    /// Create any missing ancestors of the per-repo directory.
    ///
    /// # Errors
    ///
    /// Fails with an error naming the path and the underlying reason. Never
    /// falls back to an alternative location.
    pub fn ensure_directories(&self) -> Result<(), LedgerError> {
        std::fs::create_dir_all(&self.repo_root).map_err(|e| LedgerError::Unhealthy {
            reason: format!(
                "failed to create ledger directory {}: {}",
                self.repo_root.display(),
                e
            ),
        })
    }

    /// True iff the per-repo directory exists and is writable.
    pub fn is_valid(&self) -> bool {
        if !self.repo_root.is_dir() {
            return false;
        }
        let probe = self.repo_root.join(format!(".probe.{}", std::process::id()));
        match std::fs::write(&probe, b"") {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe);
                true
            }
            Err(_) => false,
        }
    }
}

/// Replace filesystem-reserved characters and whitespace with `_`.
fn sanitize_repo_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_whitespace() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|')
            {
                '_'
            } else {
                c
            }
        })
        .collect()
}
