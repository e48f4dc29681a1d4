//! Thin blocking façade over the `git` command-line tool.
//!
//! Every operation names its working directory with `-C` and never changes
//! the caller's process CWD. Credential prompts are disabled on every
//! invocation so an unauthenticated remote fails fast instead of hanging a
//! claim. Network operations take a hard deadline: on expiry the child
//! process is killed and a distinct timeout error is surfaced.
//!
//! The CLI is preferred over a libgit2 binding because worktree and
//! checkout semantics of the CLI are the ones the rest of the tooling
//! (hooks, credential helpers, sparse checkout) already agrees on.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use super::LedgerError;

/// Failure taxonomy for git invocations.
#[derive(Debug, Error)]
pub enum GitError {
    /// Branch name failed validation (checked before any git invocation)
    #[error("invalid branch name '{name}': {reason}")]
    BranchInvalid { name: String, reason: String },

    /// Branch create/checkout failure
    #[error("branch operation failed: {0}")]
    Branch(String),

    /// Worktree add/remove/prune failure
    #[error("worktree operation failed: {0}")]
    Worktree(String),

    /// A network operation exceeded its deadline; the child was killed
    #[error("git {operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// The remote refused a non-fast-forward push (retryable)
    #[error("push rejected by remote: {0}")]
    PushRejected(String),

    /// Unexpected non-zero exit
    #[error("git {operation} failed: {stderr}")]
    CommandFailed { operation: String, stderr: String },

    /// No usable git executable on PATH
    #[error("git executable not found on PATH")]
    NotAvailable,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Whether this failure indicates the remote is unreachable rather than
    /// a local problem.
    pub fn is_network(&self) -> bool {
        match self {
            GitError::Timeout { .. } => true,
            GitError::CommandFailed { stderr, .. } => {
                let s = stderr.to_lowercase();
                s.contains("could not resolve host")
                    || s.contains("unable to access")
                    || s.contains("connection refused")
                    || s.contains("connection timed out")
                    || s.contains("could not read from remote")
                    || s.contains("does not appear to be a git repository")
            }
            _ => false,
        }
    }
}

impl From<GitError> for LedgerError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::BranchInvalid { name, reason } => LedgerError::BranchInvalid { name, reason },
            GitError::Timeout { operation, timeout } => LedgerError::Timeout {
                operation,
                seconds: timeout.as_secs(),
            },
            GitError::Worktree(reason) => LedgerError::WorktreeCorrupt { reason },
            other if other.is_network() => LedgerError::NetworkUnreachable {
                reason: other.to_string(),
            },
            other => LedgerError::GitFailure {
                reason: other.to_string(),
            },
        }
    }
}

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub commit: String,
    pub branch: Option<String>,
}

/// Blocking git gateway bound to one primary working tree.
#[derive(Debug, Clone)]
pub struct GitGateway {
    repo_path: PathBuf,
}

impl GitGateway {
    /// Poll interval while waiting on a deadlined child process.
    const WAIT_POLL: Duration = Duration::from_millis(25);

    /// Create a gateway for the repository at `repo_path`.
    ///
    /// # Errors
    ///
    /// Fails when no git executable is on PATH.
    pub fn new(repo_path: impl Into<PathBuf>) -> Result<Self, GitError> {
        which::which("git").map_err(|_| GitError::NotAvailable)?;
        Ok(Self {
            repo_path: repo_path.into(),
        })
    }

    /// The primary working tree this gateway operates on.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Validate a branch name without invoking git.
    ///
    /// Rejects whitespace, a leading `-`, embedded `..`, `@{`, control
    /// characters, and empty path segments.
    pub fn validate_branch_name(name: &str) -> Result<(), GitError> {
        let reason = if name.is_empty() {
            Some("name is empty")
        } else if name.starts_with('-') {
            Some("leading '-'")
        } else if name.contains("..") {
            Some("contains '..'")
        } else if name.contains("@{") {
            Some("contains '@{'")
        } else if name.chars().any(char::is_whitespace) {
            Some("contains whitespace")
        } else if name.chars().any(char::is_control) {
            Some("contains control characters")
        } else if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
            Some("empty path segment")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(GitError::BranchInvalid {
                name: name.to_string(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn command(dir: &Path) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run git in `dir`, returning trimmed stdout on success.
    fn run(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        debug!(dir = %dir.display(), args = ?args, "git");
        let output = Self::command(dir).args(args).output()?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(GitError::CommandFailed {
                operation: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Run git and report only whether it exited zero.
    fn run_status(&self, dir: &Path, args: &[&str]) -> Result<bool, GitError> {
        debug!(dir = %dir.display(), args = ?args, "git (status)");
        let output = Self::command(dir).args(args).output()?;
        Ok(output.status.success())
    }

    /// Run git with a hard deadline, killing the child on expiry.
    fn run_with_timeout(
        &self,
        dir: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<String, GitError> {
        debug!(dir = %dir.display(), args = ?args, ?timeout, "git (deadlined)");
        let mut child = Self::command(dir)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain pipes on threads so a chatty child cannot fill them and
        // stall before the deadline check sees it exit.
        let stdout_reader = child.stdout.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(GitError::Timeout {
                            operation: args.join(" "),
                            timeout,
                        });
                    }
                    std::thread::sleep(Self::WAIT_POLL);
                }
            }
        };

        let stdout = stdout_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if status.success() {
            Ok(stdout.trim().to_string())
        } else {
            Err(GitError::CommandFailed {
                operation: args.join(" "),
                stderr: stderr.trim().to_string(),
            })
        }
    }

    /// Name of the currently checked-out branch of the primary tree.
    pub fn current_branch(&self) -> Result<String, GitError> {
        self.run(&self.repo_path, &["rev-parse", "--abbrev-ref", "HEAD"])
    }

    /// Commit hash of HEAD in the primary tree.
    pub fn current_commit(&self) -> Result<String, GitError> {
        self.run(&self.repo_path, &["rev-parse", "HEAD"])
    }

    /// Whether the named remote is configured.
    pub fn remote_present(&self, name: &str) -> Result<bool, GitError> {
        let remotes = self.run(&self.repo_path, &["remote"])?;
        Ok(remotes.lines().any(|line| line.trim() == name))
    }

    /// Whether the primary working tree has no pending changes.
    pub fn is_clean(&self) -> Result<bool, GitError> {
        let status = self.run(&self.repo_path, &["status", "--porcelain"])?;
        Ok(status.is_empty())
    }

    /// Whether `refs/heads/<name>` exists locally.
    pub fn local_branch_exists(&self, name: &str) -> Result<bool, GitError> {
        Self::validate_branch_name(name)?;
        self.run_status(
            &self.repo_path,
            &[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{name}"),
            ],
        )
    }

    /// Create a branch with no parent and exactly one empty commit.
    ///
    /// Uses plumbing (`mktree` → `commit-tree` → `branch`) so the caller's
    /// checked-out branch and index are untouched on every exit path.
    pub fn create_orphan_branch(&self, name: &str, message: &str) -> Result<(), GitError> {
        Self::validate_branch_name(name)?;
        if self.local_branch_exists(name)? {
            return Err(GitError::Branch(format!("branch '{name}' already exists")));
        }

        let empty_tree = self
            .run(&self.repo_path, &["mktree"])
            .map_err(|e| GitError::Branch(format!("mktree: {e}")))?;
        let commit = self
            .run(&self.repo_path, &["commit-tree", &empty_tree, "-m", message])
            .map_err(|e| GitError::Branch(format!("commit-tree: {e}")))?;
        self.run(&self.repo_path, &["branch", name, &commit])
            .map_err(|e| GitError::Branch(format!("branch: {e}")))?;
        Ok(())
    }

    /// Create a local branch pointing at an existing commit-ish, e.g. a
    /// remote-tracking ref.
    pub fn create_branch_from(&self, name: &str, start_point: &str) -> Result<(), GitError> {
        Self::validate_branch_name(name)?;
        self.run(&self.repo_path, &["branch", name, start_point])
            .map(|_| ())
            .map_err(|e| GitError::Branch(format!("branch '{name}' from '{start_point}': {e}")))
    }

    /// Check out a branch in the primary tree, optionally creating it.
    pub fn checkout(&self, branch: &str, create: bool) -> Result<(), GitError> {
        Self::validate_branch_name(branch)?;
        let result = if create {
            self.run(&self.repo_path, &["checkout", "-b", branch])
        } else {
            self.run(&self.repo_path, &["checkout", branch])
        };
        result
            .map(|_| ())
            .map_err(|e| GitError::Branch(format!("checkout '{branch}': {e}")))
    }

    /// Registered worktrees, parsed from `worktree list --porcelain`.
    pub fn worktree_list(&self) -> Result<Vec<WorktreeInfo>, GitError> {
        let out = self.run(&self.repo_path, &["worktree", "list", "--porcelain"])?;
        let mut entries = Vec::new();
        let mut path: Option<PathBuf> = None;
        let mut commit: Option<String> = None;
        let mut branch: Option<String> = None;

        for line in out.lines().chain(std::iter::once("")) {
            let line = line.trim();
            if line.is_empty() {
                if let (Some(p), Some(c)) = (path.take(), commit.take()) {
                    entries.push(WorktreeInfo {
                        path: p,
                        commit: c,
                        branch: branch.take(),
                    });
                }
                branch = None;
            } else if let Some(p) = line.strip_prefix("worktree ") {
                path = Some(PathBuf::from(p));
            } else if let Some(c) = line.strip_prefix("HEAD ") {
                commit = Some(c.to_string());
            } else if let Some(b) = line.strip_prefix("branch ") {
                branch = b.strip_prefix("refs/heads/").map(str::to_string);
            }
        }

        Ok(entries)
    }

    /// Register a new worktree for `branch` at `path`.
    pub fn worktree_add(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        Self::validate_branch_name(branch)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GitError::Worktree(format!("create {}: {}", parent.display(), e)))?;
        }
        let path_str = path.to_string_lossy();
        self.run(&self.repo_path, &["worktree", "add", &path_str, branch])
            .map(|_| ())
            .map_err(|e| GitError::Worktree(format!("add {}: {}", path.display(), e)))
    }

    /// Remove a registered worktree.
    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<(), GitError> {
        let path_str = path.to_string_lossy();
        let result = if force {
            self.run(
                &self.repo_path,
                &["worktree", "remove", "--force", &path_str],
            )
        } else {
            self.run(&self.repo_path, &["worktree", "remove", &path_str])
        };
        result
            .map(|_| ())
            .map_err(|e| GitError::Worktree(format!("remove {}: {}", path.display(), e)))
    }

    /// Prune stale worktree registrations.
    pub fn worktree_prune(&self) -> Result<(), GitError> {
        self.run(&self.repo_path, &["worktree", "prune"])
            .map(|_| ())
            .map_err(|e| GitError::Worktree(format!("prune: {e}")))
    }

    /// Run git inside a specific worktree (`git -C <path> ...`).
    pub fn run_in_worktree(&self, path: &Path, args: &[&str]) -> Result<String, GitError> {
        self.run(path, args)
    }

    /// Fetch one branch from a remote into its remote-tracking ref.
    pub fn fetch_branch(
        &self,
        remote: &str,
        branch: &str,
        timeout: Duration,
    ) -> Result<(), GitError> {
        Self::validate_branch_name(branch)?;
        let refspec = format!("+refs/heads/{branch}:refs/remotes/{remote}/{branch}");
        self.run_with_timeout(&self.repo_path, &["fetch", remote, &refspec], timeout)
            .map(|_| ())
    }

    /// Push one branch, distinguishing non-fast-forward rejection from
    /// other failures.
    pub fn push_branch(
        &self,
        remote: &str,
        branch: &str,
        set_upstream: bool,
        timeout: Duration,
    ) -> Result<(), GitError> {
        Self::validate_branch_name(branch)?;
        let mut args = vec!["push"];
        if set_upstream {
            args.push("-u");
        }
        args.push(remote);
        args.push(branch);

        match self.run_with_timeout(&self.repo_path, &args, timeout) {
            Ok(_) => Ok(()),
            Err(GitError::CommandFailed { stderr, .. }) if is_push_rejection(&stderr) => {
                Err(GitError::PushRejected(stderr))
            }
            Err(e) => Err(e),
        }
    }

    /// Commit currently at the tip of `refs/heads/<branch>` on the remote.
    ///
    /// Uses `ls-remote`, so local refs are never mutated; `None` means the
    /// branch does not exist on the remote. Doubles as the online probe.
    pub fn remote_branch_commit(
        &self,
        remote: &str,
        branch: &str,
        timeout: Duration,
    ) -> Result<Option<String>, GitError> {
        Self::validate_branch_name(branch)?;
        let out = self.run_with_timeout(
            &self.repo_path,
            &["ls-remote", remote, &format!("refs/heads/{branch}")],
            timeout,
        )?;
        Ok(out
            .split_whitespace()
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string))
    }
}

/// Classify push stderr as a compare-and-set loss.
///
/// Ref-lock contention counts too: two pushes racing on the same ref lose
/// the same way a non-fast-forward does, just earlier.
fn is_push_rejection(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    s.contains("non-fast-forward")
        || s.contains("[rejected]")
        || s.contains("fetch first")
        || s.contains("cannot lock ref")
        || s.contains("failed to lock")
}
