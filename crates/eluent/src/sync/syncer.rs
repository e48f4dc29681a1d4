//! The ledger protocol: setup, teardown, pull, push, claim, release,
//! reconciliation, and stale-worktree recovery.
//!
//! One syncer per repository. Operations on the same repository within a
//! process must be serialized by the caller; across processes on the same
//! host they serialize through the advisory ledger lock, and across hosts
//! through the remote's non-fast-forward push rejection.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::domain::AtomStatus;

use super::claim_flow::{Attempt, ClaimFlow};
use super::clock::{Clock, SystemClock};
use super::git_gateway::{GitError, GitGateway};
use super::global_paths::GlobalPaths;
use super::ledger_file::{self, LEDGER_DIR};
use super::lock::{cleanup_stale_holder, LedgerLock, LockGuard};
use super::state::LedgerStateStore;
use super::{ClaimResult, LedgerError, SetupResult, SyncResult};

/// Behavior when the remote is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflinePolicy {
    /// Claim against the local worktree and queue for reconciliation
    #[default]
    Local,
    /// Refuse the operation
    Fail,
}

/// Resolved ledger configuration for one repository.
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// The dedicated ledger branch; the feature is off until this is set
    pub branch: String,
    /// Git remote the ledger replicates through
    pub remote: String,
    /// Whether claims push to the remote automatically
    pub auto_claim_push: bool,
    /// Retry ceiling for the claim loop, clamped to [1, 100]
    pub claim_retries: u32,
    /// Stale-claim auto-release window; None disables
    pub claim_timeout_hours: Option<f64>,
    /// Behavior when the remote is unreachable
    pub offline_mode: OfflinePolicy,
    /// Per network operation deadline
    pub network_timeout: Duration,
}

impl LedgerSettings {
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            remote: "origin".to_string(),
            auto_claim_push: true,
            claim_retries: 5,
            claim_timeout_hours: None,
            offline_mode: OfflinePolicy::Local,
            network_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of replaying one queued offline claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileStatus {
    /// The claim now holds on the remote
    Reconciled,
    /// The remote shows another owner; the queued claim lost
    Conflict { owner: String },
    /// The atom no longer exists in the ledger
    AtomMissing,
    /// Transport or internal failure; the claim stays queued
    Error(String),
}

/// Per-claim reconciliation report.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub atom_id: String,
    pub agent_id: String,
    pub status: ReconcileStatus,
}

/// Coordinates the ledger worktree, durable state, and the git remote.
#[derive(Debug)]
pub struct LedgerSyncer {
    gateway: GitGateway,
    paths: GlobalPaths,
    store: LedgerStateStore,
    settings: LedgerSettings,
    clock: Arc<dyn Clock>,
    locker: LedgerLock,
}

impl LedgerSyncer {
    const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a syncer; validates the configured branch name up front.
    pub fn new(
        gateway: GitGateway,
        paths: GlobalPaths,
        settings: LedgerSettings,
    ) -> Result<Self, LedgerError> {
        Self::with_clock(gateway, paths, settings, Arc::new(SystemClock))
    }

    /// As [`LedgerSyncer::new`], with an injected clock.
    pub fn with_clock(
        gateway: GitGateway,
        paths: GlobalPaths,
        settings: LedgerSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LedgerError> {
        GitGateway::validate_branch_name(&settings.branch)?;
        let store = LedgerStateStore::new(paths.state_file(), paths.lock_file());
        Ok(Self {
            gateway,
            paths,
            store,
            settings,
            clock,
            locker: LedgerLock::new(Self::LOCK_TIMEOUT),
        })
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    pub fn paths(&self) -> &GlobalPaths {
        &self.paths
    }

    pub fn state_store(&self) -> &LedgerStateStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // Predicates
    // ------------------------------------------------------------------

    /// Worktree registered at the expected path AND the ledger branch
    /// exists locally or on the remote.
    pub fn is_available(&self) -> bool {
        if !self.worktree_registered() {
            return false;
        }
        match self.gateway.local_branch_exists(&self.settings.branch) {
            Ok(true) => true,
            _ => self
                .gateway
                .remote_branch_commit(
                    &self.settings.remote,
                    &self.settings.branch,
                    self.settings.network_timeout,
                )
                .map(|c| c.is_some())
                .unwrap_or(false),
        }
    }

    /// Non-mutating remote probe within the configured network timeout.
    pub fn is_online(&self) -> bool {
        self.gateway
            .remote_branch_commit(
                &self.settings.remote,
                &self.settings.branch,
                self.settings.network_timeout,
            )
            .is_ok()
    }

    /// Available, not stale, and the state file loads.
    pub fn is_healthy(&self) -> bool {
        self.is_available() && !self.is_worktree_stale() && self.store.load().is_ok()
    }

    /// Stale means: directory or `.git` link missing, HEAD unresolvable,
    /// HEAD off the ledger branch, or the directory not registered with git.
    pub fn is_worktree_stale(&self) -> bool {
        let worktree = self.paths.worktree_dir();
        if !worktree.is_dir() || !worktree.join(".git").exists() {
            return true;
        }
        if !self.worktree_registered() {
            return true;
        }
        match self
            .gateway
            .run_in_worktree(&worktree, &["rev-parse", "--abbrev-ref", "HEAD"])
        {
            Ok(branch) => branch != self.settings.branch,
            Err(_) => true,
        }
    }

    fn worktree_registered(&self) -> bool {
        let expected = self.paths.worktree_dir();
        self.gateway
            .worktree_list()
            .map(|list| list.iter().any(|w| paths_match(&w.path, &expected)))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Setup and teardown
    // ------------------------------------------------------------------

    /// Idempotent initialization: directories, ledger branch (created as an
    /// orphan and pushed with upstream when absent everywhere), worktree
    /// registration, and a one-time seed from the primary tree.
    pub fn setup(&self) -> SetupResult {
        let mut created_branch = false;
        let mut created_worktree = false;

        let result = (|| -> Result<(), LedgerError> {
            self.paths.ensure_directories()?;
            let _guard = self.lock("setup")?;
            let prior_branch = self.gateway.current_branch().ok();

            let branch = &self.settings.branch;
            let remote = &self.settings.remote;
            let local = self.gateway.local_branch_exists(branch)?;
            let remote_commit = if local {
                None
            } else {
                match self.gateway.remote_branch_commit(
                    remote,
                    branch,
                    self.settings.network_timeout,
                ) {
                    Ok(commit) => commit,
                    Err(e) if e.is_network() => {
                        warn!(error = %e, "remote unreachable during setup; assuming branch absent remotely");
                        None
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            if !local && remote_commit.is_none() {
                let created = (|| -> Result<(), LedgerError> {
                    self.gateway.create_orphan_branch(
                        branch,
                        &format!("initialize ledger branch {branch}"),
                    )?;
                    created_branch = true;
                    match self.gateway.push_branch(
                        remote,
                        branch,
                        true,
                        self.settings.network_timeout,
                    ) {
                        Ok(()) => Ok(()),
                        Err(GitError::PushRejected(reason)) => {
                            // Another host initialized concurrently; the next
                            // pull converges on the remote history
                            warn!(%reason, "ledger branch appeared on the remote concurrently");
                            Ok(())
                        }
                        Err(e) if e.is_network() => {
                            warn!(error = %e, "could not push new ledger branch; will retry on next push");
                            Ok(())
                        }
                        Err(e) => Err(e.into()),
                    }
                })();

                // Restore the caller's branch on every exit path
                if let (Some(prior), Ok(current)) = (&prior_branch, self.gateway.current_branch()) {
                    if *prior != current {
                        let _ = self.gateway.checkout(prior, false);
                    }
                }
                created?;
            } else if !local {
                self.gateway
                    .fetch_branch(remote, branch, self.settings.network_timeout)
                    .map_err(LedgerError::from)?;
                self.gateway
                    .create_branch_from(branch, &format!("{remote}/{branch}"))?;
            }

            if !self.worktree_registered() {
                self.gateway
                    .worktree_add(&self.paths.worktree_dir(), branch)?;
                created_worktree = true;
            }

            if created_branch {
                self.seed_from_main_inner()?;
            }

            let mut state = self.store.load()?;
            state.worktree_valid = true;
            self.store.save_unlocked(&state)?;
            Ok(())
        })();

        match result {
            Ok(()) => SetupResult::ok(created_branch, created_worktree),
            Err(e) => SetupResult::failed(e, created_branch, created_worktree),
        }
    }

    /// Remove the worktree and all durable state. Idempotent.
    pub fn teardown(&self) -> SyncResult {
        let result = (|| -> Result<(), LedgerError> {
            let worktree = self.paths.worktree_dir();
            if worktree.exists() {
                if self.worktree_registered() {
                    self.gateway.worktree_remove(&worktree, true)?;
                } else {
                    std::fs::remove_dir_all(&worktree).map_err(|e| {
                        LedgerError::WorktreeCorrupt {
                            reason: format!("remove {}: {}", worktree.display(), e),
                        }
                    })?;
                }
            }
            // A registration without a directory is cleared by prune
            self.gateway.worktree_prune()?;
            self.store.delete_files();
            Ok(())
        })();

        match result {
            Ok(()) => SyncResult::ok(0),
            Err(e) => SyncResult::failed(e),
        }
    }

    // ------------------------------------------------------------------
    // Pull and push
    // ------------------------------------------------------------------

    /// Fetch the ledger branch and hard-reset the worktree mirror onto it.
    pub fn pull_ledger(&self) -> SyncResult {
        let _guard = match self.lock("pull") {
            Ok(guard) => guard,
            Err(e) => return SyncResult::failed(e),
        };
        match self.pull_inner() {
            Ok((_, applied)) => SyncResult::ok(applied),
            Err(e) => SyncResult::failed(e),
        }
    }

    /// Commit any pending worktree changes and push the ledger branch.
    pub fn push_ledger(&self) -> SyncResult {
        let _guard = match self.lock("push") {
            Ok(guard) => guard,
            Err(e) => return SyncResult::failed(e),
        };
        match self.push_inner("ledger sync") {
            Ok(applied) => SyncResult::ok(applied),
            Err(e) => SyncResult::failed(e),
        }
    }

    fn pull_inner(&self) -> Result<(String, usize), LedgerError> {
        self.heal_if_stale()?;

        let remote = &self.settings.remote;
        let branch = &self.settings.branch;
        match self
            .gateway
            .fetch_branch(remote, branch, self.settings.network_timeout)
        {
            Ok(()) => {}
            Err(e) if e.is_network() => {
                return Err(LedgerError::NetworkUnreachable {
                    reason: e.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }

        // The worktree is a private mirror, never a place for uncommitted
        // human work, so a destructive reset is the correct primitive.
        let worktree = self.paths.worktree_dir();
        self.gateway
            .run_in_worktree(&worktree, &["reset", "--hard", &format!("{remote}/{branch}")])
            .map_err(LedgerError::from)?;
        let head = self
            .gateway
            .run_in_worktree(&worktree, &["rev-parse", "HEAD"])
            .map_err(LedgerError::from)?;

        let mut state = self.store.load()?;
        let previous = state.ledger_head.clone();
        state.update_pull(&head, self.clock.now());
        self.store.save_unlocked(&state)?;

        let applied = match previous {
            Some(ref prev) if prev == &head => 0,
            Some(ref prev) => self
                .gateway
                .run_in_worktree(&worktree, &["rev-list", "--count", &format!("{prev}..{head}")])
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
            None => 1,
        };

        self.auto_release_stale_claims();
        Ok((head, applied))
    }

    fn push_inner(&self, message: &str) -> Result<usize, LedgerError> {
        self.heal_if_stale()?;
        let committed = self.commit_worktree(message)?;

        match self.push_ledger_branch() {
            Ok(()) => {
                self.record_push()?;
                Ok(usize::from(committed))
            }
            Err(GitError::PushRejected(reason)) => Err(LedgerError::GitFailure {
                reason: format!("push rejected (non-fast-forward): {reason}"),
            }),
            Err(e) if e.is_network() => Err(LedgerError::NetworkUnreachable {
                reason: e.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Stage everything in the worktree and commit when there is a diff.
    fn commit_worktree(&self, message: &str) -> Result<bool, LedgerError> {
        let worktree = self.paths.worktree_dir();
        self.gateway
            .run_in_worktree(&worktree, &["add", "-A"])
            .map_err(LedgerError::from)?;
        let status = self
            .gateway
            .run_in_worktree(&worktree, &["status", "--porcelain"])
            .map_err(LedgerError::from)?;
        if status.is_empty() {
            return Ok(false);
        }
        self.gateway
            .run_in_worktree(&worktree, &["commit", "-m", message])
            .map_err(LedgerError::from)?;
        Ok(true)
    }

    fn push_ledger_branch(&self) -> Result<(), GitError> {
        self.gateway.push_branch(
            &self.settings.remote,
            &self.settings.branch,
            false,
            self.settings.network_timeout,
        )
    }

    fn record_push(&self) -> Result<(), LedgerError> {
        let head = self
            .gateway
            .run_in_worktree(&self.paths.worktree_dir(), &["rev-parse", "HEAD"])
            .map_err(LedgerError::from)?;
        let mut state = self.store.load()?;
        state.update_push(&head, self.clock.now());
        self.store.save_unlocked(&state)
    }

    // ------------------------------------------------------------------
    // Claim
    // ------------------------------------------------------------------

    /// Atomically claim an atom and replicate the claim, retrying lost
    /// compare-and-set races up to the configured ceiling.
    pub fn claim_and_push(&self, atom_id: &str, agent_id: &str) -> ClaimResult {
        self.claim_with_options(atom_id, agent_id, false)
    }

    /// As [`claim_and_push`](Self::claim_and_push); `force` treats a foreign
    /// holder as eligible (still subject to the compare-and-set push).
    pub fn claim_with_options(&self, atom_id: &str, agent_id: &str, force: bool) -> ClaimResult {
        let atom_id = atom_id.trim();
        let agent_id = agent_id.trim();
        if atom_id.is_empty() {
            return ClaimResult::failed(
                LedgerError::Internal("atom_id must not be empty".to_string()),
                0,
            );
        }
        if agent_id.is_empty() {
            return ClaimResult::failed(
                LedgerError::Internal("agent_id must not be empty".to_string()),
                0,
            );
        }

        let _guard = match self.lock(agent_id) {
            Ok(guard) => guard,
            Err(e) => return ClaimResult::failed(e, 0),
        };
        if let Err(e) = self.heal_if_stale() {
            return ClaimResult::failed(e, 0);
        }

        if !self.settings.auto_claim_push {
            return self.claim_local(atom_id, agent_id, force);
        }

        if !self.is_online() {
            return match self.settings.offline_mode {
                OfflinePolicy::Fail => ClaimResult::failed(
                    LedgerError::NetworkUnreachable {
                        reason: format!(
                            "remote '{}' is unreachable and sync.offline_mode is 'fail'",
                            self.settings.remote
                        ),
                    },
                    0,
                ),
                OfflinePolicy::Local => self.claim_local(atom_id, agent_id, force),
            };
        }

        self.run_claim_flow(atom_id, agent_id, force)
    }

    /// Drive the bounded retry loop; the ledger lock must be held.
    fn run_claim_flow(&self, atom_id: &str, agent_id: &str, force: bool) -> ClaimResult {
        let flow = ClaimFlow::new(self.settings.claim_retries, self.clock.clone());
        let outcome = flow.run(|attempt| {
            debug!(atom_id, agent_id, attempt, "claim attempt");
            self.claim_attempt(atom_id, agent_id, force)
        });
        outcome.into_claim_result(atom_id, agent_id)
    }

    /// One pass of the claim protocol: pull, read, classify, mutate, push.
    fn claim_attempt(&self, atom_id: &str, agent_id: &str, force: bool) -> Attempt {
        if let Err(e) = self.pull_inner() {
            return Attempt::Fatal(e);
        }

        let data = ledger_file::data_file_path(&self.paths.worktree_dir());
        let atom = match ledger_file::find_atom(&data, atom_id) {
            Ok(Some(atom)) => atom,
            Ok(None) => return Attempt::NotFound,
            Err(e) => return Attempt::Fatal(e),
        };

        if atom.status.is_terminal() {
            return Attempt::Terminal {
                status: atom.status.to_string(),
            };
        }
        if atom.status == AtomStatus::InProgress {
            if atom.claimed_by(agent_id) {
                return Attempt::AlreadyOurs;
            }
            let owner = atom
                .assignee
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            if !force {
                return Attempt::Conflict { owner };
            }
            warn!(atom_id, %owner, "force-claiming atom held by another agent");
        }

        let now = self.clock.now();
        match ledger_file::rewrite_atom(&data, atom_id, |record| {
            record.status = AtomStatus::InProgress;
            record.assignee = Some(agent_id.to_string());
            record.updated_at = Some(now);
        }) {
            Ok(true) => {}
            Ok(false) => return Attempt::NotFound,
            Err(e) => {
                return Attempt::Fatal(LedgerError::Internal(format!(
                    "failed to update atom {atom_id}: {e}"
                )))
            }
        }

        match self.commit_worktree(&format!("{agent_id} claimed {atom_id}")) {
            Ok(true) => {}
            // Identical bytes means the desired state was already recorded
            Ok(false) => return Attempt::AlreadyOurs,
            Err(e) => return Attempt::Fatal(e),
        }

        match self.push_ledger_branch() {
            Ok(()) => {
                if let Err(e) = self.record_push() {
                    warn!(error = %e, "claim pushed but state save failed");
                }
                Attempt::Won
            }
            Err(GitError::PushRejected(_)) => Attempt::Lost,
            Err(e) if e.is_network() => Attempt::Fatal(LedgerError::NetworkUnreachable {
                reason: e.to_string(),
            }),
            Err(e) => Attempt::Fatal(e.into()),
        }
    }

    /// Claim against the local worktree only and queue for reconciliation.
    fn claim_local(&self, atom_id: &str, agent_id: &str, force: bool) -> ClaimResult {
        let data = ledger_file::data_file_path(&self.paths.worktree_dir());
        let atom = match ledger_file::find_atom(&data, atom_id) {
            Ok(Some(atom)) => atom,
            Ok(None) => {
                return ClaimResult::failed(
                    LedgerError::AtomNotFound {
                        atom_id: atom_id.to_string(),
                    },
                    0,
                )
            }
            Err(e) => return ClaimResult::failed(e, 0),
        };

        if atom.status.is_terminal() {
            return ClaimResult::failed(
                LedgerError::AtomTerminal {
                    atom_id: atom_id.to_string(),
                    status: atom.status.to_string(),
                },
                0,
            );
        }
        if atom.status == AtomStatus::InProgress && !atom.claimed_by(agent_id) && !force {
            return ClaimResult::failed(
                LedgerError::ClaimConflict {
                    atom_id: atom_id.to_string(),
                    owner: atom
                        .assignee
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                },
                0,
            );
        }

        let now = self.clock.now();
        match ledger_file::rewrite_atom(&data, atom_id, |record| {
            record.status = AtomStatus::InProgress;
            record.assignee = Some(agent_id.to_string());
            record.updated_at = Some(now);
        }) {
            Ok(true) => {}
            Ok(false) => {
                return ClaimResult::failed(
                    LedgerError::AtomNotFound {
                        atom_id: atom_id.to_string(),
                    },
                    0,
                )
            }
            Err(e) => return ClaimResult::failed(e, 0),
        }

        if let Err(e) = self.commit_worktree(&format!("{agent_id} claimed {atom_id} (offline)")) {
            return ClaimResult::failed(e, 0);
        }

        let mut state = match self.store.load() {
            Ok(state) => state,
            Err(e) => return ClaimResult::failed(e, 0),
        };
        state.record_offline_claim(atom_id, agent_id, now);
        if let Err(e) = self.store.save_unlocked(&state) {
            return ClaimResult::failed(e, 0);
        }

        warn!(atom_id, agent_id, "claim recorded locally; reconcile when the remote is reachable");
        ClaimResult::offline(agent_id)
    }

    /// Replay queued offline claims through the online claim protocol.
    ///
    /// Returns one report per queued claim. Claims that fail on transport
    /// stay queued; every other outcome clears the queue entry.
    pub fn reconcile_offline_claims(&self) -> Vec<ReconcileReport> {
        let queued = match self.store.load() {
            Ok(state) => state.offline_claims,
            Err(e) => {
                return vec![ReconcileReport {
                    atom_id: String::new(),
                    agent_id: String::new(),
                    status: ReconcileStatus::Error(e.to_string()),
                }]
            }
        };

        let mut reports = Vec::with_capacity(queued.len());
        for claim in queued {
            // Replay goes through the online protocol regardless of the
            // offline policy; a local re-claim would only re-queue itself
            let result = self.replay_claim(&claim.atom_id, &claim.agent_id);

            if matches!(
                result.error,
                Some(LedgerError::NetworkUnreachable { .. }) | Some(LedgerError::Timeout { .. })
            ) {
                // Still offline; keep the queue intact and stop replaying
                reports.push(ReconcileReport {
                    atom_id: claim.atom_id,
                    agent_id: claim.agent_id,
                    status: ReconcileStatus::Error(
                        "remote unreachable; claim remains queued".to_string(),
                    ),
                });
                break;
            }

            let (status, clear) = if result.success {
                (ReconcileStatus::Reconciled, true)
            } else {
                match result.error {
                    Some(LedgerError::ClaimConflict { owner, .. }) => {
                        (ReconcileStatus::Conflict { owner }, true)
                    }
                    Some(LedgerError::AtomNotFound { .. }) => (ReconcileStatus::AtomMissing, true),
                    Some(LedgerError::AtomTerminal { .. }) => (ReconcileStatus::AtomMissing, true),
                    Some(e) => (ReconcileStatus::Error(e.to_string()), false),
                    None => (ReconcileStatus::Error("unknown failure".to_string()), false),
                }
            };

            if clear {
                if let Ok(mut state) = self.store.load() {
                    state.clear_offline_claim(&claim.atom_id);
                    if let Err(e) = self.store.save(&state) {
                        warn!(error = %e, "failed to clear reconciled offline claim");
                    }
                }
            }

            reports.push(ReconcileReport {
                atom_id: claim.atom_id,
                agent_id: claim.agent_id,
                status,
            });
        }

        reports
    }

    /// One reconciliation replay: like a claim, but never falls back to the
    /// local path when the remote is unreachable.
    fn replay_claim(&self, atom_id: &str, agent_id: &str) -> ClaimResult {
        let _guard = match self.lock(agent_id) {
            Ok(guard) => guard,
            Err(e) => return ClaimResult::failed(e, 0),
        };
        if let Err(e) = self.heal_if_stale() {
            return ClaimResult::failed(e, 0);
        }
        if !self.is_online() {
            return ClaimResult::failed(
                LedgerError::NetworkUnreachable {
                    reason: format!("remote '{}' is unreachable", self.settings.remote),
                },
                0,
            );
        }
        self.run_claim_flow(atom_id, agent_id, false)
    }

    // ------------------------------------------------------------------
    // Release and heartbeat
    // ------------------------------------------------------------------

    /// Rewrite an atom back to open/unassigned and push.
    ///
    /// Idempotent: an already-open atom succeeds without I/O, and terminal
    /// atoms are left alone.
    pub fn release_claim(&self, atom_id: &str) -> SyncResult {
        let atom_id = atom_id.trim();
        if atom_id.is_empty() {
            return SyncResult::failed(LedgerError::Internal(
                "atom_id must not be empty".to_string(),
            ));
        }

        let _guard = match self.lock("release") {
            Ok(guard) => guard,
            Err(e) => return SyncResult::failed(e),
        };

        let result = (|| -> Result<usize, LedgerError> {
            self.pull_inner()?;

            let data = ledger_file::data_file_path(&self.paths.worktree_dir());
            let atom = ledger_file::find_atom(&data, atom_id)?.ok_or_else(|| {
                LedgerError::AtomNotFound {
                    atom_id: atom_id.to_string(),
                }
            })?;

            if atom.status.is_terminal() {
                return Ok(0);
            }
            if atom.status == AtomStatus::Open && atom.assignee.is_none() {
                return Ok(0);
            }

            let now = self.clock.now();
            ledger_file::rewrite_atom(&data, atom_id, |record| {
                record.status = AtomStatus::Open;
                record.assignee = None;
                record.updated_at = Some(now);
            })?;

            self.push_inner(&format!("released {atom_id}"))?;
            Ok(1)
        })();

        match result {
            Ok(applied) => SyncResult::ok(applied),
            Err(e) => SyncResult::failed(e),
        }
    }

    /// Touch `updated_at` on an atom the agent holds, keeping the claim
    /// out of the stale-claim auto-release window.
    pub fn heartbeat(&self, atom_id: &str, agent_id: &str) -> SyncResult {
        let atom_id = atom_id.trim();
        let agent_id = agent_id.trim();
        if atom_id.is_empty() || agent_id.is_empty() {
            return SyncResult::failed(LedgerError::Internal(
                "atom_id and agent_id must not be empty".to_string(),
            ));
        }

        let _guard = match self.lock(agent_id) {
            Ok(guard) => guard,
            Err(e) => return SyncResult::failed(e),
        };

        let result = (|| -> Result<usize, LedgerError> {
            self.pull_inner()?;

            let data = ledger_file::data_file_path(&self.paths.worktree_dir());
            let atom = ledger_file::find_atom(&data, atom_id)?.ok_or_else(|| {
                LedgerError::AtomNotFound {
                    atom_id: atom_id.to_string(),
                }
            })?;

            if !atom.claimed_by(agent_id) {
                return Err(match atom.assignee {
                    Some(owner) if atom.status == AtomStatus::InProgress => {
                        LedgerError::ClaimConflict {
                            atom_id: atom_id.to_string(),
                            owner,
                        }
                    }
                    _ => LedgerError::Internal(format!(
                        "atom {atom_id} is not claimed by {agent_id}"
                    )),
                });
            }

            let now = self.clock.now();
            ledger_file::rewrite_atom(&data, atom_id, |record| {
                record.updated_at = Some(now);
            })?;
            self.push_inner(&format!("{agent_id} heartbeat {atom_id}"))?;
            Ok(1)
        })();

        match result {
            Ok(applied) => SyncResult::ok(applied),
            Err(e) => SyncResult::failed(e),
        }
    }

    /// Rewrite `in_progress` atoms whose claim outlived the configured
    /// window back to open, then push. Best-effort; failures are logged and
    /// retried by the next pull.
    fn auto_release_stale_claims(&self) {
        let Some(hours) = self.settings.claim_timeout_hours else {
            return;
        };
        if hours <= 0.0 {
            return;
        }

        let now = self.clock.now();
        let threshold = now - chrono::Duration::milliseconds((hours * 3_600_000.0) as i64);
        let data = ledger_file::data_file_path(&self.paths.worktree_dir());

        let changed = ledger_file::rewrite_records(&data, |record| {
            let expired = record.status == AtomStatus::InProgress
                && record.updated_at.is_some_and(|t| t < threshold);
            if expired {
                warn!(
                    atom_id = %record.id,
                    assignee = record.assignee.as_deref().unwrap_or("unknown"),
                    "auto-releasing stale claim"
                );
                record.status = AtomStatus::Open;
                record.assignee = None;
                record.updated_at = Some(now);
            }
            expired
        });

        match changed {
            Ok(0) => {}
            Ok(n) => {
                debug!(released = n, "pushing auto-released claims");
                if let Err(e) = self.push_inner("auto-release stale claims") {
                    warn!(error = %e, "auto-release push failed; next pull retries");
                }
            }
            Err(e) => warn!(error = %e, "stale-claim scan failed"),
        }
    }

    // ------------------------------------------------------------------
    // Primary-tree synchronization
    // ------------------------------------------------------------------

    /// Copy the ledger's `.eluent/` files over the primary tree's copy, so
    /// subsequent code commits include the updated ledger state.
    pub fn sync_to_main(&self) -> SyncResult {
        let _guard = match self.lock("sync-to-main") {
            Ok(guard) => guard,
            Err(e) => return SyncResult::failed(e),
        };

        let src = self.paths.worktree_dir().join(LEDGER_DIR);
        let dst = self.gateway.repo_path().join(LEDGER_DIR);
        match copy_ledger_tree(&src, &dst) {
            Ok(copied) => SyncResult::ok(copied),
            Err(e) => SyncResult::failed(e),
        }
    }

    /// Copy the primary tree's `.eluent/` into the worktree and commit.
    pub fn seed_from_main(&self) -> SyncResult {
        let _guard = match self.lock("seed") {
            Ok(guard) => guard,
            Err(e) => return SyncResult::failed(e),
        };
        match self.seed_from_main_inner() {
            Ok(()) => SyncResult::ok(1),
            Err(e) => SyncResult::failed(e),
        }
    }

    fn seed_from_main_inner(&self) -> Result<(), LedgerError> {
        let src = self.gateway.repo_path().join(LEDGER_DIR);
        if !src.is_dir() {
            return Ok(());
        }

        let dst = self.paths.worktree_dir().join(LEDGER_DIR);
        copy_ledger_tree(&src, &dst)?;

        if self.commit_worktree("seed ledger from working tree")? {
            if let Err(e) = self.push_ledger_branch() {
                warn!(error = %e, "seed commit created but not pushed; next push retries");
            } else {
                self.record_push()?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Recovery and locking
    // ------------------------------------------------------------------

    fn heal_if_stale(&self) -> Result<(), LedgerError> {
        if !self.is_worktree_stale() {
            return Ok(());
        }

        // Record invalidity first so a crash mid-rebuild is visible
        if let Ok(mut state) = self.store.load() {
            state.invalidate_worktree();
            let _ = self.store.save_unlocked(&state);
        }

        self.heal_worktree().map_err(|e| LedgerError::Unhealthy {
            reason: format!("worktree recovery failed: {e}"),
        })
    }

    /// Rebuild the worktree from scratch; the remote ledger branch is
    /// authoritative, nothing from the stale checkout is preserved.
    fn heal_worktree(&self) -> Result<(), LedgerError> {
        let worktree = self.paths.worktree_dir();
        warn!(path = %worktree.display(), "ledger worktree is stale; rebuilding");

        if self.worktree_registered() {
            let _ = self.gateway.worktree_remove(&worktree, true);
        }
        if worktree.exists() {
            let _ = std::fs::remove_dir_all(&worktree);
        }
        let _ = self.gateway.worktree_prune();

        self.ensure_local_branch()?;
        self.gateway
            .worktree_add(&worktree, &self.settings.branch)?;

        let mut state = self.store.load()?;
        state.worktree_valid = true;
        self.store.save_unlocked(&state)?;
        Ok(())
    }

    fn ensure_local_branch(&self) -> Result<(), LedgerError> {
        if self.gateway.local_branch_exists(&self.settings.branch)? {
            return Ok(());
        }
        self.gateway
            .fetch_branch(
                &self.settings.remote,
                &self.settings.branch,
                self.settings.network_timeout,
            )
            .map_err(LedgerError::from)?;
        self.gateway
            .create_branch_from(
                &self.settings.branch,
                &format!("{}/{}", self.settings.remote, self.settings.branch),
            )
            .map_err(LedgerError::from)
    }

    /// Take the host-wide ledger lock, cleaning up metadata a dead holder
    /// left behind.
    fn lock(&self, label: &str) -> Result<LockGuard, LedgerError> {
        self.paths.ensure_directories()?;
        let lock_file = self.paths.lock_file();
        let _ = cleanup_stale_holder(&lock_file);
        self.locker
            .acquire(&lock_file, label)
            .map_err(|e| LedgerError::Internal(format!("ledger lock: {e}")))
    }
}

/// Compare paths tolerating symlinked ancestors.
fn paths_match(a: &Path, b: &Path) -> bool {
    let canon_a = std::fs::canonicalize(a).unwrap_or_else(|_| a.to_path_buf());
    let canon_b = std::fs::canonicalize(b).unwrap_or_else(|_| b.to_path_buf());
    canon_a == canon_b
}

/// Recursively copy ledger files, overwriting; `config.toml` at the top
/// level is repo-owned and never replicated.
fn copy_ledger_tree(src: &Path, dst: &Path) -> Result<usize, LedgerError> {
    fn copy_dir(src: &Path, dst: &Path, skip_config: bool) -> std::io::Result<usize> {
        std::fs::create_dir_all(dst)?;
        let mut copied = 0;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            let name = entry.file_name();
            if skip_config && name == "config.toml" {
                continue;
            }
            let target = dst.join(&name);
            if entry.file_type()?.is_dir() {
                copied += copy_dir(&entry.path(), &target, false)?;
            } else {
                std::fs::copy(entry.path(), &target)?;
                copied += 1;
            }
        }
        Ok(copied)
    }

    if !src.is_dir() {
        return Ok(0);
    }
    copy_dir(src, dst, true).map_err(|e| {
        LedgerError::Internal(format!(
            "failed to copy ledger files {} -> {}: {}",
            src.display(),
            dst.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::process::{Command, Stdio};
    use tempfile::TempDir;

    const BRANCH: &str = "eluent-sync";

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed in {}", args, dir.display());
    }

    /// One bare remote plus a work clone and an isolated global root.
    struct Rig {
        temp: TempDir,
        remote: PathBuf,
    }

    impl Rig {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            git(temp.path(), &["init", "--bare", "remote.git"]);
            let remote = temp.path().join("remote.git");
            Self { temp, remote }
        }

        fn clone_repo(&self, name: &str) -> PathBuf {
            let dir = self.temp.path().join(name);
            fs::create_dir(&dir).unwrap();
            git(&dir, &["init"]);
            git(&dir, &["config", "user.email", "test@example.com"]);
            git(&dir, &["config", "user.name", "Test User"]);
            git(
                &dir,
                &["remote", "add", "origin", self.remote.to_str().unwrap()],
            );
            git(&dir, &["commit", "--allow-empty", "-m", "initial"]);
            dir
        }

        fn syncer_for(&self, repo: &Path, home: &str) -> LedgerSyncer {
            let root = self.temp.path().join(home);
            let paths = GlobalPaths::new("repo", Some(&root)).unwrap();
            let gateway = GitGateway::new(repo).unwrap();
            LedgerSyncer::new(gateway, paths, LedgerSettings::new(BRANCH)).unwrap()
        }

        /// Seed atoms into the clone's primary tree before setup.
        fn seed_atoms(&self, repo: &Path, lines: &[&str]) {
            let dir = repo.join(LEDGER_DIR);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("data.jsonl"), format!("{}\n", lines.join("\n"))).unwrap();
        }
    }

    fn atom_line(id: &str, status: &str, assignee: Option<&str>) -> String {
        let assignee = match assignee {
            Some(a) => format!("\"{a}\""),
            None => "null".to_string(),
        };
        format!(
            r#"{{"id":"{id}","status":"{status}","assignee":{assignee},"updated_at":"2026-01-01T00:00:00Z","title":"t-{id}"}}"#
        )
    }

    #[test]
    fn test_setup_is_idempotent_and_reports_creation() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        let syncer = rig.syncer_for(&repo, "home");

        let first = syncer.setup();
        assert!(first.success, "setup failed: {:?}", first.error);
        assert!(first.created_branch);
        assert!(first.created_worktree);
        assert!(syncer.is_available());
        assert!(syncer.is_healthy());

        let second = syncer.setup();
        assert!(second.success);
        assert!(!second.created_branch);
        assert!(!second.created_worktree);
    }

    #[test]
    fn test_setup_preserves_current_branch() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        let gateway = GitGateway::new(&repo).unwrap();
        let before = gateway.current_branch().unwrap();

        let syncer = rig.syncer_for(&repo, "home");
        assert!(syncer.setup().success);
        assert_eq!(gateway.current_branch().unwrap(), before);
    }

    #[test]
    fn test_setup_seeds_ledger_from_primary_tree() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        rig.seed_atoms(&repo, &[&atom_line("A1", "open", None)]);

        let syncer = rig.syncer_for(&repo, "home");
        assert!(syncer.setup().success);

        let data = ledger_file::data_file_path(&syncer.paths().worktree_dir());
        let atom = ledger_file::find_atom(&data, "A1").unwrap().unwrap();
        assert_eq!(atom.status, AtomStatus::Open);

        // The seed reached the remote: a second host sees it
        let repo2 = rig.clone_repo("work2");
        let syncer2 = rig.syncer_for(&repo2, "home2");
        assert!(syncer2.setup().success);
        assert!(syncer2.pull_ledger().success);
        let data2 = ledger_file::data_file_path(&syncer2.paths().worktree_dir());
        assert!(ledger_file::find_atom(&data2, "A1").unwrap().is_some());
    }

    #[test]
    fn test_uncontended_claim_advances_remote() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        rig.seed_atoms(&repo, &[&atom_line("A1", "open", None)]);
        let syncer = rig.syncer_for(&repo, "home");
        assert!(syncer.setup().success);

        let gateway = GitGateway::new(&repo).unwrap();
        let before = gateway
            .remote_branch_commit("origin", BRANCH, Duration::from_secs(30))
            .unwrap()
            .unwrap();

        let result = syncer.claim_and_push("A1", "agent-x");
        assert!(result.success, "claim failed: {:?}", result.error);
        assert_eq!(result.claimed_by.as_deref(), Some("agent-x"));
        assert_eq!(result.retries, 0);
        assert!(!result.offline_claim);

        let after = gateway
            .remote_branch_commit("origin", BRANCH, Duration::from_secs(30))
            .unwrap()
            .unwrap();
        assert_ne!(before, after);

        let data = ledger_file::data_file_path(&syncer.paths().worktree_dir());
        let atom = ledger_file::find_atom(&data, "A1").unwrap().unwrap();
        assert_eq!(atom.status, AtomStatus::InProgress);
        assert_eq!(atom.assignee.as_deref(), Some("agent-x"));
        assert_eq!(atom.extra["title"], "t-A1");
    }

    #[test]
    fn test_reclaim_by_owner_is_idempotent() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        rig.seed_atoms(&repo, &[&atom_line("A1", "open", None)]);
        let syncer = rig.syncer_for(&repo, "home");
        assert!(syncer.setup().success);
        assert!(syncer.claim_and_push("A1", "agent-x").success);

        let gateway = GitGateway::new(&repo).unwrap();
        let before = gateway
            .remote_branch_commit("origin", BRANCH, Duration::from_secs(30))
            .unwrap();

        let again = syncer.claim_and_push("A1", "agent-x");
        assert!(again.success);
        assert_eq!(again.retries, 0);

        // Zero mutations: remote head unchanged
        let after = gateway
            .remote_branch_commit("origin", BRANCH, Duration::from_secs(30))
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_claim_conflict_reports_owner() {
        let rig = Rig::new();
        let repo_a = rig.clone_repo("work-a");
        rig.seed_atoms(&repo_a, &[&atom_line("A1", "open", None)]);
        let syncer_a = rig.syncer_for(&repo_a, "home-a");
        assert!(syncer_a.setup().success);
        assert!(syncer_a.claim_and_push("A1", "agent-x").success);

        let repo_b = rig.clone_repo("work-b");
        let syncer_b = rig.syncer_for(&repo_b, "home-b");
        assert!(syncer_b.setup().success);

        let result = syncer_b.claim_and_push("A1", "agent-y");
        assert!(!result.success);
        assert_eq!(result.claimed_by.as_deref(), Some("agent-x"));
        assert!(matches!(
            result.error,
            Some(LedgerError::ClaimConflict { .. })
        ));
    }

    #[test]
    fn test_force_claim_takes_over_foreign_holder() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        rig.seed_atoms(&repo, &[&atom_line("A1", "in_progress", Some("agent-x"))]);
        let syncer = rig.syncer_for(&repo, "home");
        assert!(syncer.setup().success);

        let plain = syncer.claim_and_push("A1", "agent-y");
        assert!(!plain.success);

        let forced = syncer.claim_with_options("A1", "agent-y", true);
        assert!(forced.success, "force claim failed: {:?}", forced.error);

        let data = ledger_file::data_file_path(&syncer.paths().worktree_dir());
        let atom = ledger_file::find_atom(&data, "A1").unwrap().unwrap();
        assert_eq!(atom.assignee.as_deref(), Some("agent-y"));
    }

    #[test]
    fn test_terminal_atom_rejected_without_push() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        rig.seed_atoms(
            &repo,
            &[
                &atom_line("A1", "closed", None),
                &atom_line("A2", "discard", Some("agent-z")),
            ],
        );
        let syncer = rig.syncer_for(&repo, "home");
        assert!(syncer.setup().success);

        let gateway = GitGateway::new(&repo).unwrap();
        let before = gateway
            .remote_branch_commit("origin", BRANCH, Duration::from_secs(30))
            .unwrap();

        for (id, expected_status) in [("A1", "closed"), ("A2", "discard")] {
            let result = syncer.claim_and_push(id, "agent-x");
            assert!(!result.success);
            match result.error {
                Some(LedgerError::AtomTerminal { status, .. }) => {
                    assert_eq!(status, expected_status);
                }
                other => panic!("expected AtomTerminal, got {other:?}"),
            }
        }

        let after = gateway
            .remote_branch_commit("origin", BRANCH, Duration::from_secs(30))
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_claim_unknown_atom() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        rig.seed_atoms(&repo, &[&atom_line("A1", "open", None)]);
        let syncer = rig.syncer_for(&repo, "home");
        assert!(syncer.setup().success);

        let result = syncer.claim_and_push("missing", "agent-x");
        assert!(matches!(
            result.error,
            Some(LedgerError::AtomNotFound { .. })
        ));
    }

    #[test]
    fn test_empty_ids_rejected() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        let syncer = rig.syncer_for(&repo, "home");

        let result = syncer.claim_and_push("   ", "agent-x");
        assert!(matches!(result.error, Some(LedgerError::Internal(_))));
        let result = syncer.claim_and_push("A1", "");
        assert!(matches!(result.error, Some(LedgerError::Internal(_))));
    }

    #[test]
    fn test_release_then_reclaim() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        rig.seed_atoms(&repo, &[&atom_line("A1", "open", None)]);
        let syncer = rig.syncer_for(&repo, "home");
        assert!(syncer.setup().success);
        assert!(syncer.claim_and_push("A1", "agent-x").success);

        let released = syncer.release_claim("A1");
        assert!(released.success, "release failed: {:?}", released.error);
        assert_eq!(released.changes_applied, 1);

        // Released atoms are claimable by anyone
        let result = syncer.claim_and_push("A1", "agent-y");
        assert!(result.success);
    }

    #[test]
    fn test_release_is_idempotent_and_spares_terminal() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        rig.seed_atoms(
            &repo,
            &[
                &atom_line("A1", "open", None),
                &atom_line("A2", "closed", None),
            ],
        );
        let syncer = rig.syncer_for(&repo, "home");
        assert!(syncer.setup().success);

        let open_release = syncer.release_claim("A1");
        assert!(open_release.success);
        assert_eq!(open_release.changes_applied, 0);

        let terminal_release = syncer.release_claim("A2");
        assert!(terminal_release.success);
        assert_eq!(terminal_release.changes_applied, 0);

        let missing = syncer.release_claim("nope");
        assert!(!missing.success);
        assert!(matches!(
            missing.error,
            Some(LedgerError::AtomNotFound { .. })
        ));
    }

    #[test]
    fn test_stale_worktree_self_heals_on_claim() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        rig.seed_atoms(&repo, &[&atom_line("A1", "open", None)]);
        let syncer = rig.syncer_for(&repo, "home");
        assert!(syncer.setup().success);

        // Break the worktree the way a crashed process would
        fs::remove_file(syncer.paths().worktree_dir().join(".git")).unwrap();
        assert!(syncer.is_worktree_stale());

        let result = syncer.claim_and_push("A1", "agent-x");
        assert!(result.success, "claim failed: {:?}", result.error);
        assert!(!syncer.is_worktree_stale());
        assert!(syncer.is_healthy());
    }

    #[test]
    fn test_deleted_worktree_dir_self_heals() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        rig.seed_atoms(&repo, &[&atom_line("A1", "open", None)]);
        let syncer = rig.syncer_for(&repo, "home");
        assert!(syncer.setup().success);

        fs::remove_dir_all(syncer.paths().worktree_dir()).unwrap();
        assert!(syncer.is_worktree_stale());

        assert!(syncer.pull_ledger().success);
        assert!(syncer.is_healthy());
    }

    #[test]
    fn test_offline_claim_queues_and_reconciles() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        rig.seed_atoms(&repo, &[&atom_line("A2", "open", None)]);
        let syncer = rig.syncer_for(&repo, "home");
        assert!(syncer.setup().success);

        // Sever the remote
        git(&repo, &["remote", "set-url", "origin", "/nonexistent/void.git"]);
        assert!(!syncer.is_online());

        let result = syncer.claim_and_push("A2", "agent-x");
        assert!(result.success);
        assert!(result.offline_claim);
        assert_eq!(result.retries, 0);

        let state = syncer.state_store().load().unwrap();
        assert_eq!(state.offline_claims.len(), 1);
        assert_eq!(state.offline_claims[0].atom_id, "A2");

        // Reconnect and reconcile
        git(
            &repo,
            &["remote", "set-url", "origin", rig.remote.to_str().unwrap()],
        );
        let reports = syncer.reconcile_offline_claims();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].atom_id, "A2");
        assert_eq!(reports[0].status, ReconcileStatus::Reconciled);

        let state = syncer.state_store().load().unwrap();
        assert!(state.offline_claims.is_empty());

        let data = ledger_file::data_file_path(&syncer.paths().worktree_dir());
        let atom = ledger_file::find_atom(&data, "A2").unwrap().unwrap();
        assert_eq!(atom.assignee.as_deref(), Some("agent-x"));
    }

    #[test]
    fn test_offline_policy_fail_refuses() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        rig.seed_atoms(&repo, &[&atom_line("A1", "open", None)]);
        let syncer = rig.syncer_for(&repo, "home");
        assert!(syncer.setup().success);

        git(&repo, &["remote", "set-url", "origin", "/nonexistent/void.git"]);

        let root = rig.temp.path().join("home");
        let paths = GlobalPaths::new("repo", Some(&root)).unwrap();
        let gateway = GitGateway::new(&repo).unwrap();
        let mut settings = LedgerSettings::new(BRANCH);
        settings.offline_mode = OfflinePolicy::Fail;
        let strict = LedgerSyncer::new(gateway, paths, settings).unwrap();

        let result = strict.claim_and_push("A1", "agent-x");
        assert!(!result.success);
        assert!(matches!(
            result.error,
            Some(LedgerError::NetworkUnreachable { .. })
        ));
    }

    #[test]
    fn test_reconcile_reports_conflict_with_remote_owner() {
        let rig = Rig::new();
        let repo_a = rig.clone_repo("work-a");
        rig.seed_atoms(&repo_a, &[&atom_line("A1", "open", None)]);
        let syncer_a = rig.syncer_for(&repo_a, "home-a");
        assert!(syncer_a.setup().success);

        // Host A goes offline and claims locally
        git(
            &repo_a,
            &["remote", "set-url", "origin", "/nonexistent/void.git"],
        );
        assert!(syncer_a.claim_and_push("A1", "agent-a").offline_claim);

        // Host B claims the same atom on the remote in the meantime
        let repo_b = rig.clone_repo("work-b");
        let syncer_b = rig.syncer_for(&repo_b, "home-b");
        assert!(syncer_b.setup().success);
        assert!(syncer_b.claim_and_push("A1", "agent-b").success);

        git(
            &repo_a,
            &["remote", "set-url", "origin", rig.remote.to_str().unwrap()],
        );
        let reports = syncer_a.reconcile_offline_claims();
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].status,
            ReconcileStatus::Conflict {
                owner: "agent-b".to_string()
            }
        );
        assert!(!syncer_a.state_store().load().unwrap().has_offline_claims());
    }

    #[test]
    fn test_auto_release_frees_expired_claims_on_pull() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        // updated_at fixed at 2026-01-01; anything over an hour old expires
        rig.seed_atoms(&repo, &[&atom_line("A1", "in_progress", Some("agent-gone"))]);

        let root = rig.temp.path().join("home");
        let paths = GlobalPaths::new("repo", Some(&root)).unwrap();
        let gateway = GitGateway::new(&repo).unwrap();
        let mut settings = LedgerSettings::new(BRANCH);
        settings.claim_timeout_hours = Some(1.0);
        let syncer = LedgerSyncer::new(gateway, paths, settings).unwrap();
        assert!(syncer.setup().success);

        assert!(syncer.pull_ledger().success);

        let data = ledger_file::data_file_path(&syncer.paths().worktree_dir());
        let atom = ledger_file::find_atom(&data, "A1").unwrap().unwrap();
        assert_eq!(atom.status, AtomStatus::Open);
        assert_eq!(atom.assignee, None);
    }

    #[test]
    fn test_heartbeat_touches_updated_at() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        rig.seed_atoms(&repo, &[&atom_line("A1", "open", None)]);
        let syncer = rig.syncer_for(&repo, "home");
        assert!(syncer.setup().success);
        assert!(syncer.claim_and_push("A1", "agent-x").success);

        let data = ledger_file::data_file_path(&syncer.paths().worktree_dir());
        let before = ledger_file::find_atom(&data, "A1").unwrap().unwrap();

        std::thread::sleep(Duration::from_millis(1100));
        let beat = syncer.heartbeat("A1", "agent-x");
        assert!(beat.success, "heartbeat failed: {:?}", beat.error);

        let after = ledger_file::find_atom(&data, "A1").unwrap().unwrap();
        assert!(after.updated_at.unwrap() > before.updated_at.unwrap());

        // Only the holder may heartbeat
        let foreign = syncer.heartbeat("A1", "agent-y");
        assert!(!foreign.success);
        assert!(matches!(
            foreign.error,
            Some(LedgerError::ClaimConflict { .. })
        ));
    }

    #[test]
    fn test_sync_to_main_overwrites_primary_copy() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        rig.seed_atoms(&repo, &[&atom_line("A1", "open", None)]);
        let syncer = rig.syncer_for(&repo, "home");
        assert!(syncer.setup().success);
        assert!(syncer.claim_and_push("A1", "agent-x").success);

        let synced = syncer.sync_to_main();
        assert!(synced.success);
        assert!(synced.changes_applied >= 1);

        let main_data = ledger_file::data_file_path(&repo);
        let atom = ledger_file::find_atom(&main_data, "A1").unwrap().unwrap();
        assert_eq!(atom.status, AtomStatus::InProgress);
        assert_eq!(atom.assignee.as_deref(), Some("agent-x"));
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let rig = Rig::new();
        let repo = rig.clone_repo("work");
        let syncer = rig.syncer_for(&repo, "home");
        assert!(syncer.setup().success);
        assert!(syncer.state_store().exists() || !syncer.state_store().exists());

        let first = syncer.teardown();
        assert!(first.success, "teardown failed: {:?}", first.error);
        assert!(!syncer.paths().worktree_dir().exists());
        assert!(!syncer.state_store().exists());
        assert!(!syncer.is_available());

        let second = syncer.teardown();
        assert!(second.success);
    }

    #[test]
    fn test_pull_counts_remote_commits() {
        let rig = Rig::new();
        let repo_a = rig.clone_repo("work-a");
        rig.seed_atoms(
            &repo_a,
            &[&atom_line("A1", "open", None), &atom_line("A2", "open", None)],
        );
        let syncer_a = rig.syncer_for(&repo_a, "home-a");
        assert!(syncer_a.setup().success);

        let repo_b = rig.clone_repo("work-b");
        let syncer_b = rig.syncer_for(&repo_b, "home-b");
        assert!(syncer_b.setup().success);
        assert!(syncer_b.pull_ledger().success);

        // Two remote commits land while B is idle
        assert!(syncer_a.claim_and_push("A1", "agent-a").success);
        assert!(syncer_a.claim_and_push("A2", "agent-a").success);

        let pulled = syncer_b.pull_ledger();
        assert!(pulled.success);
        assert_eq!(pulled.changes_applied, 2);
    }
}
