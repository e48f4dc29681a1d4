//! Durable sync metadata with atomic writes and corruption recovery.
//!
//! One JSON file per repository (`.ledger-sync-state` under the per-repo
//! global directory) records the last pull/push, the last known head of the
//! ledger branch, worktree validity, and the queue of claims made while
//! offline. The file is advisory bookkeeping: losing it is never fatal, and
//! a corrupt file resets to defaults with a warning instead of failing the
//! operation that touched it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use super::lock::LedgerLock;
use super::LedgerError;
use crate::domain::lenient_datetime;

/// Current on-disk schema version.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Upper bound on the offline-claim queue; oldest entries drop first.
pub const MAX_OFFLINE_CLAIMS: usize = 1000;

/// Atom and agent ids are truncated to this many characters before storage.
pub const MAX_ID_LEN: usize = 256;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// A claim performed while the remote was unreachable, awaiting
/// reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineClaim {
    pub atom_id: String,
    pub agent_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// Persisted sync metadata for one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// When the ledger worktree last successfully pulled
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub last_pull_at: Option<DateTime<Utc>>,
    /// When this host last successfully pushed the ledger branch
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub last_push_at: Option<DateTime<Utc>>,
    /// Remote head observed at the last successful pull or push
    #[serde(default)]
    pub ledger_head: Option<String>,
    /// Cleared when the worktree is known to need a rebuild
    #[serde(default = "default_true")]
    pub worktree_valid: bool,
    /// Claims queued while offline, oldest first
    #[serde(default)]
    pub offline_claims: Vec<OfflineClaim>,
}

fn default_schema_version() -> u32 {
    // A state file without a version predates versioning
    1
}

fn default_true() -> bool {
    true
}

impl Default for LedgerState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            last_pull_at: None,
            last_push_at: None,
            ledger_head: None,
            worktree_valid: true,
            offline_claims: Vec::new(),
        }
    }
}

impl LedgerState {
    /// Record a successful pull of the ledger branch.
    pub fn update_pull(&mut self, head: &str, at: DateTime<Utc>) {
        self.last_pull_at = Some(at);
        self.ledger_head = Some(head.to_string());
        self.worktree_valid = true;
    }

    /// Record a successful push of the ledger branch.
    pub fn update_push(&mut self, head: &str, at: DateTime<Utc>) {
        self.last_push_at = Some(at);
        self.ledger_head = Some(head.to_string());
    }

    /// Mark the worktree as needing a rebuild before the next operation.
    pub fn invalidate_worktree(&mut self) {
        self.worktree_valid = false;
    }

    /// Queue an offline claim, most-recent-wins per atom, bounded.
    pub fn record_offline_claim(&mut self, atom_id: &str, agent_id: &str, claimed_at: DateTime<Utc>) {
        let atom_id = normalize_id(atom_id);
        let agent_id = normalize_id(agent_id);

        // A newer claim for the same atom replaces the old entry
        self.offline_claims.retain(|c| c.atom_id != atom_id);
        self.offline_claims.push(OfflineClaim {
            atom_id,
            agent_id,
            claimed_at,
        });

        while self.offline_claims.len() > MAX_OFFLINE_CLAIMS {
            let dropped = self.offline_claims.remove(0);
            warn!(
                atom_id = %dropped.atom_id,
                "offline claim queue full; dropping oldest entry"
            );
        }
    }

    /// Remove the queued claim for an atom; returns whether one existed.
    pub fn clear_offline_claim(&mut self, atom_id: &str) -> bool {
        let atom_id = normalize_id(atom_id);
        let before = self.offline_claims.len();
        self.offline_claims.retain(|c| c.atom_id != atom_id);
        self.offline_claims.len() != before
    }

    pub fn has_offline_claims(&self) -> bool {
        !self.offline_claims.is_empty()
    }
}

/// Trim whitespace and truncate to the documented maximum length.
fn normalize_id(id: &str) -> String {
    let trimmed = id.trim();
    trimmed.chars().take(MAX_ID_LEN).collect()
}

/// Owns the state file path and performs locked, atomic persistence.
#[derive(Debug, Clone)]
pub struct LedgerStateStore {
    path: PathBuf,
    lock_path: PathBuf,
    locker: LedgerLock,
}

impl LedgerStateStore {
    pub fn new(path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_path: lock_path.into(),
            locker: LedgerLock::new(LOCK_TIMEOUT),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the state, recovering from corruption.
    ///
    /// Missing file yields defaults. An unparsable file warns once, deletes
    /// the file, and yields defaults. A file written by a newer tool version
    /// is the one case that refuses.
    pub fn load(&self) -> Result<LedgerState, LedgerError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LedgerState::default())
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "sync state unreadable; using defaults");
                return Ok(LedgerState::default());
            }
        };

        let mut state: LedgerState = match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "sync state corrupt; resetting to defaults"
                );
                let _ = fs::remove_file(&self.path);
                return Ok(LedgerState::default());
            }
        };

        self.migrate(&mut state)?;
        Ok(state)
    }

    /// Bring an older on-disk schema up to the current version.
    ///
    /// # Errors
    ///
    /// `SchemaTooNew` when the file was written by a newer tool.
    pub fn migrate(&self, state: &mut LedgerState) -> Result<(), LedgerError> {
        if state.schema_version > STATE_SCHEMA_VERSION {
            return Err(LedgerError::SchemaTooNew {
                found: state.schema_version,
                supported: STATE_SCHEMA_VERSION,
            });
        }
        // Forward migrations slot in here as the schema grows
        state.schema_version = STATE_SCHEMA_VERSION;
        Ok(())
    }

    /// Persist the state, serializing writers via the ledger lock.
    pub fn save(&self, state: &LedgerState) -> Result<(), LedgerError> {
        let _guard = self
            .locker
            .acquire(&self.lock_path, "state-save")
            .map_err(|e| LedgerError::Internal(format!("ledger lock: {e}")))?;
        self.save_unlocked(state)
    }

    /// Persist without taking the lock; the caller already holds it for the
    /// duration of the enclosing ledger operation.
    pub fn save_unlocked(&self, state: &LedgerState) -> Result<(), LedgerError> {
        let io_err = |e: std::io::Error| {
            LedgerError::Internal(format!(
                "failed to save sync state {}: {}",
                self.path.display(),
                e
            ))
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| LedgerError::Internal(format!("failed to serialize sync state: {e}")))?;

        let temp_path = self
            .path
            .with_extension(format!("tmp.{}", std::process::id()));
        let result = (|| -> Result<(), LedgerError> {
            fs::write(&temp_path, json).map_err(io_err)?;
            let file = File::open(&temp_path).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
            drop(file);
            fs::rename(&temp_path, &self.path).map_err(io_err)?;
            if let Some(dir) = self.path.parent() {
                if let Ok(dir_file) = File::open(dir) {
                    let _ = dir_file.sync_all();
                }
            }
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }

    /// Delete the state file and return defaults.
    pub fn reset(&self) -> LedgerState {
        let _ = fs::remove_file(&self.path);
        LedgerState::default()
    }

    /// Remove the state and lock files entirely (teardown).
    pub fn delete_files(&self) {
        let _ = fs::remove_file(&self.path);
        let _ = fs::remove_file(&self.lock_path);
        let _ = fs::remove_file(self.lock_path.with_extension("lock.meta"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> LedgerStateStore {
        LedgerStateStore::new(
            temp.path().join(".ledger-sync-state"),
            temp.path().join(".ledger.lock"),
        )
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let temp = TempDir::new().unwrap();
        let state = store(&temp).load().unwrap();

        assert_eq!(state, LedgerState::default());
        assert_eq!(state.schema_version, STATE_SCHEMA_VERSION);
        assert!(state.worktree_valid);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        let mut state = LedgerState::default();
        state.update_pull("abc123", ts(0));
        state.update_push("def456", ts(10));
        state.record_offline_claim("A1", "agent-x", ts(20));

        store.save(&state).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.ledger_head.as_deref(), Some("def456"));
    }

    #[test]
    fn test_corrupt_file_resets_to_defaults() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        fs::write(store.path(), b"\xff\xfe not json \x00").unwrap();
        let state = store.load().unwrap();

        assert_eq!(state, LedgerState::default());
        // File deleted so the next save starts clean
        assert!(!store.exists());
        store.save(&state).unwrap();
        assert!(store.exists());
    }

    #[test]
    fn test_truncated_json_resets_to_defaults() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        fs::write(store.path(), r#"{"schema_version":1,"last_pu"#).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state, LedgerState::default());
    }

    #[test]
    fn test_missing_schema_version_treated_as_v1() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        fs::write(store.path(), r#"{"ledger_head":"abc"}"#).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.schema_version, STATE_SCHEMA_VERSION);
        assert_eq!(state.ledger_head.as_deref(), Some("abc"));
    }

    #[test]
    fn test_newer_schema_refused() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        fs::write(store.path(), r#"{"schema_version":99}"#).unwrap();
        let err = store.load().unwrap_err();
        assert!(matches!(err, LedgerError::SchemaTooNew { found: 99, .. }));
    }

    #[test]
    fn test_invalid_timestamp_loads_as_null() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        fs::write(
            store.path(),
            r#"{"schema_version":1,"last_pull_at":"yesterday-ish","ledger_head":"abc"}"#,
        )
        .unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.last_pull_at, None);
        assert_eq!(state.ledger_head.as_deref(), Some("abc"));
    }

    #[test]
    fn test_offline_claim_replaces_same_atom() {
        let mut state = LedgerState::default();
        state.record_offline_claim("A1", "agent-x", ts(0));
        state.record_offline_claim("A1", "agent-y", ts(5));

        assert_eq!(state.offline_claims.len(), 1);
        assert_eq!(state.offline_claims[0].agent_id, "agent-y");
        assert_eq!(state.offline_claims[0].claimed_at, ts(5));
    }

    #[test]
    fn test_offline_claim_ids_normalized() {
        let mut state = LedgerState::default();
        let long_id = "x".repeat(MAX_ID_LEN + 50);
        state.record_offline_claim(&format!("  {long_id}  "), "  agent-x ", ts(0));

        assert_eq!(state.offline_claims[0].atom_id.len(), MAX_ID_LEN);
        assert_eq!(state.offline_claims[0].agent_id, "agent-x");
    }

    #[test]
    fn test_offline_queue_bounded_drops_oldest() {
        let mut state = LedgerState::default();
        for i in 0..(MAX_OFFLINE_CLAIMS + 25) {
            state.record_offline_claim(&format!("atom-{i}"), "agent-x", ts(i as i64));
        }

        assert_eq!(state.offline_claims.len(), MAX_OFFLINE_CLAIMS);
        assert_eq!(state.offline_claims[0].atom_id, "atom-25");
        assert_eq!(
            state.offline_claims.last().unwrap().atom_id,
            format!("atom-{}", MAX_OFFLINE_CLAIMS + 24)
        );
    }

    #[test]
    fn test_clear_offline_claim() {
        let mut state = LedgerState::default();
        state.record_offline_claim("A1", "agent-x", ts(0));
        state.record_offline_claim("A2", "agent-x", ts(1));

        assert!(state.clear_offline_claim("A1"));
        assert!(!state.clear_offline_claim("A1"));
        assert!(state.has_offline_claims());
        assert!(state.clear_offline_claim("A2"));
        assert!(!state.has_offline_claims());
    }

    #[test]
    fn test_reset_deletes_file() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        store.save(&LedgerState::default()).unwrap();
        assert!(store.exists());

        let state = store.reset();
        assert_eq!(state, LedgerState::default());
        assert!(!store.exists());
    }

    #[test]
    fn test_no_temp_leftovers_after_save() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        store.save(&LedgerState::default()).unwrap();

        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}

// Property-based tests live alongside the example-based ones
#[cfg(test)]
#[path = "state_proptests.rs"]
mod proptests;
