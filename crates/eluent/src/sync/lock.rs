//! Advisory cross-process locking for the ledger worktree and state file.
//!
//! All mutating ledger operations on a host serialize through one lock file
//! (`.ledger.lock` under the per-repo global directory). Hosts serialize with
//! each other through push rejection, not through this lock.
//!
//! Locks are advisory (`flock` on Unix, `LockFileEx` on Windows via `fs4`)
//! and released automatically when the guard drops, including on panic. A
//! sidecar `.meta` file records the holder's PID and agent id so a stuck
//! claim can be diagnosed and a dead holder's leftovers cleaned up.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt as Fs4FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Holder metadata written alongside the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHolder {
    /// Process ID of the lock holder
    pub pid: u32,
    /// Agent identifier of the holder
    pub agent_id: String,
    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,
}

/// RAII guard; dropping it releases the lock and removes the metadata file.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    meta_path: Option<PathBuf>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // fs4 unlocks on close as well; explicit unlock keeps release prompt
        let _ = Fs4FileExt::unlock(&self.file);
        if let Some(ref meta_path) = self.meta_path {
            let _ = std::fs::remove_file(meta_path);
        }
    }
}

/// Exclusive advisory lock with a polling acquisition deadline.
#[derive(Debug, Clone)]
pub struct LedgerLock {
    timeout: Duration,
}

impl LedgerLock {
    /// Polling starts tight and relaxes up to this pause between attempts.
    const MAX_PAUSE: Duration = Duration::from_millis(50);

    /// Create a locker that gives up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Acquire the lock, blocking up to the configured timeout.
    ///
    /// Writes a `.meta` sidecar naming the holder; the sidecar is removed
    /// when the guard drops.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened or the lock is
    /// still held elsewhere when the deadline expires.
    pub fn acquire(&self, path: &Path, agent_id: &str) -> Result<LockGuard> {
        let file = Self::open_handle(path)?;
        let deadline = Instant::now() + self.timeout;
        let mut pause = Duration::from_millis(5);

        while !Fs4FileExt::try_lock_exclusive(&file)
            .with_context(|| format!("ledger lock I/O failure at {}", path.display()))?
        {
            if Instant::now() >= deadline {
                bail!(
                    "ledger lock at {} still held after {:?}; another eluent process may be mid-claim",
                    path.display(),
                    self.timeout
                );
            }
            std::thread::sleep(pause);
            pause = (pause * 2).min(Self::MAX_PAUSE);
        }

        let meta_path = Self::stamp_holder(path, agent_id)?;
        Ok(LockGuard {
            file,
            meta_path: Some(meta_path),
        })
    }

    /// Try to acquire without blocking; `None` if held elsewhere.
    pub fn try_acquire(&self, path: &Path) -> Result<Option<LockGuard>> {
        let file = Self::open_handle(path)?;
        let acquired = Fs4FileExt::try_lock_exclusive(&file)
            .with_context(|| format!("ledger lock I/O failure at {}", path.display()))?;
        Ok(acquired.then_some(LockGuard {
            file,
            meta_path: None,
        }))
    }

    fn open_handle(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("cannot open ledger lock {}", path.display()))
    }

    /// Record who holds the lock, for diagnosis of stuck claims.
    fn stamp_holder(path: &Path, agent_id: &str) -> Result<PathBuf> {
        let meta_path = path.with_extension("lock.meta");
        let holder = LockHolder {
            pid: std::process::id(),
            agent_id: agent_id.to_string(),
            acquired_at: Utc::now(),
        };
        let json =
            serde_json::to_string_pretty(&holder).context("cannot serialize lock holder")?;
        std::fs::write(&meta_path, json)
            .with_context(|| format!("cannot write lock holder {}", meta_path.display()))?;
        Ok(meta_path)
    }
}

/// Check if a process with the given PID exists.
///
/// Unix: signal 0 probes existence without delivering a signal.
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn process_exists(_pid: u32) -> bool {
    // Unknown platform: assume alive, never steal a live lock
    true
}

/// Remove leftover lock metadata from a dead holder.
///
/// The lock itself is advisory and evaporates with the process; only the
/// `.meta` sidecar can outlive a crash. Returns true if stale metadata was
/// removed.
pub fn cleanup_stale_holder(lock_path: &Path) -> Result<bool> {
    let meta_path = lock_path.with_extension("lock.meta");
    if !meta_path.exists() {
        return Ok(false);
    }

    let stale = match std::fs::read_to_string(&meta_path) {
        Ok(content) => match serde_json::from_str::<LockHolder>(&content) {
            Ok(holder) => !process_exists(holder.pid),
            // Unreadable metadata is treated as stale
            Err(_) => true,
        },
        Err(_) => true,
    };

    if stale {
        let _ = std::fs::remove_file(&meta_path);
    }
    Ok(stale)
}
