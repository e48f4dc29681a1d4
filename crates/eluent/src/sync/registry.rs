//! Per-repository cache of syncer handles.
//!
//! Daemon-style callers hold one [`LedgerSyncer`] per repository. The
//! registry keys them by canonical repository path with a bounded
//! least-recently-used eviction; there is no process-level singleton.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::syncer::LedgerSyncer;
use super::LedgerError;

/// Bounded LRU of syncers keyed by canonical repository path.
#[derive(Debug)]
pub struct SyncerRegistry {
    capacity: usize,
    // Most recently used first
    entries: Mutex<Vec<(PathBuf, Arc<LedgerSyncer>)>>,
}

impl SyncerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Fetch the syncer for a repository, building it on first use.
    ///
    /// The factory runs only on a miss; its failure is returned and nothing
    /// is cached.
    pub fn get_or_create(
        &self,
        repo_path: &Path,
        factory: impl FnOnce(&Path) -> Result<LedgerSyncer, LedgerError>,
    ) -> Result<Arc<LedgerSyncer>, LedgerError> {
        let key = canonical_key(repo_path);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(pos) = entries.iter().position(|(path, _)| *path == key) {
            let entry = entries.remove(pos);
            let syncer = entry.1.clone();
            entries.insert(0, entry);
            return Ok(syncer);
        }

        let syncer = Arc::new(factory(&key)?);
        entries.insert(0, (key, syncer.clone()));
        entries.truncate(self.capacity);
        Ok(syncer)
    }

    /// Drop the cached syncer for a repository, if any.
    pub fn evict(&self, repo_path: &Path) {
        let key = canonical_key(repo_path);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|(path, _)| *path != key);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn canonical_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
