//! Configuration file loading and parsing.
//!
//! Eluent reads repository-level configuration from `.eluent/config.toml`.
//! A missing file or a missing `[sync]` table means ledger sync is disabled;
//! the feature turns on only when `sync.ledger_branch` is set.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::claim_flow::{MAX_CLAIM_RETRIES, MIN_CLAIM_RETRIES};
use crate::sync::{LedgerSettings, OfflinePolicy};

/// Root configuration structure loaded from `.eluent/config.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EluentConfig {
    /// Ledger synchronization settings (optional).
    pub sync: Option<SyncConfig>,
}

/// The `[sync]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfig {
    /// Dedicated ledger branch; enables the feature when set.
    pub ledger_branch: Option<String>,
    /// Git remote the ledger replicates through (default: "origin").
    pub remote: Option<String>,
    /// Whether claims push to the remote automatically (default: true).
    pub auto_claim_push: Option<bool>,
    /// Claim retry ceiling, clamped to [1, 100] (default: 5).
    pub claim_retries: Option<u32>,
    /// Hours after which a stale claim may be auto-released (default: off).
    pub claim_timeout_hours: Option<f64>,
    /// Behavior when the remote is unreachable (default: "local").
    pub offline_mode: Option<OfflinePolicy>,
    /// Per network operation timeout in seconds (default: 30).
    pub network_timeout: Option<u64>,
    /// Override for the per-user global root (default: `~/.eluent`).
    pub global_path_override: Option<PathBuf>,
}

impl EluentConfig {
    /// Load configuration for a repository; missing file yields defaults.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = repo_root.join(".eluent").join("config.toml");
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Resolved ledger settings, or `None` while the feature is disabled.
    pub fn ledger_settings(&self) -> Option<LedgerSettings> {
        let sync = self.sync.as_ref()?;
        let branch = sync.ledger_branch.as_deref()?.trim();
        if branch.is_empty() {
            return None;
        }

        let mut settings = LedgerSettings::new(branch);
        if let Some(remote) = &sync.remote {
            settings.remote = remote.clone();
        }
        if let Some(auto) = sync.auto_claim_push {
            settings.auto_claim_push = auto;
        }
        if let Some(retries) = sync.claim_retries {
            settings.claim_retries = retries.clamp(MIN_CLAIM_RETRIES, MAX_CLAIM_RETRIES);
        }
        if let Some(hours) = sync.claim_timeout_hours {
            settings.claim_timeout_hours = Some(hours);
        }
        if let Some(mode) = sync.offline_mode {
            settings.offline_mode = mode;
        }
        if let Some(seconds) = sync.network_timeout {
            settings.network_timeout = Duration::from_secs(seconds);
        }
        Some(settings)
    }

    /// Configured override for the per-user global root, if any.
    pub fn global_path_override(&self) -> Option<&Path> {
        self.sync
            .as_ref()
            .and_then(|s| s.global_path_override.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(temp: &TempDir, content: &str) {
        let dir = temp.path().join(".eluent");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.toml"), content).unwrap();
    }

    #[test]
    fn test_missing_file_disables_ledger() {
        let temp = TempDir::new().unwrap();
        let config = EluentConfig::load(temp.path()).unwrap();
        assert!(config.ledger_settings().is_none());
    }

    #[test]
    fn test_full_sync_table() {
        let temp = TempDir::new().unwrap();
        write_config(
            &temp,
            r#"
[sync]
ledger_branch = "eluent-sync"
remote = "upstream"
auto_claim_push = false
claim_retries = 9
claim_timeout_hours = 12.5
offline_mode = "fail"
network_timeout = 10
global_path_override = "/var/lib/eluent"
"#,
        );

        let config = EluentConfig::load(temp.path()).unwrap();
        let settings = config.ledger_settings().unwrap();

        assert_eq!(settings.branch, "eluent-sync");
        assert_eq!(settings.remote, "upstream");
        assert!(!settings.auto_claim_push);
        assert_eq!(settings.claim_retries, 9);
        assert_eq!(settings.claim_timeout_hours, Some(12.5));
        assert_eq!(settings.offline_mode, OfflinePolicy::Fail);
        assert_eq!(settings.network_timeout, Duration::from_secs(10));
        assert_eq!(
            config.global_path_override(),
            Some(Path::new("/var/lib/eluent"))
        );
    }

    #[test]
    fn test_defaults_when_only_branch_set() {
        let temp = TempDir::new().unwrap();
        write_config(&temp, "[sync]\nledger_branch = \"eluent-sync\"\n");

        let settings = EluentConfig::load(temp.path())
            .unwrap()
            .ledger_settings()
            .unwrap();
        assert_eq!(settings.remote, "origin");
        assert!(settings.auto_claim_push);
        assert_eq!(settings.claim_retries, 5);
        assert_eq!(settings.claim_timeout_hours, None);
        assert_eq!(settings.offline_mode, OfflinePolicy::Local);
        assert_eq!(settings.network_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_retries_clamped() {
        let temp = TempDir::new().unwrap();
        write_config(
            &temp,
            "[sync]\nledger_branch = \"eluent-sync\"\nclaim_retries = 5000\n",
        );
        let settings = EluentConfig::load(temp.path())
            .unwrap()
            .ledger_settings()
            .unwrap();
        assert_eq!(settings.claim_retries, 100);

        write_config(
            &temp,
            "[sync]\nledger_branch = \"eluent-sync\"\nclaim_retries = 0\n",
        );
        let settings = EluentConfig::load(temp.path())
            .unwrap()
            .ledger_settings()
            .unwrap();
        assert_eq!(settings.claim_retries, 1);
    }

    #[test]
    fn test_blank_branch_disables_ledger() {
        let temp = TempDir::new().unwrap();
        write_config(&temp, "[sync]\nledger_branch = \"  \"\n");
        let config = EluentConfig::load(temp.path()).unwrap();
        assert!(config.ledger_settings().is_none());
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        let temp = TempDir::new().unwrap();
        write_config(&temp, "[sync\nledger_branch = ");
        assert!(EluentConfig::load(temp.path()).is_err());
    }
}
