//! Agent identity resolution.
//!
//! Every concurrent worker needs a unique identifier; collisions produce
//! undefined ownership semantics and are not defended against. Resolution
//! priority:
//!
//! 1. `--agent-id` CLI flag (explicit override)
//! 2. `ELUENT_AGENT_ID` environment variable (session-specific)
//! 3. `~/.config/eluent/agent.toml` (persistent identity)
//! 4. The host name (the default for one-agent-per-machine setups)

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Environment variable carrying a session-scoped agent id.
pub const AGENT_ENV_VAR: &str = "ELUENT_AGENT_ID";

/// Maximum stored length of an agent identifier.
pub const MAX_AGENT_ID_LEN: usize = 256;

/// Persistent identity file, `~/.config/eluent/agent.toml`.
#[derive(Debug, Clone, Deserialize)]
struct AgentFile {
    agent: AgentSection,
}

#[derive(Debug, Clone, Deserialize)]
struct AgentSection {
    id: String,
}

/// Resolve the agent identifier for this invocation.
pub fn resolve_agent_id(flag: Option<&str>) -> Result<String> {
    if let Some(id) = flag {
        return normalize(id);
    }

    if let Ok(id) = std::env::var(AGENT_ENV_VAR) {
        if !id.trim().is_empty() {
            return normalize(&id);
        }
    }

    if let Some(id) = config_file_id()? {
        return normalize(&id);
    }

    hostname()
}

/// Trim, reject empty, and truncate to the documented maximum.
fn normalize(id: &str) -> Result<String> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        bail!("agent id must not be empty");
    }
    Ok(trimmed.chars().take(MAX_AGENT_ID_LEN).collect())
}

fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("eluent").join("agent.toml"))
}

fn config_file_id() -> Result<Option<String>> {
    let Some(path) = config_path() else {
        return Ok(None);
    };
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read agent config: {}", path.display()))?;
    let file: AgentFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse agent config: {}", path.display()))?;
    Ok(Some(file.agent.id))
}

fn hostname() -> Result<String> {
    let name = nix::unistd::gethostname().context("Failed to read host name")?;
    normalize(&name.to_string_lossy())
}
