//! Atom records as seen by the ledger coordination core.
//!
//! The core treats atoms as opaque line-delimited JSON records and only ever
//! reads or writes three fields: `status`, `assignee`, and `updated_at`.
//! Every other field is preserved untouched across a claim or release
//! rewrite.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Atom lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomStatus {
    /// Unclaimed and available for work
    Open,
    /// Claimed by an agent
    InProgress,
    /// Waiting on unresolved bonds
    Blocked,
    /// Intentionally postponed
    Deferred,
    /// Completed (terminal)
    Closed,
    /// Abandoned (terminal)
    Discard,
}

impl AtomStatus {
    /// Terminal statuses reject claims.
    pub fn is_terminal(self) -> bool {
        matches!(self, AtomStatus::Closed | AtomStatus::Discard)
    }

    /// The snake_case wire name of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            AtomStatus::Open => "open",
            AtomStatus::InProgress => "in_progress",
            AtomStatus::Blocked => "blocked",
            AtomStatus::Deferred => "deferred",
            AtomStatus::Closed => "closed",
            AtomStatus::Discard => "discard",
        }
    }
}

impl fmt::Display for AtomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record from `.eluent/data.jsonl`.
///
/// Fields the core does not understand are captured in `extra` and written
/// back unchanged when the record is rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomRecord {
    /// Caller-supplied unique identifier
    pub id: String,
    /// Current lifecycle status
    pub status: AtomStatus,
    /// Agent holding the claim, if any
    #[serde(default)]
    pub assignee: Option<String>,
    /// Last mutation timestamp (UTC); invalid values load as None
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub updated_at: Option<DateTime<Utc>>,
    /// All other fields, preserved verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AtomRecord {
    /// Whether this atom is currently claimed by the given agent.
    pub fn claimed_by(&self, agent_id: &str) -> bool {
        self.status == AtomStatus::InProgress && self.assignee.as_deref() == Some(agent_id)
    }
}

/// Deserialize an optional RFC 3339 timestamp, mapping malformed or
/// non-string values to `None` instead of failing the whole record.
pub(crate) fn lenient_datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| {
        v.as_str().and_then(|s| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
    }))
}
