//! Shared types for session bookkeeping.
//!
//! These types define the on-disk contract of the session registry. Field names
//! serialize in camelCase so registry files stay readable by every tool that
//! shares them.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a session as last written by the orchestration loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Paused,
    Interrupted,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Statuses from which a session can be continued.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Interrupted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Interrupted => "interrupted",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "interrupted" => Ok(Self::Interrupted),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!(
                "unknown session status '{other}' (expected running, paused, interrupted, completed or failed)"
            )),
        }
    }
}

/// Durable record describing one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRegistryEntry {
    /// Opaque unique token; immutable for the life of the entry.
    pub session_id: String,
    /// Absolute working directory the session runs in.
    pub cwd: PathBuf,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Agent plugin id (e.g. `opencode`).
    pub agent_plugin: String,
    /// Task tracker plugin id (e.g. `beads`, `json`).
    pub tracker_plugin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prd_path: Option<String>,
}

impl SessionRegistryEntry {
    /// Create a `running` entry stamped with the current time.
    pub fn new(
        session_id: impl Into<String>,
        cwd: impl Into<PathBuf>,
        agent_plugin: impl Into<String>,
        tracker_plugin: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            cwd: cwd.into(),
            status: SessionStatus::Running,
            started_at: now,
            updated_at: now,
            agent_plugin: agent_plugin.into(),
            tracker_plugin: tracker_plugin.into(),
            sandbox: None,
            epic_id: None,
            prd_path: None,
        }
    }

    /// First eight characters of the id, for display.
    pub fn short_id(&self) -> &str {
        match self.session_id.char_indices().nth(8) {
            Some((idx, _)) => &self.session_id[..idx],
            None => &self.session_id,
        }
    }
}

/// Generate a fresh session id.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
