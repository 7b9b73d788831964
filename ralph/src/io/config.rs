//! Project configuration stored under `.ralph/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::agents::AgentKind;
use crate::io::process::{DEFAULT_GRACE_PERIOD, DEFAULT_OUTPUT_LIMIT_BYTES};
use crate::io::session_state::STATE_DIR;

pub const CONFIG_FILE: &str = "config.toml";

pub fn config_path(cwd: &Path) -> PathBuf {
    cwd.join(STATE_DIR).join(CONFIG_FILE)
}

/// Ralph configuration (TOML).
///
/// Edited by humans; every field is optional and falls back to a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RalphConfig {
    pub agent: AgentSection,
    pub process: ProcessSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSection {
    /// Agent plugin id (`opencode` or `droid`).
    pub plugin: String,

    /// Plugin-specific options handed to `AgentPlugin::initialize`.
    pub options: toml::Table,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            plugin: AgentKind::OpenCode.as_str().to_string(),
            options: toml::Table::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessSection {
    /// Delay between the polite termination signal and the forced kill.
    pub grace_period_ms: u64,

    /// Captured stdout/stderr beyond this many bytes is dropped.
    pub output_limit_bytes: usize,
}

impl Default for ProcessSection {
    fn default() -> Self {
        Self {
            grace_period_ms: DEFAULT_GRACE_PERIOD.as_millis() as u64,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl ProcessSection {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl RalphConfig {
    pub fn validate(&self) -> Result<()> {
        self.agent_kind()?;
        if self.process.output_limit_bytes == 0 {
            return Err(anyhow!("process.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn agent_kind(&self) -> Result<AgentKind> {
        self.agent
            .plugin
            .parse()
            .map_err(|err: String| anyhow!("agent.plugin: {err}"))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RalphConfig::default()`.
pub fn load_config(path: &Path) -> Result<RalphConfig> {
    if !path.exists() {
        let cfg = RalphConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RalphConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RalphConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
