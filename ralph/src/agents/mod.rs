//! Agent plugins: adapters that run one coding-assistant CLI non-interactively.
//!
//! Every variant implements [`AgentPlugin`] on top of [`crate::io::process`].
//! Variants form a closed set ([`AgentKind`]); each owns a typed config built
//! once by [`AgentPlugin::initialize`] from a loosely-typed TOML table.
//!
//! Prompts are always delivered on stdin so they never pass through argument
//! parsing or a command interpreter.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConfigError, PluginError};
use crate::io::process::{
    DEFAULT_GRACE_PERIOD, DEFAULT_OUTPUT_LIMIT_BYTES, ExecutionHandle, OutputCallback,
};

mod base;
pub mod droid;
pub mod opencode;

pub use base::{PluginBase, PluginState};
pub use droid::DroidPlugin;
pub use opencode::OpenCodePlugin;

/// Static description of a plugin variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentPluginMeta {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub version: &'static str,
    pub author: &'static str,
    /// Executable looked up on `PATH` unless the `command` option overrides it.
    pub default_command: &'static str,
    pub supports_streaming: bool,
    pub supports_interrupt: bool,
    pub supports_file_context: bool,
    pub supports_subagent_tracing: bool,
}

/// Outcome of probing for the agent's executable. Unavailability is data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentDetectResult {
    pub available: bool,
    pub version: Option<String>,
    pub executable_path: Option<PathBuf>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub value: &'static str,
    pub label: &'static str,
    pub description: &'static str,
}

impl Choice {
    pub const fn new(value: &'static str, label: &'static str, description: &'static str) -> Self {
        Self {
            value,
            label,
            description,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestionKind {
    Text,
    Path,
    Select(Vec<Choice>),
}

/// One prompt an external setup wizard asks; answers feed `initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupQuestion {
    /// Option key the answer is stored under.
    pub id: &'static str,
    pub prompt: &'static str,
    pub kind: QuestionKind,
    pub default: String,
    pub required: bool,
    pub help: &'static str,
}

/// Paths and network access a sandbox must grant for the agent to work.
///
/// Paths may start with `~/`; expanding them is the sandbox's job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxRequirements {
    pub auth_paths: Vec<String>,
    pub binary_paths: Vec<String>,
    pub runtime_paths: Vec<String>,
    pub requires_network: bool,
}

/// A file the agent should consider alongside the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContext {
    pub path: PathBuf,
    pub line: Option<u32>,
}

impl FileContext {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            line: None,
        }
    }
}

/// Per-invocation options for [`AgentPlugin::execute`].
pub struct ExecuteOptions {
    pub cwd: PathBuf,
    /// Overrides the plugin's configured timeout for this call.
    pub timeout: Option<Duration>,
    /// Layered over the plugin's configured `env`.
    pub env: BTreeMap<String, String>,
    pub grace_period: Duration,
    pub output_limit_bytes: usize,
    pub on_stdout: Option<OutputCallback>,
    pub on_stderr: Option<OutputCallback>,
}

impl ExecuteOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            timeout: None,
            env: BTreeMap::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            on_stdout: None,
            on_stderr: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn output_limit_bytes(mut self, limit: usize) -> Self {
        self.output_limit_bytes = limit;
        self
    }

    pub fn on_stdout(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_stdout = Some(Box::new(callback));
        self
    }

    pub fn on_stderr(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_stderr = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("cwd", &self.cwd)
            .field("timeout", &self.timeout)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("grace_period", &self.grace_period)
            .field("output_limit_bytes", &self.output_limit_bytes)
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .finish()
    }
}

/// Uniform capability contract implemented by every agent variant.
///
/// Lifecycle: `Uninitialized -> Ready -> Disposed`. `execute` and `interrupt`
/// require `Ready`.
pub trait AgentPlugin: Send {
    fn meta(&self) -> &'static AgentPluginMeta;

    /// Locate the executable and query its version. Never fails.
    fn detect(&self) -> AgentDetectResult;

    /// Store recognized options. Unknown keys are ignored; invalid values for
    /// enumerated fields are dropped and the default stays in effect.
    fn initialize(&mut self, options: &toml::Table) -> Result<(), PluginError>;

    fn is_ready(&self) -> bool;

    fn setup_questions(&self) -> Vec<SetupQuestion>;

    fn validate_setup(&self, answers: &toml::Table) -> Result<(), ConfigError>;

    /// Empty means "tool default". The tool validates the model identity itself.
    fn validate_model(&self, model: &str) -> Result<(), ConfigError>;

    /// Arguments for the child process. Never contains the prompt.
    fn build_args(&self, prompt: &str, files: &[FileContext], options: &ExecuteOptions)
    -> Vec<String>;

    /// Exact text written to the child's stdin.
    fn stdin_input(
        &self,
        prompt: &str,
        files: &[FileContext],
        options: &ExecuteOptions,
    ) -> Option<String>;

    fn execute(
        &self,
        prompt: &str,
        files: &[FileContext],
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle, PluginError>;

    /// Interrupt one execution started by this plugin. Returns `false` when
    /// the id is unknown or the execution already finished.
    fn interrupt(&self, execution_id: &str) -> Result<bool, PluginError>;

    /// Interrupt all active executions and move to `Disposed`. Idempotent.
    fn dispose(&mut self);

    fn sandbox_requirements(&self) -> SandboxRequirements;
}

/// Closed set of supported agent variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    OpenCode,
    Droid,
}

impl AgentKind {
    pub const ALL: [AgentKind; 2] = [AgentKind::OpenCode, AgentKind::Droid];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenCode => "opencode",
            Self::Droid => "droid",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "opencode" => Ok(Self::OpenCode),
            "droid" => Ok(Self::Droid),
            other => Err(format!(
                "unknown agent plugin '{other}' (expected opencode or droid)"
            )),
        }
    }
}

/// Fresh, uninitialized plugin for `kind`.
pub fn create_plugin(kind: AgentKind) -> Box<dyn AgentPlugin> {
    match kind {
        AgentKind::OpenCode => Box::new(OpenCodePlugin::new()),
        AgentKind::Droid => Box::new(DroidPlugin::new()),
    }
}

/// Shared `provider/model` check: a bare name is fine, a pair needs both halves.
pub(crate) fn check_model_pair(model: &str) -> Result<(), ConfigError> {
    let model = model.trim();
    if model.is_empty() {
        return Ok(());
    }
    if let Some((provider, name)) = model.split_once('/')
        && (provider.is_empty() || name.is_empty())
    {
        return Err(ConfigError::invalid(format!(
            "Invalid model format \"{model}\". Expected format: provider/model (e.g., anthropic/claude-3-5-sonnet)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_kind_parses_known_ids() {
        assert_eq!("opencode".parse::<AgentKind>(), Ok(AgentKind::OpenCode));
        assert_eq!(" droid ".parse::<AgentKind>(), Ok(AgentKind::Droid));
        assert!("claude".parse::<AgentKind>().is_err());
        for kind in AgentKind::ALL {
            assert_eq!(kind.as_str().parse::<AgentKind>(), Ok(kind));
        }
    }

    #[test]
    fn create_plugin_matches_kind() {
        for kind in AgentKind::ALL {
            let plugin = create_plugin(kind);
            assert_eq!(plugin.meta().id, kind.as_str());
            assert!(!plugin.is_ready());
        }
    }

    #[test]
    fn model_pair_requires_both_segments() {
        assert!(check_model_pair("").is_ok());
        assert!(check_model_pair("claude-3-5-sonnet").is_ok());
        assert!(check_model_pair("anthropic/claude-3-5-sonnet").is_ok());
        for bad in ["/claude", "anthropic/", "/"] {
            let err = check_model_pair(bad).unwrap_err();
            assert!(err.to_string().contains("Invalid model format"), "{bad}");
        }
    }
}
