//! Factory Droid (`droid exec`) agent.

use std::str::FromStr;

use super::base::{PluginBase, enum_option, string_option};
use super::{
    AgentDetectResult, AgentPlugin, AgentPluginMeta, Choice, ExecuteOptions, FileContext,
    QuestionKind, SandboxRequirements, SetupQuestion, check_model_pair,
};
use crate::error::{ConfigError, PluginError};
use crate::io::process::ExecutionHandle;

pub static DROID_META: AgentPluginMeta = AgentPluginMeta {
    id: "droid",
    name: "Factory Droid",
    description: "Factory Droid coding agent CLI",
    version: "1.0.0",
    author: "Factory",
    default_command: "droid",
    supports_streaming: true,
    supports_interrupt: true,
    supports_file_context: false,
    supports_subagent_tracing: false,
};

/// Flags that keep `droid exec` from prompting.
pub const NON_INTERACTIVE_FLAGS: [&str; 2] = ["exec", "--skip-permissions-unsafe"];

const NOT_FOUND: &str =
    "Droid CLI not found in PATH. Install with: curl -fsSL https://app.factory.ai/cli | sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for ReasoningEffort {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(ConfigError::invalid(
                "Invalid reasoning effort. Must be one of: low, medium, high",
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DroidConfig {
    pub model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl DroidConfig {
    fn from_options(options: &toml::Table) -> Self {
        let key = if options.contains_key("reasoning_effort") {
            "reasoning_effort"
        } else {
            "reasoningEffort"
        };
        Self {
            model: string_option(options, "model"),
            reasoning_effort: enum_option(DROID_META.id, options, key),
        }
    }
}

#[derive(Debug)]
pub struct DroidPlugin {
    base: PluginBase,
    config: DroidConfig,
}

impl DroidPlugin {
    pub fn new() -> Self {
        Self {
            base: PluginBase::new(&DROID_META),
            config: DroidConfig::default(),
        }
    }

    pub fn config(&self) -> &DroidConfig {
        &self.config
    }
}

impl Default for DroidPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentPlugin for DroidPlugin {
    fn meta(&self) -> &'static AgentPluginMeta {
        &DROID_META
    }

    fn detect(&self) -> AgentDetectResult {
        self.base.detect(NOT_FOUND)
    }

    fn initialize(&mut self, options: &toml::Table) -> Result<(), PluginError> {
        self.base.initialize(options)?;
        self.config = DroidConfig::from_options(options);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.base.is_ready()
    }

    fn setup_questions(&self) -> Vec<SetupQuestion> {
        vec![
            self.base.command_question(),
            SetupQuestion {
                id: "model",
                prompt: "Model:",
                kind: QuestionKind::Text,
                default: String::new(),
                required: false,
                help: "Model id passed to droid (leave empty for the droid default)",
            },
            SetupQuestion {
                id: "reasoning_effort",
                prompt: "Reasoning effort:",
                kind: QuestionKind::Select(vec![
                    Choice::new("", "Default", "Use the model default"),
                    Choice::new("low", "Low", "Fastest responses"),
                    Choice::new("medium", "Medium", "Balanced"),
                    Choice::new("high", "High", "Most thorough reasoning"),
                ]),
                default: String::new(),
                required: false,
                help: "How much reasoning the model should spend per step",
            },
        ]
    }

    fn validate_setup(&self, answers: &toml::Table) -> Result<(), ConfigError> {
        match answers.get("reasoning_effort") {
            None => Ok(()),
            Some(toml::Value::String(effort)) if effort.is_empty() => Ok(()),
            Some(toml::Value::String(effort)) => effort.parse::<ReasoningEffort>().map(|_| ()),
            Some(_) => Err(ConfigError::invalid("Reasoning effort must be a string")),
        }
    }

    fn validate_model(&self, model: &str) -> Result<(), ConfigError> {
        check_model_pair(model)
    }

    fn build_args(
        &self,
        _prompt: &str,
        _files: &[FileContext],
        options: &ExecuteOptions,
    ) -> Vec<String> {
        let mut args: Vec<String> = NON_INTERACTIVE_FLAGS.iter().map(|s| s.to_string()).collect();
        if let Some(model) = &self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(effort) = self.config.reasoning_effort {
            args.push("--reasoning-effort".to_string());
            args.push(effort.as_str().to_string());
        }
        args.push("--cwd".to_string());
        args.push(options.cwd.display().to_string());
        args
    }

    fn stdin_input(
        &self,
        prompt: &str,
        _files: &[FileContext],
        _options: &ExecuteOptions,
    ) -> Option<String> {
        Some(prompt.to_string())
    }

    /// Droid prints plain text, so stdout is forwarded unfiltered.
    fn execute(
        &self,
        prompt: &str,
        files: &[FileContext],
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle, PluginError> {
        self.base.ensure_ready()?;
        let args = self.build_args(prompt, files, &options);
        let stdin = self.stdin_input(prompt, files, &options);
        self.base.spawn(args, stdin, options, false)
    }

    fn interrupt(&self, execution_id: &str) -> Result<bool, PluginError> {
        self.base.interrupt(execution_id)
    }

    fn dispose(&mut self) {
        self.base.dispose();
    }

    fn sandbox_requirements(&self) -> SandboxRequirements {
        SandboxRequirements {
            auth_paths: vec!["~/.factory".to_string()],
            binary_paths: vec!["/usr/local/bin".to_string(), "~/.local/bin".to_string()],
            runtime_paths: Vec::new(),
            requires_network: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin_with(options: &str) -> DroidPlugin {
        let mut plugin = DroidPlugin::new();
        plugin
            .initialize(&toml::from_str(options).expect("toml"))
            .expect("init");
        plugin
    }

    #[test]
    fn builds_non_interactive_args_with_cwd() {
        let plugin = plugin_with("model = \"glm-4.6\"\nreasoning_effort = \"high\"");
        let args = plugin.build_args("do it", &[], &ExecuteOptions::new("/repo"));
        assert_eq!(
            args,
            vec![
                "exec",
                "--skip-permissions-unsafe",
                "--model",
                "glm-4.6",
                "--reasoning-effort",
                "high",
                "--cwd",
                "/repo",
            ]
        );
    }

    #[test]
    fn camel_case_reasoning_key_is_accepted() {
        let plugin = plugin_with("reasoningEffort = \"low\"");
        assert_eq!(plugin.config().reasoning_effort, Some(ReasoningEffort::Low));
    }

    #[test]
    fn invalid_reasoning_effort_is_dropped() {
        let plugin = plugin_with("reasoning_effort = \"extreme\"");
        assert!(plugin.is_ready());
        assert_eq!(plugin.config().reasoning_effort, None);
        let args = plugin.build_args("x", &[], &ExecuteOptions::new("/repo"));
        assert!(!args.iter().any(|a| a == "--reasoning-effort"));
    }

    #[test]
    fn prompt_is_never_an_argument() {
        let plugin = plugin_with("");
        let prompt = "rm -rf / && echo \"pwned\" | 'x' > y\nsecond line ✓";
        let args = plugin.build_args(prompt, &[], &ExecuteOptions::new("/repo"));
        assert!(!args.iter().any(|arg| arg.contains(prompt)));
        assert_eq!(
            plugin
                .stdin_input(prompt, &[], &ExecuteOptions::new("/repo"))
                .as_deref(),
            Some(prompt)
        );
    }

    #[test]
    fn validate_setup_checks_reasoning_effort() {
        let plugin = DroidPlugin::new();
        let ok: toml::Table = toml::from_str("reasoning_effort = \"medium\"").expect("toml");
        assert!(plugin.validate_setup(&ok).is_ok());
        let empty: toml::Table = toml::from_str("reasoning_effort = \"\"").expect("toml");
        assert!(plugin.validate_setup(&empty).is_ok());
        let bad: toml::Table = toml::from_str("reasoning_effort = \"max\"").expect("toml");
        assert!(plugin.validate_setup(&bad).is_err());
    }

    #[test]
    fn lifecycle_guards_execute() {
        let mut plugin = DroidPlugin::new();
        assert_eq!(
            plugin
                .execute("x", &[], ExecuteOptions::new("/repo"))
                .unwrap_err(),
            PluginError::NotReady("droid")
        );
        plugin.initialize(&toml::Table::new()).expect("init");
        plugin.dispose();
        assert!(!plugin.is_ready());
        assert_eq!(
            plugin
                .execute("x", &[], ExecuteOptions::new("/repo"))
                .unwrap_err(),
            PluginError::Disposed("droid")
        );
    }

    #[cfg(unix)]
    #[test]
    fn missing_executable_completes_with_spawn_failure() {
        let plugin = plugin_with("command = \"ralph-no-such-droid-binary\"");
        let temp = tempfile::tempdir().expect("tempdir");
        let result = plugin
            .execute("hello", &[], ExecuteOptions::new(temp.path()))
            .expect("execute")
            .wait();
        assert_eq!(result.exit_code, Some(crate::io::process::SPAWN_FAILURE_EXIT_CODE));
        assert!(result.spawn_error.is_some());
        assert!(result.stderr.contains("ralph-no-such-droid-binary"));
    }
}
