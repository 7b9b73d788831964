//! OpenCode (`opencode run`) agent.

use std::fmt;
use std::str::FromStr;

use super::base::{PluginBase, enum_option, string_option};
use super::{
    AgentDetectResult, AgentPlugin, AgentPluginMeta, Choice, ExecuteOptions, FileContext,
    QuestionKind, SandboxRequirements, SetupQuestion, check_model_pair,
};
use crate::error::{ConfigError, PluginError};
use crate::io::process::ExecutionHandle;

pub static OPENCODE_META: AgentPluginMeta = AgentPluginMeta {
    id: "opencode",
    name: "OpenCode",
    description: "OpenCode AI coding assistant CLI",
    version: "1.0.0",
    author: "SST",
    default_command: "opencode",
    supports_streaming: true,
    supports_interrupt: true,
    supports_file_context: true,
    supports_subagent_tracing: false,
};

const NOT_FOUND: &str =
    "OpenCode CLI not found in PATH. Install with: curl -fsSL https://opencode.ai/install | bash";

/// Built-in OpenCode agent persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenCodeAgent {
    #[default]
    General,
    Build,
    Plan,
}

impl OpenCodeAgent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Build => "build",
            Self::Plan => "plan",
        }
    }
}

impl fmt::Display for OpenCodeAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpenCodeAgent {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "general" => Ok(Self::General),
            "build" => Ok(Self::Build),
            "plan" => Ok(Self::Plan),
            _ => Err(ConfigError::invalid(
                "Invalid agent type. Must be one of: general, build, plan",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Formatted text.
    #[default]
    Default,
    /// Raw JSON events.
    Json,
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::invalid(
                "Invalid format. Must be one of: default, json",
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenCodeConfig {
    /// Any provider id; the CLI validates it.
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Model variant (reasoning level etc.), passed through verbatim.
    pub variant: Option<String>,
    pub agent: OpenCodeAgent,
    pub format: OutputFormat,
}

impl OpenCodeConfig {
    fn from_options(options: &toml::Table) -> Self {
        let id = OPENCODE_META.id;
        Self {
            provider: string_option(options, "provider"),
            model: string_option(options, "model"),
            variant: string_option(options, "variant"),
            agent: enum_option(id, options, "agent").unwrap_or_default(),
            format: enum_option(id, options, "format").unwrap_or_default(),
        }
    }

    /// `provider/model` when both are set; a bare model may already carry
    /// its provider.
    pub fn model_string(&self) -> Option<String> {
        match (&self.provider, &self.model) {
            (Some(provider), Some(model)) => Some(format!("{provider}/{model}")),
            (None, Some(model)) => Some(model.clone()),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct OpenCodePlugin {
    base: PluginBase,
    config: OpenCodeConfig,
}

impl OpenCodePlugin {
    pub fn new() -> Self {
        Self {
            base: PluginBase::new(&OPENCODE_META),
            config: OpenCodeConfig::default(),
        }
    }

    pub fn config(&self) -> &OpenCodeConfig {
        &self.config
    }
}

impl Default for OpenCodePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentPlugin for OpenCodePlugin {
    fn meta(&self) -> &'static AgentPluginMeta {
        &OPENCODE_META
    }

    fn detect(&self) -> AgentDetectResult {
        self.base.detect(NOT_FOUND)
    }

    fn initialize(&mut self, options: &toml::Table) -> Result<(), PluginError> {
        self.base.initialize(options)?;
        self.config = OpenCodeConfig::from_options(options);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.base.is_ready()
    }

    fn setup_questions(&self) -> Vec<SetupQuestion> {
        vec![
            self.base.command_question(),
            SetupQuestion {
                id: "provider",
                prompt: "AI provider:",
                kind: QuestionKind::Select(vec![
                    Choice::new("", "Default", "Use configured default provider"),
                    Choice::new("anthropic", "Anthropic", "Claude models"),
                    Choice::new("openai", "OpenAI", "GPT models"),
                    Choice::new("google", "Google", "Gemini models"),
                    Choice::new("xai", "xAI", "Grok models"),
                    Choice::new("ollama", "Ollama", "Local models via Ollama"),
                ]),
                default: String::new(),
                required: false,
                help: "Which AI provider to use (leave empty for OpenCode default)",
            },
            SetupQuestion {
                id: "model",
                prompt: "Model name:",
                kind: QuestionKind::Text,
                default: String::new(),
                required: false,
                help: "Model name without provider prefix (e.g., claude-3-5-sonnet, gpt-4o)",
            },
            SetupQuestion {
                id: "agent",
                prompt: "Agent type:",
                kind: QuestionKind::Select(vec![
                    Choice::new("general", "General", "General-purpose agent (default)"),
                    Choice::new("build", "Build", "Focused on building code"),
                    Choice::new("plan", "Plan", "Planning and architecture"),
                ]),
                default: OpenCodeAgent::General.as_str().to_string(),
                required: false,
                help: "Which agent type to use for task execution",
            },
            SetupQuestion {
                id: "format",
                prompt: "Output format:",
                kind: QuestionKind::Select(vec![
                    Choice::new("default", "Default", "Formatted text output"),
                    Choice::new("json", "JSON", "Raw JSON events for parsing"),
                ]),
                default: "default".to_string(),
                required: false,
                help: "How OpenCode should format its output",
            },
        ]
    }

    fn validate_setup(&self, answers: &toml::Table) -> Result<(), ConfigError> {
        if let Some(provider) = answers.get("provider")
            && !provider.is_str()
        {
            return Err(ConfigError::invalid("Provider must be a string"));
        }
        if let Some(agent) = answer_text(answers, "agent") {
            agent.parse::<OpenCodeAgent>()?;
        }
        if let Some(format) = answer_text(answers, "format") {
            format.parse::<OutputFormat>()?;
        }
        Ok(())
    }

    fn validate_model(&self, model: &str) -> Result<(), ConfigError> {
        check_model_pair(model)
    }

    fn build_args(
        &self,
        _prompt: &str,
        files: &[FileContext],
        _options: &ExecuteOptions,
    ) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        // Omitting --agent for the default persona avoids a CLI warning.
        if self.config.agent != OpenCodeAgent::General {
            args.push("--agent".to_string());
            args.push(self.config.agent.as_str().to_string());
        }
        if let Some(model) = self.config.model_string() {
            args.push("--model".to_string());
            args.push(model);
        }
        if let Some(variant) = &self.config.variant {
            args.push("--variant".to_string());
            args.push(variant.clone());
        }
        if self.config.format == OutputFormat::Json {
            args.push("--format".to_string());
            args.push("json".to_string());
        }
        for file in files {
            args.push("--file".to_string());
            args.push(file.path.display().to_string());
        }
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

    fn execute(
        &self,
        prompt: &str,
        files: &[FileContext],
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle, PluginError> {
        self.base.ensure_ready()?;
        let args = self.build_args(prompt, files, &options);
        let stdin = self.stdin_input(prompt, files, &options);
        self.base.spawn(args, stdin, options, true)
    }

    fn interrupt(&self, execution_id: &str) -> Result<bool, PluginError> {
        self.base.interrupt(execution_id)
    }

    fn dispose(&mut self) {
        self.base.dispose();
    }

    fn sandbox_requirements(&self) -> SandboxRequirements {
        SandboxRequirements {
            // ~/.local/share/opencode holds OAuth tokens.
            auth_paths: vec![
                "~/.opencode".to_string(),
                "~/.config/opencode".to_string(),
                "~/.local/share/opencode".to_string(),
            ],
            binary_paths: vec![
                "/usr/local/bin".to_string(),
                "~/.local/bin".to_string(),
                "~/go/bin".to_string(),
            ],
            runtime_paths: Vec::new(),
            requires_network: true,
        }
    }
}

/// Answer rendered as text; an empty string means "keep the default".
fn answer_text(answers: &toml::Table, key: &str) -> Option<String> {
    match answers.get(key)? {
        toml::Value::String(value) if value.is_empty() => None,
        toml::Value::String(value) => Some(value.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin_with(options: &str) -> OpenCodePlugin {
        let mut plugin = OpenCodePlugin::new();
        plugin
            .initialize(&toml::from_str(options).expect("toml"))
            .expect("init");
        plugin
    }

    fn args(plugin: &OpenCodePlugin, prompt: &str, files: &[FileContext]) -> Vec<String> {
        plugin.build_args(prompt, files, &ExecuteOptions::new("/work"))
    }

    #[test]
    fn meta_describes_opencode() {
        let plugin = OpenCodePlugin::new();
        assert_eq!(plugin.meta().id, "opencode");
        assert_eq!(plugin.meta().default_command, "opencode");
        assert!(plugin.meta().supports_file_context);
        assert!(!plugin.meta().supports_subagent_tracing);
    }

    #[test]
    fn defaults_produce_bare_run() {
        let plugin = plugin_with("");
        assert_eq!(args(&plugin, "hi", &[]), vec!["run"]);
    }

    #[test]
    fn builds_flags_in_order() {
        let plugin = plugin_with(
            r#"
            provider = "anthropic"
            model = "claude-3-5-sonnet"
            variant = "high"
            agent = "plan"
            format = "json"
            "#,
        );
        let files = [FileContext::new("src/lib.rs"), FileContext::new("README.md")];
        assert_eq!(
            args(&plugin, "hi", &files),
            vec![
                "run",
                "--agent",
                "plan",
                "--model",
                "anthropic/claude-3-5-sonnet",
                "--variant",
                "high",
                "--format",
                "json",
                "--file",
                "src/lib.rs",
                "--file",
                "README.md",
            ]
        );
    }

    #[test]
    fn model_without_provider_is_passed_as_is() {
        let plugin = plugin_with(r#"model = "openai/gpt-4o""#);
        assert_eq!(
            plugin.config().model_string().as_deref(),
            Some("openai/gpt-4o")
        );
        let provider_only = plugin_with(r#"provider = "openai""#);
        assert_eq!(provider_only.config().model_string(), None);
    }

    #[test]
    fn invalid_enumerated_values_are_dropped() {
        let plugin = plugin_with(
            r#"
            agent = "wizard"
            format = "xml"
            extra = { nested = true }
            "#,
        );
        assert!(plugin.is_ready());
        assert_eq!(plugin.config().agent, OpenCodeAgent::General);
        assert_eq!(plugin.config().format, OutputFormat::Default);
    }

    #[test]
    fn prompt_with_shell_metacharacters_goes_to_stdin_only() {
        let plugin = plugin_with(r#"format = "json""#);
        let prompts = [
            "Fix the bug & deploy | tee out > log",
            "say \"hello\" and 'bye'",
            "line one\nline two\n",
            "unicode: héllo wörld 日本語 🚀",
            "$(rm -rf /) `whoami` %PATH% ^&",
        ];
        for prompt in prompts {
            let built = args(&plugin, prompt, &[]);
            assert!(!built.iter().any(|arg| arg.contains(prompt)), "{prompt}");
            assert_eq!(
                plugin
                    .stdin_input(prompt, &[], &ExecuteOptions::new("/work"))
                    .as_deref(),
                Some(prompt)
            );
        }
    }

    #[test]
    fn validate_setup_checks_enumerations() {
        let plugin = OpenCodePlugin::new();
        let ok: toml::Table =
            toml::from_str("provider = \"\"\nagent = \"build\"\nformat = \"\"\nvariant = \"max\"")
                .expect("toml");
        assert!(plugin.validate_setup(&ok).is_ok());

        let bad_agent: toml::Table = toml::from_str("agent = \"wizard\"").expect("toml");
        assert_eq!(
            plugin.validate_setup(&bad_agent).unwrap_err().to_string(),
            "Invalid agent type. Must be one of: general, build, plan"
        );

        let bad_format: toml::Table = toml::from_str("format = \"xml\"").expect("toml");
        assert_eq!(
            plugin.validate_setup(&bad_format).unwrap_err().to_string(),
            "Invalid format. Must be one of: default, json"
        );

        let bad_provider: toml::Table = toml::from_str("provider = 42").expect("toml");
        assert_eq!(
            plugin.validate_setup(&bad_provider).unwrap_err().to_string(),
            "Provider must be a string"
        );
    }

    #[test]
    fn validate_model_accepts_bare_and_pairs() {
        let plugin = OpenCodePlugin::new();
        assert!(plugin.validate_model("").is_ok());
        assert!(plugin.validate_model("gpt-4o").is_ok());
        assert!(plugin.validate_model("ollama/llama3").is_ok());
        let err = plugin.validate_model("anthropic/").unwrap_err();
        assert!(err.to_string().contains("Invalid model format \"anthropic/\""));
    }

    #[test]
    fn setup_questions_cover_command_and_options() {
        let ids: Vec<&str> = OpenCodePlugin::new()
            .setup_questions()
            .iter()
            .map(|q| q.id)
            .collect();
        assert_eq!(ids, vec!["command", "provider", "model", "agent", "format"]);
    }

    #[test]
    fn sandbox_requires_network_and_auth_paths() {
        let req = OpenCodePlugin::new().sandbox_requirements();
        assert!(req.requires_network);
        assert!(req.auth_paths.iter().any(|p| p == "~/.local/share/opencode"));
    }

    #[test]
    fn execute_before_initialize_is_rejected() {
        let plugin = OpenCodePlugin::new();
        let err = plugin
            .execute("hi", &[], ExecuteOptions::new("/work"))
            .unwrap_err();
        assert_eq!(err, PluginError::NotReady("opencode"));
    }

    #[test]
    fn dispose_makes_plugin_unready() {
        let mut plugin = plugin_with("");
        plugin.dispose();
        plugin.dispose();
        assert!(!plugin.is_ready());
        assert_eq!(
            plugin.interrupt("x"),
            Err(PluginError::Disposed("opencode"))
        );
    }

    /// `cat` stands in for the agent: it echoes the stdin prompt, tool marker included.
    #[cfg(unix)]
    #[test]
    fn stdin_prompt_reaches_child_and_stdout_is_filtered() {
        use std::sync::{Arc, Mutex};

        let plugin = plugin_with(r#"command = "cat""#);
        let temp = tempfile::tempdir().expect("tempdir");
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&seen);
        let options = ExecuteOptions::new(temp.path())
            .on_stdout(move |chunk| sink.lock().expect("lock").push_str(chunk));

        let prompt = "| slashcommand {}\nHello & <world> \"quoted\"\n";
        let stdin = plugin.stdin_input(prompt, &[], &options);
        let handle = plugin
            .base
            .spawn(vec!["-".to_string()], stdin, options, true)
            .expect("spawn");
        let result = handle.wait();
        assert!(result.success(), "{result:?}");
        assert_eq!(result.stdout, prompt);
        assert_eq!(
            seen.lock().expect("lock").as_str(),
            "Hello & <world> \"quoted\"\n"
        );
    }
}
