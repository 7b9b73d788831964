//! Behavior shared by every agent variant: lifecycle state, common options,
//! executable detection and execution tracking.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use super::{AgentDetectResult, AgentPluginMeta, ExecuteOptions, QuestionKind, SetupQuestion};
use crate::core::filter::LineFilter;
use crate::error::PluginError;
use crate::io::process::{self, ExecutionHandle, Interrupter, OutputCallback, RunOptions};

/// Bound on the `--version` check, independent of any configured run timeout.
pub const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const VERSION_CHECK_GRACE: Duration = Duration::from_millis(500);

static VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+\.\d+\.\d+)").expect("version pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Uninitialized,
    Ready,
    Disposed,
}

/// Options understood by every variant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CommonOptions {
    command: Option<String>,
    timeout: Option<Duration>,
    env: BTreeMap<String, String>,
}

impl CommonOptions {
    fn parse(plugin: &str, options: &toml::Table) -> Self {
        let timeout = match options.get("timeout") {
            None => None,
            Some(toml::Value::Integer(ms)) if *ms > 0 => Some(Duration::from_millis(*ms as u64)),
            Some(toml::Value::Integer(_)) => None,
            Some(other) => {
                warn!(plugin, value = %other, "ignoring non-integer timeout option");
                None
            }
        };

        let mut env = BTreeMap::new();
        if let Some(value) = options.get("env") {
            match value.as_table() {
                Some(table) => {
                    for (key, value) in table {
                        match value.as_str() {
                            Some(value) => {
                                env.insert(key.clone(), value.to_string());
                            }
                            None => warn!(plugin, key = %key, "ignoring non-string env option"),
                        }
                    }
                }
                None => warn!(plugin, "ignoring env option that is not a table"),
            }
        }

        Self {
            command: string_option(options, "command"),
            timeout,
            env,
        }
    }
}

/// Lifecycle and execution bookkeeping embedded in each variant.
#[derive(Debug)]
pub struct PluginBase {
    meta: &'static AgentPluginMeta,
    state: PluginState,
    common: CommonOptions,
    active: Mutex<BTreeMap<String, Interrupter>>,
}

impl PluginBase {
    pub fn new(meta: &'static AgentPluginMeta) -> Self {
        Self {
            meta,
            state: PluginState::Uninitialized,
            common: CommonOptions::default(),
            active: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn meta(&self) -> &'static AgentPluginMeta {
        self.meta
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == PluginState::Ready
    }

    /// Executable to spawn: the `command` option, else the variant default.
    pub fn command(&self) -> &str {
        self.common
            .command
            .as_deref()
            .unwrap_or(self.meta.default_command)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.common.timeout
    }

    /// Number of executions that have not finished yet.
    pub fn active_executions(&self) -> usize {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.retain(|_, interrupter| !interrupter.is_finished());
        active.len()
    }

    pub(crate) fn initialize(&mut self, options: &toml::Table) -> Result<(), PluginError> {
        if self.state == PluginState::Disposed {
            return Err(PluginError::Disposed(self.meta.id));
        }
        self.common = CommonOptions::parse(self.meta.id, options);
        self.state = PluginState::Ready;
        debug!(plugin = self.meta.id, command = self.command(), "agent plugin initialized");
        Ok(())
    }

    pub(crate) fn ensure_ready(&self) -> Result<(), PluginError> {
        match self.state {
            PluginState::Ready => Ok(()),
            PluginState::Uninitialized => Err(PluginError::NotReady(self.meta.id)),
            PluginState::Disposed => Err(PluginError::Disposed(self.meta.id)),
        }
    }

    /// Resolve the executable on `PATH` and run its `--version` check.
    #[instrument(skip_all, fields(plugin = self.meta.id))]
    pub(crate) fn detect(&self, not_found_message: &str) -> AgentDetectResult {
        let path = match which::which(self.command()) {
            Ok(path) => path,
            Err(err) => {
                debug!(command = self.command(), error = %err, "agent executable not found");
                return AgentDetectResult {
                    available: false,
                    error: Some(not_found_message.to_string()),
                    ..AgentDetectResult::default()
                };
            }
        };

        match query_version(&path) {
            Ok(version) => AgentDetectResult {
                available: true,
                version,
                executable_path: Some(path),
                error: None,
            },
            Err(error) => AgentDetectResult {
                available: false,
                version: None,
                executable_path: Some(path),
                error: Some(error),
            },
        }
    }

    /// Spawn the configured executable and track the handle for interrupts.
    ///
    /// With `filter_stdout`, stdout is filtered a complete line at a time;
    /// an unterminated last line is delivered once the stream ends.
    #[instrument(skip_all, fields(plugin = self.meta.id, args = args.len()))]
    pub(crate) fn spawn(
        &self,
        args: Vec<String>,
        stdin: Option<String>,
        options: ExecuteOptions,
        filter_stdout: bool,
    ) -> Result<ExecutionHandle, PluginError> {
        self.ensure_ready()?;

        let ExecuteOptions {
            cwd,
            timeout,
            env,
            grace_period,
            output_limit_bytes,
            on_stdout,
            on_stderr,
        } = options;

        let mut run_options = RunOptions::new(cwd)
            .grace_period(grace_period)
            .output_limit_bytes(output_limit_bytes);
        run_options.env = self.common.env.clone();
        run_options.env.extend(env);
        run_options.timeout = timeout.or(self.common.timeout);
        run_options.stdin_text = stdin;
        run_options.on_stderr = on_stderr;
        run_options.on_stdout = match on_stdout {
            Some(sink) if filter_stdout => {
                let mut filtered = FilteredSink {
                    filter: LineFilter::new(),
                    sink,
                };
                let callback: OutputCallback = Box::new(move |chunk: &str| filtered.push(chunk));
                Some(callback)
            }
            other => other,
        };

        let handle = process::run(self.command(), &args, run_options);
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.retain(|_, interrupter| !interrupter.is_finished());
        active.insert(handle.id().to_string(), handle.interrupter());
        debug!(execution_id = handle.id(), "agent execution started");
        Ok(handle)
    }

    pub(crate) fn interrupt(&self, execution_id: &str) -> Result<bool, PluginError> {
        self.ensure_ready()?;
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(active
            .get(execution_id)
            .is_some_and(|interrupter| interrupter.interrupt()))
    }

    /// Interrupt every active execution and enter `Disposed`.
    pub(crate) fn dispose(&mut self) -> usize {
        if self.state == PluginState::Disposed {
            return 0;
        }
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let interrupted = active
            .values()
            .filter(|interrupter| interrupter.interrupt())
            .count();
        active.clear();
        drop(active);
        self.state = PluginState::Disposed;
        info!(plugin = self.meta.id, interrupted, "agent plugin disposed");
        interrupted
    }

    /// Setup question for overriding the executable path.
    pub(crate) fn command_question(&self) -> SetupQuestion {
        SetupQuestion {
            id: "command",
            prompt: "Path to executable:",
            kind: QuestionKind::Path,
            default: self.meta.default_command.to_string(),
            required: false,
            help: "Leave as the default to look the executable up on PATH",
        }
    }
}

/// Run `<path> --version` and extract the first `x.y.z`.
fn query_version(path: &Path) -> Result<Option<String>, String> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir());
    let options = RunOptions::new(cwd)
        .timeout(VERSION_CHECK_TIMEOUT)
        .grace_period(VERSION_CHECK_GRACE);
    let result = process::run(&path.to_string_lossy(), &["--version".to_string()], options).wait();

    if let Some(error) = result.spawn_error {
        return Err(format!("Failed to execute: {error}"));
    }
    if result.timed_out {
        return Err("Timeout waiting for --version".to_string());
    }
    match result.exit_code {
        Some(0) => Ok(VERSION
            .captures(&result.stdout)
            .map(|caps| caps[1].to_string())),
        code => {
            let stderr = result.stderr.trim();
            if stderr.is_empty() {
                Err(match code {
                    Some(code) => format!("Exited with code {code}"),
                    None => "Terminated by signal".to_string(),
                })
            } else {
                Err(stderr.to_string())
            }
        }
    }
}

/// Non-blank string option.
pub(crate) fn string_option(options: &toml::Table, key: &str) -> Option<String> {
    options
        .get(key)
        .and_then(toml::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Enumerated option; an unrecognized value is dropped with a warning.
pub(crate) fn enum_option<T: FromStr>(plugin: &str, options: &toml::Table, key: &str) -> Option<T> {
    let value = options.get(key)?;
    let parsed = value.as_str().and_then(|raw| raw.trim().parse::<T>().ok());
    if parsed.is_none() {
        warn!(plugin, key, value = %value, "ignoring invalid option value");
    }
    parsed
}

/// Stdout callback that forwards only filtered, complete lines. The partial
/// tail is flushed when the runner drops the callback at end of stream.
struct FilteredSink {
    filter: LineFilter,
    sink: OutputCallback,
}

impl FilteredSink {
    fn push(&mut self, chunk: &str) {
        if let Some(text) = self.filter.push(chunk) {
            (self.sink)(&text);
        }
    }
}

impl Drop for FilteredSink {
    fn drop(&mut self) {
        if let Some(text) = self.filter.finish() {
            (self.sink)(&text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_META: AgentPluginMeta = AgentPluginMeta {
        id: "test",
        name: "Test",
        description: "test agent",
        version: "0.0.0",
        author: "tests",
        default_command: "ralph-test-agent-that-does-not-exist",
        supports_streaming: true,
        supports_interrupt: true,
        supports_file_context: false,
        supports_subagent_tracing: false,
    };

    fn table(source: &str) -> toml::Table {
        toml::from_str(source).expect("toml")
    }

    #[test]
    fn lifecycle_transitions() {
        let mut base = PluginBase::new(&TEST_META);
        assert_eq!(base.state(), PluginState::Uninitialized);
        assert_eq!(base.ensure_ready(), Err(PluginError::NotReady("test")));

        base.initialize(&toml::Table::new()).expect("init");
        assert!(base.is_ready());

        assert_eq!(base.dispose(), 0);
        assert!(!base.is_ready());
        assert_eq!(base.dispose(), 0);
        assert_eq!(
            base.initialize(&toml::Table::new()),
            Err(PluginError::Disposed("test"))
        );
    }

    #[test]
    fn common_options_are_parsed_and_unknown_keys_ignored() {
        let mut base = PluginBase::new(&TEST_META);
        base.initialize(&table(
            r#"
            command = "/opt/bin/agent"
            timeout = 1500
            unknown = true
            [env]
            API_MODE = "fast"
            BAD = 3
            "#,
        ))
        .expect("init");
        assert_eq!(base.command(), "/opt/bin/agent");
        assert_eq!(base.default_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(base.common.env.len(), 1);
    }

    #[test]
    fn non_positive_or_mistyped_timeout_is_ignored() {
        let mut base = PluginBase::new(&TEST_META);
        base.initialize(&table("timeout = 0")).expect("init");
        assert_eq!(base.default_timeout(), None);
        base.initialize(&table("timeout = \"soon\"")).expect("init");
        assert_eq!(base.default_timeout(), None);
        assert_eq!(base.command(), TEST_META.default_command);
    }

    #[test]
    fn enum_option_drops_invalid_values() {
        let options = table("good = \"completed\"\nbad = \"sideways\"\nwrong = 1");
        let good: Option<crate::core::types::SessionStatus> = enum_option("test", &options, "good");
        assert!(good.is_some());
        let bad: Option<crate::core::types::SessionStatus> = enum_option("test", &options, "bad");
        assert!(bad.is_none());
        let wrong: Option<crate::core::types::SessionStatus> = enum_option("test", &options, "wrong");
        assert!(wrong.is_none());
    }

    #[test]
    fn detect_reports_missing_executable() {
        let base = PluginBase::new(&TEST_META);
        let result = base.detect("Test CLI not found in PATH");
        assert!(!result.available);
        assert_eq!(result.error.as_deref(), Some("Test CLI not found in PATH"));
        assert!(result.executable_path.is_none());
    }

    #[test]
    fn spawn_requires_ready() {
        let base = PluginBase::new(&TEST_META);
        let temp = tempfile::tempdir().expect("tempdir");
        let err = base
            .spawn(Vec::new(), None, ExecuteOptions::new(temp.path()), false)
            .unwrap_err();
        assert_eq!(err, PluginError::NotReady("test"));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::sync::{Arc, Mutex};

        fn ready_base(command: &str) -> PluginBase {
            let mut base = PluginBase::new(&TEST_META);
            base.initialize(&table(&format!("command = \"{command}\"")))
                .expect("init");
            base
        }

        #[test]
        fn filtered_stdout_drops_metadata_chunks() {
            let base = ready_base("sh");
            let temp = tempfile::tempdir().expect("tempdir");
            let seen = Arc::new(Mutex::new(String::new()));
            let sink = Arc::clone(&seen);
            let options = ExecuteOptions::new(temp.path())
                .on_stdout(move |chunk| sink.lock().expect("lock").push_str(chunk));
            let handle = base
                .spawn(
                    vec!["-c".to_string(), "printf '| tool call\\nanswer\\n'".to_string()],
                    None,
                    options,
                    true,
                )
                .expect("spawn");
            let result = handle.wait();
            assert!(result.success());
            assert_eq!(seen.lock().expect("lock").as_str(), "answer\n");
            assert!(result.stdout.contains("| tool call"), "capture stays raw");
        }

        #[test]
        fn filtered_stdout_reassembles_lines_split_across_writes() {
            let base = ready_base("sh");
            let temp = tempfile::tempdir().expect("tempdir");
            let seen = Arc::new(Mutex::new(String::new()));
            let sink = Arc::clone(&seen);
            let options = ExecuteOptions::new(temp.path())
                .on_stdout(move |chunk| sink.lock().expect("lock").push_str(chunk));
            let script = "printf '| re'; sleep 0.1; printf 'ad x\\nans'; sleep 0.1; \
                          printf 'wer\\n'; sleep 0.1; printf 'tail'";
            let result = base
                .spawn(vec!["-c".to_string(), script.to_string()], None, options, true)
                .expect("spawn")
                .wait();
            assert!(result.success());
            assert_eq!(seen.lock().expect("lock").as_str(), "answer\ntail");
        }

        #[test]
        fn env_layers_over_configured_env() {
            let mut base = PluginBase::new(&TEST_META);
            base.initialize(&table(
                "command = \"sh\"\n[env]\nA = \"from-config\"\nB = \"from-config\"",
            ))
            .expect("init");
            let temp = tempfile::tempdir().expect("tempdir");
            let options = ExecuteOptions::new(temp.path()).env("B", "from-call");
            let result = base
                .spawn(
                    vec!["-c".to_string(), "printf '%s %s' \"$A\" \"$B\"".to_string()],
                    None,
                    options,
                    false,
                )
                .expect("spawn")
                .wait();
            assert_eq!(result.stdout, "from-config from-call");
        }

        #[test]
        fn interrupt_and_dispose_reach_active_executions() {
            let mut base = ready_base("sleep");
            let temp = tempfile::tempdir().expect("tempdir");
            let first = base
                .spawn(vec!["5".to_string()], None, ExecuteOptions::new(temp.path()), false)
                .expect("spawn");
            let second = base
                .spawn(vec!["5".to_string()], None, ExecuteOptions::new(temp.path()), false)
                .expect("spawn");
            assert_eq!(base.active_executions(), 2);

            assert!(base.interrupt(first.id()).expect("interrupt"));
            assert!(!base.interrupt("unknown-id").expect("interrupt"));
            assert!(first.wait().interrupted);

            assert_eq!(base.dispose(), 1);
            assert!(second.wait().interrupted);
            assert_eq!(
                base.interrupt("anything"),
                Err(PluginError::Disposed("test"))
            );
        }
    }
}
