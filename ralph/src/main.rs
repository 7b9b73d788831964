//! ralph: run coding agents non-interactively and resume ralph sessions.
//!
//! Sessions are tracked in a machine-wide registry (`<config_dir>/ralph/sessions.json`,
//! overridable with `RALPH_REGISTRY_PATH`); each project keeps its run state in
//! `.ralph/session.json`.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, warn};

use ralph::agents::{AgentKind, ExecuteOptions, FileContext, create_plugin};
use ralph::exit_codes;
use ralph::io::config::{RalphConfig, config_path, load_config};
use ralph::io::process::{ExecutionResult, ExecutionStatus};
use ralph::io::registry::{SessionRegistry, normalize_cwd};
use ralph::logging;
use ralph::resume::{
    ResolvedSession, ResumeArgs, ResumeCommand, ensure_resumable, render_cleanup_summary,
    render_session_list, resolve_session,
};

const RESUME_HELP: &str = "\
Resumable states: paused, running, interrupted.

Cross-directory resume:
  Every session is recorded in a global registry, so a session can be resumed
  from any directory by its id or a unique id prefix.

Examples:
  ralph resume                      Resume the session in the current directory
  ralph resume a1b2c3d4             Resume by session-id prefix
  ralph resume --cwd ~/project      Resume the session in another directory
  ralph resume --list               List resumable sessions
  ralph resume --cleanup            Remove registry entries whose session file is gone";

#[derive(Parser)]
#[command(
    name = "ralph",
    version,
    about = "Run coding agents non-interactively and resume ralph sessions"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resume a paused, running or interrupted session.
    #[command(after_help = RESUME_HELP)]
    Resume(ResumeCli),
    /// Report whether agent CLIs are installed and which version they are.
    Detect {
        /// Agent to check (default: all known agents).
        agent: Option<AgentKind>,
    },
    /// Run one prompt through an agent, streaming its filtered output.
    Exec(ExecCli),
}

#[derive(Args)]
struct ResumeCli {
    /// Session id or unique session-id prefix (default: the session in --cwd).
    #[arg(value_name = "SESSION_ID")]
    session_id: Option<String>,

    /// Directory whose session to resume (default: current directory).
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Print only the resolved directory.
    #[arg(long)]
    headless: bool,

    /// Resume even if the session is marked as running.
    #[arg(long)]
    force: bool,

    /// List resumable sessions.
    #[arg(short, long)]
    list: bool,

    /// Remove registry entries whose session file no longer exists.
    #[arg(long)]
    cleanup: bool,
}

#[derive(Args)]
struct ExecCli {
    /// Agent to run (default: `agent.plugin` from `.ralph/config.toml`).
    #[arg(long)]
    agent: Option<AgentKind>,

    /// Working directory for the agent (default: current directory).
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// File to attach as context; repeatable.
    #[arg(long = "file", value_name = "PATH")]
    files: Vec<PathBuf>,

    /// Stop the agent after this many milliseconds (0 disables the timeout).
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Prompt text, or `-` to read it from stdin.
    prompt: String,
}

fn main() {
    logging::init();
    let code = match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Resume(args) => cmd_resume(args),
        Command::Detect { agent } => cmd_detect(agent),
        Command::Exec(args) => cmd_exec(args),
    }
}

fn resolve_cwd(cwd: Option<PathBuf>) -> Result<PathBuf> {
    let cwd = match cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir().context("read current directory")?,
    };
    Ok(normalize_cwd(&cwd))
}

fn cmd_resume(cli: ResumeCli) -> Result<i32> {
    let args = ResumeArgs {
        session_id: cli.session_id,
        cwd: resolve_cwd(cli.cwd)?,
        headless: cli.headless,
        force: cli.force,
        list: cli.list,
        cleanup: cli.cleanup,
    };
    let registry = SessionRegistry::open_default().context("open session registry")?;
    debug!(registry = %registry.registry_file_path().display(), "using session registry");

    match args.command() {
        ResumeCommand::List => {
            let sessions = registry.list_resumable_sessions()?;
            print!("{}", render_session_list(&sessions));
            Ok(exit_codes::OK)
        }
        ResumeCommand::Cleanup => {
            let removed = registry.cleanup_stale_registry_entries()?;
            print!(
                "{}",
                render_cleanup_summary(removed, registry.registry_file_path())
            );
            Ok(exit_codes::OK)
        }
        ResumeCommand::Resolve => {
            let outcome = resolve_session(&args, &registry)
                .and_then(|resolved| ensure_resumable(&resolved, args.force).map(|()| resolved));
            match outcome {
                Ok(resolved) => {
                    print_resolved(&resolved, args.headless);
                    Ok(exit_codes::OK)
                }
                Err(err) => {
                    eprintln!("{err}");
                    Ok(err.exit_code())
                }
            }
        }
    }
}

fn print_resolved(resolved: &ResolvedSession, headless: bool) {
    if headless {
        println!("{}", resolved.cwd.display());
        return;
    }
    match &resolved.registry_entry {
        Some(entry) => println!(
            "Resuming session {} ({}) in {}",
            entry.short_id(),
            entry.status,
            resolved.cwd.display()
        ),
        None => println!(
            "Resuming session in {} (not found in registry)",
            resolved.cwd.display()
        ),
    }
}

/// Options for `kind` from the project config; other agents start from defaults.
fn agent_options(cfg: &RalphConfig, kind: AgentKind) -> toml::Table {
    match cfg.agent_kind() {
        Ok(configured) if configured == kind => cfg.agent.options.clone(),
        _ => toml::Table::new(),
    }
}

fn cmd_detect(agent: Option<AgentKind>) -> Result<i32> {
    let cwd = resolve_cwd(None)?;
    let cfg = load_config(&config_path(&cwd))?;
    let kinds = match agent {
        Some(kind) => vec![kind],
        None => AgentKind::ALL.to_vec(),
    };

    let mut all_available = true;
    for kind in kinds {
        let mut plugin = create_plugin(kind);
        plugin
            .initialize(&agent_options(&cfg, kind))
            .with_context(|| format!("initialize {kind}"))?;
        let result = plugin.detect();
        if result.available {
            println!(
                "{kind}: available (version {}) at {}",
                result.version.as_deref().unwrap_or("unknown"),
                result
                    .executable_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            );
        } else {
            all_available = false;
            println!(
                "{kind}: unavailable: {}",
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        plugin.dispose();
    }

    Ok(if all_available {
        exit_codes::OK
    } else {
        exit_codes::UNAVAILABLE
    })
}

fn cmd_exec(cli: ExecCli) -> Result<i32> {
    let cwd = resolve_cwd(cli.cwd)?;
    let cfg = load_config(&config_path(&cwd))?;
    let kind = match cli.agent {
        Some(kind) => kind,
        None => cfg.agent_kind()?,
    };
    let prompt = if cli.prompt == "-" {
        std::io::read_to_string(std::io::stdin()).context("read prompt from stdin")?
    } else {
        cli.prompt
    };
    let files: Vec<FileContext> = cli.files.into_iter().map(FileContext::new).collect();

    let mut plugin = create_plugin(kind);
    plugin
        .initialize(&agent_options(&cfg, kind))
        .with_context(|| format!("initialize {kind}"))?;

    let mut options = ExecuteOptions::new(&cwd)
        .grace_period(cfg.process.grace_period())
        .output_limit_bytes(cfg.process.output_limit_bytes)
        .on_stdout(|chunk| {
            let mut out = std::io::stdout();
            let _ = out.write_all(chunk.as_bytes());
            let _ = out.flush();
        })
        .on_stderr(|chunk| {
            let _ = std::io::stderr().write_all(chunk.as_bytes());
        });
    if let Some(ms) = cli.timeout_ms {
        options = options.timeout(Duration::from_millis(ms));
    }

    #[cfg(unix)]
    let ctrl_c = block_ctrl_c()?;
    let handle = plugin
        .execute(&prompt, &files, options)
        .with_context(|| format!("execute {kind}"))?;
    #[cfg(unix)]
    interrupt_on_ctrl_c(ctrl_c, handle.interrupter());

    let result = handle.wait();
    plugin.dispose();
    Ok(exec_exit_code(&result))
}

fn exec_exit_code(result: &ExecutionResult) -> i32 {
    match result.status() {
        ExecutionStatus::Completed => exit_codes::OK,
        ExecutionStatus::TimedOut => {
            eprintln!("agent timed out after {:.1}s", result.duration.as_secs_f64());
            exit_codes::TIMED_OUT
        }
        ExecutionStatus::Interrupted => exit_codes::INTERRUPTED,
        ExecutionStatus::SpawnFailed | ExecutionStatus::Failed => {
            result.exit_code.unwrap_or(exit_codes::INVALID)
        }
    }
}

/// Block SIGINT before the agent's threads start so they inherit the mask and
/// the signal stays pending for [`interrupt_on_ctrl_c`].
#[cfg(unix)]
fn block_ctrl_c() -> Result<nix::sys::signal::SigSet> {
    use nix::sys::signal::{SigSet, Signal};

    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.thread_block().context("block SIGINT")?;
    Ok(set)
}

/// The agent runs in its own process group, so Ctrl-C must be forwarded.
#[cfg(unix)]
fn interrupt_on_ctrl_c(
    set: nix::sys::signal::SigSet,
    interrupter: ralph::io::process::Interrupter,
) {
    std::thread::spawn(move || {
        if set.wait().is_ok() {
            warn!("interrupt received; stopping agent");
            interrupter.interrupt();
        }
    });
}
