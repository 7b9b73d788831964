//! `ralph resume`: map user intent to exactly one resumable session.
//!
//! Resolution order:
//!
//! 1. An explicit id is matched exactly, then as a prefix. It never falls back
//!    to the current directory.
//! 2. Without an id, the target directory's persisted state and registry entry
//!    are consulted together. Persisted state without an entry is drift and is
//!    tolerated; an entry without persisted state is stale and is not.
//!
//! Every failure carries the diagnostic shown to the operator as its `Display`.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::types::{SessionRegistryEntry, SessionStatus};
use crate::error::RegistryError;
use crate::exit_codes;
use crate::io::registry::SessionLookup;
use crate::io::session_state::session_file_path;

/// Other sessions listed when nothing is resumable in the target directory.
const MAX_SUGGESTIONS: usize = 3;

/// Parsed `ralph resume` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeArgs {
    pub session_id: Option<String>,
    pub cwd: PathBuf,
    pub headless: bool,
    /// Resume even when the session is marked as running elsewhere.
    pub force: bool,
    pub list: bool,
    pub cleanup: bool,
}

impl ResumeArgs {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            session_id: None,
            cwd: cwd.into(),
            headless: false,
            force: false,
            list: false,
            cleanup: false,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Which action the arguments ask for. `--list` wins over `--cleanup`.
    pub fn command(&self) -> ResumeCommand {
        if self.list {
            ResumeCommand::List
        } else if self.cleanup {
            ResumeCommand::Cleanup
        } else {
            ResumeCommand::Resolve
        }
    }

    /// The requested id; blank ids count as absent.
    fn requested_id(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeCommand {
    List,
    Cleanup,
    Resolve,
}

/// The directory to resume in, plus its registry entry when one exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
    pub cwd: PathBuf,
    /// `None` when persisted state exists but the registry lost track of it.
    pub registry_entry: Option<SessionRegistryEntry>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(
        "Session '{session_id}' not found in registry.\nUse 'ralph resume --list' to see available sessions."
    )]
    NotFound { session_id: String },

    #[error("{}", ambiguous_message(.prefix, .candidates))]
    Ambiguous {
        prefix: String,
        candidates: Vec<SessionRegistryEntry>,
    },

    #[error(
        "Session file not found at {}.\nThe registry entry for session {} is stale. Run 'ralph resume --cleanup' to remove stale entries.",
        session_file_path(.cwd).display(),
        SessionRegistryEntry::short_id(.entry)
    )]
    SessionFileMissing {
        cwd: PathBuf,
        entry: Box<SessionRegistryEntry>,
    },

    #[error("{}", no_session_message(.cwd, .others))]
    NoSession {
        cwd: PathBuf,
        /// Resumable sessions in other directories, newest first.
        others: Vec<SessionRegistryEntry>,
    },

    #[error(
        "Session {} is marked running and may be active in another terminal.\nUse --force to resume it anyway.",
        SessionRegistryEntry::short_id(.entry)
    )]
    StillRunning { entry: Box<SessionRegistryEntry> },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ResolveError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Ambiguous { .. } => exit_codes::AMBIGUOUS,
            Self::NotFound { .. } | Self::SessionFileMissing { .. } | Self::NoSession { .. } => {
                exit_codes::NO_SESSION
            }
            Self::StillRunning { .. } | Self::Registry(_) => exit_codes::INVALID,
        }
    }
}

/// Resolve `args` to a single resumable target.
#[instrument(skip_all, fields(session_id = args.session_id.as_deref(), cwd = %args.cwd.display()))]
pub fn resolve_session<L: SessionLookup>(
    args: &ResumeArgs,
    sessions: &L,
) -> Result<ResolvedSession, ResolveError> {
    match args.requested_id() {
        Some(id) => resolve_by_id(id, sessions),
        None => resolve_by_cwd(&args.cwd, sessions),
    }
}

fn resolve_by_id<L: SessionLookup>(
    id: &str,
    sessions: &L,
) -> Result<ResolvedSession, ResolveError> {
    if let Some(entry) = sessions.get_session_by_id(id)? {
        debug!("resolved by exact id");
        return Ok(resolved(entry));
    }

    let mut candidates = sessions.find_sessions_by_prefix(id)?;
    match candidates.len() {
        0 => Err(ResolveError::NotFound {
            session_id: id.to_string(),
        }),
        1 => {
            debug!("resolved by unique prefix");
            Ok(resolved(candidates.remove(0)))
        }
        _ => {
            candidates.sort_by(|a, b| a.session_id.cmp(&b.session_id));
            Err(ResolveError::Ambiguous {
                prefix: id.to_string(),
                candidates,
            })
        }
    }
}

fn resolve_by_cwd<L: SessionLookup>(
    cwd: &Path,
    sessions: &L,
) -> Result<ResolvedSession, ResolveError> {
    let persisted = sessions.has_persisted_session(cwd);
    let entry = sessions.get_session_by_cwd(cwd)?;

    match (persisted, entry) {
        (true, Some(entry)) => Ok(resolved(entry)),
        (true, None) => {
            warn!(cwd = %cwd.display(), "persisted session has no registry entry; resuming anyway");
            Ok(ResolvedSession {
                cwd: cwd.to_path_buf(),
                registry_entry: None,
            })
        }
        (false, Some(entry)) => Err(ResolveError::SessionFileMissing {
            cwd: cwd.to_path_buf(),
            entry: Box::new(entry),
        }),
        (false, None) => {
            let others = sessions
                .list_resumable_sessions()?
                .into_iter()
                .filter(|entry| entry.cwd != cwd)
                .collect();
            Err(ResolveError::NoSession {
                cwd: cwd.to_path_buf(),
                others,
            })
        }
    }
}

fn resolved(entry: SessionRegistryEntry) -> ResolvedSession {
    ResolvedSession {
        cwd: entry.cwd.clone(),
        registry_entry: Some(entry),
    }
}

/// Refuse to take over a session another process may still be driving.
pub fn ensure_resumable(resolved: &ResolvedSession, force: bool) -> Result<(), ResolveError> {
    match &resolved.registry_entry {
        Some(entry) if entry.status == SessionStatus::Running && !force => {
            Err(ResolveError::StillRunning {
                entry: Box::new(entry.clone()),
            })
        }
        _ => Ok(()),
    }
}

fn status_icon(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Paused => "⏸",
        SessionStatus::Running => "▶",
        SessionStatus::Interrupted => "⚠",
        SessionStatus::Completed | SessionStatus::Failed => "•",
    }
}

/// One session as shown in listings: a summary line, then its directory.
///
/// `index` is zero-based and rendered one-based.
pub fn format_session_entry(entry: &SessionRegistryEntry, index: Option<usize>) -> String {
    let lead = index.map(|i| format!("{}. ", i + 1)).unwrap_or_default();
    let source = match (&entry.epic_id, &entry.prd_path) {
        (Some(epic), _) => format!("epic:{epic}"),
        (None, Some(prd)) => format!("prd:{prd}"),
        (None, None) => entry.tracker_plugin.clone(),
    };
    let sandbox = if entry.sandbox == Some(true) {
        " [sandbox]"
    } else {
        ""
    };
    format!(
        "{lead}{icon} {short}  {status}  {agent} / {source}{sandbox}\n   {cwd}",
        icon = status_icon(entry.status),
        short = entry.short_id(),
        status = entry.status,
        agent = entry.agent_plugin,
        cwd = entry.cwd.display(),
    )
}

/// Output of `ralph resume --list`.
pub fn render_session_list(entries: &[SessionRegistryEntry]) -> String {
    if entries.is_empty() {
        return "No resumable sessions found.\n\nStart a new session with 'ralph run'.\n".to_string();
    }
    let mut out = String::from("Resumable sessions:\n\n");
    for (i, entry) in entries.iter().enumerate() {
        out.push_str(&format_session_entry(entry, Some(i)));
        out.push('\n');
    }
    out.push_str("\nResume with 'ralph resume <session-id>' (a unique prefix is enough).\n");
    out
}

/// Output of `ralph resume --cleanup`.
pub fn render_cleanup_summary(removed: usize, registry_path: &Path) -> String {
    let outcome = match removed {
        0 => "No stale entries found.".to_string(),
        1 => "Removed 1 stale session from registry.".to_string(),
        n => format!("Removed {n} stale sessions from registry."),
    };
    format!(
        "Cleaning up stale session registry entries...\nRegistry: {}\n\n{outcome}\n",
        registry_path.display()
    )
}

fn ambiguous_message(prefix: &str, candidates: &[SessionRegistryEntry]) -> String {
    let mut out = format!("Multiple sessions match prefix '{prefix}':\n");
    for entry in candidates {
        out.push_str(&format!("  {}  {}\n", entry.session_id, entry.cwd.display()));
    }
    out.push_str("Please provide a more specific session ID.");
    out
}

fn no_session_message(cwd: &Path, others: &[SessionRegistryEntry]) -> String {
    let mut out = format!("No session to resume in {}.", cwd.display());
    if others.is_empty() {
        out.push_str("\n\nStart a new session with 'ralph run'.");
        return out;
    }
    out.push_str("\n\nAvailable sessions in other directories:\n");
    for entry in others.iter().take(MAX_SUGGESTIONS) {
        out.push_str(&format_session_entry(entry, None));
        out.push('\n');
    }
    if others.len() > MAX_SUGGESTIONS {
        out.push_str(&format!("... and {} more\n", others.len() - MAX_SUGGESTIONS));
    }
    out.push_str("\nUse 'ralph resume <session-id>' to resume one of them.");
    out
}
