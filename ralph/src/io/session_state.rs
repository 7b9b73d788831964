//! Presence checks for a project's persisted session state.
//!
//! The orchestration loop owns `.ralph/session.json`; this crate only asks
//! whether it exists, never what it contains.

use std::path::{Path, PathBuf};

/// Directory holding per-project runner state.
pub const STATE_DIR: &str = ".ralph";
pub const SESSION_FILE: &str = "session.json";

pub fn session_file_path(cwd: &Path) -> PathBuf {
    cwd.join(STATE_DIR).join(SESSION_FILE)
}

/// Source of truth for "does this directory have resumable run state".
pub trait SessionStore {
    fn has_persisted_session(&self, cwd: &Path) -> bool;
}

/// Checks `<cwd>/.ralph/session.json` on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSessionStore;

impl SessionStore for FsSessionStore {
    fn has_persisted_session(&self, cwd: &Path) -> bool {
        session_file_path(cwd).is_file()
    }
}
