//! Test-only helpers for registry entries and session state.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::core::types::{SessionRegistryEntry, SessionStatus};
use crate::io::session_state::{SessionStore, session_file_path};

/// Fixed reference time so entry ordering is deterministic.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 22, 10, 0, 0)
        .single()
        .expect("valid timestamp")
}

/// Entry started at [`base_time`] and last updated `minutes` later.
pub fn entry_at(id: &str, cwd: &str, status: SessionStatus, minutes: i64) -> SessionRegistryEntry {
    SessionRegistryEntry {
        session_id: id.to_string(),
        cwd: PathBuf::from(cwd),
        status,
        started_at: base_time(),
        updated_at: base_time() + Duration::minutes(minutes),
        agent_plugin: "test-agent".to_string(),
        tracker_plugin: "test-tracker".to_string(),
        sandbox: None,
        epic_id: None,
        prd_path: None,
    }
}

pub fn entry(id: &str, cwd: &str, status: SessionStatus) -> SessionRegistryEntry {
    entry_at(id, cwd, status, 0)
}

/// In-memory [`SessionStore`] with an explicit set of directories that have
/// persisted state.
#[derive(Debug, Default)]
pub struct FakeSessionStore {
    present: Mutex<BTreeSet<PathBuf>>,
}

impl FakeSessionStore {
    pub fn with_sessions<I, P>(cwds: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            present: Mutex::new(cwds.into_iter().map(|p| p.as_ref().to_path_buf()).collect()),
        }
    }

    pub fn insert(&self, cwd: impl AsRef<Path>) {
        self.lock().insert(cwd.as_ref().to_path_buf());
    }

    pub fn remove(&self, cwd: impl AsRef<Path>) {
        self.lock().remove(cwd.as_ref());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<PathBuf>> {
        self.present.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionStore for FakeSessionStore {
    fn has_persisted_session(&self, cwd: &Path) -> bool {
        self.lock().contains(cwd)
    }
}

/// Create `<cwd>/.ralph/session.json` so the filesystem store sees a session.
pub fn write_session_file(cwd: &Path) -> PathBuf {
    let path = session_file_path(cwd);
    fs::create_dir_all(path.parent().expect("session dir")).expect("create session dir");
    fs::write(&path, "{}\n").expect("write session file");
    path
}
