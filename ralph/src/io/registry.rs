//! Durable session registry shared by every ralph process on the machine.
//!
//! The registry is a single JSON file (`<config_dir>/ralph/sessions.json`):
//!
//! ```json
//! { "version": 1, "sessions": { "<session-id>": { "sessionId": "...", ... } } }
//! ```
//!
//! Mutations are read-modify-write cycles performed under an exclusive advisory
//! lock on a sibling `.lock` file, and land via temp file + rename. Readers take
//! no lock: a rename is atomic, so they observe either the previous or the next
//! version of the file, never a partial write.
//!
//! Cross-process serialization relies on `flock` and is only provided on unix.
//! Other targets take no lock: concurrent writers there can lose updates, the
//! last rename winning.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::core::lookup;
use crate::core::types::{SessionRegistryEntry, SessionStatus};
use crate::error::RegistryError;
use crate::io::session_state::{FsSessionStore, SessionStore};

/// Highest registry file version this build understands.
pub const REGISTRY_VERSION: u32 = 1;
/// Overrides the registry location (used by tests and sandboxes).
pub const REGISTRY_PATH_ENV: &str = "RALPH_REGISTRY_PATH";
const REGISTRY_FILE: &str = "sessions.json";

type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    #[serde(default)]
    sessions: BTreeMap<String, SessionRegistryEntry>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            sessions: BTreeMap::new(),
        }
    }
}

impl RegistryFile {
    fn entries(&self) -> Vec<SessionRegistryEntry> {
        self.sessions.values().cloned().collect()
    }
}

/// Repository over the registry file.
#[derive(Debug, Clone)]
pub struct SessionRegistry<S = FsSessionStore> {
    path: PathBuf,
    store: S,
}

impl SessionRegistry<FsSessionStore> {
    /// Registry at [`default_registry_path`], checking session state on disk.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(default_registry_path()?, FsSessionStore))
    }
}

impl<S: SessionStore> SessionRegistry<S> {
    pub fn new(path: impl Into<PathBuf>, store: S) -> Self {
        Self {
            path: path.into(),
            store,
        }
    }

    /// Location of the registry file, for diagnostics.
    pub fn registry_file_path(&self) -> &Path {
        &self.path
    }

    /// The store consulted for persisted session state.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// All entries, most recently updated first.
    pub fn list_sessions(&self) -> Result<Vec<SessionRegistryEntry>> {
        let mut entries = self.load()?.entries();
        lookup::sort_by_recency(&mut entries);
        Ok(entries)
    }

    pub fn get_session_by_id(&self, session_id: &str) -> Result<Option<SessionRegistryEntry>> {
        Ok(self.load()?.sessions.get(session_id).cloned())
    }

    /// Entries whose id starts with `prefix`, in id order.
    pub fn find_sessions_by_prefix(&self, prefix: &str) -> Result<Vec<SessionRegistryEntry>> {
        let entries = self.load()?.entries();
        Ok(lookup::filter_by_prefix(&entries, prefix)
            .into_iter()
            .cloned()
            .collect())
    }

    /// The most recently updated entry registered for `cwd`.
    pub fn get_session_by_cwd(&self, cwd: &Path) -> Result<Option<SessionRegistryEntry>> {
        let cwd = normalize_cwd(cwd);
        let entries = self.load()?.entries();
        Ok(lookup::select_for_cwd(&entries, &cwd).cloned())
    }

    /// Resumable entries whose persisted state still exists, newest first.
    pub fn list_resumable_sessions(&self) -> Result<Vec<SessionRegistryEntry>> {
        let entries = self.load()?.entries();
        Ok(lookup::resumable(&entries, |cwd| {
            self.store.has_persisted_session(cwd)
        }))
    }

    /// Whether run state exists for `cwd`, regardless of registry bookkeeping.
    pub fn has_persisted_session(&self, cwd: &Path) -> bool {
        self.store.has_persisted_session(&normalize_cwd(cwd))
    }

    /// Add an entry, or refresh an existing one for the same id and directory.
    ///
    /// Re-registering keeps the original `started_at`. An id already bound to a
    /// different directory is rejected.
    #[instrument(skip_all, fields(session_id = %entry.session_id))]
    pub fn register_session(&self, mut entry: SessionRegistryEntry) -> Result<()> {
        entry.cwd = normalize_cwd(&entry.cwd);
        self.update(|file| {
            if let Some(existing) = file.sessions.get(&entry.session_id) {
                if existing.cwd != entry.cwd {
                    return Err(RegistryError::DuplicateId {
                        session_id: entry.session_id.clone(),
                        existing_cwd: existing.cwd.clone(),
                    });
                }
                entry.started_at = existing.started_at;
            }
            info!(cwd = %entry.cwd.display(), status = %entry.status, "registering session");
            file.sessions.insert(entry.session_id.clone(), entry);
            Ok(())
        })
    }

    /// Record a status transition and bump `updated_at`.
    #[instrument(skip(self))]
    pub fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<SessionRegistryEntry> {
        self.update(|file| {
            let entry = file
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
            debug!(from = %entry.status, to = %status, "session status transition");
            entry.status = status;
            entry.updated_at = Utc::now();
            Ok(entry.clone())
        })
    }

    /// Remove an entry. Returns whether it existed.
    #[instrument(skip(self))]
    pub fn unregister_session(&self, session_id: &str) -> Result<bool> {
        self.update(|file| Ok(file.sessions.remove(session_id).is_some()))
    }

    /// Remove entries whose persisted session state no longer exists.
    #[instrument(skip(self))]
    pub fn cleanup_stale_registry_entries(&self) -> Result<usize> {
        self.update(|file| {
            let entries = file.entries();
            let stale = lookup::stale_ids(&entries, |cwd| self.store.has_persisted_session(cwd));
            for id in &stale {
                file.sessions.remove(id);
            }
            if !stale.is_empty() {
                info!(removed = stale.len(), "removed stale registry entries");
            }
            Ok(stale.len())
        })
    }

    fn load(&self) -> Result<RegistryFile> {
        read_registry(&self.path)
    }

    /// Locked read-modify-write. The file is only rewritten when `apply`
    /// changed it.
    fn update<T>(&self, apply: impl FnOnce(&mut RegistryFile) -> Result<T>) -> Result<T> {
        let _lock = RegistryLock::acquire(&self.path)?;
        let original = read_registry(&self.path)?;
        let mut file = original.clone();
        let value = apply(&mut file)?;
        if file != original {
            file.version = REGISTRY_VERSION;
            write_registry(&self.path, &file)?;
        }
        Ok(value)
    }
}

/// Read-only queries the resume resolver needs.
pub trait SessionLookup {
    fn get_session_by_id(&self, session_id: &str) -> Result<Option<SessionRegistryEntry>>;
    fn find_sessions_by_prefix(&self, prefix: &str) -> Result<Vec<SessionRegistryEntry>>;
    fn get_session_by_cwd(&self, cwd: &Path) -> Result<Option<SessionRegistryEntry>>;
    fn list_resumable_sessions(&self) -> Result<Vec<SessionRegistryEntry>>;
    fn has_persisted_session(&self, cwd: &Path) -> bool;
}

impl<S: SessionStore> SessionLookup for SessionRegistry<S> {
    fn get_session_by_id(&self, session_id: &str) -> Result<Option<SessionRegistryEntry>> {
        SessionRegistry::get_session_by_id(self, session_id)
    }

    fn find_sessions_by_prefix(&self, prefix: &str) -> Result<Vec<SessionRegistryEntry>> {
        SessionRegistry::find_sessions_by_prefix(self, prefix)
    }

    fn get_session_by_cwd(&self, cwd: &Path) -> Result<Option<SessionRegistryEntry>> {
        SessionRegistry::get_session_by_cwd(self, cwd)
    }

    fn list_resumable_sessions(&self) -> Result<Vec<SessionRegistryEntry>> {
        SessionRegistry::list_resumable_sessions(self)
    }

    fn has_persisted_session(&self, cwd: &Path) -> bool {
        SessionRegistry::has_persisted_session(self, cwd)
    }
}

/// `$RALPH_REGISTRY_PATH`, else `<config_dir>/ralph/sessions.json`.
pub fn default_registry_path() -> Result<PathBuf> {
    resolve_registry_path(std::env::var_os(REGISTRY_PATH_ENV), dirs::config_dir())
}

fn resolve_registry_path(
    env_override: Option<OsString>,
    config_dir: Option<PathBuf>,
) -> Result<PathBuf> {
    if let Some(path) = env_override.filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    config_dir
        .map(|dir| dir.join("ralph").join(REGISTRY_FILE))
        .ok_or(RegistryError::NoConfigDir)
}

/// Absolute form of `cwd` so lookups agree regardless of how it was spelled.
pub fn normalize_cwd(cwd: &Path) -> PathBuf {
    std::path::absolute(cwd).unwrap_or_else(|_| cwd.to_path_buf())
}

fn read_registry(path: &Path) -> Result<RegistryFile> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "registry file missing; treating as empty");
            return Ok(RegistryFile::default());
        }
        Err(err) => return Err(RegistryError::io(path, err)),
    };
    if contents.trim().is_empty() {
        return Ok(RegistryFile::default());
    }
    let file: RegistryFile =
        serde_json::from_str(&contents).map_err(|source| RegistryError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
    if file.version > REGISTRY_VERSION {
        return Err(RegistryError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: file.version,
            supported: REGISTRY_VERSION,
        });
    }
    Ok(file)
}

/// Atomically write the registry (temp file + rename).
fn write_registry(path: &Path, file: &RegistryFile) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(file)?;
    buf.push('\n');
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| RegistryError::io(parent, err))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).map_err(|err| RegistryError::io(&tmp_path, err))?;
    fs::rename(&tmp_path, path).map_err(|err| RegistryError::io(path, err))?;
    debug!(path = %path.display(), sessions = file.sessions.len(), "registry written");
    Ok(())
}

/// Exclusive advisory lock held for the duration of one read-modify-write.
struct RegistryLock {
    #[cfg(unix)]
    _guard: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl RegistryLock {
    fn acquire(registry_path: &Path) -> Result<Self> {
        let lock_path = registry_path.with_extension("json.lock");
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|err| RegistryError::io(parent, err))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|err| RegistryError::io(&lock_path, err))?;
        Self::lock(file, &lock_path)
    }

    #[cfg(unix)]
    fn lock(file: File, lock_path: &Path) -> Result<Self> {
        use nix::fcntl::{Flock, FlockArg};

        let guard = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            RegistryError::Lock {
                path: lock_path.to_path_buf(),
                message: errno.to_string(),
            }
        })?;
        Ok(Self { _guard: guard })
    }

    #[cfg(not(unix))]
    fn lock(file: File, lock_path: &Path) -> Result<Self> {
        tracing::warn!(path = %lock_path.display(), "advisory locking unavailable; registry updates are unserialized");
        Ok(Self { _file: file })
    }
}
