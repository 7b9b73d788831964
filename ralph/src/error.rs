//! Typed errors for the registry, plugins and configuration.
//!
//! Process-level failures (spawn failure, nonzero exit, timeout, interrupt) are
//! not errors: they are reported as data through
//! [`ExecutionResult`](crate::io::process::ExecutionResult). Resolution
//! failures live next to the resolver in [`crate::resume::ResolveError`].

use std::path::PathBuf;

use thiserror::Error;

/// Failures reading or updating the session registry file.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The registry file exists but cannot be parsed. This is the only
    /// condition callers cannot recover from without operator action.
    #[error("registry file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("registry file {path} has unsupported version {found} (expected <= {supported})")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("lock registry {path}: {message}")]
    Lock { path: PathBuf, message: String },

    #[error("session {session_id} is already registered for {existing_cwd}")]
    DuplicateId {
        session_id: String,
        existing_cwd: PathBuf,
    },

    #[error("session {0} not found in registry")]
    NotFound(String),

    #[error("cannot locate a configuration directory for the session registry")]
    NoConfigDir,
}

impl RegistryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Agent plugin lifecycle violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    #[error("agent plugin '{0}' is not initialized")]
    NotReady(&'static str),

    #[error("agent plugin '{0}' has been disposed")]
    Disposed(&'static str),
}

/// Rejected setup answers or model strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}
