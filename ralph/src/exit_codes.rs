//! Stable exit codes for ralph CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid arguments or config, registry failures, or a session that is still running.
pub const INVALID: i32 = 1;
/// `ralph resume` found nothing to resume (unknown id, stale entry, empty directory).
pub const NO_SESSION: i32 = 2;
/// `ralph resume` was given a prefix matching several sessions.
pub const AMBIGUOUS: i32 = 3;
/// `ralph detect` could not find a usable agent executable.
pub const UNAVAILABLE: i32 = 4;
/// `ralph exec` stopped the agent because its timeout expired.
pub const TIMED_OUT: i32 = 124;
/// `ralph exec` was interrupted before the agent finished.
pub const INTERRUPTED: i32 = 130;
