//! Agent execution engine and session registry for the ralph loop.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (output filtering, registry lookup
//!   rules, session types). No I/O.
//! - **[`io`]**: Side effects (child processes, the registry file, persisted
//!   session state, configuration).
//!
//! On top of these, [`agents`] adapts individual coding-assistant CLIs to one
//! contract and [`resume`] maps "resume this" requests to a single session.

pub mod agents;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod resume;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
