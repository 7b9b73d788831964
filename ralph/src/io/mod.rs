//! Side-effecting operations: child processes, the registry file, project state.

pub mod config;
pub mod process;
pub mod registry;
pub mod session_state;
