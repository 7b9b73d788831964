//! Deterministic, pure logic.
//!
//! Core modules are free of I/O. They operate on in-memory values and return
//! deterministic outputs suitable for tests.

pub mod filter;
pub mod lookup;
pub mod types;
