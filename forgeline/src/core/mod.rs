//! Deterministic, pure logic for the envelope protocol and task lifecycle.
//!
//! Core modules are free of I/O. They operate on in-memory values and return
//! deterministic results suitable for tests; side effects live in [`crate::io`].

pub mod budget;
pub mod parser;
pub mod path;
pub mod quality;
pub mod task_state;
pub mod types;
pub mod validator;
