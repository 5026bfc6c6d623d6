//! Orchestrator for chains of LLM role agents.
//!
//! A project moves from a raw product spec through CTO, ENGINEER, and PM
//! planning phases into a polling loop that drives DEV and QA over a task
//! board. Every agent call goes through one invocation runtime that retries
//! transport failures, parses loose model output, validates it, and asks the
//! model to repair what fails validation.
//!
//! - **[`core`]**: Pure logic (envelope types, parser, validator, task state).
//!   No I/O.
//! - **[`io`]**: Generator, task board, and agent service clients; config,
//!   checkpoints, artifact storage, prompt rendering.
//! - **[`runtime`]**: The invocation runtime with retry, circuit breaker, and
//!   repair loop.
//! - **[`pipeline`]** and **[`monitor`]**: The phase driver and polling loop
//!   that coordinate the rest.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod monitor;
pub mod pipeline;
pub mod runtime;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
