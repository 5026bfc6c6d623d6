//! Side-effecting adapters: files, HTTP clients, prompt rendering.
//!
//! Everything here is replaceable in tests, either through a trait seam
//! ([`generator::Generator`], [`task_board::TaskBoard`]) or a temp directory.

pub mod agent_client;
pub mod atomic;
pub mod checkpoint;
pub mod config;
pub mod generator;
pub mod project_store;
pub mod prompt;
pub mod task_board;
