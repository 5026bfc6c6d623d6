//! Stable exit codes for forgeline CLI commands.

/// Command succeeded; for `run`/`monitor`, the project was accepted.
pub const OK: i32 = 0;
/// Invalid config or arguments, or an unexpected error.
pub const INVALID: i32 = 1;
/// A mandatory planning phase failed and the project was marked failed.
pub const PHASE_FAILED: i32 = 2;
/// The loop stopped early: shutdown, a STOP file, or a stopped project.
pub const INTERRUPTED: i32 = 3;
/// The monitor loop hit its iteration cap.
pub const INCOMPLETE: i32 = 4;
/// `parse` could not recover an envelope.
pub const UNPARSEABLE: i32 = 5;
