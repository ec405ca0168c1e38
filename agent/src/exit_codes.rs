//! Stable exit codes for agent CLI commands.

/// Command succeeded; for `agent run`, the task was submitted.
pub const OK: i32 = 0;
/// Invalid config, model failure or any other unexpected error.
pub const ERROR: i32 = 1;
/// `agent run` stopped on the step or cost limit.
pub const LIMITS_EXCEEDED: i32 = 2;
