//! Stable exit codes for fixloop CLI commands.

/// Command succeeded; `run` ended with the fixer reporting no remaining issues.
pub const OK: i32 = 0;
/// Invalid config or arguments, an agent failure, or any other error.
pub const FAILED: i32 = 1;
/// `run` used its whole iteration budget without a stop signal.
pub const MAX_ITERATIONS: i32 = 2;
/// Another live session holds the project lock.
pub const LOCKED: i32 = 3;
/// `run` was interrupted with Ctrl-C.
pub const INTERRUPTED: i32 = 130;
