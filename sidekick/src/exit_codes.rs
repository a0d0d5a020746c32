//! Stable exit codes for sidekick CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid config, a missing feed or other errors.
pub const INVALID: i32 = 1;
/// `sidekick select` found no ready project.
pub const IDLE: i32 = 2;
