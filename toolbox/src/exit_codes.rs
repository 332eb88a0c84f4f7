//! Stable exit codes for the toolbox binary.

/// The pass completed every phase (individual services may still have failed).
pub const OK: i32 = 0;
/// A pass-fatal error aborted the run (secret session missing, tunnel down).
pub const FATAL: i32 = 1;
/// The configuration file could not be read or failed validation.
pub const INVALID: i32 = 2;
/// `--job` found the job's lock held by another live run.
pub const LOCKED: i32 = 3;
