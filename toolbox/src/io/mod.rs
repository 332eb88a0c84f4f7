//! Side-effecting adapters: processes, container runtime, git, secrets, HTTP,
//! filesystem and locks.

pub mod config;
pub mod docker;
pub mod files;
pub mod git;
pub mod lock;
pub mod process;
pub mod release;
pub mod secrets;
pub mod uptime;
