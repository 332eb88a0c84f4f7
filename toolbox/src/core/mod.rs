//! Deterministic, pure logic shared by the reconcilers.
//!
//! Core modules must be free of I/O side effects. They operate on descriptors
//! and strings and return deterministic outputs suitable for tests.

pub mod descriptor;
pub mod image;
pub mod order;
pub mod render;
pub mod repo_url;
pub mod run_args;
pub mod types;
