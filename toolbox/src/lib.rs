//! Idempotent reconciliation engine for a small self-hosted service fleet.
//!
//! Every invocation runs one pass that compares the declared fleet (containers,
//! git-built services, bare OS processes and a reverse tunnel) with what is
//! actually running, and takes the minimal set of actions to converge it.
//!
//! - **[`core`]**: Pure, deterministic logic (descriptors, image normalization,
//!   dependency ordering, rendering). No I/O.
//! - **[`io`]**: Side-effecting adapters (process execution, docker, git,
//!   secrets, HTTP, filesystem, locks). Every external tool sits behind a trait
//!   so passes can be driven by scripted doubles in tests.
//!
//! Reconciliation modules ([`container`], [`git_service`], [`process_service`],
//! [`tunnel`]) converge one descriptor each; [`pass`] sequences them and
//! [`job`] runs single-flight auxiliary jobs.

pub mod container;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod git_service;
pub mod io;
pub mod job;
pub mod logging;
pub mod pass;
pub mod process_service;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tunnel;
