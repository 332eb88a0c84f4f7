//! Single-flight auxiliary jobs (backups and similar maintenance).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::io::config::JobDescriptor;
use crate::io::lock::{AdvisoryLock, mark_success, read_last_success};
use crate::io::process::{CommandSpec, ProcessExecutor, run_checked};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// The last success is newer than the job's minimum interval.
    Skipped { last_success: DateTime<Utc> },
}

pub fn lock_path(state_dir: &Path, job: &str) -> PathBuf {
    state_dir.join(format!("{job}.lock"))
}

pub fn last_success_path(state_dir: &Path, job: &str) -> PathBuf {
    state_dir.join(format!("{job}.last_success"))
}

pub fn run_job(
    executor: &dyn ProcessExecutor,
    job: &JobDescriptor,
    state_dir: &Path,
) -> Result<JobOutcome> {
    run_job_at(executor, job, state_dir, Utc::now())
}

/// Run `job` as if the current time were `now`.
///
/// The lock is held for the whole run and released on every path.
#[instrument(skip_all, fields(job = %job.name))]
pub fn run_job_at(
    executor: &dyn ProcessExecutor,
    job: &JobDescriptor,
    state_dir: &Path,
    now: DateTime<Utc>,
) -> Result<JobOutcome> {
    let staleness = Duration::from_secs(job.lock_staleness_secs);
    let _lock = AdvisoryLock::acquire_at(&lock_path(state_dir, &job.name), staleness, now)?;

    let marker = last_success_path(state_dir, &job.name);
    if let Some(min_interval) = job.min_interval_secs
        && let Some(last_success) = read_last_success(&marker)?
    {
        let elapsed = now.signed_duration_since(last_success);
        if elapsed.num_seconds() < i64::try_from(min_interval).unwrap_or(i64::MAX) {
            info!(job = %job.name, %last_success, "last success is recent, skipping");
            return Ok(JobOutcome::Skipped { last_success });
        }
    }

    info!(job = %job.name, "running job");
    let mut spec = CommandSpec::shell(&job.command, Duration::from_secs(job.timeout_secs));
    if let Some(dir) = &job.workdir {
        spec = spec.current_dir(dir);
    }
    run_checked(executor, &spec).with_context(|| format!("job {}", job.name))?;

    mark_success(&marker, Utc::now().max(now))?;
    info!(job = %job.name, "job completed");
    Ok(JobOutcome::Completed)
}
