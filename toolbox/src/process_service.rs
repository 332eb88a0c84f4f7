//! Supervision of bare OS processes.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::descriptor::ProcessDescriptor;
use crate::core::types::ReconciliationOutcome;
use crate::io::process::{CommandSpec, ProcessExecutor};

/// Detect the process with its detection command and start it when absent.
///
/// Detection counts as "running" only when the command succeeds and prints
/// something. Starting is advisory: the process is spawned detached and given
/// `grace` to come up, but its health is not verified.
#[instrument(skip_all, fields(process = %desc.name))]
pub fn ensure_running(
    executor: &dyn ProcessExecutor,
    desc: &ProcessDescriptor,
    query_timeout: Duration,
    grace: Duration,
) -> Result<ReconciliationOutcome> {
    let detection = executor
        .run(&CommandSpec::shell(&desc.detection, query_timeout))
        .with_context(|| format!("detect {}", desc.name))?;
    if detection.success() && !detection.stdout_trimmed().is_empty() {
        info!(process = %desc.name, "process running");
        return Ok(ReconciliationOutcome::Unchanged);
    }

    info!(process = %desc.name, "process not running, starting");
    let pid = executor
        .spawn_detached(&CommandSpec::shell(&desc.start_cmd, query_timeout), None)
        .with_context(|| format!("start {}", desc.name))?;
    debug!(process = %desc.name, pid, "spawned");
    if !grace.is_zero() {
        thread::sleep(grace);
    }
    Ok(ReconciliationOutcome::Converged)
}
