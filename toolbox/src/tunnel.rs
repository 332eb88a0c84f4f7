//! The externally reachable tunnel process.
//!
//! Replacing a running tunnel is done as a handover: the new process must be
//! confirmed alive before the old one is signalled, so an unhealthy
//! replacement never takes the site offline.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, instrument, warn};

use crate::core::descriptor::TunnelDescriptor;
use crate::core::types::ReconciliationOutcome;
use crate::error::ToolboxError;
use crate::io::process::{CommandSpec, ProcessExecutor, run_checked};

pub struct TunnelManager<'a> {
    executor: &'a dyn ProcessExecutor,
    query_timeout: Duration,
    grace: Duration,
}

impl<'a> TunnelManager<'a> {
    pub fn new(executor: &'a dyn ProcessExecutor, query_timeout: Duration, grace: Duration) -> Self {
        Self {
            executor,
            query_timeout,
            grace,
        }
    }

    /// Pids of running tunnel processes.
    pub fn running_pids(&self, desc: &TunnelDescriptor) -> Result<Vec<u32>> {
        let pattern = desc.process_pattern();
        let spec = CommandSpec::new("pgrep", ["-f", pattern.as_str()], self.query_timeout);
        let output = self.executor.run(&spec)?;
        match output.exit_code {
            Some(0) => {}
            // pgrep exits 1 when nothing matched.
            Some(1) if !output.timed_out => return Ok(Vec::new()),
            _ => bail!(
                "`{}` failed: {}",
                spec.display(),
                output.stderr.trim()
            ),
        }
        output
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                line.trim()
                    .parse()
                    .with_context(|| format!("parse pgrep pid '{line}'"))
            })
            .collect()
    }

    /// Start the tunnel when absent; with `topology_changed`, hand over to a
    /// fresh process and only then terminate the previous one(s).
    #[instrument(skip_all, fields(tunnel = %desc.name, topology_changed))]
    pub fn ensure_running(
        &self,
        desc: &TunnelDescriptor,
        topology_changed: bool,
    ) -> Result<ReconciliationOutcome> {
        let previous = self.running_pids(desc)?;
        if !previous.is_empty() && !topology_changed {
            info!(tunnel = %desc.name, "tunnel running");
            return Ok(ReconciliationOutcome::Unchanged);
        }
        if previous.is_empty() {
            info!(tunnel = %desc.name, "tunnel not running, starting");
        } else {
            info!(tunnel = %desc.name, ?previous, "topology changed, starting replacement tunnel");
        }

        let pid = self.spawn(desc)?;
        if !self.grace.is_zero() {
            thread::sleep(self.grace);
        }
        let current = self.running_pids(desc)?;
        if !current.contains(&pid) {
            warn!(tunnel = %desc.name, pid, "new tunnel process did not stay up");
            return Err(ToolboxError::TunnelStartup {
                tunnel: desc.name.clone(),
                log_file: desc.log_file.clone(),
            }
            .into());
        }
        info!(tunnel = %desc.name, pid, "tunnel started");

        for old in previous.into_iter().filter(|old| current.contains(old)) {
            let spec = CommandSpec::new("kill", ["-TERM".to_string(), old.to_string()], self.query_timeout);
            match run_checked(self.executor, &spec) {
                Ok(_) => info!(tunnel = %desc.name, pid = old, "terminated previous tunnel process"),
                Err(err) => warn!(
                    tunnel = %desc.name,
                    pid = old,
                    error = %format!("{err:#}"),
                    "could not terminate previous tunnel process"
                ),
            }
        }
        Ok(ReconciliationOutcome::Converged)
    }

    fn spawn(&self, desc: &TunnelDescriptor) -> Result<u32> {
        let config = desc.config_path.to_string_lossy().into_owned();
        let spec = CommandSpec::new(
            &desc.binary,
            ["tunnel", "--config", config.as_str(), "run", desc.name.as_str()],
            self.query_timeout,
        );
        self.executor
            .spawn_detached(&spec, Some(&desc.log_file))
            .with_context(|| format!("spawn tunnel {}", desc.name))
    }
}
