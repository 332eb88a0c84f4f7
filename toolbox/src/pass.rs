//! One reconciliation pass over the whole fleet.
//!
//! Phases run in a fixed order: prerequisites, tunnel, OS processes,
//! containers, git-built services, uptime report. Within a phase, services
//! run in declaration order except that a service waits for the same-phase
//! services it `depends_on`.
//!
//! A failing service is recorded and the pass moves on. Only a missing secret
//! session or a tunnel that will not start aborts the pass.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::container::ContainerReconciler;
use crate::core::descriptor::ServiceDescriptor;
use crate::core::order::dependency_order;
use crate::core::types::{PassReport, ReconciliationOutcome};
use crate::error;
use crate::git_service::GitReconciler;
use crate::io::config::ToolboxConfig;
use crate::io::docker::Docker;
use crate::io::files::ensure_dir;
use crate::io::process::ProcessExecutor;
use crate::io::release::ReleaseSource;
use crate::io::secrets::SecretResolver;
use crate::io::uptime::UptimeReporter;
use crate::process_service;
use crate::tunnel::TunnelManager;

/// External collaborators a pass talks to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub executor: &'a dyn ProcessExecutor,
    pub secrets: &'a dyn SecretResolver,
    pub releases: &'a dyn ReleaseSource,
    pub uptime: &'a dyn UptimeReporter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOptions {
    /// The tunnel's routing changed; hand over to a fresh tunnel process.
    pub topology_changed: bool,
}

/// Run every phase once and report per-service outcomes.
///
/// Returns `Err` only for pass-fatal errors.
#[instrument(skip_all, fields(topology_changed = options.topology_changed))]
pub fn run_pass(
    cfg: &ToolboxConfig,
    deps: &Collaborators<'_>,
    options: PassOptions,
) -> Result<PassReport> {
    info!("starting reconciliation pass");
    prerequisites(cfg, deps)?;

    let mut report = PassReport::default();
    for phase in phases(cfg) {
        for service in dependency_order(&phase)? {
            let outcome = match reconcile(cfg, deps, service, options) {
                Ok(outcome) => outcome,
                Err(err) if error::is_pass_fatal(&err) => {
                    warn!(service = service.name(), "aborting pass: {err:#}");
                    return Err(err);
                }
                Err(err) => {
                    warn!(service = service.name(), kind = %service.kind(), "reconciliation failed: {err:#}");
                    ReconciliationOutcome::Failed(format!("{err:#}"))
                }
            };
            report.record(service.name(), service.kind(), outcome);
        }
    }

    report_uptime(cfg, deps);
    info!(
        converged = report.converged(),
        unchanged = report.unchanged(),
        failed = report.failed(),
        "pass complete"
    );
    Ok(report)
}

fn prerequisites(cfg: &ToolboxConfig, deps: &Collaborators<'_>) -> Result<()> {
    let paths = &cfg.paths;
    for dir in [&paths.data_dir, &paths.code_dir, &paths.state_dir]
        .into_iter()
        .chain(&paths.ensure_dirs)
    {
        if let Err(err) = ensure_dir(dir) {
            warn!("{err:#}");
        }
    }

    deps.secrets.ensure_authenticated()?;

    if let Err(err) = Docker::new(deps.executor, &cfg.timeouts).ensure_network(&cfg.network.name) {
        warn!(network = %cfg.network.name, "could not ensure container network: {err:#}");
    }
    Ok(())
}

fn phases(cfg: &ToolboxConfig) -> [Vec<ServiceDescriptor<'_>>; 4] {
    [
        cfg.tunnel.iter().map(ServiceDescriptor::Tunnel).collect(),
        cfg.processes.iter().map(ServiceDescriptor::Process).collect(),
        cfg.containers.iter().map(ServiceDescriptor::Container).collect(),
        cfg.git.iter().map(ServiceDescriptor::Git).collect(),
    ]
}

fn reconcile(
    cfg: &ToolboxConfig,
    deps: &Collaborators<'_>,
    service: ServiceDescriptor<'_>,
    options: PassOptions,
) -> Result<ReconciliationOutcome> {
    let timeouts = &cfg.timeouts;
    match service {
        ServiceDescriptor::Tunnel(desc) => {
            TunnelManager::new(deps.executor, timeouts.query(), timeouts.tunnel_grace())
                .ensure_running(desc, options.topology_changed)
        }
        ServiceDescriptor::Process(desc) => process_service::ensure_running(
            deps.executor,
            desc,
            timeouts.query(),
            timeouts.process_grace(),
        ),
        ServiceDescriptor::Container(desc) => {
            ContainerReconciler::new(deps.executor, deps.secrets, timeouts, &cfg.network.name)
                .ensure_running(desc)
        }
        ServiceDescriptor::Git(desc) => GitReconciler::new(
            deps.executor,
            deps.secrets,
            deps.releases,
            timeouts,
            &cfg.network.name,
        )
        .ensure_deployed(desc),
    }
}

/// Best-effort heartbeat; never fails the pass.
fn report_uptime(cfg: &ToolboxConfig, deps: &Collaborators<'_>) {
    let Some(source) = &cfg.uptime.url else {
        return;
    };
    let url = match deps.secrets.resolve_value(source) {
        Ok(url) if !url.trim().is_empty() => url,
        Ok(_) => {
            warn!("uptime url is empty, skipping report");
            return;
        }
        Err(err) => {
            warn!("could not resolve uptime url: {err:#}");
            return;
        }
    };
    if let Err(err) = deps.uptime.report(url.trim()) {
        warn!("uptime report failed: {err:#}");
    }
}
