//! Reconcile the self-hosted fleet once, or run one auxiliary job.
//!
//! Meant to be invoked on a fixed cadence by a launch agent; every run is a
//! full, idempotent pass.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};

use toolbox::core::types::ReconciliationOutcome;
use toolbox::error::{self, ToolboxError};
use toolbox::exit_codes;
use toolbox::io::config::{ToolboxConfig, load_config};
use toolbox::io::process::SystemExecutor;
use toolbox::io::release::GithubReleases;
use toolbox::io::secrets::VaultCli;
use toolbox::io::uptime::HttpUptimeReporter;
use toolbox::job::{JobOutcome, run_job};
use toolbox::logging;
use toolbox::pass::{Collaborators, PassOptions, run_pass};

#[derive(Parser)]
#[command(
    name = "toolbox",
    version,
    about = "Converge self-hosted services to their declared state"
)]
struct Cli {
    /// Pass `code_changed` after a deploy of this tool's configuration to hand
    /// the tunnel over to a fresh process.
    #[arg(value_enum, value_name = "code_changed")]
    trigger: Option<Trigger>,

    /// Fleet configuration file.
    #[arg(long, default_value = "toolbox.toml")]
    config: PathBuf,

    /// Run the named auxiliary job instead of a reconciliation pass.
    #[arg(long, value_name = "NAME")]
    job: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Trigger {
    #[value(name = "code_changed")]
    CodeChanged,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    std::process::exit(run(&cli));
}

fn run(cli: &Cli) -> i32 {
    let cfg = match load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("{err:#}");
            return exit_codes::INVALID;
        }
    };
    match &cli.job {
        Some(name) => cmd_job(&cfg, name),
        None => cmd_pass(&cfg, cli.trigger == Some(Trigger::CodeChanged)),
    }
}

fn cmd_pass(cfg: &ToolboxConfig, topology_changed: bool) -> i32 {
    let executor = SystemExecutor::default();
    let secrets = VaultCli::new(
        &executor,
        &cfg.secrets.cli,
        &cfg.secrets.vault,
        cfg.timeouts.secret(),
    );
    let releases = match GithubReleases::new(cfg.timeouts.release_lookup()) {
        Ok(releases) => releases,
        Err(err) => {
            error!("{err:#}");
            return exit_codes::FATAL;
        }
    };
    let uptime = match HttpUptimeReporter::new(cfg.timeouts.report()) {
        Ok(uptime) => uptime,
        Err(err) => {
            error!("{err:#}");
            return exit_codes::FATAL;
        }
    };
    let deps = Collaborators {
        executor: &executor,
        secrets: &secrets,
        releases: &releases,
        uptime: &uptime,
    };

    match run_pass(cfg, &deps, PassOptions { topology_changed }) {
        Ok(report) => {
            for service in &report.services {
                if let ReconciliationOutcome::Failed(reason) = &service.outcome {
                    warn!(service = %service.name, kind = %service.kind, "failed: {reason}");
                }
            }
            exit_codes::OK
        }
        Err(err) => {
            error!("pass aborted: {err:#}");
            exit_codes::FATAL
        }
    }
}

fn cmd_job(cfg: &ToolboxConfig, name: &str) -> i32 {
    let Some(job) = cfg.job(name) else {
        error!(job = name, "no such job in configuration");
        return exit_codes::INVALID;
    };
    let executor = SystemExecutor::default();
    match run_job(&executor, job, &cfg.paths.state_dir) {
        Ok(JobOutcome::Completed) => exit_codes::OK,
        Ok(JobOutcome::Skipped { last_success }) => {
            info!(job = name, %last_success, "skipped");
            exit_codes::OK
        }
        Err(err) => {
            error!(job = name, "{err:#}");
            match error::find(&err) {
                Some(ToolboxError::LockHeld { .. }) => exit_codes::LOCKED,
                _ => exit_codes::FATAL,
            }
        }
    }
}
