//! Fleet configuration loaded from a TOML file.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

use crate::core::descriptor::{
    ContainerDescriptor, DeployStrategy, EnvValue, GitBuildDescriptor, ProcessDescriptor,
    ServiceDescriptor, TunnelDescriptor,
};
use crate::core::order::dependency_order;

/// Top-level configuration (TOML).
///
/// Loaded once per invocation and passed around by reference. Missing
/// sections default to an empty fleet with conservative timeouts.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolboxConfig {
    pub paths: PathsConfig,
    pub network: NetworkConfig,
    pub secrets: SecretsConfig,
    pub uptime: UptimeConfig,
    pub timeouts: TimeoutsConfig,
    pub tunnel: Option<TunnelDescriptor>,
    pub processes: Vec<ProcessDescriptor>,
    pub containers: Vec<ContainerDescriptor>,
    pub git: Vec<GitBuildDescriptor>,
    pub jobs: Vec<JobDescriptor>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Persistent container data.
    pub data_dir: PathBuf,
    /// Default parent for git checkouts.
    pub code_dir: PathBuf,
    /// Lock and last-success sentinels.
    pub state_dir: PathBuf,
    /// Extra directories created during prerequisites.
    pub ensure_dirs: Vec<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/data"),
            code_dir: PathBuf::from("~/code"),
            state_dir: PathBuf::from("~/.toolbox/state"),
            ensure_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub name: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: "toolbox_network".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecretsConfig {
    /// Secret backend CLI binary.
    pub cli: String,
    pub vault: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            cli: "op".to_string(),
            vault: "Private".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UptimeConfig {
    /// Heartbeat URL; reporting is disabled when absent.
    pub url: Option<EnvValue>,
}

/// Bounded timeouts for every external call.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Runtime and VCS queries.
    pub query_secs: u64,
    /// Container start/stop, checkouts, compose.
    pub mutate_secs: u64,
    pub pull_secs: u64,
    /// Build, install and image builds.
    pub build_secs: u64,
    pub clone_secs: u64,
    pub secret_secs: u64,
    pub release_lookup_ms: u64,
    /// Must stay sub-second so a slow monitor never delays the pass.
    pub report_ms: u64,
    /// Wait after spawning a supervised process.
    pub process_grace_ms: u64,
    /// Wait after spawning the tunnel before confirming it is alive.
    pub tunnel_grace_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            query_secs: 30,
            mutate_secs: 120,
            pull_secs: 900,
            build_secs: 1800,
            clone_secs: 900,
            secret_secs: 30,
            release_lookup_ms: 5000,
            report_ms: 900,
            process_grace_ms: 2000,
            tunnel_grace_ms: 10_000,
        }
    }
}

impl TimeoutsConfig {
    pub fn query(&self) -> Duration {
        Duration::from_secs(self.query_secs)
    }

    pub fn mutate(&self) -> Duration {
        Duration::from_secs(self.mutate_secs)
    }

    pub fn pull(&self) -> Duration {
        Duration::from_secs(self.pull_secs)
    }

    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_secs)
    }

    pub fn clone_repo(&self) -> Duration {
        Duration::from_secs(self.clone_secs)
    }

    pub fn secret(&self) -> Duration {
        Duration::from_secs(self.secret_secs)
    }

    pub fn release_lookup(&self) -> Duration {
        Duration::from_millis(self.release_lookup_ms)
    }

    pub fn report(&self) -> Duration {
        Duration::from_millis(self.report_ms)
    }

    pub fn process_grace(&self) -> Duration {
        Duration::from_millis(self.process_grace_ms)
    }

    pub fn tunnel_grace(&self) -> Duration {
        Duration::from_millis(self.tunnel_grace_ms)
    }
}

/// A single-flight shell job (backups and similar maintenance).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct JobDescriptor {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Skip the run when the last success is more recent than this.
    #[serde(default)]
    pub min_interval_secs: Option<u64>,
    #[serde(default = "default_job_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_lock_staleness_secs")]
    pub lock_staleness_secs: u64,
}

fn default_job_timeout_secs() -> u64 {
    6 * 60 * 60
}

fn default_lock_staleness_secs() -> u64 {
    60 * 60
}

impl ToolboxConfig {
    /// Every descriptor in phase order: tunnel, processes, containers, git.
    pub fn services(&self) -> Vec<ServiceDescriptor<'_>> {
        let mut services = Vec::new();
        if let Some(tunnel) = &self.tunnel {
            services.push(ServiceDescriptor::Tunnel(tunnel));
        }
        services.extend(self.processes.iter().map(ServiceDescriptor::Process));
        services.extend(self.containers.iter().map(ServiceDescriptor::Container));
        services.extend(self.git.iter().map(ServiceDescriptor::Git));
        services
    }

    pub fn job(&self, name: &str) -> Option<&JobDescriptor> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.name.trim().is_empty() {
            bail!("network.name must not be empty");
        }
        if self.secrets.cli.trim().is_empty() {
            bail!("secrets.cli must not be empty");
        }
        if self.timeouts.report_ms == 0 || self.timeouts.report_ms >= 1000 {
            bail!("timeouts.report_ms must be between 1 and 999");
        }

        let services = self.services();
        let mut names = BTreeSet::new();
        for service in &services {
            let name = service.name();
            if name.trim().is_empty() {
                bail!("{} service with an empty name", service.kind());
            }
            if !names.insert(name) {
                bail!("duplicate service name '{name}'");
            }
        }
        for service in &services {
            for dep in service.depends_on() {
                if !names.contains(dep.as_str()) {
                    bail!("'{}' depends on unknown service '{dep}'", service.name());
                }
            }
        }
        dependency_order(&services).context("validate depends_on")?;

        for container in &self.containers {
            if container.image.trim().is_empty() {
                bail!("container '{}' has an empty image", container.name);
            }
            if container.command.as_ref().is_some_and(Vec::is_empty) {
                bail!("container '{}' has an empty command", container.name);
            }
        }
        for process in &self.processes {
            if process.detection.trim().is_empty() || process.start_cmd.trim().is_empty() {
                bail!("process '{}' needs detection and start_cmd", process.name);
            }
        }
        for git in &self.git {
            validate_git(git)?;
        }

        let mut job_names = BTreeSet::new();
        for job in &self.jobs {
            if !job_names.insert(job.name.as_str()) {
                bail!("duplicate job name '{}'", job.name);
            }
            if job.command.trim().is_empty() {
                bail!("job '{}' has an empty command", job.name);
            }
            if job.timeout_secs == 0 {
                bail!("job '{}' timeout_secs must be > 0", job.name);
            }
        }
        Ok(())
    }

    /// Expand a leading `~` in every configured path.
    fn expand_paths(&mut self, home: Option<&Path>) {
        let expand = |path: &mut PathBuf| *path = expand_tilde(path, home);
        expand(&mut self.paths.data_dir);
        expand(&mut self.paths.code_dir);
        expand(&mut self.paths.state_dir);
        self.paths.ensure_dirs.iter_mut().for_each(expand);
        if let Some(tunnel) = &mut self.tunnel {
            expand(&mut tunnel.config_path);
            expand(&mut tunnel.log_file);
        }
        for container in &mut self.containers {
            expand_volumes(&mut container.volumes, home);
        }
        for git in &mut self.git {
            expand(&mut git.local_path);
            if let Some(deploy) = &mut git.deploy_path {
                expand(deploy);
            }
            if let Some(container) = &mut git.container {
                expand_volumes(&mut container.volumes, home);
            }
        }
        for job in &mut self.jobs {
            if let Some(workdir) = &mut job.workdir {
                expand(workdir);
            }
        }
    }
}

fn validate_git(git: &GitBuildDescriptor) -> Result<()> {
    if git.repo_url.trim().is_empty() {
        bail!("git service '{}' has an empty repo_url", git.name);
    }
    if git.local_path.as_os_str().is_empty() {
        bail!("git service '{}' has an empty local_path", git.name);
    }
    if git.local_path.parent().is_none() {
        bail!("git service '{}' local_path has no parent directory", git.name);
    }
    if git.deploy_strategy == DeployStrategy::Scratch
        && (git.build_cmd.is_none() || git.deploy_path.is_none())
    {
        bail!(
            "git service '{}' uses the scratch strategy and needs build_cmd and deploy_path",
            git.name
        );
    }
    if let Some(container) = &git.container
        && container.image.trim().is_empty()
    {
        bail!("git service '{}' has an empty container image", git.name);
    }
    Ok(())
}

/// Expand `~` in the host side of `host:container[:mode]` volume mappings.
fn expand_volumes(volumes: &mut [String], home: Option<&Path>) {
    for volume in volumes {
        if volume.starts_with("~/") || volume.starts_with("~:") {
            let (host, rest) = volume.split_once(':').unwrap_or((volume.as_str(), ""));
            let expanded = expand_tilde(Path::new(host), home);
            let mut mapped = expanded.to_string_lossy().into_owned();
            if !rest.is_empty() {
                mapped.push(':');
                mapped.push_str(rest);
            }
            *volume = mapped;
        }
    }
}

/// Replace a leading `~` with the home directory, if known.
pub fn expand_tilde(path: &Path, home: Option<&Path>) -> PathBuf {
    let Some(home) = home else {
        return path.to_path_buf();
    };
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Load, expand and validate the configuration at `path`.
pub fn load_config(path: &Path) -> Result<ToolboxConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_config(&contents, home::home_dir().as_deref())
        .with_context(|| format!("parse {}", path.display()))
}

/// Parse configuration text; `home` expands `~` prefixes.
pub fn parse_config(contents: &str, home: Option<&Path>) -> Result<ToolboxConfig> {
    let mut cfg: ToolboxConfig = toml::from_str(contents).context("decode toml")?;
    cfg.expand_paths(home);
    cfg.validate()
        .map_err(|err| anyhow!("invalid configuration: {err:#}"))?;
    Ok(cfg)
}
