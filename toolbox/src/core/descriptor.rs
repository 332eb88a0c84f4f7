//! Declarative service descriptors.
//!
//! Descriptors are plain data deserialized from the configuration file. They
//! describe desired state only; nothing here observes or mutates the host.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Backend that owns a [`SecretReference`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretProvider {
    Vault,
}

/// Symbolic pointer to a secret, resolved fresh on every pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretReference {
    pub provider: SecretProvider,
    pub item: String,
    pub field: String,
}

/// Environment value: either a literal or a secret to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Literal(String),
    Secret(SecretReference),
}

impl From<&str> for EnvValue {
    fn from(value: &str) -> Self {
        EnvValue::Literal(value.to_string())
    }
}

pub type Environment = BTreeMap<String, EnvValue>;

/// A single long-running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub name: String,
    /// `repository[:tag]`; an untagged reference means `:latest`.
    pub image: String,
    #[serde(default)]
    pub ports: Vec<String>,
    /// `host:container[:mode]`; absolute host paths are created on demand.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub environment: Environment,
    /// Command and arguments passed after the image.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
}

/// Container built from a git checkout. The container takes the service name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedContainer {
    pub image: String,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

/// Where the build runs before its output is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStrategy {
    /// Build in the checkout and copy it to the destination.
    #[default]
    InPlace,
    /// Build in a scratch copy without `.git` so the checkout stays clean.
    Scratch,
}

/// Action taken after a service changed during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PostDeployAction {
    RestartContainer { container: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitBuildDescriptor {
    pub name: String,
    pub repo_url: String,
    pub local_path: PathBuf,
    /// Branch (or fixed tag/commit) to follow instead of the remote default.
    #[serde(default)]
    pub branch: Option<String>,
    /// Follow the latest published release tag of the upstream repository.
    #[serde(default)]
    pub track_releases: bool,
    #[serde(default)]
    pub build_cmd: Option<String>,
    /// Runs once, right after the first clone.
    #[serde(default)]
    pub install_cmd: Option<String>,
    #[serde(default)]
    pub deploy_path: Option<PathBuf>,
    #[serde(default)]
    pub deploy_strategy: DeployStrategy,
    #[serde(default)]
    pub container: Option<EmbeddedContainer>,
    /// Rendered to `<checkout>/.env`.
    #[serde(default)]
    pub env_file: Option<EnvValue>,
    /// Rendered to `<checkout>/compose.override.yml`.
    #[serde(default)]
    pub compose_override: Option<toml::Table>,
    #[serde(default)]
    pub post_deploy: Option<PostDeployAction>,
    /// Rebuild and redeploy even when the remote has no new commits.
    #[serde(default)]
    pub force_update: bool,
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
}

impl GitBuildDescriptor {
    /// Stand-alone container descriptor for the embedded container, if any.
    pub fn container_descriptor(&self) -> Option<ContainerDescriptor> {
        self.container.as_ref().map(|c| ContainerDescriptor {
            name: self.name.clone(),
            image: c.image.clone(),
            ports: c.ports.clone(),
            volumes: c.volumes.clone(),
            environment: c.environment.clone(),
            command: c.command.clone(),
            auto_update: self.auto_update,
            depends_on: BTreeSet::new(),
        })
    }
}

/// Bare OS process supervised through a detection command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub name: String,
    /// Shell command that prints something iff the process is running.
    pub detection: String,
    pub start_cmd: String,
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDescriptor {
    /// Tunnel identity passed to `<binary> tunnel run`.
    pub name: String,
    pub config_path: PathBuf,
    pub log_file: PathBuf,
    #[serde(default = "default_tunnel_binary")]
    pub binary: String,
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
}

fn default_tunnel_binary() -> String {
    "cloudflared".to_string()
}

impl TunnelDescriptor {
    /// Pattern matched by `pgrep -f` to find running tunnel processes.
    pub fn process_pattern(&self) -> String {
        format!("{} tunnel", self.binary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceKind {
    Tunnel,
    Process,
    Container,
    Git,
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ServiceKind::Tunnel => "tunnel",
            ServiceKind::Process => "process",
            ServiceKind::Container => "container",
            ServiceKind::Git => "git",
        };
        f.write_str(label)
    }
}

/// Borrowed view over any descriptor, exposing the fields all kinds share.
#[derive(Debug, Clone, Copy)]
pub enum ServiceDescriptor<'a> {
    Container(&'a ContainerDescriptor),
    Git(&'a GitBuildDescriptor),
    Process(&'a ProcessDescriptor),
    Tunnel(&'a TunnelDescriptor),
}

impl<'a> ServiceDescriptor<'a> {
    pub fn name(&self) -> &'a str {
        match *self {
            ServiceDescriptor::Container(d) => &d.name,
            ServiceDescriptor::Git(d) => &d.name,
            ServiceDescriptor::Process(d) => &d.name,
            ServiceDescriptor::Tunnel(d) => &d.name,
        }
    }

    pub fn kind(&self) -> ServiceKind {
        match *self {
            ServiceDescriptor::Container(_) => ServiceKind::Container,
            ServiceDescriptor::Git(_) => ServiceKind::Git,
            ServiceDescriptor::Process(_) => ServiceKind::Process,
            ServiceDescriptor::Tunnel(_) => ServiceKind::Tunnel,
        }
    }

    pub fn auto_update(&self) -> bool {
        match *self {
            ServiceDescriptor::Container(d) => d.auto_update,
            ServiceDescriptor::Git(d) => d.auto_update,
            ServiceDescriptor::Process(d) => d.auto_update,
            ServiceDescriptor::Tunnel(d) => d.auto_update,
        }
    }

    pub fn depends_on(&self) -> &'a BTreeSet<String> {
        match *self {
            ServiceDescriptor::Container(d) => &d.depends_on,
            ServiceDescriptor::Git(d) => &d.depends_on,
            ServiceDescriptor::Process(d) => &d.depends_on,
            ServiceDescriptor::Tunnel(d) => &d.depends_on,
        }
    }
}
