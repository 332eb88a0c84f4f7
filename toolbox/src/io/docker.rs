//! Container runtime adapter over the `docker` CLI.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::descriptor::ContainerDescriptor;
use crate::core::image::ImageDetails;
use crate::core::run_args::{docker_run_args, volume_host_dirs};
use crate::error::ToolboxError;
use crate::io::config::TimeoutsConfig;
use crate::io::files::ensure_dir;
use crate::io::process::{CommandSpec, ProcessExecutor, command_error, run_checked};

/// Existing container matched by exact name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub running: bool,
}

/// Thin wrapper for `docker` subprocess calls.
pub struct Docker<'a> {
    executor: &'a dyn ProcessExecutor,
    timeouts: &'a TimeoutsConfig,
}

impl<'a> Docker<'a> {
    pub fn new(executor: &'a dyn ProcessExecutor, timeouts: &'a TimeoutsConfig) -> Self {
        Self { executor, timeouts }
    }

    fn query(&self, args: &[&str]) -> CommandSpec {
        CommandSpec::new("docker", args.iter().copied(), self.timeouts.query())
    }

    fn mutate(&self, args: &[&str]) -> CommandSpec {
        CommandSpec::new("docker", args.iter().copied(), self.timeouts.mutate())
    }

    /// Create the network if it does not exist yet.
    #[instrument(skip_all, fields(network = name))]
    pub fn ensure_network(&self, name: &str) -> Result<()> {
        let filter = format!("name={name}");
        let output = run_checked(
            self.executor,
            &self.query(&["network", "ls", "--filter", &filter, "--format", "{{.Name}}"]),
        )?;
        // The name filter is a substring match.
        if output.stdout.lines().any(|line| line.trim() == name) {
            debug!("network exists");
            return Ok(());
        }
        run_checked(self.executor, &self.mutate(&["network", "create", name]))?;
        info!(network = name, "created container network");
        Ok(())
    }

    /// Look up a container (running or stopped) by exact name.
    pub fn container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let filter = format!("name={name}");
        let output = run_checked(
            self.executor,
            &self.query(&[
                "ps",
                "--all",
                "--filter",
                &filter,
                "--format",
                "{{.ID}} {{.Names}} {{.State}}",
            ]),
        )?;
        Ok(parse_ps_line(&output.stdout, name))
    }

    pub fn container_id(&self, name: &str) -> Result<Option<String>> {
        Ok(self.container(name)?.map(|info| info.id))
    }

    pub fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self.container(name)?.is_some_and(|info| info.running))
    }

    /// Configured image reference and internal image id of a container.
    pub fn image_of(&self, container_id: &str) -> Result<ImageDetails> {
        let output = run_checked(
            self.executor,
            &self.query(&[
                "inspect",
                "--format",
                "{{.Config.Image}} {{.Image}}",
                container_id,
            ]),
        )?;
        let line = output.stdout_trimmed();
        let (reference, id) = line
            .split_once(' ')
            .with_context(|| format!("unexpected docker inspect output '{line}'"))?;
        Ok(ImageDetails {
            reference: reference.to_string(),
            id: id.to_string(),
        })
    }

    /// Pull an image. Soft: failures are logged and reported as `false`.
    #[instrument(skip_all, fields(image))]
    pub fn pull(&self, image: &str) -> bool {
        let spec = CommandSpec::new("docker", ["pull", image], self.timeouts.pull());
        let failure = match self.executor.run(&spec) {
            Ok(output) if output.success() => {
                info!(image, "pulled image");
                return true;
            }
            Ok(output) => ToolboxError::ImagePull {
                image: image.to_string(),
                stderr: spec.scrub(output.stderr.trim()),
            },
            Err(err) => ToolboxError::ImagePull {
                image: image.to_string(),
                stderr: format!("{err:#}"),
            },
        };
        warn!("{failure}");
        false
    }

    /// Create host volume directories, then `docker run` the container.
    ///
    /// `sensitive` values are redacted from the logged command and any error.
    #[instrument(skip_all, fields(container = %desc.name))]
    pub fn start(
        &self,
        desc: &ContainerDescriptor,
        network: &str,
        env: &BTreeMap<String, String>,
        sensitive: &[String],
    ) -> Result<()> {
        for dir in volume_host_dirs(&desc.volumes) {
            ensure_dir(&dir)?;
        }
        let spec = CommandSpec::new("docker", docker_run_args(desc, network, env), self.timeouts.mutate())
            .redact(sensitive.iter().cloned());
        run_checked(self.executor, &spec)?;
        info!(container = %desc.name, image = %desc.image, "started container");
        Ok(())
    }

    /// Stop and remove a container. Absent containers are a no-op.
    #[instrument(skip_all, fields(container = name))]
    pub fn stop(&self, name: &str) -> Result<()> {
        let Some(info) = self.container(name)? else {
            debug!("no container to stop");
            return Ok(());
        };
        if info.running {
            run_checked(self.executor, &self.mutate(&["stop", name]))?;
        }
        let remove = self.mutate(&["rm", name]);
        let output = self.executor.run(&remove)?;
        if !output.success() {
            return Err(command_error(&remove, &output))
                .with_context(|| format!("container {name} was stopped but not removed"));
        }
        info!(container = name, "removed container");
        Ok(())
    }

    /// Native restart; `false` when there is no such container.
    pub fn restart(&self, name: &str) -> Result<bool> {
        if self.container(name)?.is_none() {
            return Ok(false);
        }
        run_checked(self.executor, &self.mutate(&["restart", name]))?;
        info!(container = name, "restarted container");
        Ok(true)
    }

    pub fn build_image(&self, dir: &Path, image: &str) -> Result<()> {
        let spec = CommandSpec::new("docker", ["build", "-t", image, "."], self.timeouts.build())
            .current_dir(dir);
        run_checked(self.executor, &spec)?;
        info!(image, "built image");
        Ok(())
    }

    pub fn compose_up(&self, dir: &Path) -> Result<()> {
        let spec = CommandSpec::new(
            "docker",
            ["compose", "up", "--wait", "--detach"],
            self.timeouts.build(),
        )
        .current_dir(dir);
        run_checked(self.executor, &spec)?;
        info!(dir = %dir.display(), "compose stack up");
        Ok(())
    }

    pub fn compose_down(&self, dir: &Path) -> Result<()> {
        let spec = self.mutate(&["compose", "down"]).current_dir(dir);
        run_checked(self.executor, &spec)?;
        info!(dir = %dir.display(), "compose stack down");
        Ok(())
    }

    /// True when at least one compose-managed container is running.
    pub fn compose_running(&self, dir: &Path) -> Result<bool> {
        let spec = self.query(&["compose", "ps", "-q"]).current_dir(dir);
        let output = run_checked(self.executor, &spec)?;
        Ok(!output.stdout_trimmed().is_empty())
    }
}

fn parse_ps_line(stdout: &str, name: &str) -> Option<ContainerInfo> {
    stdout.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let id = parts.next()?;
        let names = parts.next()?;
        let state = parts.next().unwrap_or_default();
        names
            .split(',')
            .any(|candidate| candidate == name)
            .then(|| ContainerInfo {
                id: id.to_string(),
                running: state == "running",
            })
    })
}
