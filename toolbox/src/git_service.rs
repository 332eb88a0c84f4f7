//! Services built from git checkouts.
//!
//! One reconciliation walks the checkout through clone or update, optional
//! release-tag pinning, the one-time install, rendering of `.env` and compose
//! override files, build, deploy, containerize and run. Each stage's failure
//! stops the remaining stages of this service only.
//!
//! Nothing is rebuilt unless the checkout moved, a rendered file changed, or
//! the descriptor forces it. The container or compose stack is still started
//! when it is found down.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::container::ContainerReconciler;
use crate::core::descriptor::{DeployStrategy, GitBuildDescriptor, PostDeployAction};
use crate::core::render::{COMPOSE_OVERRIDE_FILE, ENV_FILE, compose_override_yaml, env_file_contents};
use crate::core::types::ReconciliationOutcome;
use crate::error::ToolboxError;
use crate::io::config::TimeoutsConfig;
use crate::io::docker::Docker;
use crate::io::files::{copy_tree, replace_dir_contents, write_if_changed};
use crate::io::git::{CloneOptions, Git};
use crate::io::lock::{AdvisoryLock, DEFAULT_STALENESS};
use crate::io::process::{CommandSpec, ProcessExecutor, run_checked};
use crate::io::release::ReleaseSource;
use crate::io::secrets::SecretResolver;

/// What happened to the checkout during this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckoutSync {
    /// The repository was cloned this pass.
    pub cloned: bool,
    /// HEAD moved (or the working tree was populated for the first time).
    pub changed: bool,
}

impl CheckoutSync {
    const UNCHANGED: Self = Self {
        cloned: false,
        changed: false,
    };
    const UPDATED: Self = Self {
        cloned: false,
        changed: true,
    };
}

/// Sentinel guarding a checkout against overlapping passes.
pub fn checkout_lock_path(local_path: &Path) -> Result<PathBuf> {
    let parent = local_path
        .parent()
        .with_context(|| format!("checkout path missing parent {}", local_path.display()))?;
    let name = local_path
        .file_name()
        .with_context(|| format!("checkout path missing name {}", local_path.display()))?;
    Ok(parent.join(format!(".{}.toolbox.lock", name.to_string_lossy())))
}

pub struct GitReconciler<'a> {
    executor: &'a dyn ProcessExecutor,
    secrets: &'a dyn SecretResolver,
    releases: &'a dyn ReleaseSource,
    timeouts: &'a TimeoutsConfig,
    network: &'a str,
}

impl<'a> GitReconciler<'a> {
    pub fn new(
        executor: &'a dyn ProcessExecutor,
        secrets: &'a dyn SecretResolver,
        releases: &'a dyn ReleaseSource,
        timeouts: &'a TimeoutsConfig,
        network: &'a str,
    ) -> Self {
        Self {
            executor,
            secrets,
            releases,
            timeouts,
            network,
        }
    }

    #[instrument(skip_all, fields(service = %desc.name))]
    pub fn ensure_deployed(&self, desc: &GitBuildDescriptor) -> Result<ReconciliationOutcome> {
        let _lock = AdvisoryLock::acquire(&checkout_lock_path(&desc.local_path)?, DEFAULT_STALENESS)?;
        let git = Git::new(self.executor, self.timeouts, &desc.local_path);

        let sync = self.sync_checkout(desc, &git)?;
        if sync.cloned {
            self.install(desc)?;
        }
        let rendered = self.render_files(desc)?;

        let rebuild = sync.changed || rendered || desc.force_update;
        if rebuild {
            info!(
                service = %desc.name,
                checkout_changed = sync.changed,
                files_changed = rendered,
                forced = desc.force_update,
                "rebuilding"
            );
            self.build_and_deploy(desc)?;
            self.containerize(desc)?;
        } else {
            info!(service = %desc.name, "no changes, skipping build and deploy");
        }

        let started = self.run(desc, rebuild)?;
        if rebuild {
            self.post_deploy(desc)?;
        }

        Ok(if rebuild || started {
            ReconciliationOutcome::Converged
        } else {
            ReconciliationOutcome::Unchanged
        })
    }

    /// Clone or update the checkout and report whether HEAD moved.
    pub fn sync_checkout(&self, desc: &GitBuildDescriptor, git: &Git<'_>) -> Result<CheckoutSync> {
        if desc.local_path.exists() && !git.is_repository() {
            return Err(ToolboxError::RepositoryState {
                path: desc.local_path.clone(),
            }
            .into());
        }

        let cloned = !git.is_repository();
        if cloned {
            info!(service = %desc.name, path = %desc.local_path.display(), "cloning");
            let options = CloneOptions {
                branch: if desc.track_releases {
                    None
                } else {
                    desc.branch.as_deref()
                },
                no_checkout: desc.track_releases,
            };
            git.clone_from(&desc.repo_url, &options)
                .with_context(|| format!("clone {}", desc.name))?;
        } else if !desc.auto_update {
            debug!(service = %desc.name, "auto_update off, not fetching");
            return Ok(CheckoutSync::UNCHANGED);
        } else {
            git.fetch().with_context(|| format!("fetch {}", desc.name))?;
        }

        if desc.track_releases {
            if let Some(tag) = self.releases.latest_tag(&desc.repo_url) {
                return self.pin_release(desc, git, &tag, cloned);
            }
            if cloned {
                // No release published: populate the tree from the pin or default branch.
                let reference = self.tracked_branch(desc, git)?;
                git.checkout(&reference)?;
                return Ok(CheckoutSync {
                    cloned,
                    changed: true,
                });
            }
            if let Some(current) = git.current_tag()? {
                // Lookup failures also land here; stay on the release we have.
                warn!(service = %desc.name, tag = %current, "no release found, keeping current tag");
                return Ok(CheckoutSync::UNCHANGED);
            }
        }

        if cloned {
            return Ok(CheckoutSync {
                cloned,
                changed: true,
            });
        }
        self.follow_branch(desc, git)
    }

    fn pin_release(
        &self,
        desc: &GitBuildDescriptor,
        git: &Git<'_>,
        tag: &str,
        cloned: bool,
    ) -> Result<CheckoutSync> {
        if !cloned && git.current_tag()?.as_deref() == Some(tag) {
            info!(service = %desc.name, tag, "already on latest release");
            return Ok(CheckoutSync::UNCHANGED);
        }
        info!(service = %desc.name, tag, "checking out release");
        git.checkout(tag)?;
        Ok(CheckoutSync {
            cloned,
            changed: true,
        })
    }

    fn tracked_branch(&self, desc: &GitBuildDescriptor, git: &Git<'_>) -> Result<String> {
        match &desc.branch {
            Some(branch) => Ok(branch.clone()),
            None => git.default_branch(),
        }
    }

    /// Fast-forward to the tracked branch, or move to a fixed tag/commit pin.
    fn follow_branch(&self, desc: &GitBuildDescriptor, git: &Git<'_>) -> Result<CheckoutSync> {
        let reference = self.tracked_branch(desc, git)?;
        if git.remote_branch_exists(&reference)? {
            let behind = git.commits_behind(&reference)?;
            if behind == 0 {
                info!(service = %desc.name, branch = %reference, "up to date");
                return Ok(CheckoutSync::UNCHANGED);
            }
            info!(service = %desc.name, branch = %reference, behind, "pulling new commits");
            git.checkout(&reference)?;
            git.pull_ff_only()?;
            return Ok(CheckoutSync::UPDATED);
        }

        let target = git.resolve_commit(&reference)?;
        if git.head_commit()? == target {
            info!(service = %desc.name, pin = %reference, "at pinned revision");
            return Ok(CheckoutSync::UNCHANGED);
        }
        info!(service = %desc.name, pin = %reference, "moving to pinned revision");
        git.checkout(&reference)?;
        Ok(CheckoutSync::UPDATED)
    }

    fn install(&self, desc: &GitBuildDescriptor) -> Result<()> {
        let Some(command) = &desc.install_cmd else {
            return Ok(());
        };
        info!(service = %desc.name, "running install command");
        let spec = CommandSpec::shell(command, self.timeouts.build()).current_dir(&desc.local_path);
        run_checked(self.executor, &spec).map_err(|err| ToolboxError::Install {
            service: desc.name.clone(),
            path: desc.local_path.clone(),
            detail: format!("{err:#}"),
        })?;
        Ok(())
    }

    /// Write `.env` and the compose override. Returns whether either changed.
    fn render_files(&self, desc: &GitBuildDescriptor) -> Result<bool> {
        let mut changed = false;
        if let Some(payload) = &desc.env_file {
            let raw = self
                .secrets
                .resolve_value(payload)
                .with_context(|| format!("resolve env file for {}", desc.name))?;
            let path = desc.local_path.join(ENV_FILE);
            if write_if_changed(&path, &env_file_contents(&raw))? {
                info!(service = %desc.name, "wrote {ENV_FILE}");
                changed = true;
            }
        }
        if let Some(document) = &desc.compose_override {
            let path = desc.local_path.join(COMPOSE_OVERRIDE_FILE);
            if write_if_changed(&path, &compose_override_yaml(document)?)? {
                info!(service = %desc.name, "wrote {COMPOSE_OVERRIDE_FILE}");
                changed = true;
            }
        }
        Ok(changed)
    }

    fn build_and_deploy(&self, desc: &GitBuildDescriptor) -> Result<()> {
        match desc.deploy_strategy {
            DeployStrategy::InPlace => {
                if let Some(command) = &desc.build_cmd {
                    self.build(desc, &desc.local_path, command)?;
                }
                if let Some(dest) = &desc.deploy_path {
                    self.deploy(desc, &desc.local_path, dest)?;
                }
            }
            DeployStrategy::Scratch => {
                let parent = desc
                    .local_path
                    .parent()
                    .with_context(|| format!("checkout path missing parent {}", desc.local_path.display()))?;
                let scratch = tempfile::Builder::new()
                    .prefix(&format!(".{}.scratch-", desc.name))
                    .tempdir_in(parent)
                    .with_context(|| format!("create scratch dir in {}", parent.display()))?;
                copy_tree(&desc.local_path, scratch.path(), |name| name != ".git")
                    .with_context(|| format!("copy {} to scratch", desc.name))?;
                debug!(service = %desc.name, scratch = %scratch.path().display(), "building in scratch copy");
                if let Some(command) = &desc.build_cmd {
                    self.build(desc, scratch.path(), command)?;
                }
                if let Some(dest) = &desc.deploy_path {
                    self.deploy(desc, scratch.path(), dest)?;
                }
            }
        }
        Ok(())
    }

    fn build(&self, desc: &GitBuildDescriptor, dir: &Path, command: &str) -> Result<()> {
        info!(service = %desc.name, "building");
        let spec = CommandSpec::shell(command, self.timeouts.build()).current_dir(dir);
        run_checked(self.executor, &spec).map_err(|err| ToolboxError::Build {
            service: desc.name.clone(),
            detail: format!("{err:#}"),
        })?;
        Ok(())
    }

    fn deploy(&self, desc: &GitBuildDescriptor, from: &Path, dest: &Path) -> Result<()> {
        replace_dir_contents(from, dest).map_err(|err| ToolboxError::Deploy {
            service: desc.name.clone(),
            detail: format!("{err:#}"),
        })?;
        info!(service = %desc.name, dest = %dest.display(), "deployed");
        Ok(())
    }

    fn containerize(&self, desc: &GitBuildDescriptor) -> Result<()> {
        let Some(container) = &desc.container else {
            return Ok(());
        };
        Docker::new(self.executor, self.timeouts)
            .build_image(&desc.local_path, &container.image)
            .map_err(|err| ToolboxError::Build {
                service: desc.name.clone(),
                detail: format!("{err:#}"),
            })?;
        Ok(())
    }

    /// Ensure the embedded container or compose stack runs. Returns whether
    /// anything was (re)started.
    fn run(&self, desc: &GitBuildDescriptor, rebuilt: bool) -> Result<bool> {
        let mut started = false;
        let docker = Docker::new(self.executor, self.timeouts);

        if let Some(container) = desc.container_descriptor() {
            if rebuilt || !docker.is_running(&container.name)? {
                ContainerReconciler::new(self.executor, self.secrets, self.timeouts, self.network)
                    .recreate(&container)
                    .with_context(|| format!("start container {}", container.name))?;
                started = true;
            }
        }

        if desc.compose_override.is_some() {
            if rebuilt {
                docker.compose_down(&desc.local_path)?;
                docker.compose_up(&desc.local_path)?;
                started = true;
            } else if !docker.compose_running(&desc.local_path)? {
                info!(service = %desc.name, "compose stack down, bringing it up");
                docker.compose_up(&desc.local_path)?;
                started = true;
            }
        }
        Ok(started)
    }

    fn post_deploy(&self, desc: &GitBuildDescriptor) -> Result<()> {
        let Some(action) = &desc.post_deploy else {
            return Ok(());
        };
        match action {
            PostDeployAction::RestartContainer { container } => {
                let docker = Docker::new(self.executor, self.timeouts);
                if !docker.restart(container)? {
                    warn!(service = %desc.name, container = %container, "post-deploy restart target not found");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_sits_beside_the_checkout() {
        assert_eq!(
            checkout_lock_path(Path::new("/srv/code/ghost")).expect("lock path"),
            PathBuf::from("/srv/code/.ghost.toolbox.lock")
        );
    }
}
