//! Convergence of single long-running containers.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::descriptor::{ContainerDescriptor, EnvValue};
use crate::core::image::normalize;
use crate::core::types::ReconciliationOutcome;
use crate::io::config::TimeoutsConfig;
use crate::io::docker::Docker;
use crate::io::process::ProcessExecutor;
use crate::io::secrets::SecretResolver;

/// Brings one container in line with its descriptor.
pub struct ContainerReconciler<'a> {
    docker: Docker<'a>,
    secrets: &'a dyn SecretResolver,
    network: &'a str,
}

impl<'a> ContainerReconciler<'a> {
    pub fn new(
        executor: &'a dyn ProcessExecutor,
        secrets: &'a dyn SecretResolver,
        timeouts: &'a TimeoutsConfig,
        network: &'a str,
    ) -> Self {
        Self {
            docker: Docker::new(executor, timeouts),
            secrets,
            network,
        }
    }

    /// Start the container if it is missing, or replace it when the declared
    /// image changed and `auto_update` allows it.
    ///
    /// A failed pull never takes a running container down.
    #[instrument(skip_all, fields(container = %desc.name))]
    pub fn ensure_running(&self, desc: &ContainerDescriptor) -> Result<ReconciliationOutcome> {
        let desired = normalize(&desc.image);
        let existing = self.docker.container(&desc.name)?;

        let Some(info) = existing.filter(|info| info.running) else {
            info!(container = %desc.name, image = %desired, "container not running, starting");
            if desc.auto_update {
                self.docker.pull(&desc.image);
            }
            let env = self.resolve_env(desc)?;
            // Clears a stopped container still holding the name.
            self.docker.stop(&desc.name)?;
            self.docker
                .start(desc, self.network, &env.values, &env.sensitive)?;
            return Ok(ReconciliationOutcome::Converged);
        };

        let running = normalize(&self.docker.image_of(&info.id)?.reference);
        if running == desired {
            info!(container = %desc.name, image = %running, "container up to date");
            return Ok(ReconciliationOutcome::Unchanged);
        }
        if !desc.auto_update {
            info!(
                container = %desc.name,
                running = %running,
                desired = %desired,
                "image differs but auto_update is off, leaving as is"
            );
            return Ok(ReconciliationOutcome::Unchanged);
        }
        if !self.docker.pull(&desc.image) {
            warn!(container = %desc.name, image = %desired, "pull failed, keeping the running container");
            return Ok(ReconciliationOutcome::Unchanged);
        }

        let env = self.resolve_env(desc)?;
        info!(container = %desc.name, from = %running, to = %desired, "replacing container");
        self.docker.stop(&desc.name)?;
        self.docker
            .start(desc, self.network, &env.values, &env.sensitive)?;
        Ok(ReconciliationOutcome::Converged)
    }

    /// Stop, remove and start again with freshly resolved environment.
    pub fn recreate(&self, desc: &ContainerDescriptor) -> Result<()> {
        let env = self.resolve_env(desc)?;
        self.docker.stop(&desc.name)?;
        self.docker
            .start(desc, self.network, &env.values, &env.sensitive)
    }

    fn resolve_env(&self, desc: &ContainerDescriptor) -> Result<ResolvedEnv> {
        let values = self
            .secrets
            .resolve_all(&desc.environment)
            .with_context(|| format!("resolve environment for {}", desc.name))?;
        let sensitive = desc
            .environment
            .iter()
            .filter(|(_, value)| matches!(value, EnvValue::Secret(_)))
            .filter_map(|(key, _)| values.get(key).cloned())
            .collect();
        Ok(ResolvedEnv { values, sensitive })
    }
}

struct ResolvedEnv {
    values: BTreeMap<String, String>,
    sensitive: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::{SecretProvider, SecretReference};
    use crate::io::process::CommandOutput;
    use crate::test_support::{ScriptedExecutor, StaticSecrets, container};

    const MUTATIONS: [&str; 5] = ["docker run", "docker stop", "docker rm", "docker pull", "docker restart"];

    fn mutations(executor: &ScriptedExecutor) -> usize {
        MUTATIONS.iter().map(|prefix| executor.count(prefix)).sum()
    }

    fn running(executor: &ScriptedExecutor, name: &str, image: &str) {
        executor.respond("docker ps", CommandOutput::ok(&format!("c0ffee {name} running\n")));
        executor.respond(
            "docker inspect",
            CommandOutput::ok(&format!("{image} sha256:1234\n")),
        );
    }

    #[test]
    fn untagged_running_image_matches_latest() {
        let timeouts = TimeoutsConfig::default();
        let secrets = StaticSecrets::new();
        let executor = ScriptedExecutor::new();
        running(&executor, "web", "nginx");
        let mut desc = container("web", "nginx:latest");
        desc.auto_update = true;

        let outcome = ContainerReconciler::new(&executor, &secrets, &timeouts, "net")
            .ensure_running(&desc)
            .expect("reconcile");
        assert_eq!(outcome, ReconciliationOutcome::Unchanged);
        assert_eq!(mutations(&executor), 0);
    }

    #[test]
    fn auto_update_off_never_replaces() {
        let timeouts = TimeoutsConfig::default();
        let secrets = StaticSecrets::new();
        let executor = ScriptedExecutor::new();
        running(&executor, "web", "nginx:1.25");
        let desc = container("web", "nginx:1.27");

        let outcome = ContainerReconciler::new(&executor, &secrets, &timeouts, "net")
            .ensure_running(&desc)
            .expect("reconcile");
        assert_eq!(outcome, ReconciliationOutcome::Unchanged);
        assert_eq!(mutations(&executor), 0);
    }

    #[test]
    fn changed_image_is_pulled_then_replaced() {
        let timeouts = TimeoutsConfig::default();
        let secrets = StaticSecrets::new();
        let executor = ScriptedExecutor::new();
        running(&executor, "web", "nginx:1.25");
        let mut desc = container("web", "nginx:1.27");
        desc.auto_update = true;

        let outcome = ContainerReconciler::new(&executor, &secrets, &timeouts, "net")
            .ensure_running(&desc)
            .expect("reconcile");
        assert_eq!(outcome, ReconciliationOutcome::Converged);
        let mutating: Vec<String> = executor
            .calls()
            .into_iter()
            .filter(|call| MUTATIONS.iter().any(|prefix| call.starts_with(prefix)))
            .collect();
        assert_eq!(
            mutating,
            vec![
                "docker pull nginx:1.27",
                "docker stop web",
                "docker rm web",
                "docker run -d --name web --restart unless-stopped --network net nginx:1.27",
            ]
        );
    }

    #[test]
    fn failed_pull_leaves_running_container_untouched() {
        let timeouts = TimeoutsConfig::default();
        let secrets = StaticSecrets::new();
        let executor = ScriptedExecutor::new();
        running(&executor, "web", "nginx:1.25");
        executor.respond("docker pull", CommandOutput::failed(1, "manifest unknown"));
        let mut desc = container("web", "nginx:1.27");
        desc.auto_update = true;

        let outcome = ContainerReconciler::new(&executor, &secrets, &timeouts, "net")
            .ensure_running(&desc)
            .expect("reconcile");
        assert_eq!(outcome, ReconciliationOutcome::Unchanged);
        assert_eq!(executor.count("docker stop"), 0);
        assert_eq!(executor.count("docker run"), 0);
    }

    #[test]
    fn stopped_container_is_cleared_and_started_with_secrets() {
        let timeouts = TimeoutsConfig::default();
        let secrets = StaticSecrets::new().with("Postgres Docker", "password", "hunter2");
        let executor = ScriptedExecutor::new();
        executor.respond("docker ps", CommandOutput::ok("dead01 postgres exited\n"));
        let mut desc = container("postgres", "pgvector/pgvector:pg17");
        desc.environment.insert(
            "POSTGRES_PASSWORD".to_string(),
            EnvValue::Secret(SecretReference {
                provider: SecretProvider::Vault,
                item: "Postgres Docker".to_string(),
                field: "password".to_string(),
            }),
        );

        let outcome = ContainerReconciler::new(&executor, &secrets, &timeouts, "net")
            .ensure_running(&desc)
            .expect("reconcile");
        assert_eq!(outcome, ReconciliationOutcome::Converged);
        assert_eq!(executor.count("docker pull"), 0);
        assert_eq!(executor.count("docker stop"), 0);
        assert_eq!(executor.count("docker rm postgres"), 1);

        let run = executor
            .specs()
            .into_iter()
            .find(|spec| spec.args.first().is_some_and(|arg| arg == "run"))
            .expect("docker run issued");
        assert!(run.args.contains(&"POSTGRES_PASSWORD=hunter2".to_string()));
        assert!(run.display().contains("POSTGRES_PASSWORD=[REDACTED]"));
    }

    #[test]
    fn secret_failure_fails_before_touching_the_container() {
        let timeouts = TimeoutsConfig::default();
        let secrets = StaticSecrets::new();
        let executor = ScriptedExecutor::new();
        running(&executor, "app", "app:1");
        let mut desc = container("app", "app:2");
        desc.auto_update = true;
        desc.environment.insert(
            "TOKEN".to_string(),
            EnvValue::Secret(SecretReference {
                provider: SecretProvider::Vault,
                item: "App".to_string(),
                field: "token".to_string(),
            }),
        );

        let err = ContainerReconciler::new(&executor, &secrets, &timeouts, "net")
            .ensure_running(&desc)
            .expect_err("missing secret");
        assert!(format!("{err:#}").contains("resolve environment for app"));
        assert_eq!(executor.count("docker stop"), 0);
    }
}
