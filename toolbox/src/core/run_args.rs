//! Argument construction for `docker run`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use super::descriptor::ContainerDescriptor;

/// Restart policy applied to every managed container.
pub const RESTART_POLICY: &str = "unless-stopped";

/// Build the argument list for `docker run` (without the `docker` program).
///
/// Flags are emitted in a fixed order (env sorted by key) so the same
/// descriptor always yields the same command.
pub fn docker_run_args(
    desc: &ContainerDescriptor,
    network: &str,
    env: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        desc.name.clone(),
        "--restart".to_string(),
        RESTART_POLICY.to_string(),
        "--network".to_string(),
        network.to_string(),
    ];
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    for volume in &desc.volumes {
        args.push("-v".to_string());
        args.push(volume.clone());
    }
    for port in &desc.ports {
        args.push("-p".to_string());
        args.push(port.clone());
    }
    args.push(desc.image.clone());
    if let Some(command) = &desc.command {
        args.extend(command.iter().cloned());
    }
    args
}

/// Host-side directories that must exist before the container starts.
///
/// Named volumes (no leading `/`) are managed by the runtime and skipped.
pub fn volume_host_dirs(volumes: &[String]) -> Vec<PathBuf> {
    volumes
        .iter()
        .filter_map(|volume| volume.split(':').next())
        .filter(|host| host.starts_with('/'))
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::container;

    #[test]
    fn builds_deterministic_run_command() {
        let mut desc = container("postgres", "pgvector/pgvector:pg17");
        desc.ports = vec!["5432:5432".to_string()];
        desc.volumes = vec!["/srv/data/postgres:/var/lib/postgresql/data".to_string()];
        desc.command = Some(vec!["postgres".to_string(), "-N".to_string(), "1000".to_string()]);
        let env = BTreeMap::from([
            ("POSTGRES_USER".to_string(), "app".to_string()),
            ("POSTGRES_MAX_CONNECTIONS".to_string(), "1000".to_string()),
        ]);

        let args = docker_run_args(&desc, "toolbox_network", &env);
        assert_eq!(
            args.join(" "),
            "run -d --name postgres --restart unless-stopped --network toolbox_network \
             -e POSTGRES_MAX_CONNECTIONS=1000 -e POSTGRES_USER=app \
             -v /srv/data/postgres:/var/lib/postgresql/data -p 5432:5432 \
             pgvector/pgvector:pg17 postgres -N 1000"
        );
    }

    #[test]
    fn only_absolute_host_paths_are_created() {
        let dirs = volume_host_dirs(&[
            "/srv/data/ghost:/var/lib/ghost/content".to_string(),
            "named_volume:/data".to_string(),
        ]);
        assert_eq!(dirs, vec![PathBuf::from("/srv/data/ghost")]);
    }
}
