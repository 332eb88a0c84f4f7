use std::fs;
use std::path::Path;

use toolbox::core::descriptor::{
    DeployStrategy, EmbeddedContainer, EnvValue, GitBuildDescriptor, PostDeployAction,
    SecretProvider, SecretReference,
};
use toolbox::core::render::{COMPOSE_OVERRIDE_FILE, compose_override_yaml};
use toolbox::core::types::ReconciliationOutcome;
use toolbox::error::{self, ToolboxError};
use toolbox::git_service::GitReconciler;
use toolbox::io::config::TimeoutsConfig;
use toolbox::io::process::CommandOutput;
use toolbox::test_support::{
    ScriptedExecutor, StaticReleases, StaticSecrets, clone_creates_checkout, git_service,
};

const NETWORK: &str = "toolbox_network";

fn reconcile(
    executor: &ScriptedExecutor,
    secrets: &StaticSecrets,
    releases: &StaticReleases,
    desc: &GitBuildDescriptor,
) -> anyhow::Result<ReconciliationOutcome> {
    let timeouts = TimeoutsConfig::default();
    GitReconciler::new(executor, secrets, releases, &timeouts, NETWORK).ensure_deployed(desc)
}

fn existing_checkout(root: &Path, name: &str) -> std::path::PathBuf {
    let path = root.join("code").join(name);
    fs::create_dir_all(path.join(".git")).expect("create checkout");
    path
}

/// Remote default branch `main`, `behind` commits ahead of HEAD.
fn remote_main(executor: &ScriptedExecutor, behind: u32) {
    executor.respond("git symbolic-ref", CommandOutput::ok("origin/main\n"));
    executor.respond("git rev-list", CommandOutput::ok(&format!("{behind}\n")));
}

#[test]
fn unchanged_checkout_skips_install_build_and_deploy() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = existing_checkout(temp.path(), "site");
    let mut desc = git_service("site", "https://github.com/example/site.git", &path);
    desc.auto_update = true;
    desc.install_cmd = Some("npm ci".to_string());
    desc.build_cmd = Some("npm run build".to_string());
    desc.deploy_path = Some(temp.path().join("www/site"));

    let executor = ScriptedExecutor::new();
    remote_main(&executor, 0);
    let outcome = reconcile(&executor, &StaticSecrets::new(), &StaticReleases::new(), &desc)
        .expect("reconcile");

    assert_eq!(outcome, ReconciliationOutcome::Unchanged);
    assert_eq!(executor.count("sh -c"), 0);
    assert_eq!(executor.count("git pull"), 0);
    assert!(!temp.path().join("www/site").exists());
    assert_eq!(executor.count("git fetch --tags"), 1);
}

#[test]
fn new_commits_are_pulled_built_and_deployed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = existing_checkout(temp.path(), "site");
    fs::write(path.join("index.html"), "<h1>new</h1>").expect("write");
    let mut desc = git_service("site", "https://github.com/example/site.git", &path);
    desc.auto_update = true;
    desc.build_cmd = Some("npm run build".to_string());
    desc.deploy_path = Some(temp.path().join("www/site"));

    let executor = ScriptedExecutor::new();
    remote_main(&executor, 2);
    let outcome = reconcile(&executor, &StaticSecrets::new(), &StaticReleases::new(), &desc)
        .expect("reconcile");

    assert_eq!(outcome, ReconciliationOutcome::Converged);
    assert_eq!(executor.count("git checkout main"), 1);
    assert_eq!(executor.count("git pull --ff-only"), 1);
    assert_eq!(executor.count("sh -c npm run build"), 1);
    assert_eq!(
        fs::read_to_string(temp.path().join("www/site/index.html")).expect("deployed"),
        "<h1>new</h1>"
    );
    assert!(!temp.path().join("www/site/.git").exists());
}

#[test]
fn auto_update_off_never_fetches() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = existing_checkout(temp.path(), "site");
    let desc = git_service("site", "https://github.com/example/site.git", &path);

    let executor = ScriptedExecutor::new();
    let outcome = reconcile(&executor, &StaticSecrets::new(), &StaticReleases::new(), &desc)
        .expect("reconcile");
    assert_eq!(outcome, ReconciliationOutcome::Unchanged);
    assert!(executor.calls().iter().all(|call| !call.starts_with("git")));
}

#[test]
fn force_update_rebuilds_without_new_commits() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = existing_checkout(temp.path(), "site");
    let mut desc = git_service("site", "https://github.com/example/site.git", &path);
    desc.auto_update = true;
    desc.force_update = true;
    desc.build_cmd = Some("make".to_string());

    let executor = ScriptedExecutor::new();
    remote_main(&executor, 0);
    let outcome = reconcile(&executor, &StaticSecrets::new(), &StaticReleases::new(), &desc)
        .expect("reconcile");
    assert_eq!(outcome, ReconciliationOutcome::Converged);
    assert_eq!(executor.count("sh -c make"), 1);
    assert_eq!(executor.count("git pull"), 0);
}

#[test]
fn install_runs_once_after_first_clone() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("code/app");
    let mut desc = git_service("app", "git@github.com:example/app.git", &path);
    desc.auto_update = true;
    desc.install_cmd = Some("bin/setup".to_string());

    let executor = ScriptedExecutor::new();
    executor.respond_with("git clone", clone_creates_checkout);
    remote_main(&executor, 0);

    let first = reconcile(&executor, &StaticSecrets::new(), &StaticReleases::new(), &desc)
        .expect("first pass");
    assert_eq!(first, ReconciliationOutcome::Converged);
    assert_eq!(
        executor.calls()[0],
        format!("git clone -- git@github.com:example/app.git {}", path.display())
    );
    assert_eq!(executor.count("sh -c bin/setup"), 1);
    assert_eq!(executor.count("git fetch"), 0);

    executor.clear_calls();
    let second = reconcile(&executor, &StaticSecrets::new(), &StaticReleases::new(), &desc)
        .expect("second pass");
    assert_eq!(second, ReconciliationOutcome::Unchanged);
    assert_eq!(executor.count("git clone"), 0);
    assert_eq!(executor.count("sh -c bin/setup"), 0);
}

#[test]
fn failed_install_is_reported_as_install_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("code/app");
    let mut desc = git_service("app", "git@github.com:example/app.git", &path);
    desc.install_cmd = Some("bin/setup".to_string());
    desc.build_cmd = Some("make".to_string());

    let executor = ScriptedExecutor::new();
    executor.respond_with("git clone", clone_creates_checkout);
    executor.respond("sh -c bin/setup", CommandOutput::failed(2, "missing ruby"));

    let err = reconcile(&executor, &StaticSecrets::new(), &StaticReleases::new(), &desc)
        .expect_err("install fails");
    assert!(matches!(error::find(&err), Some(ToolboxError::Install { .. })));
    assert_eq!(executor.count("sh -c make"), 0);
}

#[test]
fn release_tag_already_checked_out_is_left_alone() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = existing_checkout(temp.path(), "plausible");
    let url = "https://github.com/plausible/community-edition";
    let mut desc = git_service("plausible", url, &path);
    desc.auto_update = true;
    desc.track_releases = true;

    let releases = StaticReleases::new().with(url, "v2.1.5");
    let executor = ScriptedExecutor::new();
    executor.respond("git describe", CommandOutput::ok("v2.1.5\n"));

    let outcome =
        reconcile(&executor, &StaticSecrets::new(), &releases, &desc).expect("reconcile");
    assert_eq!(outcome, ReconciliationOutcome::Unchanged);
    assert_eq!(executor.count("git checkout"), 0);
}

#[test]
fn newer_release_tag_is_checked_out() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = existing_checkout(temp.path(), "plausible");
    let url = "https://github.com/plausible/community-edition";
    let mut desc = git_service("plausible", url, &path);
    desc.auto_update = true;
    desc.track_releases = true;
    // Release tracking wins over a branch pin when a release exists.
    desc.branch = Some("main".to_string());

    let releases = StaticReleases::new().with(url, "v2.1.5");
    let executor = ScriptedExecutor::new();
    executor.respond("git describe", CommandOutput::ok("v2.1.4\n"));

    let outcome =
        reconcile(&executor, &StaticSecrets::new(), &releases, &desc).expect("reconcile");
    assert_eq!(outcome, ReconciliationOutcome::Converged);
    assert_eq!(executor.count("git checkout v2.1.5"), 1);
    assert_eq!(executor.count("git pull"), 0);
}

#[test]
fn missing_release_keeps_a_tagged_checkout_in_place() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = existing_checkout(temp.path(), "sentry");
    let url = "https://github.com/getsentry/self-hosted";
    let mut desc = git_service("sentry", url, &path);
    desc.auto_update = true;
    desc.track_releases = true;
    desc.compose_override = Some(toml::Table::new());
    fs::write(
        path.join(COMPOSE_OVERRIDE_FILE),
        compose_override_yaml(&toml::Table::new()).expect("render"),
    )
    .expect("prewrite");

    let executor = ScriptedExecutor::new();
    executor.respond("git describe", CommandOutput::ok("24.9.0\n"));
    executor.respond("git symbolic-ref", CommandOutput::ok("origin/master\n"));
    executor.respond("git rev-list", CommandOutput::ok("57\n"));
    executor.respond("docker compose ps", CommandOutput::ok("3f2a9c\n"));

    let outcome = reconcile(&executor, &StaticSecrets::new(), &StaticReleases::new(), &desc)
        .expect("reconcile");
    assert_eq!(outcome, ReconciliationOutcome::Unchanged);
    assert_eq!(executor.count("git checkout"), 0);
    assert_eq!(executor.count("git pull"), 0);
    assert_eq!(executor.count("git rev-list"), 0);
    assert_eq!(executor.count("docker compose down"), 0);
    assert_eq!(executor.count("docker compose up"), 0);
}

#[test]
fn release_tracking_clone_checks_out_the_release() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("data/plausible-ce");
    let url = "https://github.com/plausible/community-edition";
    let mut desc = git_service("plausible", url, &path);
    desc.track_releases = true;

    let releases = StaticReleases::new().with(url, "v2.1.5");
    let executor = ScriptedExecutor::new();
    executor.respond_with("git clone", clone_creates_checkout);

    let outcome =
        reconcile(&executor, &StaticSecrets::new(), &releases, &desc).expect("reconcile");
    assert_eq!(outcome, ReconciliationOutcome::Converged);
    assert_eq!(
        executor.calls(),
        vec![
            format!("git clone --no-checkout -- {url} {}", path.display()),
            "git checkout v2.1.5".to_string(),
        ]
    );
}

#[test]
fn fixed_pin_compares_commits_instead_of_counting() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = existing_checkout(temp.path(), "plausible");
    let mut desc = git_service("plausible", "https://github.com/plausible/ce", &path);
    desc.auto_update = true;
    desc.branch = Some("v2.1.5".to_string());

    let executor = ScriptedExecutor::new();
    executor.respond("git rev-parse --verify", CommandOutput::failed(1, ""));
    executor.respond("git rev-parse v2.1.5^{commit}", CommandOutput::ok("abc123\n"));
    executor.respond("git rev-parse HEAD", CommandOutput::ok("abc123\n"));

    let outcome = reconcile(&executor, &StaticSecrets::new(), &StaticReleases::new(), &desc)
        .expect("reconcile");
    assert_eq!(outcome, ReconciliationOutcome::Unchanged);
    assert_eq!(executor.count("git rev-list"), 0);
    assert_eq!(executor.count("git checkout"), 0);
}

#[test]
fn directory_without_git_metadata_is_never_overwritten() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("code/site");
    fs::create_dir_all(&path).expect("create");
    fs::write(path.join("notes.txt"), "keep me").expect("write");
    let desc = git_service("site", "https://github.com/example/site.git", &path);

    let executor = ScriptedExecutor::new();
    let err = reconcile(&executor, &StaticSecrets::new(), &StaticReleases::new(), &desc)
        .expect_err("not a repo");
    assert!(matches!(
        error::find(&err),
        Some(ToolboxError::RepositoryState { .. })
    ));
    assert_eq!(executor.count("git clone"), 0);
    assert!(path.join("notes.txt").exists());
}

#[test]
fn env_file_and_compose_override_render_once_and_drive_compose() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = existing_checkout(temp.path(), "plausible");
    let mut desc = git_service("plausible", "https://github.com/plausible/ce", &path);
    desc.auto_update = true;
    desc.env_file = Some(EnvValue::Secret(SecretReference {
        provider: SecretProvider::Vault,
        item: "Plausible".to_string(),
        field: "env".to_string(),
    }));
    desc.compose_override = Some(
        toml::from_str(
            r#"
            [services.plausible]
            ports = ["127.0.0.1:8000:8000"]
            "#,
        )
        .expect("override"),
    );
    let secrets = StaticSecrets::new().with("Plausible", "env", "\"BASE_URL=https://stats\nSECRET=x\"");

    let executor = ScriptedExecutor::new();
    remote_main(&executor, 0);
    executor.respond("docker compose ps -q", CommandOutput::ok("f00d\n"));

    let first = reconcile(&executor, &secrets, &StaticReleases::new(), &desc).expect("first");
    assert_eq!(first, ReconciliationOutcome::Converged);
    assert_eq!(
        fs::read_to_string(path.join(".env")).expect("env file"),
        "BASE_URL=https://stats\nSECRET=x\n"
    );
    let yaml = fs::read_to_string(path.join("compose.override.yml")).expect("override");
    assert!(yaml.contains("127.0.0.1:8000:8000"));
    assert_eq!(executor.count("docker compose down"), 1);
    assert_eq!(executor.count("docker compose up --wait --detach"), 1);

    executor.clear_calls();
    let second = reconcile(&executor, &secrets, &StaticReleases::new(), &desc).expect("second");
    assert_eq!(second, ReconciliationOutcome::Unchanged);
    assert_eq!(executor.count("docker compose down"), 0);
    assert_eq!(executor.count("docker compose up"), 0);
}

#[test]
fn stopped_compose_stack_is_brought_up_without_rebuild() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = existing_checkout(temp.path(), "sentry");
    let mut desc = git_service("sentry", "https://github.com/getsentry/self-hosted", &path);
    desc.compose_override = Some(toml::Table::new());
    fs::write(
        path.join(COMPOSE_OVERRIDE_FILE),
        compose_override_yaml(&toml::Table::new()).expect("render"),
    )
    .expect("prewrite");

    let executor = ScriptedExecutor::new();
    let outcome = reconcile(&executor, &StaticSecrets::new(), &StaticReleases::new(), &desc)
        .expect("reconcile");
    assert_eq!(outcome, ReconciliationOutcome::Converged);
    assert_eq!(executor.count("docker compose down"), 0);
    assert_eq!(executor.count("docker compose up"), 1);
}

#[test]
fn scratch_deploy_builds_outside_the_checkout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = existing_checkout(temp.path(), "theme");
    fs::create_dir_all(path.join("assets")).expect("assets");
    fs::write(path.join("assets/theme.css"), "body{}").expect("write");
    let dest = temp.path().join("data/ghost/themes/theme");
    let mut desc = git_service("theme", "git@github.com:example/theme.git", &path);
    desc.auto_update = true;
    desc.deploy_strategy = DeployStrategy::Scratch;
    desc.build_cmd = Some("npm run build".to_string());
    desc.deploy_path = Some(dest.clone());
    desc.post_deploy = Some(PostDeployAction::RestartContainer {
        container: "ghost".to_string(),
    });

    let executor = ScriptedExecutor::new();
    remote_main(&executor, 1);
    executor.respond("docker ps", CommandOutput::ok("c1 ghost running\n"));

    let outcome = reconcile(&executor, &StaticSecrets::new(), &StaticReleases::new(), &desc)
        .expect("reconcile");
    assert_eq!(outcome, ReconciliationOutcome::Converged);

    let build = executor
        .specs()
        .into_iter()
        .find(|spec| spec.display() == "sh -c npm run build")
        .expect("build ran");
    let build_dir = build.workdir.expect("build workdir");
    assert_ne!(build_dir, path);
    assert_eq!(build_dir.parent(), path.parent());
    assert!(!build_dir.exists(), "scratch dir is removed after deploy");

    assert_eq!(
        fs::read_to_string(dest.join("assets/theme.css")).expect("deployed"),
        "body{}"
    );
    assert!(!dest.join(".git").exists());
    assert_eq!(executor.count("docker restart ghost"), 1);
}

#[test]
fn embedded_container_is_built_and_replaced_on_change() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = existing_checkout(temp.path(), "app");
    let mut desc = git_service("app", "git@github.com:example/app.git", &path);
    desc.auto_update = true;
    desc.container = Some(EmbeddedContainer {
        image: "app".to_string(),
        ports: vec!["4000:3000".to_string()],
        volumes: Vec::new(),
        environment: [("RAILS_ENV".to_string(), EnvValue::from("production"))]
            .into_iter()
            .collect(),
        command: Some(vec!["bundle".to_string(), "exec".to_string(), "puma".to_string()]),
    });

    let executor = ScriptedExecutor::new();
    remote_main(&executor, 3);
    executor.respond("docker ps", CommandOutput::ok("c2 app running\n"));

    let outcome = reconcile(&executor, &StaticSecrets::new(), &StaticReleases::new(), &desc)
        .expect("reconcile");
    assert_eq!(outcome, ReconciliationOutcome::Converged);
    let docker: Vec<String> = executor
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("docker") && !call.starts_with("docker ps"))
        .collect();
    assert_eq!(
        docker,
        vec![
            "docker build -t app .",
            "docker stop app",
            "docker rm app",
            "docker run -d --name app --restart unless-stopped --network toolbox_network \
             -e RAILS_ENV=production -p 4000:3000 app bundle exec puma",
        ]
    );
}

#[test]
fn embedded_container_is_started_when_down_without_rebuild() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = existing_checkout(temp.path(), "app");
    let mut desc = git_service("app", "git@github.com:example/app.git", &path);
    desc.container = Some(EmbeddedContainer {
        image: "app".to_string(),
        ports: Vec::new(),
        volumes: Vec::new(),
        environment: Default::default(),
        command: None,
    });

    let executor = ScriptedExecutor::new();
    let outcome = reconcile(&executor, &StaticSecrets::new(), &StaticReleases::new(), &desc)
        .expect("reconcile");
    assert_eq!(outcome, ReconciliationOutcome::Converged);
    assert_eq!(executor.count("docker build"), 0);
    assert_eq!(executor.count("docker run"), 1);
}

#[test]
fn build_failure_stops_remaining_stages() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = existing_checkout(temp.path(), "site");
    let mut desc = git_service("site", "https://github.com/example/site.git", &path);
    desc.auto_update = true;
    desc.build_cmd = Some("npm run build".to_string());
    desc.deploy_path = Some(temp.path().join("www/site"));

    let executor = ScriptedExecutor::new();
    remote_main(&executor, 1);
    executor.respond("sh -c npm run build", CommandOutput::failed(1, "syntax error"));

    let err = reconcile(&executor, &StaticSecrets::new(), &StaticReleases::new(), &desc)
        .expect_err("build fails");
    assert!(matches!(error::find(&err), Some(ToolboxError::Build { .. })));
    assert!(!temp.path().join("www/site").exists());
}
