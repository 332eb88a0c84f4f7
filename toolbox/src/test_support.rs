//! Test doubles and descriptor builders.
//!
//! Available to unit tests and, through the `test-support` feature, to the
//! integration tests under `tests/`.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;

use anyhow::{Result, anyhow};

use crate::core::descriptor::{
    ContainerDescriptor, DeployStrategy, GitBuildDescriptor, ProcessDescriptor, TunnelDescriptor,
};
use crate::io::config::{PathsConfig, TimeoutsConfig, ToolboxConfig};
use crate::io::process::{CommandOutput, CommandSpec, ProcessExecutor};
use crate::io::release::ReleaseSource;
use crate::io::secrets::SecretResolver;
use crate::io::uptime::UptimeReporter;

type Hook = Rc<dyn Fn(&CommandSpec) -> CommandOutput>;

#[derive(Clone)]
enum Response {
    Output(CommandOutput),
    Hook(Hook),
    SpawnError(String),
}

struct Rule {
    prefix: String,
    responses: Vec<Response>,
    served: usize,
}

impl Rule {
    /// Responses are served in order; the last one repeats.
    fn next(&mut self) -> Option<Response> {
        let index = self.served.min(self.responses.len().checked_sub(1)?);
        self.served += 1;
        self.responses.get(index).cloned()
    }
}

/// [`ProcessExecutor`] that answers from scripted rules and records every call.
///
/// A call matches the rule with the longest prefix of its display line
/// (`program arg arg…`). Unmatched calls succeed with empty output, which for
/// docker/git queries means "nothing there".
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: RefCell<Vec<Rule>>,
    calls: RefCell<Vec<String>>,
    specs: RefCell<Vec<CommandSpec>>,
    spawned: RefCell<Vec<String>>,
    next_pid: Cell<u32>,
}

/// First pid handed out by [`ScriptedExecutor::spawn_detached`].
pub const FIRST_SCRIPTED_PID: u32 = 4000;

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            next_pid: Cell::new(FIRST_SCRIPTED_PID),
            ..Self::default()
        }
    }

    fn push(&self, prefix: &str, response: Response) {
        let mut rules = self.rules.borrow_mut();
        match rules.iter_mut().find(|rule| rule.prefix == prefix) {
            Some(rule) => rule.responses.push(response),
            None => rules.push(Rule {
                prefix: prefix.to_string(),
                responses: vec![response],
                served: 0,
            }),
        }
    }

    /// Queue a response for calls starting with `prefix`.
    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        self.push(prefix, Response::Output(output));
    }

    /// Compute the response from the call (e.g. to create files like `git clone` would).
    pub fn respond_with(&self, prefix: &str, hook: impl Fn(&CommandSpec) -> CommandOutput + 'static) {
        self.push(prefix, Response::Hook(Rc::new(hook)));
    }

    /// Make matching calls fail to spawn.
    pub fn fail_to_spawn(&self, prefix: &str, message: &str) {
        self.push(prefix, Response::SpawnError(message.to_string()));
    }

    /// Display lines of every `run` call, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// Full specs of every `run` call, in order.
    pub fn specs(&self) -> Vec<CommandSpec> {
        self.specs.borrow().clone()
    }

    /// Display lines of every detached spawn, in order.
    pub fn spawned(&self) -> Vec<String> {
        self.spawned.borrow().clone()
    }

    /// Number of `run` calls starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    /// Forget recorded calls, keeping the rules.
    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
        self.specs.borrow_mut().clear();
        self.spawned.borrow_mut().clear();
    }

    fn lookup(&self, line: &str) -> Option<Response> {
        let mut rules = self.rules.borrow_mut();
        rules
            .iter_mut()
            .filter(|rule| line.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len())
            .and_then(Rule::next)
    }
}

impl ProcessExecutor for ScriptedExecutor {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.display();
        self.calls.borrow_mut().push(line.clone());
        self.specs.borrow_mut().push(spec.clone());
        match self.lookup(&line) {
            None => Ok(CommandOutput::ok("")),
            Some(Response::Output(output)) => Ok(output),
            Some(Response::Hook(hook)) => Ok(hook(spec)),
            Some(Response::SpawnError(message)) => Err(anyhow!("spawn {line}: {message}")),
        }
    }

    fn spawn_detached(&self, spec: &CommandSpec, _log: Option<&Path>) -> Result<u32> {
        let line = spec.display();
        self.spawned.borrow_mut().push(line.clone());
        if let Some(Response::SpawnError(message)) = self.lookup(&line) {
            return Err(anyhow!("spawn {line}: {message}"));
        }
        let pid = self.next_pid.get();
        self.next_pid.set(pid + 1);
        Ok(pid)
    }
}

/// Secret backend with fixed values keyed by `item/field`.
#[derive(Default)]
pub struct StaticSecrets {
    values: BTreeMap<String, String>,
    signed_out: bool,
    lookups: Cell<usize>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, item: &str, field: &str, value: &str) -> Self {
        self.values
            .insert(format!("{item}/{field}"), value.to_string());
        self
    }

    pub fn signed_out() -> Self {
        Self {
            signed_out: true,
            ..Self::default()
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.get()
    }
}

impl SecretResolver for StaticSecrets {
    fn ensure_authenticated(&self) -> Result<()> {
        if self.signed_out {
            return Err(crate::error::ToolboxError::Authentication(
                "no active session".to_string(),
            )
            .into());
        }
        Ok(())
    }

    fn resolve(&self, item: &str, field: &str) -> Result<String> {
        self.lookups.set(self.lookups.get() + 1);
        self.values
            .get(&format!("{item}/{field}"))
            .cloned()
            .ok_or_else(|| anyhow!("no secret {item}/{field}"))
    }
}

/// Release source with fixed tags keyed by repository URL.
#[derive(Default)]
pub struct StaticReleases {
    tags: BTreeMap<String, String>,
}

impl StaticReleases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, repo_url: &str, tag: &str) -> Self {
        self.tags.insert(repo_url.to_string(), tag.to_string());
        self
    }
}

impl ReleaseSource for StaticReleases {
    fn latest_tag(&self, repo_url: &str) -> Option<String> {
        self.tags.get(repo_url).cloned()
    }
}

/// Uptime reporter that records the URLs it was asked to ping.
#[derive(Default)]
pub struct RecordingUptime {
    reports: RefCell<Vec<String>>,
    fail: bool,
}

impl RecordingUptime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn reports(&self) -> Vec<String> {
        self.reports.borrow().clone()
    }
}

impl UptimeReporter for RecordingUptime {
    fn report(&self, url: &str) -> Result<()> {
        self.reports.borrow_mut().push(url.to_string());
        if self.fail {
            return Err(anyhow!("monitor unreachable"));
        }
        Ok(())
    }
}

/// Serve one HTTP response on a local port. Returns the base URL and a handle
/// yielding the raw request text.
pub fn serve_once(status: &str, body: &str) -> (String, thread::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind local listener");
    let addr = listener.local_addr().expect("local addr");
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).expect("read request");
            if n == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..n]);
        }
        stream.write_all(response.as_bytes()).expect("write response");
        String::from_utf8_lossy(&request).into_owned()
    });
    (format!("http://{addr}"), handle)
}

/// Container descriptor with no ports, volumes or environment.
pub fn container(name: &str, image: &str) -> ContainerDescriptor {
    ContainerDescriptor {
        name: name.to_string(),
        image: image.to_string(),
        ports: Vec::new(),
        volumes: Vec::new(),
        environment: BTreeMap::new(),
        command: None,
        auto_update: false,
        depends_on: BTreeSet::new(),
    }
}

pub fn process(name: &str, detection: &str, start_cmd: &str) -> ProcessDescriptor {
    ProcessDescriptor {
        name: name.to_string(),
        detection: detection.to_string(),
        start_cmd: start_cmd.to_string(),
        auto_update: false,
        depends_on: BTreeSet::new(),
    }
}

pub fn tunnel(name: &str, dir: &Path) -> TunnelDescriptor {
    TunnelDescriptor {
        name: name.to_string(),
        config_path: dir.join("tunnel.yml"),
        log_file: dir.join("tunnel.log"),
        binary: "cloudflared".to_string(),
        auto_update: false,
        depends_on: BTreeSet::new(),
    }
}

/// Git-built service with nothing but a repository and checkout path.
pub fn git_service(name: &str, repo_url: &str, local_path: &Path) -> GitBuildDescriptor {
    GitBuildDescriptor {
        name: name.to_string(),
        repo_url: repo_url.to_string(),
        local_path: local_path.to_path_buf(),
        branch: None,
        track_releases: false,
        build_cmd: None,
        install_cmd: None,
        deploy_path: None,
        deploy_strategy: DeployStrategy::InPlace,
        container: None,
        env_file: None,
        compose_override: None,
        post_deploy: None,
        force_update: false,
        auto_update: false,
        depends_on: BTreeSet::new(),
    }
}

/// Empty fleet whose directories live under `root`, with zero grace periods.
pub fn config_in(root: &Path) -> ToolboxConfig {
    ToolboxConfig {
        paths: PathsConfig {
            data_dir: root.join("data"),
            code_dir: root.join("code"),
            state_dir: root.join("state"),
            ensure_dirs: Vec::new(),
        },
        timeouts: TimeoutsConfig {
            process_grace_ms: 0,
            tunnel_grace_ms: 0,
            ..TimeoutsConfig::default()
        },
        ..ToolboxConfig::default()
    }
}

/// Scripted response for `git clone` that creates the checkout's `.git` dir.
pub fn clone_creates_checkout(spec: &CommandSpec) -> CommandOutput {
    if let Some(path) = spec.args.last() {
        let _ = std::fs::create_dir_all(PathBuf::from(path).join(".git"));
    }
    CommandOutput::ok("")
}
