//! Child process execution with timeouts, bounded output and detached spawns.
//!
//! Every external tool the reconcilers touch (docker, git, the secret CLI,
//! shell commands) goes through [`ProcessExecutor`]. The system implementation
//! never retries; callers decide what a failure means.

use std::fs::OpenOptions;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::repo_url::redact_credentials;
use crate::error::ToolboxError;

const REDACTED: &str = "[REDACTED]";

/// A fully described command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    /// Values replaced with `[REDACTED]` wherever the command or its output is shown.
    pub redact: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            workdir: None,
            env: Vec::new(),
            timeout,
            redact: Vec::new(),
        }
    }

    /// `sh -c <script>`.
    pub fn shell(script: &str, timeout: Duration) -> Self {
        Self::new("sh", ["-c", script], timeout)
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn redact<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.redact.extend(
            values
                .into_iter()
                .map(Into::into)
                .filter(|value: &String| !value.is_empty()),
        );
        self
    }

    /// Command line safe for logs and error messages.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        self.scrub(&line)
    }

    /// Strip redacted values and embedded URL credentials from `text`.
    pub fn scrub(&self, text: &str) -> String {
        let mut out = redact_credentials(text);
        for secret in &self.redact {
            out = out.replace(secret.as_str(), REDACTED);
        }
        out
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal (including timeouts).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            ..Self::default()
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            exit_code: Some(code),
            stderr: stderr.to_string(),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Seam between the reconcilers and the operating system.
pub trait ProcessExecutor {
    /// Run to completion (or timeout) and capture output. Errors only when the
    /// command could not be spawned or waited on; a non-zero exit is `Ok`.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Start a process in its own process group and return without waiting.
    /// Output goes to `log` (appended) or is discarded. Returns the pid.
    fn spawn_detached(&self, spec: &CommandSpec, log: Option<&Path>) -> Result<u32>;
}

/// Run a command and turn a non-zero exit or timeout into
/// [`ToolboxError::CommandExecution`].
pub fn run_checked(executor: &dyn ProcessExecutor, spec: &CommandSpec) -> Result<CommandOutput> {
    let output = executor.run(spec)?;
    if output.success() {
        return Ok(output);
    }
    Err(command_error(spec, &output).into())
}

/// Typed error for a finished-but-failed command, with secrets scrubbed.
pub fn command_error(spec: &CommandSpec, output: &CommandOutput) -> ToolboxError {
    ToolboxError::CommandExecution {
        command: spec.display(),
        code: output.exit_code,
        timed_out: output.timed_out.then_some(spec.timeout),
        stderr: spec.scrub(output.stderr.trim()),
    }
}

/// [`ProcessExecutor`] backed by real child processes.
#[derive(Debug, Clone)]
pub struct SystemExecutor {
    output_limit_bytes: usize,
}

impl SystemExecutor {
    pub fn new(output_limit_bytes: usize) -> Self {
        Self { output_limit_bytes }
    }

    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.workdir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd
    }
}

impl Default for SystemExecutor {
    fn default() -> Self {
        Self::new(1_000_000)
    }
}

impl ProcessExecutor for SystemExecutor {
    #[instrument(skip_all, fields(command = %spec.display()))]
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let captured = run_command_with_timeout(
            Self::command(spec),
            spec.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run {}", spec.display()))?;

        let mut stdout = String::from_utf8_lossy(&captured.stdout).into_owned();
        let mut stderr = String::from_utf8_lossy(&captured.stderr).into_owned();
        stdout.push_str(&truncated_notice("stdout", captured.stdout_truncated));
        stderr.push_str(&truncated_notice("stderr", captured.stderr_truncated));
        Ok(CommandOutput {
            exit_code: captured.status.code(),
            stdout,
            stderr,
            timed_out: captured.timed_out,
        })
    }

    #[instrument(skip_all, fields(command = %spec.display()))]
    fn spawn_detached(&self, spec: &CommandSpec, log: Option<&Path>) -> Result<u32> {
        let mut cmd = Self::command(spec);
        cmd.stdin(Stdio::null()).process_group(0);
        match log {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("create log dir {}", parent.display()))?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("open log file {}", path.display()))?;
                let err_file = file
                    .try_clone()
                    .with_context(|| format!("clone log file {}", path.display()))?;
                cmd.stdout(file).stderr(err_file);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", spec.display()))?;
        debug!(pid = child.id(), "spawned detached process");
        Ok(child.id())
    }
}

fn truncated_notice(label: &str, truncated: usize) -> String {
    if truncated > 0 {
        format!("\n[{label} truncated {truncated} bytes]\n")
    } else {
        String::new()
    }
}

/// Raw output of [`run_command_with_timeout`].
#[derive(Debug)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CapturedOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CapturedOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
