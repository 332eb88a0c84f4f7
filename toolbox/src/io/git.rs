//! Git adapter for checkouts of git-built services.
//!
//! The engine never prompts and never rewrites history, so we keep a small,
//! explicit wrapper around `git` subprocess calls.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::io::config::TimeoutsConfig;
use crate::io::files::ensure_dir;
use crate::io::process::{CommandOutput, CommandSpec, ProcessExecutor, command_error, run_checked};

/// Options for a fresh clone.
#[derive(Debug, Clone, Default)]
pub struct CloneOptions<'b> {
    pub branch: Option<&'b str>,
    /// Clone without populating the working tree (a ref is checked out later).
    pub no_checkout: bool,
}

/// Wrapper for executing git commands in a checkout.
pub struct Git<'a> {
    executor: &'a dyn ProcessExecutor,
    timeouts: &'a TimeoutsConfig,
    workdir: PathBuf,
}

impl<'a> Git<'a> {
    pub fn new(
        executor: &'a dyn ProcessExecutor,
        timeouts: &'a TimeoutsConfig,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            timeouts,
            workdir: workdir.into(),
        }
    }

    /// True when the checkout exists and carries git metadata.
    pub fn is_repository(&self) -> bool {
        self.workdir.join(".git").exists()
    }

    /// Clone `url` into this wrapper's workdir, creating parent directories.
    #[instrument(skip_all, fields(path = %self.workdir.display()))]
    pub fn clone_from(&self, url: &str, options: &CloneOptions<'_>) -> Result<()> {
        let parent = self
            .workdir
            .parent()
            .with_context(|| format!("checkout path missing parent {}", self.workdir.display()))?;
        ensure_dir(parent)?;

        let mut args = vec!["clone".to_string()];
        if options.no_checkout {
            args.push("--no-checkout".to_string());
        }
        if let Some(branch) = options.branch {
            args.push("--branch".to_string());
            args.push(branch.to_string());
        }
        args.push("--".to_string());
        args.push(url.to_string());
        args.push(self.workdir.to_string_lossy().into_owned());

        let spec = CommandSpec::new("git", args, self.timeouts.clone_repo())
            .current_dir(parent)
            .env("GIT_TERMINAL_PROMPT", "0");
        run_checked(self.executor, &spec)?;
        debug!("cloned repository");
        Ok(())
    }

    pub fn fetch(&self) -> Result<()> {
        self.run_checked(&["fetch", "--tags"], self.timeouts.mutate())?;
        Ok(())
    }

    /// The remote's default branch, from `origin/HEAD`.
    pub fn default_branch(&self) -> Result<String> {
        let out = self.run_capture(&["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])?;
        let name = out.trim();
        let branch = name.strip_prefix("origin/").unwrap_or(name);
        if branch.is_empty() {
            return Err(anyhow!("origin/HEAD does not name a branch"));
        }
        Ok(branch.to_string())
    }

    pub fn remote_branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/remotes/origin/{branch}");
        let output = self.run(&["rev-parse", "--verify", "--quiet", &reference], self.timeouts.query())?;
        Ok(output.success())
    }

    /// Number of commits on `origin/<branch>` that HEAD does not have.
    pub fn commits_behind(&self, branch: &str) -> Result<u64> {
        let range = format!("HEAD..origin/{branch}");
        let out = self.run_capture(&["rev-list", &range, "--count"])?;
        out.trim()
            .parse()
            .with_context(|| format!("parse rev-list count '{}'", out.trim()))
    }

    pub fn head_commit(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Commit a ref (branch, tag or sha) points at.
    pub fn resolve_commit(&self, reference: &str) -> Result<String> {
        let spec = format!("{reference}^{{commit}}");
        Ok(self.run_capture(&["rev-parse", &spec])?.trim().to_string())
    }

    /// Tag pointing exactly at HEAD, if any.
    pub fn current_tag(&self) -> Result<Option<String>> {
        let output = self.run(&["describe", "--tags", "--exact-match", "HEAD"], self.timeouts.query())?;
        if !output.success() {
            return Ok(None);
        }
        let tag = output.stdout_trimmed();
        Ok((!tag.is_empty()).then(|| tag.to_string()))
    }

    /// Check out a ref. Checking out the ref that is already active succeeds.
    #[instrument(skip_all, fields(reference))]
    pub fn checkout(&self, reference: &str) -> Result<()> {
        let args = ["checkout", reference];
        let spec = self.spec(&args, self.timeouts.mutate());
        let output = self.executor.run(&spec)?;
        if output.success() || is_already_active(&output) {
            debug!(reference, "checked out");
            return Ok(());
        }
        Err(command_error(&spec, &output).into())
    }

    pub fn pull_ff_only(&self) -> Result<()> {
        self.run_checked(&["pull", "--ff-only"], self.timeouts.mutate())?;
        Ok(())
    }

    fn spec(&self, args: &[&str], timeout: Duration) -> CommandSpec {
        CommandSpec::new("git", args.iter().copied(), timeout)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args, self.timeouts.query())?;
        Ok(output.stdout)
    }

    fn run_checked(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        run_checked(self.executor, &self.spec(args, timeout))
    }

    fn run(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        self.executor.run(&self.spec(args, timeout))
    }
}

fn is_already_active(output: &CommandOutput) -> bool {
    output.stderr.contains("Already on '") || output.stderr.contains("is already checked out at")
}
