//! Typed failures the orchestrator needs to tell apart.
//!
//! Everything else travels as `anyhow::Error` with context; these variants are
//! attached at the point of failure and recovered with [`find`] when a pass
//! decides whether an error is fatal to one service or to the whole run.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolboxError {
    #[error("secret backend session is not established: {0}")]
    Authentication(String),

    #[error("`{command}` {}: {stderr}", describe_status(.code, .timed_out))]
    CommandExecution {
        command: String,
        code: Option<i32>,
        timed_out: Option<Duration>,
        stderr: String,
    },

    #[error("failed to pull image {image}: {stderr}")]
    ImagePull { image: String, stderr: String },

    #[error("{} exists but is not a git repository; remove or fix it manually", .path.display())]
    RepositoryState { path: PathBuf },

    #[error("build failed for {service}: {detail}")]
    Build { service: String, detail: String },

    #[error("deploy failed for {service}: {detail}")]
    Deploy { service: String, detail: String },

    #[error(
        "install command failed for {service}; manual intervention may be required in {}: {detail}",
        .path.display()
    )]
    Install {
        service: String,
        path: PathBuf,
        detail: String,
    },

    #[error("tunnel {tunnel} failed to start; see {}", .log_file.display())]
    TunnelStartup { tunnel: String, log_file: PathBuf },

    #[error("lock {} already held since {since}", .path.display())]
    LockHeld { path: PathBuf, since: String },
}

impl ToolboxError {
    /// Errors that abort the whole pass instead of a single service.
    pub fn is_pass_fatal(&self) -> bool {
        matches!(
            self,
            ToolboxError::Authentication(_) | ToolboxError::TunnelStartup { .. }
        )
    }
}

fn describe_status(code: &Option<i32>, timed_out: &Option<Duration>) -> String {
    match (timed_out, code) {
        (Some(after), _) => format!("timed out after {}s", after.as_secs()),
        (None, Some(code)) => format!("exited with code {code}"),
        (None, None) => "was terminated by a signal".to_string(),
    }
}

/// Find the first [`ToolboxError`] in an error chain.
pub fn find(err: &anyhow::Error) -> Option<&ToolboxError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ToolboxError>())
}

/// True when `err` carries a pass-fatal [`ToolboxError`] anywhere in its chain.
pub fn is_pass_fatal(err: &anyhow::Error) -> bool {
    find(err).is_some_and(ToolboxError::is_pass_fatal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn fatal_errors_are_found_through_context() {
        let err = Err::<(), _>(ToolboxError::Authentication("op whoami failed".to_string()))
            .context("prerequisites")
            .unwrap_err();
        assert!(is_pass_fatal(&err));
    }

    #[test]
    fn service_errors_are_not_pass_fatal() {
        let err = anyhow::Error::new(ToolboxError::Build {
            service: "site".to_string(),
            detail: "npm exited 1".to_string(),
        });
        assert!(!is_pass_fatal(&err));
        assert!(matches!(find(&err), Some(ToolboxError::Build { .. })));
    }

    #[test]
    fn command_error_describes_timeout() {
        let err = ToolboxError::CommandExecution {
            command: "git fetch --tags".to_string(),
            code: None,
            timed_out: Some(Duration::from_secs(30)),
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "`git fetch --tags` timed out after 30s: ");
    }
}
