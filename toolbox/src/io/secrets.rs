//! Secret resolution through the password manager CLI.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::descriptor::{EnvValue, Environment, SecretReference};
use crate::error::ToolboxError;
use crate::io::process::{CommandSpec, ProcessExecutor, run_checked};

/// Resolves symbolic secret references to plaintext.
///
/// Values are never cached across passes; every pass resolves afresh.
pub trait SecretResolver {
    /// Fail with [`ToolboxError::Authentication`] when no session exists.
    fn ensure_authenticated(&self) -> Result<()>;

    fn resolve(&self, item: &str, field: &str) -> Result<String>;

    fn resolve_reference(&self, reference: &SecretReference) -> Result<String> {
        self.resolve(&reference.item, &reference.field)
    }

    fn resolve_value(&self, value: &EnvValue) -> Result<String> {
        match value {
            EnvValue::Literal(literal) => Ok(literal.clone()),
            EnvValue::Secret(reference) => self.resolve_reference(reference),
        }
    }

    /// Resolve an environment map; literals pass through unchanged.
    fn resolve_all(&self, env: &Environment) -> Result<BTreeMap<String, String>> {
        env.iter()
            .map(|(key, value)| {
                let resolved = self
                    .resolve_value(value)
                    .with_context(|| format!("resolve {key}"))?;
                Ok((key.clone(), resolved))
            })
            .collect()
    }
}

/// Fields fetched with the backend's reveal flag.
pub fn is_sensitive_field(field: &str) -> bool {
    let field = field.to_ascii_lowercase();
    field.contains("password") || field == "secret_access_key"
}

/// [`SecretResolver`] backed by the `op` CLI.
pub struct VaultCli<'a> {
    executor: &'a dyn ProcessExecutor,
    cli: String,
    vault: String,
    timeout: Duration,
}

impl<'a> VaultCli<'a> {
    pub fn new(executor: &'a dyn ProcessExecutor, cli: &str, vault: &str, timeout: Duration) -> Self {
        Self {
            executor,
            cli: cli.to_string(),
            vault: vault.to_string(),
            timeout,
        }
    }
}

impl SecretResolver for VaultCli<'_> {
    #[instrument(skip_all)]
    fn ensure_authenticated(&self) -> Result<()> {
        let spec = CommandSpec::new(&self.cli, ["whoami"], self.timeout);
        let output = self.executor.run(&spec).map_err(|err| {
            ToolboxError::Authentication(format!("could not run {}: {err:#}", self.cli))
        })?;
        if !output.success() {
            return Err(ToolboxError::Authentication(format!(
                "`{} whoami` failed ({}); sign in first",
                self.cli,
                output.stderr.trim()
            ))
            .into());
        }
        debug!("secret backend session is active");
        Ok(())
    }

    fn resolve(&self, item: &str, field: &str) -> Result<String> {
        let mut args = vec![
            "item".to_string(),
            "get".to_string(),
            item.to_string(),
            "--vault".to_string(),
            self.vault.clone(),
            "--fields".to_string(),
            field.to_string(),
        ];
        if is_sensitive_field(field) {
            args.push("--reveal".to_string());
        }
        let spec = CommandSpec::new(&self.cli, args, self.timeout);
        let output = run_checked(self.executor, &spec)
            .with_context(|| format!("fetch secret {item}/{field}"))?;
        debug!(item, field, "resolved secret");
        Ok(output.stdout_trimmed().to_string())
    }
}
