//! Rendering of files written into checkouts.

use anyhow::{Context, Result};

/// File name of the rendered compose override inside a checkout.
pub const COMPOSE_OVERRIDE_FILE: &str = "compose.override.yml";
/// File name of the rendered environment file inside a checkout.
pub const ENV_FILE: &str = ".env";

/// Normalize an environment-file payload.
///
/// Secret backends hand multi-line values back wrapped in quotes, so one pair
/// of matching surrounding quotes is stripped after trimming.
pub fn env_file_contents(raw: &str) -> String {
    let trimmed = raw.trim();
    let unquoted = ['"', '\'']
        .iter()
        .find_map(|quote| {
            trimmed
                .strip_prefix(*quote)
                .and_then(|rest| rest.strip_suffix(*quote))
        })
        .unwrap_or(trimmed);
    format!("{unquoted}\n")
}

/// Serialize a compose override document as YAML.
pub fn compose_override_yaml(document: &toml::Table) -> Result<String> {
    serde_yaml::to_string(document).context("serialize compose override")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_one_pair_of_quotes() {
        assert_eq!(env_file_contents("\"A=1\nB=2\"\n"), "A=1\nB=2\n");
        assert_eq!(env_file_contents("'A=1'"), "A=1\n");
        assert_eq!(env_file_contents("\"\"A=1\"\""), "\"A=1\"\n");
    }

    #[test]
    fn leaves_unbalanced_quotes() {
        assert_eq!(env_file_contents("\"A=1"), "\"A=1\n");
        assert_eq!(env_file_contents("  A=1  "), "A=1\n");
    }

    #[test]
    fn renders_compose_override_as_yaml() {
        let doc: toml::Table = toml::from_str(
            r#"
            [services.plausible]
            ports = ["127.0.0.1:8000:8000"]
            "#,
        )
        .expect("parse override");
        let yaml = compose_override_yaml(&doc).expect("yaml");
        let reparsed: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("reparse");
        assert_eq!(
            reparsed["services"]["plausible"]["ports"][0].as_str(),
            Some("127.0.0.1:8000:8000")
        );
    }
}
