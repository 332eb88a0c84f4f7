//! Hosted-git repository URL helpers.

use std::sync::LazyLock;

use regex::Regex;

static GITHUB_REPO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"github\.com[/:]([^/]+)/([^/]+?)(?:\.git)?/?$").expect("valid github regex")
});

static URL_CREDENTIALS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"://[^/@\s]+@").expect("valid credentials regex"));

/// Extract `(owner, repo)` from a GitHub HTTPS or SSH URL.
pub fn github_owner_repo(url: &str) -> Option<(String, String)> {
    let caps = GITHUB_REPO.captures(url.trim())?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

/// Redact `user:token@` credentials embedded in URLs before logging.
pub fn redact_credentials(input: &str) -> String {
    URL_CREDENTIALS
        .replace_all(input, "://[REDACTED]@")
        .into_owned()
}
