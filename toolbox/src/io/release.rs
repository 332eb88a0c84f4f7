//! Latest published release lookup on the hosted-git API.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::repo_url::github_owner_repo;

const GITHUB_API: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("toolbox/", env!("CARGO_PKG_VERSION"));

/// Source of the newest release tag for a repository.
pub trait ReleaseSource {
    /// `None` when the URL is not a hosted repository or the lookup failed.
    fn latest_tag(&self, repo_url: &str) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct ReleasePayload {
    tag_name: String,
}

/// [`ReleaseSource`] backed by the GitHub REST API.
pub struct GithubReleases {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl GithubReleases {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url(GITHUB_API, timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("build release http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn fetch(&self, owner: &str, repo: &str) -> Result<String> {
        let url = format!("{}/repos/{owner}/{repo}/releases/latest", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .with_context(|| format!("GET {url}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("GET {url} returned HTTP {status}"));
        }
        let body = response.text().with_context(|| format!("read body of {url}"))?;
        let payload: ReleasePayload =
            serde_json::from_str(&body).context("decode release payload")?;
        Ok(payload.tag_name)
    }
}

impl ReleaseSource for GithubReleases {
    fn latest_tag(&self, repo_url: &str) -> Option<String> {
        let (owner, repo) = github_owner_repo(repo_url)?;
        match self.fetch(&owner, &repo) {
            Ok(tag) => {
                debug!(%owner, %repo, %tag, "latest release");
                Some(tag)
            }
            Err(err) => {
                warn!(%owner, %repo, "release lookup failed, not pinning: {err:#}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve_once;

    #[test]
    fn reads_tag_name_from_latest_release() {
        let (base, handle) = serve_once(
            "200 OK",
            r#"{"tag_name":"24.9.0","name":"24.9.0","draft":false}"#,
        );
        let releases =
            GithubReleases::with_base_url(&base, Duration::from_secs(5)).expect("client");
        let tag = releases.latest_tag("https://github.com/getsentry/self-hosted.git");
        let request = handle.join().expect("server thread");
        assert_eq!(tag.as_deref(), Some("24.9.0"));
        assert!(request.starts_with("GET /repos/getsentry/self-hosted/releases/latest "));
    }

    #[test]
    fn http_errors_degrade_to_no_pin() {
        let (base, handle) = serve_once("404 Not Found", r#"{"message":"Not Found"}"#);
        let releases =
            GithubReleases::with_base_url(&base, Duration::from_secs(5)).expect("client");
        assert_eq!(releases.latest_tag("git@github.com:a/b.git"), None);
        handle.join().expect("server thread");
    }

    #[test]
    fn malformed_payload_degrades_to_no_pin() {
        let (base, handle) = serve_once("200 OK", r#"{"name":"untagged"}"#);
        let releases =
            GithubReleases::with_base_url(&base, Duration::from_secs(5)).expect("client");
        assert_eq!(releases.latest_tag("https://github.com/a/b"), None);
        handle.join().expect("server thread");
    }

    #[test]
    fn non_github_urls_are_not_looked_up() {
        let releases = GithubReleases::with_base_url("http://127.0.0.1:9", Duration::from_secs(1))
            .expect("client");
        assert_eq!(releases.latest_tag("https://gitlab.com/a/b.git"), None);
    }
}
