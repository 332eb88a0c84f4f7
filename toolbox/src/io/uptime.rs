//! Best-effort heartbeat to an uptime monitor.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::info;

/// Pings a monitor once a pass has completed.
pub trait UptimeReporter {
    fn report(&self, url: &str) -> Result<()>;
}

/// [`UptimeReporter`] issuing a plain HTTP GET.
pub struct HttpUptimeReporter {
    client: reqwest::blocking::Client,
}

impl HttpUptimeReporter {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build uptime http client")?;
        Ok(Self { client })
    }
}

impl UptimeReporter for HttpUptimeReporter {
    fn report(&self, url: &str) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .context("send uptime heartbeat")?;
        let status = response.status();
        if !status.is_success() {
            bail!("uptime monitor responded with HTTP {status}");
        }
        info!(%status, "reported uptime");
        Ok(())
    }
}
