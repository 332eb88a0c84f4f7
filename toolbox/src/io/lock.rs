//! Sentinel-file advisory locks and last-success markers.
//!
//! Both files hold a single RFC 3339 UTC timestamp. A lock older than its
//! staleness window (or with an unreadable timestamp) is treated as abandoned
//! and reclaimed once. Sentinels are written to a staging file and linked into
//! place, so a reader never sees a half-written lock.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::ToolboxError;

/// Default staleness window for abandoned locks.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(60 * 60);

/// Held advisory lock; the sentinel is removed on drop.
#[derive(Debug)]
pub struct AdvisoryLock {
    path: PathBuf,
    released: bool,
}

impl AdvisoryLock {
    pub fn acquire(path: &Path, staleness: Duration) -> Result<Self> {
        Self::acquire_at(path, staleness, Utc::now())
    }

    /// Acquire as if the current time were `now`.
    pub fn acquire_at(path: &Path, staleness: Duration, now: DateTime<Utc>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        if try_create(path, now)? {
            debug!(path = %path.display(), "lock acquired");
            return Ok(Self::held(path));
        }

        let since = read_contents(path);
        if !is_stale(path, &since, staleness, now) {
            return Err(ToolboxError::LockHeld {
                path: path.to_path_buf(),
                since,
            }
            .into());
        }

        // Another process may have reclaimed it since we looked.
        let current = read_contents(path);
        if current != since {
            return Err(ToolboxError::LockHeld {
                path: path.to_path_buf(),
                since: current,
            }
            .into());
        }
        warn!(path = %path.display(), since = %since, "reclaiming stale lock");
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("remove stale lock {}", path.display()));
            }
        }
        if try_create(path, now)? {
            debug!(path = %path.display(), "lock acquired after reclaiming");
            return Ok(Self::held(path));
        }
        Err(ToolboxError::LockHeld {
            path: path.to_path_buf(),
            since: read_contents(path),
        }
        .into())
    }

    fn held(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the sentinel now instead of at drop.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove_sentinel(&self.path)
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = remove_sentinel(&self.path) {
            warn!(path = %self.path.display(), "failed to release lock: {err:#}");
        }
    }
}

fn remove_sentinel(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove lock {}", path.display())),
    }
}

fn read_contents(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default().trim().to_string()
}

/// An empty sentinel is judged by its modification time; other unreadable
/// contents count as abandoned.
fn is_stale(path: &Path, contents: &str, staleness: Duration, now: DateTime<Utc>) -> bool {
    if contents.is_empty() {
        return match fs::metadata(path).and_then(|meta| meta.modified()) {
            Ok(modified) => {
                let modified: DateTime<Utc> = modified.into();
                now.signed_duration_since(modified).to_std().unwrap_or_default() > staleness
            }
            Err(_) => false,
        };
    }
    match parse_timestamp(contents) {
        Some(taken) => now.signed_duration_since(taken).to_std().unwrap_or_default() > staleness,
        None => true,
    }
}

/// Publish a fully written sentinel, failing if one already exists.
fn try_create(path: &Path, now: DateTime<Utc>) -> Result<bool> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut staged = NamedTempFile::new_in(dir)
        .with_context(|| format!("stage lock in {}", dir.display()))?;
    staged
        .write_all(format_timestamp(now).as_bytes())
        .with_context(|| format!("write lock {}", path.display()))?;
    match staged.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err.error).with_context(|| format!("create lock {}", path.display())),
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// Timestamp of the last recorded success, if the marker exists and parses.
pub fn read_last_success(path: &Path) -> Result<Option<DateTime<Utc>>> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let parsed = parse_timestamp(&contents);
            if parsed.is_none() {
                warn!(path = %path.display(), "ignoring unreadable last-success marker");
            }
            Ok(parsed)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

pub fn mark_success(path: &Path, at: DateTime<Utc>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create state dir {}", parent.display()))?;
    }
    fs::write(path, format_timestamp(at)).with_context(|| format!("write {}", path.display()))
}
