//! Filesystem helpers: change-aware writes and directory copies.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Create `dir` and its parents.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))
}

/// Write `contents` only if the file is missing or differs. Returns whether it wrote.
///
/// Writes go through a temp file and rename so readers never see a partial file.
pub fn write_if_changed(path: &Path, contents: &str) -> Result<bool> {
    if let Ok(existing) = fs::read_to_string(path)
        && existing == contents
    {
        debug!(path = %path.display(), "file unchanged");
        return Ok(false);
    }
    write_atomic(path, contents)?;
    debug!(path = %path.display(), "file written");
    Ok(true)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    ensure_dir(parent)?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Recursively copy `src` into `dst`, skipping top-level entries rejected by `keep`.
///
/// Symlinks are recreated, not followed.
pub fn copy_tree(src: &Path, dst: &Path, keep: impl Fn(&str) -> bool) -> Result<()> {
    ensure_dir(dst)?;
    for entry in fs::read_dir(src).with_context(|| format!("read dir {}", src.display()))? {
        let entry = entry.with_context(|| format!("read dir entry in {}", src.display()))?;
        let name = entry.file_name();
        if !keep(&name.to_string_lossy()) {
            continue;
        }
        copy_entry(&entry.path(), &dst.join(&name))?;
    }
    Ok(())
}

fn copy_entry(src: &Path, dst: &Path) -> Result<()> {
    let meta =
        fs::symlink_metadata(src).with_context(|| format!("stat {}", src.display()))?;
    if meta.file_type().is_symlink() {
        let target =
            fs::read_link(src).with_context(|| format!("read link {}", src.display()))?;
        std::os::unix::fs::symlink(&target, dst)
            .with_context(|| format!("create symlink {}", dst.display()))?;
    } else if meta.is_dir() {
        copy_tree(src, dst, |_| true)?;
    } else {
        fs::copy(src, dst)
            .with_context(|| format!("copy {} to {}", src.display(), dst.display()))?;
    }
    Ok(())
}

/// True for dotfiles and dot-directories.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Replace everything in `dest` with the non-hidden top-level entries of `src`.
///
/// The new tree is assembled in a sibling staging directory and swapped in with
/// renames, so `dest` is never observed half-copied.
pub fn replace_dir_contents(src: &Path, dest: &Path) -> Result<()> {
    let staging = sibling(dest, "toolbox-staging")?;
    let retired = sibling(dest, "toolbox-old")?;
    for leftover in [&staging, &retired] {
        if leftover.exists() {
            fs::remove_dir_all(leftover)
                .with_context(|| format!("remove leftover {}", leftover.display()))?;
        }
    }

    copy_tree(src, &staging, |name| !is_hidden(name))?;

    if dest.exists() {
        fs::rename(dest, &retired)
            .with_context(|| format!("move aside {}", dest.display()))?;
    }
    fs::rename(&staging, dest).with_context(|| format!("swap in {}", dest.display()))?;
    if retired.exists() {
        fs::remove_dir_all(&retired)
            .with_context(|| format!("remove previous deploy {}", retired.display()))?;
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> Result<PathBuf> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    let name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    ensure_dir(parent)?;
    Ok(parent.join(format!(".{}.{suffix}", name.to_string_lossy())))
}
