//! File system helpers for the shared caches
//!
//! Every shared store in depcache follows the same rule: create if absent,
//! never overwrite, publish atomically. The helpers here implement the two
//! publication primitives ([`atomic_write`] for files we own exclusively and
//! [`publish_no_clobber`] for artifacts other workers may race to create) plus
//! directory merging used when assembling bundles.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Create a directory and all of its parents.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

/// Atomically writes bytes to a file using a write-then-rename strategy.
///
/// The content goes to a sibling temporary file, is synced to disk, then renamed
/// over the target. Readers observe either the old or the new content, never a
/// partial write. Parent directories are created as needed.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let mut temp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    temp_name.push(format!(".{}.tmp", std::process::id()));
    let temp_path = path.with_file_name(temp_name);

    {
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        file.write_all(content)
            .with_context(|| format!("Failed to write to temp file: {}", temp_path.display()))?;
        file.sync_all().context("Failed to sync file to disk")?;
    }

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename temp file to: {}", path.display()))?;

    Ok(())
}

/// Publish `temp` at `dest` unless something is already there.
///
/// Uses a hard link so that an existing `dest` is never replaced. The temporary
/// file is removed in every case. Returns `true` if this call published the
/// artifact and `false` if another writer got there first.
///
/// `temp` and `dest` must be on the same file system.
pub fn publish_no_clobber(temp: &Path, dest: &Path) -> Result<bool> {
    if let Some(parent) = dest.parent() {
        ensure_dir(parent)?;
    }

    let outcome = match fs::hard_link(temp, dest) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(anyhow::Error::new(e).context(format!(
            "Failed to publish {} to {}",
            temp.display(),
            dest.display()
        ))),
    };

    if let Err(e) = remove_file_if_exists(temp) {
        tracing::warn!(target: "fs", "Failed to remove temporary file: {:#}", e);
    }

    outcome
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => {
            Err(anyhow::Error::new(e).context(format!("Failed to remove {}", path.display())))
        }
    }
}

/// Remove a directory tree, treating "already gone" as success.
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("Failed to remove directory {}", path.display()))),
    }
}

/// Hex-encoded SHA-256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Merge the tree under `src` into `dst`.
///
/// Files missing from `dst` are copied. Go module cache `list` files present on
/// both sides are merged as the sorted union of their lines. Any other existing
/// file is left untouched. Returns the number of files written.
pub fn merge_dirs(src: &Path, dst: &Path) -> Result<usize> {
    let mut written = 0;
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
            continue;
        }

        if !target.exists() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy {} to {}", entry.path().display(), target.display())
            })?;
            written += 1;
        } else if entry.file_name() == "list" {
            merge_list_files(entry.path(), &target)?;
            written += 1;
        }
    }
    Ok(written)
}

fn merge_list_files(src: &Path, dst: &Path) -> Result<()> {
    let mut lines = BTreeSet::new();
    for path in [src, dst] {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        lines.extend(content.lines().filter(|l| !l.trim().is_empty()).map(ToString::to_string));
    }
    let mut merged = lines.into_iter().collect::<Vec<_>>().join("\n");
    merged.push('\n');
    atomic_write(dst, merged.as_bytes())
}

/// Normalise a user-supplied relative path.
///
/// Collapses `.` segments and redundant separators; returns `None` for absolute
/// paths and for paths containing `..`. The repository root normalises to `"."`.
pub fn normalize_relative_path(path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() { Some(".".to_string()) } else { Some(parts.join("/")) }
}

/// Whether `path` lies within `root` once both are canonicalised.
pub fn is_within(root: &Path, path: &Path) -> bool {
    match (root.canonicalize(), path.canonicalize()) {
        (Ok(root), Ok(path)) => path.starts_with(root),
        _ => false,
    }
}

/// Join a normalised relative path onto `base`, with `"."` meaning `base` itself.
pub fn join_relative(base: &Path, relative: &str) -> PathBuf {
    if relative == "." { base.to_path_buf() } else { base.join(relative) }
}
