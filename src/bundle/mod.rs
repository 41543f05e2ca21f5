//! Bundle assembly
//!
//! Each request works in `<bundles_dir>/temp/<id>/`: the source archive is
//! extracted to `app/` and resolvers write what they download below
//! `deps/<ecosystem>/`. The finished bundle is one deterministic tarball at
//! `<bundles_dir>/<id>.tar.gz` holding both trees.
//!
//! `.git` is left out of the bundle unless the request has the
//! `include-git-dir` flag. Symlinks pointing outside `app/` are rejected, or
//! deleted with `remove-unsafe-symlinks`.

use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

use crate::constants::{APP_DIR, BUNDLE_POLL_INTERVAL, DEPS_DIR};
use crate::core::DepcacheError;
use crate::utils::fs::{ensure_dir, is_within, remove_dir_if_exists, remove_file_if_exists};
use crate::utils::tarball::{TarGzWriter, extract_tar_gz};

const TEMP_DIR: &str = "temp";

/// Final bundle of a request.
pub fn bundle_archive_path(bundles_dir: &Path, id: u64) -> PathBuf {
    bundles_dir.join(format!("{id}.tar.gz"))
}

/// Working directory of a request.
pub fn temp_dir(bundles_dir: &Path, id: u64) -> PathBuf {
    bundles_dir.join(TEMP_DIR).join(id.to_string())
}

/// How the source tree is prepared and packed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BundleOptions {
    /// Keep `.git` in the bundle
    pub include_git_dir: bool,
    /// Delete symlinks leaving `app/` instead of failing
    pub remove_unsafe_symlinks: bool,
}

/// The working directory of one request.
#[derive(Debug, Clone)]
pub struct BundleDir {
    root: PathBuf,
    archive: PathBuf,
}

impl BundleDir {
    pub fn new(bundles_dir: &Path, id: u64) -> Self {
        Self {
            root: temp_dir(bundles_dir, id),
            archive: bundle_archive_path(bundles_dir, id),
        }
    }

    /// `temp/<id>`, the directory resolvers receive.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn app_dir(&self) -> PathBuf {
        self.root.join(APP_DIR)
    }

    pub fn deps_dir(&self) -> PathBuf {
        self.root.join(DEPS_DIR)
    }

    /// Where the finished bundle goes.
    pub fn archive_path(&self) -> &Path {
        &self.archive
    }

    /// Start from a clean directory holding the extracted `source_archive`.
    pub async fn prepare_source(&self, source_archive: &Path, options: BundleOptions) -> Result<()> {
        let root = self.root.clone();
        let archive = source_archive.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            remove_dir_if_exists(&root)?;
            ensure_dir(&root)?;
            extract_tar_gz(&archive, &root)?;
            ensure_dir(&root.join(DEPS_DIR))?;
            enforce_sandbox(&root.join(APP_DIR), options.remove_unsafe_symlinks)
        })
        .await
        .context("Failed to spawn blocking task for source preparation")??;
        tracing::debug!(target: "bundle", "Prepared the source at {}", self.app_dir().display());
        Ok(())
    }

    /// Pack `app/` and `deps/` into the final bundle.
    ///
    /// The tarball is written next to its destination and renamed into
    /// place, so a bundle that exists is always complete.
    pub async fn assemble(&self, options: BundleOptions) -> Result<PathBuf> {
        let app = self.app_dir();
        let deps = self.deps_dir();
        let dest = self.archive.clone();
        let temp = PathBuf::from(format!("{}.partial", dest.display()));
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }

        let target = temp.clone();
        let written = tokio::task::spawn_blocking(move || -> Result<()> {
            let mut writer = TarGzWriter::create(&target)?;
            writer.append_tree(&app, APP_DIR, |relative| {
                !options.include_git_dir && relative.components().next() == Some(Component::Normal(".git".as_ref()))
            })?;
            if deps.is_dir() {
                writer.append_tree(&deps, DEPS_DIR, |_| false)?;
            } else {
                writer.append_empty_dir(DEPS_DIR)?;
            }
            writer.finish()
        })
        .await
        .context("Failed to spawn blocking task for bundle creation")?;

        if let Err(e) = written {
            remove_file_if_exists(&temp)?;
            return Err(e);
        }
        if let Err(e) = std::fs::rename(&temp, &dest) {
            remove_file_if_exists(&temp)?;
            return Err(anyhow::Error::new(e)
                .context(format!("Failed to move the bundle into place at {}", dest.display())));
        }
        tracing::info!(target: "bundle", "Created the bundle at {}", dest.display());
        Ok(dest)
    }
}

/// Reject or delete symlinks whose destination is outside `app_dir`.
///
/// Destinations are resolved on the file system, following every link in a
/// chain. Dangling or looping links count as unsafe.
pub fn enforce_sandbox(app_dir: &Path, remove_unsafe_symlinks: bool) -> Result<()> {
    let mut unsafe_links = Vec::new();
    for entry in WalkDir::new(app_dir).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", app_dir.display()))?;
        if !entry.path_is_symlink() {
            continue;
        }
        if !is_within(app_dir, entry.path()) {
            unsafe_links.push(entry.path().to_path_buf());
        }
    }

    for link in unsafe_links {
        let relative = link.strip_prefix(app_dir).unwrap_or(&link).display().to_string();
        if !remove_unsafe_symlinks {
            return Err(DepcacheError::InvalidRepoStructure {
                reason: format!(
                    "The destination of {relative} is outside of the cloned repository. \
                     Use the remove-unsafe-symlinks flag to remove such symlinks"
                ),
            }
            .into());
        }
        tracing::warn!(target: "bundle", "Removing the symlink {} that points outside of the repository", relative);
        remove_file_if_exists(&link)?;
    }
    Ok(())
}

/// Wait until the bundle at `path` exists, for at most `timeout`.
pub async fn wait_for_bundle(path: &Path, timeout: Duration) -> Result<PathBuf> {
    let started = Instant::now();
    loop {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        if started.elapsed() >= timeout {
            return Err(DepcacheError::Timeout {
                seconds: timeout.as_secs(),
                operation: format!("waiting for the bundle {}", path.display()),
            }
            .into());
        }
        tokio::time::sleep(BUNDLE_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tarball::{create_tar_gz, list_entries};
    use tempfile::TempDir;

    fn source_archive(temp: &Path, build: impl FnOnce(&Path)) -> PathBuf {
        let tree = temp.join("tree");
        std::fs::create_dir_all(tree.join(".git")).unwrap();
        std::fs::write(tree.join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::write(tree.join("go.mod"), "module example.com/m\n").unwrap();
        build(&tree);
        let archive = temp.join("source.tar.gz");
        create_tar_gz(&tree, APP_DIR, &archive).unwrap();
        archive
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_sandbox() {
        use std::os::unix::fs::symlink;

        let temp = TempDir::new().unwrap();
        let app = temp.path().join("app");
        std::fs::create_dir_all(app.join("sub")).unwrap();
        std::fs::write(app.join("file"), "x").unwrap();
        symlink("../file", app.join("sub/inside")).unwrap();
        symlink("../../outside", app.join("sub/escape")).unwrap();

        let err = enforce_sandbox(&app, false).unwrap_err();
        assert!(err.to_string().starts_with("The destination of sub/escape is outside"));
        enforce_sandbox(&app, true).unwrap();
        assert!(app.join("sub/inside").symlink_metadata().is_ok());
        assert!(app.join("sub/escape").symlink_metadata().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_chain_is_resolved_physically() {
        use std::os::unix::fs::symlink;

        let temp = TempDir::new().unwrap();
        let app = temp.path().join("app");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(temp.path().join("secret"), "s").unwrap();
        std::fs::write(app.join("secret"), "decoy").unwrap();
        symlink(".", app.join("q")).unwrap();
        symlink("q/../secret", app.join("p")).unwrap();

        let err = enforce_sandbox(&app, false).unwrap_err();
        assert!(err.to_string().starts_with("The destination of p is outside"), "{err}");
        enforce_sandbox(&app, true).unwrap();
        assert!(app.join("p").symlink_metadata().is_err());
        assert!(app.join("q").symlink_metadata().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_and_absolute_symlinks_are_unsafe() {
        use std::os::unix::fs::symlink;

        let temp = TempDir::new().unwrap();
        let app = temp.path().join("app");
        std::fs::create_dir_all(&app).unwrap();
        symlink("missing", app.join("dangling")).unwrap();
        symlink("/etc/passwd", app.join("absolute")).unwrap();
        symlink("loop", app.join("loop")).unwrap();

        enforce_sandbox(&app, true).unwrap();
        for name in ["dangling", "absolute", "loop"] {
            assert!(app.join(name).symlink_metadata().is_err(), "{name} was kept");
        }
    }

    #[tokio::test]
    async fn test_assemble_drops_git_dir_by_default() {
        let temp = TempDir::new().unwrap();
        let archive = source_archive(temp.path(), |_| {});
        let bundles = temp.path().join("bundles");
        let bundle = BundleDir::new(&bundles, 7);

        bundle.prepare_source(&archive, BundleOptions::default()).await.unwrap();
        std::fs::create_dir_all(bundle.deps_dir().join("gomod/pkg/mod/cache/download")).unwrap();
        std::fs::write(bundle.deps_dir().join("gomod/pkg/mod/cache/download/list"), "v1\n").unwrap();

        let path = bundle.assemble(BundleOptions::default()).await.unwrap();
        assert_eq!(path, bundles.join("7.tar.gz"));
        let entries = list_entries(&path).unwrap();
        assert!(entries.contains(&"app/go.mod".to_string()));
        assert!(entries.contains(&"deps/gomod/pkg/mod/cache/download/list".to_string()));
        assert!(!entries.iter().any(|e| e.starts_with("app/.git")));
        assert!(!bundles.join("7.tar.gz.partial").exists());
    }

    #[tokio::test]
    async fn test_include_git_dir_and_deterministic_output() {
        let temp = TempDir::new().unwrap();
        let archive = source_archive(temp.path(), |_| {});
        let options = BundleOptions {
            include_git_dir: true,
            ..BundleOptions::default()
        };

        let first = BundleDir::new(&temp.path().join("one"), 1);
        first.prepare_source(&archive, options).await.unwrap();
        let first = first.assemble(options).await.unwrap();
        let second = BundleDir::new(&temp.path().join("two"), 1);
        second.prepare_source(&archive, options).await.unwrap();
        let second = second.assemble(options).await.unwrap();

        assert!(list_entries(&first).unwrap().contains(&"app/.git/HEAD".to_string()));
        assert!(list_entries(&first).unwrap().contains(&"deps".to_string()));
        assert_eq!(std::fs::read(first).unwrap(), std::fs::read(second).unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_bundle_times_out() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("1.tar.gz");
        let err = wait_for_bundle(&missing, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<DepcacheError>(), Some(DepcacheError::Timeout { .. })));

        std::fs::write(&missing, b"x").unwrap();
        assert_eq!(wait_for_bundle(&missing, Duration::ZERO).await.unwrap(), missing);
    }
}
