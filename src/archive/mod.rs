//! Source archive cache
//!
//! Compressed snapshots of repositories at a commit, stored at
//! `<sources_dir>/<repo path>/<ref>.tar.gz` with the working copy (including
//! `.git`) under `app/`. When submodules are checked out the archive name
//! gets a `-with-submodules` suffix.
//!
//! # Fetch algorithm
//!
//! 1. A valid archive for (repo, ref) is returned unchanged.
//! 2. Otherwise older archives of the same repository are tried newest
//!    first: their history is extracted, the missing commits fetched and the
//!    working tree reset to the ref. Archives with submodules are never used
//!    this way.
//! 3. If no candidate works, the repository is cloned from scratch.
//!
//! New archives are built under `<sources_dir>/.tmp`, verified, then
//! published with a hard link that never replaces an existing file. A
//! concurrent writer that loses the race discards its copy and returns the
//! published one.
//!
//! An archive is valid when it is a readable gzip tar and `git fsck`
//! succeeds on its extracted `app/` directory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio_retry::RetryIf;

use crate::constants::{APP_DIR, CACHE_STEP_RETRIES, WITH_SUBMODULES_SUFFIX};
use crate::core::{DepcacheError, find_depcache_error};
use crate::git::{GitRepo, repo_name_from_url};
use crate::request::is_request_ref_valid;
use crate::utils::backoff::retry_strategy;
use crate::utils::fs::remove_file_if_exists;
use crate::utils::tarball::{TarGzWriter, extract_tar_gz, is_valid_tar_gz};
use crate::utils::{ensure_dir, publish_no_clobber};

const TMP_DIR: &str = ".tmp";

/// A verified source archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceArchive {
    /// Archive file
    pub path: PathBuf,
    /// Repository URL
    pub repo: String,
    /// Commit hash
    pub git_ref: String,
    /// Whether submodules are checked out inside
    pub with_submodules: bool,
}

/// Content-addressed store of source archives.
#[derive(Debug, Clone)]
pub struct SourceArchiveCache {
    sources_dir: PathBuf,
}

impl SourceArchiveCache {
    /// Cache rooted at `sources_dir`.
    pub fn new(sources_dir: impl Into<PathBuf>) -> Self {
        Self {
            sources_dir: sources_dir.into(),
        }
    }

    /// Root directory.
    pub fn sources_dir(&self) -> &Path {
        &self.sources_dir
    }

    /// Where the archive for (repo, ref) lives.
    ///
    /// Only full commit hashes name an archive; branches and tags move.
    pub fn archive_path(&self, repo: &str, git_ref: &str, with_submodules: bool) -> Result<PathBuf> {
        if !is_request_ref_valid(git_ref) {
            return Err(DepcacheError::InvalidRequestData {
                reason: format!("Cannot cache {repo} at {git_ref}, the ref must be a 40 character hex string"),
            }
            .into());
        }
        let repo_name = repo_name_from_url(repo)?;
        let suffix = if with_submodules { WITH_SUBMODULES_SUFFIX } else { "" };
        Ok(self.sources_dir.join(repo_name).join(format!("{git_ref}{suffix}.tar.gz")))
    }

    /// Materialise the archive for (repo, ref).
    ///
    /// Transient failures of the creating step (repository access, file
    /// access, subprocess) are retried once before surfacing.
    pub async fn fetch(&self, repo: &str, git_ref: &str, with_submodules: bool) -> Result<SourceArchive> {
        let path = self.archive_path(repo, git_ref, with_submodules)?;
        let archive = SourceArchive {
            path: path.clone(),
            repo: repo.to_string(),
            git_ref: git_ref.to_string(),
            with_submodules,
        };

        if path.exists() {
            tracing::debug!(target: "archive", "The archive already exists at {}", path.display());
            match verify_archive(&path).await {
                Ok(()) => return Ok(archive),
                Err(e) => {
                    tracing::warn!(
                        target: "archive",
                        "The archive at {} is invalid and will be re-created: {:#}",
                        path.display(),
                        e
                    );
                    remove_file_if_exists(&path)?;
                }
            }
        }

        RetryIf::spawn(
            retry_strategy(CACHE_STEP_RETRIES),
            || self.create(repo, git_ref, with_submodules, &path),
            |e: &anyhow::Error| {
                let retry = find_depcache_error(e).is_some_and(DepcacheError::is_transient);
                if retry {
                    tracing::warn!(target: "archive", "Retrying archive creation for {}: {:#}", repo, e);
                }
                retry
            },
        )
        .await?;

        Ok(archive)
    }

    async fn create(&self, repo: &str, git_ref: &str, with_submodules: bool, dest: &Path) -> Result<()> {
        for previous in self.previous_archives(dest)? {
            match self.update_from(&previous, repo, git_ref, with_submodules, dest).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        target: "archive",
                        "Existing archive at {} could not be reused: {:#}",
                        previous.display(),
                        e
                    );
                }
            }
        }
        self.clone_and_archive(repo, git_ref, with_submodules, dest).await
    }

    /// Other archives of the same repository without submodules, newest first.
    fn previous_archives(&self, dest: &Path) -> Result<Vec<PathBuf>> {
        let Some(dir) = dest.parent() else {
            return Ok(Vec::new());
        };
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut candidates = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path == dest || !name.ends_with(".tar.gz") || name.contains(WITH_SUBMODULES_SUFFIX) {
                continue;
            }
            let modified = entry.metadata().and_then(|m| m.modified()).unwrap_or(SystemTime::UNIX_EPOCH);
            candidates.push((modified, path));
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(candidates.into_iter().map(|(_, path)| path).collect())
    }

    fn work_dir(&self) -> Result<TempDir> {
        let tmp = self.sources_dir.join(TMP_DIR);
        ensure_dir(&tmp)?;
        tempfile::Builder::new()
            .prefix("work-")
            .tempdir_in(&tmp)
            .with_context(|| format!("Failed to create a work directory in {}", tmp.display()))
    }

    async fn update_from(
        &self,
        previous: &Path,
        repo: &str,
        git_ref: &str,
        with_submodules: bool,
        dest: &Path,
    ) -> Result<()> {
        tracing::info!(target: "archive", "Updating the history from {}", previous.display());
        let work = self.work_dir()?;
        let archive = previous.to_path_buf();
        let extract_to = work.path().to_path_buf();
        tokio::task::spawn_blocking(move || extract_tar_gz(&archive, &extract_to))
            .await
            .context("Failed to spawn blocking task for extraction")??;

        let app = work.path().join(APP_DIR);
        if !app.join(".git").is_dir() {
            return Err(DepcacheError::InvalidRepoStructure {
                reason: format!("{} does not contain a Git repository", previous.display()),
            }
            .into());
        }

        let git = GitRepo::new(&app);
        git.fetch_ref(repo, git_ref, repo).await?;
        git.reset_hard(repo, git_ref, repo).await?;
        if with_submodules {
            git.update_submodules(repo, repo).await?;
        }
        self.publish(&app, dest).await
    }

    async fn clone_and_archive(
        &self,
        repo: &str,
        git_ref: &str,
        with_submodules: bool,
        dest: &Path,
    ) -> Result<()> {
        let work = self.work_dir()?;
        let git = GitRepo::clone_no_checkout(repo, &work.path().join("repo"), repo).await?;
        git.reset_hard(repo, git_ref, repo).await?;
        if with_submodules {
            git.update_submodules(repo, repo).await?;
        }
        self.publish(git.path(), dest).await
    }

    /// Archive `working_copy`, verify it and publish it at `dest`.
    async fn publish(&self, working_copy: &Path, dest: &Path) -> Result<()> {
        let tmp = self.sources_dir.join(TMP_DIR);
        ensure_dir(&tmp)?;
        let temp_archive = tempfile::Builder::new()
            .prefix("archive-")
            .suffix(".tar.gz")
            .tempfile_in(&tmp)
            .context("Failed to create a temporary archive")?
            .into_temp_path();

        let source = working_copy.to_path_buf();
        let target = temp_archive.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut writer = TarGzWriter::create(&target)?;
            writer.append_tree(&source, APP_DIR, |_| false)?;
            writer.finish()
        })
        .await
        .context("Failed to spawn blocking task for archiving")??;

        verify_archive(&temp_archive).await?;

        if publish_no_clobber(&temp_archive, dest)? {
            tracing::info!(target: "archive", "Published {}", dest.display());
        } else {
            tracing::info!(
                target: "archive",
                "{} was published by another worker; discarding this copy",
                dest.display()
            );
        }
        Ok(())
    }

    /// Delete archives not modified within `older_than`. Returns how many were removed.
    pub async fn prune_archives(&self, older_than: Duration) -> Result<usize> {
        let root = self.sources_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<usize> {
            if !root.is_dir() {
                return Ok(0);
            }
            let cutoff = SystemTime::now().checked_sub(older_than).unwrap_or(SystemTime::UNIX_EPOCH);
            let mut removed = 0;
            for entry in walkdir::WalkDir::new(&root)
                .into_iter()
                .filter_entry(|e| e.file_name() != TMP_DIR && e.file_name() != ".locks")
            {
                let entry = entry?;
                if !entry.file_type().is_file() || !entry.file_name().to_string_lossy().ends_with(".tar.gz") {
                    continue;
                }
                let modified = entry.metadata()?.modified()?;
                if modified < cutoff {
                    tracing::info!(target: "archive", "Pruning {}", entry.path().display());
                    remove_file_if_exists(entry.path())?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
        .context("Failed to spawn blocking task for pruning")?
    }
}

/// Check that `path` is a readable archive whose `app/` passes `git fsck`.
pub async fn verify_archive(path: &Path) -> Result<()> {
    tracing::debug!(target: "archive", "Verifying the archive at {}", path.display());
    let archive = path.to_path_buf();
    let valid = tokio::task::spawn_blocking(move || is_valid_tar_gz(&archive))
        .await
        .context("Failed to spawn blocking task for verification")?;
    if !valid {
        return Err(DepcacheError::FileAccess {
            path: path.display().to_string(),
            reason: "No valid archive found".to_string(),
        }
        .into());
    }

    let scratch = tempfile::Builder::new().prefix("depcache-verify-").tempdir()?;
    let archive = path.to_path_buf();
    let extract_to = scratch.path().to_path_buf();
    tokio::task::spawn_blocking(move || extract_tar_gz(&archive, &extract_to))
        .await
        .context("Failed to spawn blocking task for extraction")??;

    let app = scratch.path().join(APP_DIR);
    if let Err(e) = GitRepo::new(&app).fsck("verify").await {
        tracing::error!(target: "archive", "Verification of {} failed: {:#}", path.display(), e);
        return Err(DepcacheError::FileAccess {
            path: path.display().to_string(),
            reason: "Invalid archive".to_string(),
        }
        .into());
    }
    Ok(())
}
