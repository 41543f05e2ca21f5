//! Git operations used by the source archive cache and the resolvers
//!
//! All operations shell out to the system `git` through
//! [`command_builder::GitCommand`]; there is no libgit2 dependency. Remote
//! operations map failures to [`DepcacheError::RepositoryAccess`], local ones to
//! [`DepcacheError::SubprocessCall`].

pub mod command_builder;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::constants::{GIT_CLONE_TIMEOUT, GIT_FETCH_TIMEOUT, GIT_LOCAL_TIMEOUT};
use crate::core::DepcacheError;
use command_builder::GitCommand;

/// A submodule recorded in `.gitmodules` and pinned in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submodule {
    /// Name from `.gitmodules`
    pub name: String,
    /// Path relative to the repository root
    pub path: String,
    /// Remote URL
    pub url: String,
    /// Pinned commit
    pub sha: String,
}

/// A working copy on disk.
#[derive(Debug, Clone)]
pub struct GitRepo {
    path: PathBuf,
}

impl GitRepo {
    /// Wrap an existing working copy.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Repository directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Clone `url` into `target` without checking out files.
    pub async fn clone_no_checkout(url: &str, target: &Path, context: &str) -> Result<Self> {
        tracing::info!(target: "git", "({}) Cloning {}", context, url);
        GitCommand::clone_no_checkout(url, target)
            .with_timeout(Some(GIT_CLONE_TIMEOUT))
            .with_context(context)
            .execute_success()
            .await?;
        Ok(Self::new(target))
    }

    /// Fetch `refspec` from `url` into this repository.
    pub async fn fetch_ref(&self, url: &str, refspec: &str, context: &str) -> Result<()> {
        GitCommand::fetch_ref(url, refspec)
            .current_dir(&self.path)
            .with_timeout(Some(GIT_FETCH_TIMEOUT))
            .with_context(context)
            .execute_success()
            .await
    }

    /// Reset the working tree to `ref_name`.
    ///
    /// A missing commit is reported as a repository access failure for `url`.
    pub async fn reset_hard(&self, url: &str, ref_name: &str, context: &str) -> Result<()> {
        GitCommand::reset_hard(ref_name)
            .current_dir(&self.path)
            .remote(url)
            .with_timeout(Some(GIT_LOCAL_TIMEOUT))
            .with_context(context)
            .execute_success()
            .await
    }

    /// Check out submodules at their pinned commits, without recursion.
    pub async fn update_submodules(&self, url: &str, context: &str) -> Result<()> {
        GitCommand::submodule_update()
            .current_dir(&self.path)
            .remote(url)
            .with_timeout(Some(GIT_CLONE_TIMEOUT))
            .with_context(context)
            .execute_success()
            .await
    }

    /// Verify the object database.
    pub async fn fsck(&self, context: &str) -> Result<()> {
        GitCommand::fsck()
            .current_dir(&self.path)
            .with_timeout(Some(GIT_LOCAL_TIMEOUT))
            .with_context(context)
            .execute_success()
            .await
    }

    /// Commit that `HEAD` points to.
    pub async fn head_commit(&self) -> Result<String> {
        GitCommand::rev_parse("HEAD").current_dir(&self.path).execute_stdout().await
    }

    /// Tags pointing at `commit`.
    pub async fn tags_at(&self, commit: &str) -> Result<Vec<String>> {
        let output =
            GitCommand::tags_pointing_at(commit).current_dir(&self.path).execute_stdout().await?;
        Ok(output.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
    }

    /// Tags on `commit` or any of its ancestors.
    pub async fn tags_reachable_from(&self, commit: &str) -> Result<Vec<String>> {
        let output =
            GitCommand::tags_merged_into(commit).current_dir(&self.path).execute_stdout().await?;
        Ok(output.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
    }

    /// Committer time of `commit`.
    pub async fn commit_time(&self, commit: &str) -> Result<DateTime<Utc>> {
        let output =
            GitCommand::commit_timestamp(commit).current_dir(&self.path).execute_stdout().await?;
        let seconds: i64 = output
            .trim()
            .parse()
            .with_context(|| format!("Unexpected commit timestamp for {commit}: {output}"))?;
        DateTime::from_timestamp(seconds, 0)
            .ok_or_else(|| anyhow::anyhow!("Commit timestamp out of range: {seconds}"))
    }

    /// Submodules declared in `.gitmodules` with their pinned commits.
    ///
    /// A repository without `.gitmodules` has no submodules.
    pub async fn submodules(&self) -> Result<Vec<Submodule>> {
        if !self.path.join(".gitmodules").is_file() {
            return Ok(Vec::new());
        }

        let paths = GitCommand::new()
            .args(["config", "-f", ".gitmodules", "--get-regexp", r"^submodule\..*\.path$"])
            .current_dir(&self.path)
            .execute_stdout()
            .await?;

        let mut submodules = Vec::new();
        for line in paths.lines() {
            let Some((key, path)) = line.split_once(' ') else {
                continue;
            };
            let Some(name) =
                key.strip_prefix("submodule.").and_then(|rest| rest.strip_suffix(".path"))
            else {
                continue;
            };

            let url = GitCommand::new()
                .args(["config", "-f", ".gitmodules", "--get", &format!("submodule.{name}.url")])
                .current_dir(&self.path)
                .execute_stdout()
                .await?;

            let tree = GitCommand::new()
                .args(["ls-tree", "HEAD", path])
                .current_dir(&self.path)
                .execute_stdout()
                .await?;
            // <mode> commit <sha>\t<path>
            let sha = tree
                .split_whitespace()
                .nth(2)
                .filter(|_| tree.split_whitespace().nth(1) == Some("commit"))
                .ok_or_else(|| DepcacheError::InvalidRepoStructure {
                    reason: format!("The submodule {name} at {path} is not pinned to a commit"),
                })?;

            submodules.push(Submodule {
                name: name.to_string(),
                path: path.to_string(),
                url,
                sha: sha.to_string(),
            });
        }
        Ok(submodules)
    }
}

/// Repository path derived from its URL, e.g. `org/project` for
/// `https://github.com/org/project.git`.
///
/// Used to lay out the source archive directory.
pub fn repo_name_from_url(url: &str) -> Result<String> {
    let path = match url::Url::parse(url) {
        Ok(parsed) if !parsed.cannot_be_a_base() => parsed.path().to_string(),
        _ => {
            // scp-like syntax: git@host:org/project.git
            let (_, path) = url.split_once(':').ok_or_else(|| {
                DepcacheError::validation(format!("The repository URL {url} is invalid"))
            })?;
            path.to_string()
        }
    };

    let name = path.trim_matches('/');
    let name = name.strip_suffix(".git").unwrap_or(name);
    if name.is_empty() || name.split('/').any(|segment| segment == ".." || segment == ".") {
        return Err(DepcacheError::validation(format!("The repository URL {url} is invalid")).into());
    }
    Ok(name.to_string())
}

/// Whether the system `git` is available.
pub fn is_git_installed() -> bool {
    crate::utils::platform::command_exists(crate::utils::get_git_command())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestGit;
    use tempfile::TempDir;

    #[test]
    fn test_repo_name_from_url() {
        assert_eq!(repo_name_from_url("https://github.com/org/project.git").unwrap(), "org/project");
        assert_eq!(repo_name_from_url("https://github.com/org/project/").unwrap(), "org/project");
        assert_eq!(repo_name_from_url("git@gitlab.com:group/sub/proj.git").unwrap(), "group/sub/proj");
        assert!(repo_name_from_url("https://github.com/").is_err());
    }

    #[tokio::test]
    async fn test_tags_and_commit_time() {
        let temp = TempDir::new().unwrap();
        let git = TestGit::new(temp.path());
        git.init().unwrap();
        git.config_user().unwrap();
        std::fs::write(temp.path().join("README"), "hi").unwrap();
        git.add_all().unwrap();
        git.commit("initial").unwrap();
        git.tag("v1.2.3").unwrap();

        let repo = GitRepo::new(temp.path());
        let head = repo.head_commit().await.unwrap();
        assert_eq!(head.len(), 40);
        assert_eq!(repo.tags_at(&head).await.unwrap(), vec!["v1.2.3"]);
        assert_eq!(repo.tags_reachable_from(&head).await.unwrap(), vec!["v1.2.3"]);
        assert!(repo.commit_time(&head).await.unwrap().timestamp() > 0);
        repo.fsck("test").await.unwrap();
        assert!(repo.submodules().await.unwrap().is_empty());
    }
}
