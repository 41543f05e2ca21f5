//! Git test helper utilities
//!
//! Provides a small synchronous wrapper around the `git` binary for building
//! fixture repositories in tests.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Runs git commands inside one fixture repository.
pub struct TestGit {
    repo_path: PathBuf,
}

impl TestGit {
    fn run_git_command(&self, args: &[&str], action: &str) -> Result<std::process::Output> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .with_context(|| action.to_string())?;

        if !output.status.success() {
            bail!("{} failed: {}", action, String::from_utf8_lossy(&output.stderr));
        }

        Ok(output)
    }

    /// Helper for the repository at `repo_path` (not created until [`init`](Self::init)).
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    /// Repository directory.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// `git init` on a `main` branch.
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.repo_path)?;
        self.run_git_command(&["init", "-b", "main"], "Failed to initialize git repository")?;
        Ok(())
    }

    /// Configure a local identity so commits work on CI machines.
    pub fn config_user(&self) -> Result<()> {
        self.run_git_command(
            &["config", "user.email", "test@depcache.example"],
            "Failed to configure git user email",
        )?;
        self.run_git_command(
            &["config", "user.name", "Test User"],
            "Failed to configure git user name",
        )?;
        Ok(())
    }

    /// Write a file relative to the repository root, creating parents.
    pub fn write_file(&self, relative: &str, content: &str) -> Result<()> {
        let path = self.repo_path.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content).with_context(|| format!("Failed to write {relative}"))
    }

    /// `git add .`
    pub fn add_all(&self) -> Result<()> {
        self.run_git_command(&["add", "."], "Failed to add files to git")?;
        Ok(())
    }

    /// `git commit -m <message>`
    pub fn commit(&self, message: &str) -> Result<()> {
        self.run_git_command(&["commit", "-m", message], "Failed to create git commit")?;
        Ok(())
    }

    /// `git tag <name>`
    pub fn tag(&self, tag_name: &str) -> Result<()> {
        self.run_git_command(&["tag", tag_name], &format!("Failed to create tag: {tag_name}"))?;
        Ok(())
    }

    /// Add `url` as a submodule at `path`.
    pub fn submodule_add(&self, url: &str, path: &str) -> Result<()> {
        self.run_git_command(
            &["-c", "protocol.file.allow=always", "submodule", "add", url, path],
            &format!("Failed to add submodule {path}"),
        )?;
        Ok(())
    }

    /// Commit hash of `HEAD`.
    pub fn rev_parse_head(&self) -> Result<String> {
        let output =
            self.run_git_command(&["rev-parse", "HEAD"], "Failed to get current commit SHA")?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// `file://` URL of this repository, usable as a request `repo`.
    pub fn file_url(&self) -> String {
        format!("file://{}", self.repo_path.display())
    }

    /// Initialise, commit `files` and return the commit hash.
    pub fn init_with_files(&self, files: &[(&str, &str)]) -> Result<String> {
        self.init()?;
        self.config_user()?;
        for (path, content) in files {
            self.write_file(path, content)?;
        }
        self.add_all()?;
        self.commit("Initial commit")?;
        self.rev_parse_head()
    }

    /// Commit `files` on top of the current history and return the new hash.
    pub fn commit_files(&self, files: &[(&str, &str)], message: &str) -> Result<String> {
        for (path, content) in files {
            self.write_file(path, content)?;
        }
        self.add_all()?;
        self.commit(message)?;
        self.rev_parse_head()
    }
}
