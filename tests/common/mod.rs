//! Shared helpers for the integration suite
#![allow(dead_code)]

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use depcache::test_utils::TestGit;

/// An isolated depcache home plus an upstream repository to submit.
pub struct TestHome {
    temp: TempDir,
    home: PathBuf,
    pub upstream: TestGit,
}

impl TestHome {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let home = temp.path().join("home");
        std::fs::create_dir_all(&home)?;
        let upstream = TestGit::new(temp.path().join("upstream"));
        Ok(Self {
            temp,
            home,
            upstream,
        })
    }

    /// Root directory handed to depcache through `DEPCACHE_HOME`.
    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Write a request payload for the upstream repository at `git_ref`.
    pub fn write_payload(&self, git_ref: &str, pkg_managers: &[&str]) -> Result<PathBuf> {
        let payload = serde_json::json!({
            "repo": self.upstream.file_url(),
            "ref": git_ref,
            "pkg_managers": pkg_managers,
        });
        let path = self.temp.path().join("payload.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&payload)?)?;
        Ok(path)
    }

    /// Run the depcache binary against this home.
    pub fn run_depcache(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(env!("CARGO_BIN_EXE_depcache"))
            .args(args)
            .current_dir(self.temp.path())
            .env("DEPCACHE_HOME", &self.home)
            .env_remove("DEPCACHE_CONFIG")
            .env_remove("RUST_LOG")
            .env("NO_COLOR", "1")
            .output()
            .context("Failed to run depcache")?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Assert the command succeeded
    pub fn assert_success(&self) -> &Self {
        assert!(self.success, "Command failed with code {:?}\nStderr: {}", self.code, self.stderr);
        self
    }

    /// Assert the command failed
    pub fn assert_failure(&self) -> &Self {
        assert!(!self.success, "Command unexpectedly succeeded\nStdout: {}", self.stdout);
        self
    }

    /// Parse stdout as JSON
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.stdout)
            .unwrap_or_else(|e| panic!("stdout is not JSON ({e}):\n{}", self.stdout))
    }
}
