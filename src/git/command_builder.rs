//! Type-safe Git command builder for consistent command execution
//!
//! Every Git invocation made by the archive cache and the resolvers goes
//! through [`GitCommand`], which adds the `-C <dir>` prefix, a bounded wait,
//! non-interactive credentials and typed error mapping.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::core::DepcacheError;
use crate::utils::platform::get_git_command;

/// Builder for one Git invocation.
///
/// ```rust,no_run
/// use depcache::git::command_builder::GitCommand;
///
/// # async fn example() -> anyhow::Result<()> {
/// let sha = GitCommand::new()
///     .args(["rev-parse", "HEAD"])
///     .current_dir("/path/to/repo")
///     .with_context("request 42")
///     .execute_stdout()
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// New commands default to a 5 minute timeout and `GIT_TERMINAL_PROMPT=0`, so
/// a credential prompt fails the command instead of hanging a worker.
pub struct GitCommand {
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    env_vars: Vec<(String, String)>,
    timeout_duration: Option<Duration>,
    context: Option<String>,
    /// Repository URL for remote operations, used in error messages
    remote_url: Option<String>,
}

impl Default for GitCommand {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            current_dir: None,
            env_vars: vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())],
            timeout_duration: Some(Duration::from_secs(300)),
            context: None,
            remote_url: None,
        }
    }
}

impl GitCommand {
    /// Creates a new Git command builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the repository directory (passed as `-C <dir>`).
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Adds a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Set a custom timeout for the command (None for no timeout)
    pub const fn with_timeout(mut self, duration: Option<Duration>) -> Self {
        self.timeout_duration = duration;
        self
    }

    /// Set a context for logging (e.g., the request id)
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Record the remote URL; failures then map to
    /// [`DepcacheError::RepositoryAccess`].
    pub fn remote(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    fn operation(args: &[String]) -> String {
        args.first().cloned().unwrap_or_else(|| "unknown".to_string())
    }

    fn map_failure(&self, stderr: &str, code: Option<i32>) -> DepcacheError {
        let operation = Self::operation(&self.args);
        match (&self.remote_url, operation.as_str()) {
            (Some(url), "clone") => DepcacheError::RepositoryAccess {
                url: url.clone(),
                reason: "Cloning the Git repository failed".to_string(),
            },
            (Some(url), "fetch") => DepcacheError::RepositoryAccess {
                url: url.clone(),
                reason: "Fetching from the Git repository failed".to_string(),
            },
            (Some(url), "reset" | "checkout") => DepcacheError::RepositoryAccess {
                url: url.clone(),
                reason: "Checking out the Git repository failed".to_string(),
            },
            (Some(url), _) => DepcacheError::RepositoryAccess {
                url: url.clone(),
                reason: format!("Git {operation} failed: {}", stderr.trim()),
            },
            (None, _) => DepcacheError::SubprocessCall {
                command: format!("git {}", self.args.join(" ")),
                message: format!("Git {operation} failed"),
                stderr: stderr.to_string(),
                code,
            },
        }
    }

    /// Execute the command and return the output
    pub async fn execute(self) -> Result<GitCommandOutput> {
        let start = std::time::Instant::now();
        let git_command = get_git_command();
        let mut cmd = Command::new(git_command);

        let mut full_args = Vec::new();
        if let Some(ref dir) = self.current_dir {
            full_args.push("-C".to_string());
            full_args.push(dir.display().to_string());
        }
        full_args.extend(self.args.iter().cloned());
        cmd.args(&full_args);

        let ctx = self.context.as_deref().unwrap_or("-");
        tracing::debug!(target: "git", "({}) Executing command: {} {}", ctx, git_command, full_args.join(" "));

        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let output_future = cmd.output();
        let output = if let Some(duration) = self.timeout_duration {
            if let Ok(result) = timeout(duration, output_future).await {
                result.with_context(|| format!("Failed to execute git {}", full_args.join(" ")))?
            } else {
                tracing::warn!(
                    target: "git",
                    "({}) Command timed out after {} seconds: git {}",
                    ctx,
                    duration.as_secs(),
                    full_args.join(" ")
                );
                return Err(self
                    .map_failure(
                        &format!("Git command timed out after {} seconds", duration.as_secs()),
                        None,
                    )
                    .into());
            }
        } else {
            output_future.await.with_context(|| format!("Failed to execute git {}", full_args.join(" ")))?
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            tracing::debug!(
                target: "git",
                "({}) Command failed with exit code {:?}: {}",
                ctx,
                output.status.code(),
                stderr.trim()
            );
            return Err(self.map_failure(&stderr, output.status.code()).into());
        }

        let elapsed = start.elapsed();
        if elapsed.as_secs() > 1 {
            tracing::info!(
                target: "git::perf",
                "({}) Git {} took {:.2}s",
                ctx,
                Self::operation(&self.args),
                elapsed.as_secs_f64()
            );
        }

        Ok(GitCommandOutput {
            stdout,
            stderr,
        })
    }

    /// Execute the command and return only stdout as a trimmed string
    pub async fn execute_stdout(self) -> Result<String> {
        let output = self.execute().await?;
        Ok(output.stdout.trim().to_string())
    }

    /// Execute the command and check for success
    pub async fn execute_success(self) -> Result<()> {
        self.execute().await?;
        Ok(())
    }
}

/// Output from a Git command
pub struct GitCommandOutput {
    /// Standard output from the Git command
    pub stdout: String,
    /// Standard error output from the Git command
    pub stderr: String,
}

// Convenience builders for the operations the archive cache performs

impl GitCommand {
    /// `git clone --no-checkout <url> <target>`
    pub fn clone_no_checkout(url: &str, target: impl AsRef<Path>) -> Self {
        Self::new()
            .args(["clone", "--no-checkout", url])
            .arg(target.as_ref().display().to_string())
            .remote(url)
    }

    /// `git fetch <remote> <refspec>` with tags
    pub fn fetch_ref(remote_url: &str, refspec: &str) -> Self {
        Self::new().args(["fetch", "--tags", "--force", remote_url, refspec]).remote(remote_url)
    }

    /// `git reset --hard <ref>`
    pub fn reset_hard(ref_name: &str) -> Self {
        Self::new().args(["reset", "--hard", ref_name])
    }

    /// `git submodule update --init` without recursion
    pub fn submodule_update() -> Self {
        Self::new().args(["submodule", "update", "--init"])
    }

    /// `git fsck`
    pub fn fsck() -> Self {
        Self::new().args(["fsck", "--no-progress"])
    }

    /// `git rev-parse <ref>`
    pub fn rev_parse(ref_name: &str) -> Self {
        Self::new().args(["rev-parse", ref_name])
    }

    /// `git tag --points-at <commit>`
    pub fn tags_pointing_at(commit: &str) -> Self {
        Self::new().args(["tag", "--points-at", commit])
    }

    /// Tags reachable from `commit`
    pub fn tags_merged_into(commit: &str) -> Self {
        Self::new().args([
            "for-each-ref",
            "--format",
            "%(refname:lstrip=-1)",
            "refs/tags",
            "--merged",
            commit,
        ])
    }

    /// Committer timestamp of `commit` as seconds since the epoch
    pub fn commit_timestamp(commit: &str) -> Self {
        Self::new().args(["show", "-s", "--format=%ct", commit])
    }
}
