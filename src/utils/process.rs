//! Builder for package-manager subprocesses
//!
//! [`ToolCommand`] runs an external tool (`go`, `npm`, ...) with a bounded
//! wait. A non-zero exit or an elapsed timeout becomes a
//! [`DepcacheError::SubprocessCall`] carrying the command line, captured
//! stderr and a caller-chosen summary, so callers never block indefinitely
//! and failures stay distinguishable from other I/O errors.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::constants::DEFAULT_SUBPROCESS_TIMEOUT_SECS;
use crate::core::DepcacheError;

/// Captured output of a successful tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

/// Fluent builder for one external tool invocation.
///
/// ```rust,no_run
/// use depcache::utils::process::ToolCommand;
///
/// # async fn example() -> anyhow::Result<()> {
/// let output = ToolCommand::new("go")
///     .args(["mod", "download"])
///     .current_dir("/tmp/app")
///     .env("GOFLAGS", "-mod=mod")
///     .failure_message("Processing gomod dependencies failed")
///     .execute()
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    env_vars: Vec<(String, String)>,
    clear_env: bool,
    timeout_duration: Duration,
    failure_message: Option<String>,
    context: Option<String>,
}

impl ToolCommand {
    /// Creates a builder for `program` with the default timeout.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env_vars: Vec::new(),
            clear_env: false,
            timeout_duration: Duration::from_secs(DEFAULT_SUBPROCESS_TIMEOUT_SECS),
            failure_message: None,
            context: None,
        }
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

    /// Sets the working directory.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Adds several environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars.extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Start from an empty environment instead of inheriting the parent's.
    pub const fn env_clear(mut self) -> Self {
        self.clear_env = true;
        self
    }

    /// Overrides the timeout.
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout_duration = duration;
        self
    }

    /// Summary used as the error message when the command fails.
    pub fn failure_message(mut self, message: impl Into<String>) -> Self {
        self.failure_message = Some(message.into());
        self
    }

    /// Label included in log lines (usually the request id).
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn failure(&self, stderr: String, code: Option<i32>) -> DepcacheError {
        let command = self.command_line();
        DepcacheError::SubprocessCall {
            message: self
                .failure_message
                .clone()
                .unwrap_or_else(|| format!("The command \"{command}\" failed")),
            command,
            stderr,
            code,
        }
    }

    /// Runs the command and returns its output, failing on non-zero exit.
    pub async fn execute(self) -> Result<ToolOutput> {
        let start = std::time::Instant::now();
        let command_line = self.command_line();
        let ctx = self.context.as_deref().unwrap_or("-");
        tracing::debug!(target: "process", "({}) Running {}", ctx, command_line);

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        if self.clear_env {
            cmd.env_clear();
        }
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let output = match timeout(self.timeout_duration, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(self.failure(format!("Failed to start {}: {e}", self.program), None).into());
            }
            Err(_) => {
                tracing::warn!(
                    target: "process",
                    "({}) {} timed out after {}s",
                    ctx,
                    command_line,
                    self.timeout_duration.as_secs()
                );
                return Err(self
                    .failure(
                        format!("Timed out after {} seconds", self.timeout_duration.as_secs()),
                        None,
                    )
                    .into());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        tracing::debug!(
            target: "process::perf",
            "({}) {} finished in {:.2}s",
            ctx,
            command_line,
            start.elapsed().as_secs_f64()
        );

        if !output.status.success() {
            tracing::error!(
                target: "process",
                "({}) {} exited with {:?}: {}",
                ctx,
                command_line,
                output.status.code(),
                stderr.trim()
            );
            return Err(self.failure(stderr, output.status.code()).into());
        }

        Ok(ToolOutput {
            stdout,
            stderr,
        })
    }

    /// Runs the command and returns trimmed stdout.
    pub async fn execute_stdout(self) -> Result<String> {
        Ok(self.execute().await?.stdout.trim().to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::find_depcache_error;

    #[tokio::test]
    async fn test_successful_command_captures_stdout() {
        let out = ToolCommand::new("sh").args(["-c", "echo hello"]).execute_stdout().await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_failure_is_subprocess_error() {
        let err = ToolCommand::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .failure_message("Processing failed")
            .execute()
            .await
            .unwrap_err();

        match find_depcache_error(&err) {
            Some(DepcacheError::SubprocessCall {
                message,
                stderr,
                code,
                ..
            }) => {
                assert_eq!(message, "Processing failed");
                assert_eq!(stderr.trim(), "broken");
                assert_eq!(*code, Some(3));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_does_not_hang() {
        let err = ToolCommand::new("sh")
            .args(["-c", "sleep 5"])
            .timeout(Duration::from_millis(100))
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(find_depcache_error(&err), Some(DepcacheError::SubprocessCall { .. })));
    }
}
