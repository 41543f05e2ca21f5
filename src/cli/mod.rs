//! Command-line interface for depcache.
//!
//! Every command is a thin shell over the library: it loads the
//! [`Config`], opens the persisted request store and prints JSON on stdout.
//! Diagnostics go to stderr through `tracing`.
//!
//! # Commands
//!
//! - `submit <payload.json> [--wait]` - create a request and process it
//! - `show [<id>] [--verbose]` - print one request, or all of them
//! - `manifest <id>` - print the content manifest of a finished request
//! - `download <id> -o <file>` - copy the bundle of a complete request
//! - `stale <id> --reason <text>` - mark a request stale
//! - `cache prune --older-than-days <n>` - delete old source archives
//!
//! # Example
//!
//! ```bash
//! depcache submit request.json --wait
//! depcache manifest 1 > content-manifest.json
//! depcache download 1 -o bundle.tar.gz
//! ```

mod cache;
mod download;
mod manifest;
mod show;
mod stale;
mod submit;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "depcache",
    about = "Resolve, cache and bundle the dependencies of a source repository",
    version,
    long_about = "depcache fetches a repository at a commit, downloads every dependency its \
                  package managers declare into a local cache, and produces a self-contained \
                  bundle plus a content manifest describing what is inside."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only report errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file
    #[arg(short, long, global = true, env = "DEPCACHE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a request from a JSON payload and process it
    Submit(submit::SubmitCommand),
    /// Show a request, or every request when no id is given
    Show(show::ShowCommand),
    /// Print the content manifest of a complete or stale request
    Manifest(manifest::ManifestCommand),
    /// Copy the bundle of a complete request
    Download(download::DownloadCommand),
    /// Mark a request stale
    Stale(stale::StaleCommand),
    /// Manage the source archive cache
    Cache(cache::CacheCommand),
}

impl Cli {
    /// Install logging, load the configuration and run the command.
    pub async fn execute(self) -> Result<()> {
        self.init_logging();
        let config = Config::load_with_optional(self.config.clone()).await?;
        tracing::debug!(target: "cli", "Using root {}", config.root.display());

        match self.command {
            Commands::Submit(cmd) => cmd.execute(config).await,
            Commands::Show(cmd) => cmd.execute(config).await,
            Commands::Manifest(cmd) => cmd.execute(config).await,
            Commands::Download(cmd) => cmd.execute(config).await,
            Commands::Stale(cmd) => cmd.execute(config).await,
            Commands::Cache(cmd) => cmd.execute(config).await,
        }
    }

    /// The default filter for the selected verbosity; `RUST_LOG` wins when set.
    fn log_filter(&self) -> EnvFilter {
        if std::env::var("RUST_LOG").is_ok() {
            return EnvFilter::from_default_env();
        }
        let level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        };
        EnvFilter::new(format!("depcache={level}"))
    }

    fn init_logging(&self) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(self.log_filter())
            .with_writer(std::io::stderr)
            .with_target(self.verbose)
            .try_init();
    }
}

/// Print `value` as pretty JSON on stdout.
pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
