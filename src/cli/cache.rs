//! `depcache cache`

use anyhow::Result;
use clap::{Args, Subcommand};
use colored::Colorize;
use std::time::Duration;

use crate::archive::SourceArchiveCache;
use crate::config::Config;

#[derive(Args, Debug)]
pub struct CacheCommand {
    #[command(subcommand)]
    command: CacheSubcommand,
}

#[derive(Subcommand, Debug)]
enum CacheSubcommand {
    /// Delete source archives that were not refreshed recently
    Prune {
        /// Minimum age in days of the archives to delete
        #[arg(long, value_name = "DAYS")]
        older_than_days: u64,
    },
}

impl CacheCommand {
    pub async fn execute(self, config: Config) -> Result<()> {
        match self.command {
            CacheSubcommand::Prune {
                older_than_days,
            } => {
                let cache = SourceArchiveCache::new(config.sources_dir());
                let age = Duration::from_secs(older_than_days.saturating_mul(24 * 60 * 60));
                let removed = cache.prune_archives(age).await?;
                println!("{} {} source archive(s)", "Removed".green().bold(), removed);
                Ok(())
            }
        }
    }
}
