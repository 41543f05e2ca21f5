//! `depcache download`

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

use crate::bundle::{bundle_archive_path, wait_for_bundle};
use crate::config::Config;
use crate::core::DepcacheError;
use crate::request::StateKind;
use crate::store::Store;

#[derive(Args, Debug)]
pub struct DownloadCommand {
    /// Request id
    pub id: u64,

    /// Where to write the bundle
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,
}

impl DownloadCommand {
    pub async fn execute(self, config: Config) -> Result<()> {
        let store = Store::open(&config).await?;
        let request = store.get(self.id)?;
        if request.state() != Some(StateKind::Complete) {
            return Err(DepcacheError::validation(format!(
                "The bundle of request {} is not available, the request is {}",
                self.id,
                request.state().map_or("unknown", StateKind::as_str)
            ))
            .into());
        }

        let bundle = bundle_archive_path(store.bundles_dir(), self.id);
        let bundle = wait_for_bundle(&bundle, config.bundle_wait_timeout()).await?;
        tokio::fs::copy(&bundle, &self.output).await.with_context(|| {
            format!("Failed to copy {} to {}", bundle.display(), self.output.display())
        })?;
        eprintln!("{} {}", "Saved".green().bold(), self.output.display());
        Ok(())
    }
}
