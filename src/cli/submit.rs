//! `depcache submit`

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use super::print_json;
use crate::bundle::{bundle_archive_path, wait_for_bundle};
use crate::config::Config;
use crate::core::DepcacheError;
use crate::pipeline::{Pipeline, WorkerPool};
use crate::request::{RequestView, StateKind};

#[derive(Args, Debug)]
pub struct SubmitCommand {
    /// JSON file with the request payload (`-` reads stdin)
    pub payload: PathBuf,

    /// Print the finished request instead of the new one and fail if it failed
    #[arg(long)]
    pub wait: bool,
}

impl SubmitCommand {
    pub async fn execute(self, config: Config) -> Result<()> {
        let payload = self.read_payload().await?;
        let max_concurrent = config.max_concurrent_requests;
        let wait_timeout = config.bundle_wait_timeout();
        let pipeline = Arc::new(Pipeline::from_config(config).await?);

        let request = pipeline.submit(&payload).await?;
        eprintln!("{} request {}", "Created".green().bold(), request.id);
        if !self.wait {
            print_json(&RequestView::new(&request, &[], false))?;
        }

        let (queue, pool) = WorkerPool::spawn(pipeline.clone(), max_concurrent);
        queue.enqueue(request.id).await?;
        drop(queue);
        pool.join().await?;

        if !self.wait {
            return Ok(());
        }
        let store = pipeline.store();
        let finished = store.get(request.id)?;

        print_json(&RequestView::new(&finished, &store.request_packages(request.id)?, false))?;
        match finished.state() {
            Some(StateKind::Complete) => {
                let bundle = bundle_archive_path(store.bundles_dir(), request.id);
                let bundle = wait_for_bundle(&bundle, wait_timeout).await?;
                eprintln!("{} bundle at {}", "Finished".green().bold(), bundle.display());
                Ok(())
            }
            _ => Err(DepcacheError::Other {
                message: format!(
                    "Request {} finished in state {}: {}",
                    request.id,
                    finished.state().map_or("unknown", StateKind::as_str),
                    finished.current_state().map(|s| s.reason.as_str()).unwrap_or_default()
                ),
            }
            .into()),
        }
    }

    async fn read_payload(&self) -> Result<Value> {
        let content = if self.payload.as_os_str() == "-" {
            let mut buf = String::new();
            tokio::io::AsyncReadExt::read_to_string(&mut tokio::io::stdin(), &mut buf)
                .await
                .context("Failed to read the payload from stdin")?;
            buf
        } else {
            tokio::fs::read_to_string(&self.payload)
                .await
                .with_context(|| format!("Failed to read payload {}", self.payload.display()))?
        };
        let payload = serde_json::from_str(&content)
            .map_err(|e| DepcacheError::validation(format!("The payload is not valid JSON: {e}")))?;
        Ok(payload)
    }
}
