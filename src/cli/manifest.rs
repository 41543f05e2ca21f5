//! `depcache manifest`

use anyhow::Result;
use clap::Args;

use super::print_json;
use crate::config::Config;
use crate::content_manifest::{deep_sort, generate};
use crate::core::DepcacheError;
use crate::request::StateKind;
use crate::store::Store;

#[derive(Args, Debug)]
pub struct ManifestCommand {
    /// Request id
    pub id: u64,
}

impl ManifestCommand {
    pub async fn execute(self, config: Config) -> Result<()> {
        let store = Store::open(&config).await?;
        let request = store.get(self.id)?;
        if !request.has_completed() {
            return Err(DepcacheError::validation(format!(
                "Content manifests are only available for requests in the \"complete\" or \"stale\" state \
                 that completed successfully, request {} is {}",
                self.id,
                request.state().map_or("unknown", StateKind::as_str)
            ))
            .into());
        }

        let manifest = generate(&request, &store.request_packages(self.id)?)?;
        print_json(&deep_sort(manifest))
    }
}
