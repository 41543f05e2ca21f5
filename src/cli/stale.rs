//! `depcache stale`

use anyhow::Result;
use clap::Args;

use super::print_json;
use crate::config::Config;
use crate::request::{RequestView, StateKind};
use crate::store::Store;

#[derive(Args, Debug)]
pub struct StaleCommand {
    /// Request id
    pub id: u64,

    /// Reason recorded with the transition
    #[arg(long)]
    pub reason: String,
}

impl StaleCommand {
    pub async fn execute(self, config: Config) -> Result<()> {
        let store = Store::open(&config).await?;
        if !store.set_state(self.id, StateKind::Stale.as_str(), &self.reason).await? {
            tracing::info!(target: "cli", "Request {} was already stale", self.id);
        }
        print_json(&RequestView::new(&store.get(self.id)?, &[], false))
    }
}
