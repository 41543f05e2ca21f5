//! `depcache show`

use anyhow::Result;
use clap::Args;

use super::print_json;
use crate::config::Config;
use crate::request::RequestView;
use crate::store::Store;

#[derive(Args, Debug)]
pub struct ShowCommand {
    /// Request id; every request is listed when omitted
    pub id: Option<u64>,

    /// Include the state history and the full package and dependency lists
    #[arg(long = "full", short = 'f')]
    pub full: bool,
}

impl ShowCommand {
    pub async fn execute(self, config: Config) -> Result<()> {
        let store = Store::open(&config).await?;
        match self.id {
            Some(id) => {
                let request = store.get(id)?;
                let packages = if self.full {
                    store.request_packages(id)?
                } else {
                    Vec::new()
                };
                print_json(&RequestView::new(&request, &packages, self.full))
            }
            None => {
                let views: Vec<RequestView> =
                    store.list().iter().map(|request| RequestView::new(request, &[], false)).collect();
                print_json(&views)
            }
        }
    }
}
