//! depcache CLI entry point
//!
//! Parses arguments, runs the selected command and renders failures with
//! their details and suggestions.

use anyhow::Result;
use clap::Parser;
use depcache::cli;
use depcache::core::error::user_friendly_error;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // Set up colored output for Windows
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    match cli.execute().await {
        Ok(()) => Ok(()),
        Err(e) => {
            let error_ctx = user_friendly_error(e);
            error_ctx.display();
            std::process::exit(1);
        }
    }
}
