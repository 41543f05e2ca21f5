//! Test utilities for depcache
//!
//! Helpers shared by unit and integration tests:
//! - [`TestGit`] builds throwaway repositories to serve as request sources
//! - [`FakeGo`] and [`FakeFetcher`] replace the Go toolchain and registry
//!   downloads with scripted responses
//! - [`ResolverFixture`] prepares a bundle directory and a [`ResolveContext`]
//!
//! [`ResolveContext`]: crate::pkg_managers::ResolveContext

pub mod fakes;
pub mod fixture;
pub mod git_helper;

pub use fakes::{FakeFetcher, FakeGo, GoCall};
pub use fixture::{ResolverFixture, test_request};
pub use git_helper::TestGit;

use std::sync::Once;
use tracing::Level;
use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

/// Install a test subscriber once per process.
///
/// Uses `level` when given, otherwise `RUST_LOG`; with neither, tests run
/// without logging.
///
/// ```bash
/// RUST_LOG=depcache=debug cargo test
/// ```
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = match level {
            Some(level) => EnvFilter::new(level.to_string()),
            None if std::env::var("RUST_LOG").is_ok() => EnvFilter::from_default_env(),
            None => return,
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(false)
            .try_init();
    });
}
