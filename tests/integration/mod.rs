//! Integration test suite for depcache
//!
//! The tests build real git repositories in temporary directories and serve
//! them over `file://` URLs. Registries and the Go toolchain are replaced by
//! the scripted fakes from `depcache::test_utils`, so nothing touches the
//! network.
//!
//! # Running Integration Tests
//!
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//!
//! - **archive_cache**: source archive reuse and concurrent fetches
//! - **cli**: the `depcache` binary end to end
//! - **pipeline_e2e**: requests driven through the worker pool

#[path = "../common/mod.rs"]
mod common;

mod archive_cache;
mod cli;
mod pipeline_e2e;
