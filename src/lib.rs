//! depcache - dependency resolution and caching for source repositories
//!
//! Given a repository URL, a commit and the package managers to consider,
//! depcache produces a self-contained bundle: the application source plus
//! every dependency its lock files declare, laid out so the package managers
//! can build offline. Alongside the bundle it records which packages and
//! dependencies were found and derives a content manifest of package URLs.
//!
//! # Architecture Overview
//!
//! A submitted request moves through a fixed pipeline:
//!
//! 1. The [`archive`] cache materializes the source at the commit as a
//!    verified tarball, reusing older archives of the same repository.
//! 2. Each selected resolver in [`pkg_managers`] reads the manifests and
//!    lock files of its packages and downloads dependencies into a shared
//!    per-ecosystem cache, copying them into the request's `deps/` tree.
//! 3. The [`bundle`] assembler writes `app/` and `deps/` into one
//!    deterministic tarball.
//!
//! The [`request`] state machine records every step, and failures are
//! classified by origin (client or server) and type. [`pipeline`] drives
//! requests concurrently through a bounded worker pool.
//!
//! # Core Modules
//!
//! - [`request`] - request model, payload validation and state machine
//! - [`store`] - request records and content-addressed package records
//! - [`pipeline`] - step planning, the orchestration loop and worker pool
//! - [`archive`] - source archive cache
//! - [`pkg_managers`] - gomod, npm, yarn, pip, rubygems and git-submodule resolvers
//! - [`bundle`] - bundle directories, symlink sandboxing and assembly
//! - [`content_manifest`] and [`purl`] - image content manifests
//!
//! ## Supporting Modules
//! - [`config`] - `~/.depcache/config.toml`
//! - [`core`] - error types and user-facing diagnostics
//! - [`git`] - system `git` wrapper
//! - [`package`] - package and dependency records
//! - [`utils`] - file system, tarball, retry and subprocess helpers
//!
//! # Command-Line Usage
//!
//! ```bash
//! # Submit a request and wait for it to finish
//! depcache submit request.json --wait
//!
//! # Inspect it
//! depcache show 1 --full
//! depcache manifest 1
//!
//! # Fetch the bundle
//! depcache download 1 -o bundle.tar.gz
//! ```

// Request lifecycle
pub mod pipeline;
pub mod request;
pub mod store;

// Source and dependency caches
pub mod archive;
pub mod bundle;
pub mod pkg_managers;

// Results
pub mod content_manifest;
pub mod package;
pub mod purl;

// Supporting modules
pub mod cli;
pub mod config;
pub mod constants;
pub mod core;
pub mod git;
pub mod utils;

// test_utils module is available for both unit tests and integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
