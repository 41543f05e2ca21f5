//! Global constants used throughout the depcache codebase.
//!
//! Timeout durations, retry parameters and well-known names that are shared
//! by several modules live here so magic numbers stay discoverable.

use std::time::Duration;

/// Timeout for Git clone operations (10 minutes).
///
/// Full clones of large repositories are the slowest operation the archive
/// cache performs.
pub const GIT_CLONE_TIMEOUT: Duration = Duration::from_secs(600);

/// Timeout for Git fetch operations (5 minutes).
pub const GIT_FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for local Git operations such as `reset`, `fsck` and `ls-tree`.
pub const GIT_LOCAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Default timeout for package-manager subprocesses (1 hour).
pub const DEFAULT_SUBPROCESS_TIMEOUT_SECS: u64 = 3600;

/// Default bound on waiting for a bundle to appear on disk.
pub const DEFAULT_BUNDLE_WAIT_TIMEOUT_SECS: u64 = 600;

/// Poll interval while waiting for a bundle.
pub const BUNDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Starting delay for exponential backoff (10ms).
pub const STARTING_BACKOFF_DELAY_MS: u64 = 10;

/// Maximum backoff delay for exponential backoff (500ms).
pub const MAX_BACKOFF_DELAY_MS: u64 = 500;

/// Number of retries granted to a failing cache-populating step.
///
/// A value of 1 means "try, then retry once".
pub const CACHE_STEP_RETRIES: usize = 1;

/// Number of retries for artifact downloads.
pub const DOWNLOAD_RETRIES: usize = 3;

/// Default number of requests processed concurrently by the worker pool.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 4;

/// Capacity of the request queue channel.
pub const REQUEST_QUEUE_CAPACITY: usize = 256;

/// Name of the directory holding the application source inside a bundle.
pub const APP_DIR: &str = "app";

/// Name of the directory holding dependency caches inside a bundle.
pub const DEPS_DIR: &str = "deps";

/// Archive name suffix used when submodules were checked out.
pub const WITH_SUBMODULES_SUFFIX: &str = "-with-submodules";

/// Placeholder substituted with the owning module's purl for local Go dependencies.
pub const PARENT_PURL_PLACEHOLDER: &str = "PARENT_PURL";

/// Environment variable overriding the depcache root directory.
pub const HOME_ENV: &str = "DEPCACHE_HOME";

/// Environment variable pointing at a configuration file.
pub const CONFIG_ENV: &str = "DEPCACHE_CONFIG";
