//! Service configuration for depcache
//!
//! Configuration is read from a TOML file. Every field is optional; missing
//! fields fall back to defaults rooted at the depcache home directory.
//!
//! # Location
//!
//! The file is looked up in this order:
//! 1. The `--config <path>` command line option
//! 2. The `DEPCACHE_CONFIG` environment variable
//! 3. `~/.depcache/config.toml`
//!
//! The home directory itself (`~/.depcache`) can be moved with `DEPCACHE_HOME`.
//!
//! # Example
//!
//! ```toml
//! enabled_package_managers = ["gomod", "npm", "git-submodule"]
//! gomod_strict_vendor = true
//! goproxy_url = "https://proxy.golang.org"
//! max_concurrent_requests = 8
//!
//! [gomod_file_deps_allowlist]
//! "github.com/org/monorepo" = ["github.com/org/monorepo/staging/*"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    CONFIG_ENV, DEFAULT_BUNDLE_WAIT_TIMEOUT_SECS, DEFAULT_MAX_CONCURRENT_REQUESTS,
    DEFAULT_SUBPROCESS_TIMEOUT_SECS, HOME_ENV,
};

/// Resolved service configuration.
///
/// Directory fields are `None` unless set explicitly; use the accessor methods
/// of the same name to get the effective path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for every default path. Not read from the file.
    #[serde(skip)]
    pub root: PathBuf,

    /// Where source archives are stored.
    pub sources_dir: Option<PathBuf>,

    /// Where request bundles and their temporary directories live.
    pub bundles_dir: Option<PathBuf>,

    /// Shared, content-addressed dependency artifact cache.
    pub deps_cache_dir: Option<PathBuf>,

    /// JSON file persisting requests and components.
    pub state_file: Option<PathBuf>,

    /// Package managers accepted by request validation.
    pub enabled_package_managers: Vec<String>,

    /// Reject vendored Go repositories unless `gomod-vendor` is set.
    pub gomod_strict_vendor: bool,

    /// Per-module glob patterns of packages allowed to be replaced by local paths.
    pub gomod_file_deps_allowlist: BTreeMap<String, Vec<String>>,

    /// Value of `GOPROXY` for Go invocations.
    pub goproxy_url: String,

    /// npm registry base URL.
    pub npm_registry_url: String,

    /// Python package index base URL.
    pub pypi_url: String,

    /// RubyGems base URL.
    pub rubygems_url: String,

    /// Upper bound on requests processed at the same time.
    pub max_concurrent_requests: usize,

    /// Bound on waiting for a bundle before failing a download.
    pub bundle_wait_timeout_secs: u64,

    /// Bound on each package-manager subprocess.
    pub subprocess_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: default_root(),
            sources_dir: None,
            bundles_dir: None,
            deps_cache_dir: None,
            state_file: None,
            enabled_package_managers: ["gomod", "npm", "pip", "yarn", "rubygems", "git-submodule"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            gomod_strict_vendor: false,
            gomod_file_deps_allowlist: BTreeMap::new(),
            goproxy_url: "https://proxy.golang.org".to_string(),
            npm_registry_url: "https://registry.npmjs.org".to_string(),
            pypi_url: "https://pypi.org".to_string(),
            rubygems_url: "https://rubygems.org".to_string(),
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            bundle_wait_timeout_secs: DEFAULT_BUNDLE_WAIT_TIMEOUT_SECS,
            subprocess_timeout_secs: DEFAULT_SUBPROCESS_TIMEOUT_SECS,
        }
    }
}

/// The depcache home directory: `$DEPCACHE_HOME` or `~/.depcache`.
fn default_root() -> PathBuf {
    if let Ok(dir) = std::env::var(HOME_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir().map_or_else(|| PathBuf::from(".depcache"), |home| home.join(".depcache"))
}

impl Config {
    /// Configuration with every default path placed under `root`.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Default configuration file location.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        default_root().join("config.toml")
    }

    /// Load from an explicit path, or the default location if `None`.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// explicit file is an error.
    pub async fn load_with_optional(path: Option<PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(&path).await,
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load_from(&path).await
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load configuration from a specific file.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config.root = default_root();
        Ok(config)
    }

    /// Effective source archive directory.
    pub fn sources_dir(&self) -> PathBuf {
        self.sources_dir.clone().unwrap_or_else(|| self.root.join("sources"))
    }

    /// Effective bundle directory.
    pub fn bundles_dir(&self) -> PathBuf {
        self.bundles_dir.clone().unwrap_or_else(|| self.root.join("bundles"))
    }

    /// Effective dependency cache directory.
    pub fn deps_cache_dir(&self) -> PathBuf {
        self.deps_cache_dir.clone().unwrap_or_else(|| self.root.join("deps-cache"))
    }

    /// Effective state file.
    pub fn state_file(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(|| self.root.join("state.json"))
    }

    /// Bundle wait bound as a [`Duration`].
    pub const fn bundle_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.bundle_wait_timeout_secs)
    }

    /// Subprocess bound as a [`Duration`].
    pub const fn subprocess_timeout(&self) -> Duration {
        Duration::from_secs(self.subprocess_timeout_secs)
    }

    /// Allowlisted local-replacement patterns for a Go module.
    ///
    /// A module named `example.org/module/v2` falls back to the entry for
    /// `example.org/module` when it has none of its own.
    pub fn gomod_allowed_local_deps(&self, module_name: &str) -> Vec<String> {
        if let Some(patterns) = self.gomod_file_deps_allowlist.get(module_name) {
            return patterns.clone();
        }
        let versionless = strip_major_version_suffix(module_name);
        self.gomod_file_deps_allowlist.get(versionless).cloned().unwrap_or_default()
    }
}

fn strip_major_version_suffix(module_name: &str) -> &str {
    match module_name.rsplit_once("/v") {
        Some((base, major)) if !major.is_empty() && major.chars().all(|c| c.is_ascii_digit()) => {
            base
        }
        _ => module_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_default_under_root() {
        let config = Config::for_root("/srv/depcache");
        assert_eq!(config.sources_dir(), PathBuf::from("/srv/depcache/sources"));
        assert_eq!(config.bundles_dir(), PathBuf::from("/srv/depcache/bundles"));
        assert_eq!(config.state_file(), PathBuf::from("/srv/depcache/state.json"));
    }

    #[tokio::test]
    async fn test_load_partial_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        tokio::fs::write(
            &path,
            r#"
sources_dir = "/data/sources"
enabled_package_managers = ["gomod"]
gomod_strict_vendor = true

[gomod_file_deps_allowlist]
"example.org/module" = ["example.org/module/local/*"]
"#,
        )
        .await
        .unwrap();

        let config = Config::load_from(&path).await.unwrap();
        assert_eq!(config.sources_dir(), PathBuf::from("/data/sources"));
        assert_eq!(config.enabled_package_managers, vec!["gomod"]);
        assert!(config.gomod_strict_vendor);
        assert_eq!(config.max_concurrent_requests, DEFAULT_MAX_CONCURRENT_REQUESTS);
        assert_eq!(
            config.gomod_allowed_local_deps("example.org/module/v2"),
            vec!["example.org/module/local/*"]
        );
    }

    #[tokio::test]
    async fn test_missing_explicit_file_is_error() {
        let temp = TempDir::new().unwrap();
        let result = Config::load_with_optional(Some(temp.path().join("nope.toml"))).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_strip_major_version_suffix() {
        assert_eq!(strip_major_version_suffix("example.org/module/v3"), "example.org/module");
        assert_eq!(strip_major_version_suffix("example.org/module"), "example.org/module");
        assert_eq!(strip_major_version_suffix("example.org/vendor"), "example.org/vendor");
    }
}
