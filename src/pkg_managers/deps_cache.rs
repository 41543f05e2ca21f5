//! Shared dependency artifact cache
//!
//! Artifacts downloaded by any resolver are stored once at
//! `<deps_cache_dir>/<ecosystem>/<sha256(url)>/<file name>` and copied into
//! each bundle that needs them. Entries are created if absent and never
//! overwritten: a download goes to a temporary file under `.tmp`, is checked
//! against its expected digest, then published with a no-clobber hard link.
//! Two requests racing for the same artifact both succeed and one copy wins.
//!
//! Network access goes through the [`ArtifactFetcher`] seam so resolvers can
//! be exercised offline.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use sha2::{Digest, Sha256, Sha512};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_retry::RetryIf;

use crate::constants::DOWNLOAD_RETRIES;
use crate::core::{DepcacheError, find_depcache_error};
use crate::utils::backoff::retry_strategy;
use crate::utils::fs::{remove_file_if_exists, sha256_file};
use crate::utils::{ensure_dir, publish_no_clobber};

const TMP_DIR: &str = ".tmp";

/// Downloads artifacts and metadata from package registries.
pub trait ArtifactFetcher: Send + Sync {
    /// Write the body at `url` to `dest`.
    fn download<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<()>>;

    /// Fetch and parse a JSON document.
    fn get_json<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<serde_json::Value>>;
}

/// [`ArtifactFetcher`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build a client identifying itself as depcache.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("depcache/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build the HTTP client")?;
        Ok(Self {
            client,
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, DepcacheError> {
        let network = |reason: String| DepcacheError::Network {
            operation: format!("GET {url}"),
            reason,
        };
        let response = self.client.get(url).send().await.map_err(|e| network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(network(format!("HTTP {}", response.status())));
        }
        Ok(response)
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn download<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            tracing::debug!(target: "deps_cache", "Downloading {}", url);
            let body = self.get(url).await?.bytes().await.map_err(|e| DepcacheError::Network {
                operation: format!("GET {url}"),
                reason: e.to_string(),
            })?;
            tokio::fs::write(dest, &body)
                .await
                .with_context(|| format!("Failed to write {}", dest.display()))?;
            Ok(())
        })
    }

    fn get_json<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            let value = self.get(url).await?.json().await.map_err(|e| DepcacheError::Network {
                operation: format!("GET {url}"),
                reason: format!("invalid JSON: {e}"),
            })?;
            Ok(value)
        })
    }
}

/// Expected digest of an artifact, as `<algorithm>:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    /// `sha256` or `sha512`
    pub algorithm: String,
    /// Lowercase hex digest
    pub hex: String,
}

impl Checksum {
    /// Parse `sha256:<hex>` style values. Unknown algorithms are rejected.
    pub fn parse(value: &str) -> Option<Self> {
        let (algorithm, hex) = value.split_once(':')?;
        if !matches!(algorithm, "sha256" | "sha512") || hex.is_empty() {
            return None;
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_lowercase(),
        })
    }

    /// Fail unless the file at `path` has this digest.
    pub fn verify(&self, path: &Path) -> Result<()> {
        let actual = match self.algorithm.as_str() {
            "sha512" => {
                let content =
                    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
                hex::encode(Sha512::digest(&content))
            }
            _ => sha256_file(path)?,
        };
        if actual != self.hex {
            return Err(DepcacheError::FileAccess {
                path: path.display().to_string(),
                reason: format!(
                    "The checksum of the downloaded file does not match: expected {}:{}, got {}:{}",
                    self.algorithm, self.hex, self.algorithm, actual
                ),
            }
            .into());
        }
        Ok(())
    }
}

/// Content-addressed store of downloaded artifacts shared by every request.
#[derive(Clone)]
pub struct DependencyCache {
    root: PathBuf,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl std::fmt::Debug for DependencyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyCache").field("root", &self.root).finish_non_exhaustive()
    }
}

impl DependencyCache {
    /// Cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self {
            root: root.into(),
            fetcher,
        }
    }

    /// The fetcher used for downloads.
    pub fn fetcher(&self) -> &dyn ArtifactFetcher {
        self.fetcher.as_ref()
    }

    /// Directory holding everything cached for `ecosystem`.
    pub fn ecosystem_dir(&self, ecosystem: &str) -> PathBuf {
        self.root.join(ecosystem)
    }

    /// Where the artifact downloaded from `url` is stored.
    pub fn entry_path(&self, ecosystem: &str, url: &str, file_name: &str) -> PathBuf {
        let key = hex::encode(Sha256::digest(url.as_bytes()));
        self.root.join(ecosystem).join(key).join(file_name)
    }

    /// Return the cached artifact for `url`, downloading it if absent.
    ///
    /// A cached file failing `checksum` is discarded and downloaded again.
    /// Network failures are retried.
    pub async fn fetch(
        &self,
        ecosystem: &str,
        url: &str,
        file_name: &str,
        checksum: Option<&Checksum>,
    ) -> Result<PathBuf> {
        let mut components = Path::new(file_name).components();
        if !matches!((components.next(), components.next()), (Some(Component::Normal(_)), None)) {
            return Err(DepcacheError::InvalidFileFormat {
                file: url.to_string(),
                reason: format!("{file_name:?} is not a plain file name"),
            }
            .into());
        }
        let path = self.entry_path(ecosystem, url, file_name);
        if path.is_file() {
            match checksum.map(|c| c.verify(&path)).transpose() {
                Ok(_) => {
                    tracing::debug!(target: "deps_cache", "Using cached {}", path.display());
                    return Ok(path);
                }
                Err(e) => {
                    tracing::warn!(target: "deps_cache", "Discarding cached {}: {:#}", path.display(), e);
                    remove_file_if_exists(&path)?;
                }
            }
        }

        RetryIf::spawn(
            retry_strategy(DOWNLOAD_RETRIES),
            || self.download_and_publish(url, checksum, &path),
            |e: &anyhow::Error| {
                let retry = matches!(find_depcache_error(e), Some(DepcacheError::Network { .. }));
                if retry {
                    tracing::warn!(target: "deps_cache", "Retrying download of {}: {:#}", url, e);
                }
                retry
            },
        )
        .await?;
        Ok(path)
    }

    async fn download_and_publish(&self, url: &str, checksum: Option<&Checksum>, dest: &Path) -> Result<()> {
        let tmp = self.root.join(TMP_DIR);
        ensure_dir(&tmp)?;
        let temp = tempfile::Builder::new()
            .prefix("download-")
            .tempfile_in(&tmp)
            .context("Failed to create a temporary download file")?
            .into_temp_path();

        self.fetcher.download(url, &temp).await?;
        if let Some(checksum) = checksum {
            checksum.verify(&temp)?;
        }
        if !publish_no_clobber(&temp, dest)? {
            tracing::debug!(target: "deps_cache", "{} was cached concurrently", dest.display());
        }
        Ok(())
    }

    /// Copy a cached artifact into a bundle. Returns `false` if `dest` already existed.
    pub async fn copy_into(&self, cached: &Path, dest: &Path) -> Result<bool> {
        if dest.exists() {
            tracing::debug!(target: "deps_cache", "{} is already in the bundle", dest.display());
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }
        tokio::fs::copy(cached, dest)
            .await
            .with_context(|| format!("Failed to copy {} to {}", cached.display(), dest.display()))?;
        Ok(true)
    }

    /// Fetch JSON metadata through the fetcher.
    pub async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        RetryIf::spawn(
            retry_strategy(DOWNLOAD_RETRIES),
            || self.fetcher.get_json(url),
            |e: &anyhow::Error| matches!(find_depcache_error(e), Some(DepcacheError::Network { .. })),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeFetcher;
    use tempfile::TempDir;

    fn sha256_of(content: &[u8]) -> Checksum {
        Checksum {
            algorithm: "sha256".to_string(),
            hex: hex::encode(Sha256::digest(content)),
        }
    }

    #[test]
    fn test_checksum_parse() {
        assert_eq!(
            Checksum::parse("sha256:ABCDEF"),
            Some(Checksum {
                algorithm: "sha256".to_string(),
                hex: "abcdef".to_string(),
            })
        );
        assert_eq!(Checksum::parse("md5:abc"), None);
        assert_eq!(Checksum::parse("sha256:xyz"), None);
        assert_eq!(Checksum::parse("abc"), None);
    }

    #[tokio::test]
    async fn test_fetch_downloads_once() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::new().with_file("https://r.example/a-1.0.0.tgz", b"tarball"));
        let cache = DependencyCache::new(temp.path(), fetcher.clone());

        let checksum = sha256_of(b"tarball");
        let first = cache.fetch("npm", "https://r.example/a-1.0.0.tgz", "a-1.0.0.tgz", Some(&checksum)).await.unwrap();
        let second = cache.fetch("npm", "https://r.example/a-1.0.0.tgz", "a-1.0.0.tgz", Some(&checksum)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"tarball");
        assert_eq!(fetcher.download_count("https://r.example/a-1.0.0.tgz"), 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_not_published() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::new().with_file("https://r.example/b.tgz", b"tampered"));
        let cache = DependencyCache::new(temp.path(), fetcher);

        let err = cache
            .fetch("pip", "https://r.example/b.tgz", "b.tgz", Some(&sha256_of(b"original")))
            .await
            .unwrap_err();
        assert!(matches!(find_depcache_error(&err), Some(DepcacheError::FileAccess { .. })));
        assert!(!cache.entry_path("pip", "https://r.example/b.tgz", "b.tgz").exists());
    }

    #[tokio::test]
    async fn test_missing_artifact_is_network_error() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::new());
        let cache = DependencyCache::new(temp.path(), fetcher.clone());
        let err = cache.fetch("npm", "https://r.example/missing.tgz", "missing.tgz", None).await.unwrap_err();
        assert!(matches!(find_depcache_error(&err), Some(DepcacheError::Network { .. })));
        assert_eq!(fetcher.download_count("https://r.example/missing.tgz"), DOWNLOAD_RETRIES + 1);
    }

    #[tokio::test]
    async fn test_file_names_stay_in_their_entry() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::new().with_file("https://r.example/x", b"x"));
        let cache = DependencyCache::new(temp.path().join("cache"), fetcher.clone());
        for name in ["../x", "..", "a/b", "/abs", ""] {
            let err = cache.fetch("pip", "https://r.example/x", name, None).await.unwrap_err();
            assert!(matches!(find_depcache_error(&err), Some(DepcacheError::InvalidFileFormat { .. })), "{name:?}");
        }
        assert_eq!(fetcher.download_count("https://r.example/x"), 0);
    }

    #[tokio::test]
    async fn test_copy_into_skips_existing() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::new().with_file("https://r.example/c.tgz", b"c"));
        let cache = DependencyCache::new(temp.path().join("cache"), fetcher);
        let cached = cache.fetch("yarn", "https://r.example/c.tgz", "c.tgz", None).await.unwrap();

        let dest = temp.path().join("bundle/deps/yarn/c.tgz");
        assert!(cache.copy_into(&cached, &dest).await.unwrap());
        assert!(!cache.copy_into(&cached, &dest).await.unwrap());
    }
}
