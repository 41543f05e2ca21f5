//! Package-manager resolvers
//!
//! Every supported ecosystem implements the same contract: given the prepared
//! source tree of a request and its path configuration, report normalized
//! [`Package`] records and put whatever the build needs offline under
//! `deps/<ecosystem>/` of the bundle directory.
//!
//! Resolvers are a closed set ([`Resolver`]) selected from the request's
//! package managers; there is no runtime registry. Each configured subpath is
//! resolved on its own and the results aggregated. Downloads go through the
//! shared [`DependencyCache`] so that artifacts already fetched for another
//! request, or for an earlier subpath, are not downloaded again.

pub mod deps_cache;
pub mod git_submodule;
pub mod gomod;
pub mod js;
pub mod npm;
pub mod pip;
pub mod rubygems;
pub mod yarn;

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::archive::SourceArchiveCache;
use crate::config::Config;
use crate::constants::{APP_DIR, DEPS_DIR};
use crate::core::DepcacheError;
use crate::package::Package;
use crate::request::{EnvVar, PackageManager, Replacement, Request};
use crate::utils::fs::join_relative;

pub use deps_cache::{ArtifactFetcher, Checksum, DependencyCache, HttpFetcher};
pub use gomod::{GoCommand, GoToolchain};

/// Everything a resolver may use while processing one request.
pub struct ResolveContext<'a> {
    /// The request being processed
    pub request: &'a Request,
    /// Service configuration
    pub config: &'a Config,
    /// Per-request bundle directory holding `app/` and `deps/`
    pub bundle_dir: &'a Path,
    /// Shared artifact cache
    pub deps_cache: &'a DependencyCache,
    /// Source archives, for dependencies that come from git
    pub archives: &'a SourceArchiveCache,
    /// The Go toolchain
    pub go: &'a dyn GoToolchain,
}

impl ResolveContext<'_> {
    /// Root of the application source.
    pub fn source_dir(&self) -> PathBuf {
        self.bundle_dir.join(APP_DIR)
    }

    /// Directory of a configured package path.
    pub fn package_dir(&self, path: &str) -> PathBuf {
        join_relative(&self.source_dir(), path)
    }

    /// Output directory of an ecosystem inside the bundle.
    pub fn deps_dir(&self, ecosystem: &str) -> PathBuf {
        self.bundle_dir.join(DEPS_DIR).join(ecosystem)
    }

    /// Label used in logs.
    pub fn label(&self) -> String {
        format!("request {}", self.request.id)
    }
}

/// What a resolver reports.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolveOutput {
    /// Top-level packages with their dependencies
    pub packages: Vec<Package>,
    /// Environment variables the build needs
    pub environment: BTreeMap<String, EnvVar>,
}

impl ResolveOutput {
    /// Fold another output into this one.
    pub fn merge(&mut self, other: Self) {
        self.packages.extend(other.packages);
        self.environment.extend(other.environment);
    }
}

/// The resolver of one package manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolver {
    /// Go modules
    Gomod,
    /// npm lock files
    Npm,
    /// pip requirement files
    Pip,
    /// Yarn v1 lock files
    Yarn,
    /// Bundler lock files
    Rubygems,
    /// Git submodules
    GitSubmodule,
}

impl Resolver {
    /// The resolver for a package manager.
    pub const fn for_package_manager(pm: PackageManager) -> Self {
        match pm {
            PackageManager::Gomod => Self::Gomod,
            PackageManager::Npm => Self::Npm,
            PackageManager::Pip => Self::Pip,
            PackageManager::Yarn => Self::Yarn,
            PackageManager::Rubygems => Self::Rubygems,
            PackageManager::GitSubmodule => Self::GitSubmodule,
        }
    }

    /// The package manager this resolver serves.
    pub const fn package_manager(self) -> PackageManager {
        match self {
            Self::Gomod => PackageManager::Gomod,
            Self::Npm => PackageManager::Npm,
            Self::Pip => PackageManager::Pip,
            Self::Yarn => PackageManager::Yarn,
            Self::Rubygems => PackageManager::Rubygems,
            Self::GitSubmodule => PackageManager::GitSubmodule,
        }
    }

    /// Resolve every configured path of the request.
    pub async fn resolve(self, ctx: &ResolveContext<'_>) -> Result<ResolveOutput> {
        tracing::info!(
            target: "resolver",
            "({}) Resolving {} dependencies",
            ctx.label(),
            self.package_manager()
        );
        match self {
            Self::Gomod => gomod::resolve(ctx).await,
            Self::Npm => npm::resolve(ctx).await,
            Self::Pip => pip::resolve(ctx).await,
            Self::Yarn => yarn::resolve(ctx).await,
            Self::Rubygems => rubygems::resolve(ctx).await,
            Self::GitSubmodule => git_submodule::resolve(ctx).await,
        }
    }
}

/// Fail unless every requested replacement was applied.
pub fn check_replacements_apply(
    pm: PackageManager,
    requested: &[Replacement],
    applied: &BTreeSet<String>,
) -> Result<(), DepcacheError> {
    let unused: BTreeSet<String> =
        requested.iter().map(|r| r.name.clone()).filter(|name| !applied.contains(name)).collect();
    if unused.is_empty() {
        return Ok(());
    }
    Err(DepcacheError::ReplacementsDontApply {
        package_manager: pm.to_string(),
        names: unused.into_iter().collect(),
    })
}

/// Bundle location of a git dependency archive:
/// `<deps_dir>/<host>/<namespace>/<repo>/<repo>-external-gitcommit-<ref>.tar.gz`.
pub fn git_dependency_path(deps_dir: &Path, repo_url: &str, git_ref: &str) -> Result<PathBuf, DepcacheError> {
    let parsed = url::Url::parse(repo_url).map_err(|e| DepcacheError::InvalidRequestData {
        reason: format!("The git URL {repo_url} is invalid: {e}"),
    })?;
    let host = parsed.host_str().unwrap_or("unknown-host");
    let path = parsed.path().trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    let repo = path.rsplit('/').next().unwrap_or(path);
    Ok(deps_dir.join(host).join(path).join(format!("{repo}-external-gitcommit-{git_ref}.tar.gz")))
}

/// Fail if a configured package directory does not exist.
pub(crate) fn require_package_dir(ctx: &ResolveContext<'_>, path: &str) -> Result<PathBuf> {
    let dir = ctx.package_dir(path);
    if !dir.is_dir() {
        return Err(DepcacheError::InvalidRepoStructure {
            reason: format!("The path \"{path}\" does not exist in the repository"),
        }
        .into());
    }
    Ok(dir)
}
