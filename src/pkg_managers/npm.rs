//! npm resolver
//!
//! Reads `npm-shrinkwrap.json` or `package-lock.json` (lock file versions 1,
//! 2 and 3) and fetches every locked dependency. Dependencies that are not
//! served by the registry keep their original form (`github:org/repo#sha`,
//! `git+https://...#sha`, a tarball URL or `file:path`) as their version.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use super::js::{JsSource, fetch_dependency, is_git_spec, is_registry_url, parse_git_spec, registry_tarball_url};
use super::{ResolveContext, ResolveOutput, require_package_dir};
use crate::core::DepcacheError;
use crate::package::{Component, Dependency, Package, PackageType};
use crate::request::PackageManager;

const LOCK_FILES: [&str; 2] = ["npm-shrinkwrap.json", "package-lock.json"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockFile {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    lockfile_version: Option<u64>,
    #[serde(default)]
    dependencies: BTreeMap<String, LegacyEntry>,
    #[serde(default)]
    packages: BTreeMap<String, PackageEntry>,
}

/// `dependencies` entry of a version 1 lock file.
#[derive(Debug, Deserialize)]
struct LegacyEntry {
    version: String,
    resolved: Option<String>,
    integrity: Option<String>,
    #[serde(default)]
    dev: bool,
    #[serde(default)]
    bundled: bool,
    #[serde(default)]
    dependencies: BTreeMap<String, LegacyEntry>,
}

/// `packages` entry of a version 2 or 3 lock file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageEntry {
    name: Option<String>,
    version: Option<String>,
    resolved: Option<String>,
    integrity: Option<String>,
    #[serde(default)]
    dev: bool,
    #[serde(default)]
    in_bundle: bool,
    #[serde(default)]
    link: bool,
}

/// One locked dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedDependency {
    pub name: String,
    /// Registry version or the original non-registry form
    pub version: String,
    pub resolved: Option<String>,
    pub integrity: Option<String>,
    pub dev: bool,
    /// Shipped inside its parent's tarball
    pub bundled: bool,
}

/// The root package and its dependencies, as recorded in a lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockContents {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<LockedDependency>,
}

fn unexpected_format(file: &str, reason: impl Into<String>) -> DepcacheError {
    DepcacheError::InvalidFileFormat {
        file: file.to_string(),
        reason: reason.into(),
    }
}

/// Collect dependencies, merging duplicates of the same name and version.
///
/// A duplicate is dev (or bundled) only if every occurrence is.
#[derive(Default)]
struct Collector {
    deps: Vec<LockedDependency>,
    index: BTreeMap<(String, String), usize>,
}

impl Collector {
    fn add(&mut self, dep: LockedDependency) {
        let key = (dep.name.clone(), dep.version.clone());
        if let Some(&position) = self.index.get(&key) {
            let existing = &mut self.deps[position];
            existing.dev &= dep.dev;
            existing.bundled &= dep.bundled;
            return;
        }
        self.index.insert(key, self.deps.len());
        self.deps.push(dep);
    }

    fn add_legacy(&mut self, entries: &BTreeMap<String, LegacyEntry>) {
        for (name, entry) in entries {
            self.add(LockedDependency {
                name: name.clone(),
                version: entry.version.clone(),
                resolved: entry.resolved.clone(),
                integrity: entry.integrity.clone(),
                dev: entry.dev,
                bundled: entry.bundled,
            });
            self.add_legacy(&entry.dependencies);
        }
    }
}

/// Version reported for a `packages` entry: the original form for
/// non-registry sources, the plain version otherwise.
fn package_entry_version(location: &str, entry: &PackageEntry, registry: &str) -> Option<String> {
    if entry.link {
        return Some(format!("file:{}", entry.resolved.as_deref().unwrap_or(location)));
    }
    match entry.resolved.as_deref() {
        Some(resolved) if is_git_spec(resolved) => Some(resolved.to_string()),
        Some(resolved) if resolved.starts_with("file:") => Some(resolved.to_string()),
        Some(resolved)
            if (resolved.starts_with("http://") || resolved.starts_with("https://"))
                && !is_registry_url(resolved, registry) =>
        {
            Some(resolved.to_string())
        }
        _ => entry.version.clone(),
    }
}

/// Parse an npm lock file.
pub fn parse_lock_file(content: &str, file: &str, registry: &str) -> Result<LockContents, DepcacheError> {
    let lock: LockFile = serde_json::from_str(content)
        .map_err(|e| unexpected_format(file, e.to_string()))?;

    let mut collector = Collector::default();
    let root = lock.packages.get("");
    let name = root.and_then(|r| r.name.clone()).or(lock.name);
    let version = root.and_then(|r| r.version.clone()).or(lock.version);

    if lock.lockfile_version.unwrap_or(1) >= 2 && !lock.packages.is_empty() {
        for (location, entry) in &lock.packages {
            let Some((_, dep_name)) = location.rsplit_once("node_modules/") else {
                // the root package and workspace folders
                continue;
            };
            let Some(dep_version) = package_entry_version(location, entry, registry) else {
                return Err(unexpected_format(file, format!("The package {location} has no version")));
            };
            collector.add(LockedDependency {
                name: dep_name.to_string(),
                version: dep_version,
                resolved: entry.resolved.clone(),
                integrity: entry.integrity.clone(),
                dev: entry.dev,
                bundled: entry.in_bundle,
            });
        }
    } else {
        collector.add_legacy(&lock.dependencies);
    }

    match (name, version) {
        (Some(name), Some(version)) => Ok(LockContents {
            name,
            version,
            dependencies: collector.deps,
        }),
        _ => Err(unexpected_format(file, "the package name or version is missing")),
    }
}

/// How to obtain a locked dependency.
pub fn dependency_source(dep: &LockedDependency, registry: &str) -> Result<JsSource, DepcacheError> {
    let version = dep.version.as_str();
    if let Some(path) = version.strip_prefix("file:") {
        return Ok(JsSource::File {
            path: path.to_string(),
        });
    }
    if is_git_spec(version) {
        return parse_git_spec(version);
    }
    if version.starts_with("http://") || version.starts_with("https://") {
        if dep.integrity.is_none() {
            return Err(DepcacheError::InvalidFileFormat {
                file: "package-lock.json".to_string(),
                reason: format!("The dependency {version} is missing the integrity value in the lock file"),
            });
        }
        return Ok(JsSource::Http {
            url: version.to_string(),
        });
    }
    let url = match &dep.resolved {
        Some(resolved) => resolved.clone(),
        None => registry_tarball_url(registry, &dep.name, version),
    };
    Ok(JsSource::Registry {
        url,
    })
}

fn find_lock_file(package_dir: &Path) -> Result<(&'static str, std::path::PathBuf), DepcacheError> {
    LOCK_FILES
        .iter()
        .map(|name| (*name, package_dir.join(name)))
        .find(|(_, path)| path.is_file())
        .ok_or_else(|| DepcacheError::InvalidRepoStructure {
            reason: "The npm-shrinkwrap.json or package-lock.json file must be present for the npm \
                     package manager"
                .to_string(),
        })
}

/// Resolve every configured npm package of the request.
pub async fn resolve(ctx: &ResolveContext<'_>) -> Result<ResolveOutput> {
    let registry = ctx.config.npm_registry_url.as_str();
    let mut output = ResolveOutput::default();

    for config in ctx.request.package_configs(PackageManager::Npm) {
        let package_dir = require_package_dir(ctx, &config.path)?;
        let (lock_name, lock_path) = find_lock_file(&package_dir)?;
        if !package_dir.join("package.json").is_file() {
            return Err(DepcacheError::InvalidRepoStructure {
                reason: "The package.json file must be present for the npm package manager".to_string(),
            }
            .into());
        }

        let content = tokio::fs::read_to_string(&lock_path)
            .await
            .with_context(|| format!("Failed to read {}", lock_path.display()))?;
        let lock = parse_lock_file(&content, lock_name, registry)?;
        tracing::info!(
            target: "resolver::npm",
            "({}) Fetching {} npm dependencies of {}@{} at \"{}\"",
            ctx.label(),
            lock.dependencies.len(),
            lock.name,
            lock.version,
            config.path
        );

        let mut dependencies = Vec::with_capacity(lock.dependencies.len());
        for dep in &lock.dependencies {
            if dep.bundled {
                tracing::debug!(target: "resolver::npm", "{}@{} is bundled in its parent", dep.name, dep.version);
            } else {
                let source = dependency_source(dep, registry)?;
                fetch_dependency(ctx, "npm", &package_dir, &dep.name, &source).await?;
            }
            dependencies.push(Dependency::new(
                Component::new(&dep.name, PackageType::Npm, &dep.version).dev(dep.dev),
            ));
        }

        output.packages.push(
            Package::new(Component::new(lock.name, PackageType::Npm, lock.version))
                .at_path(Some(config.path.as_str()))
                .with_dependencies(dependencies),
        );
    }
    Ok(output)
}
