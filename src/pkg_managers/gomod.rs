//! Go modules resolver
//!
//! Each configured path is processed with a private `GOPATH`/`GOMODCACHE` so
//! that the downloaded module cache can be merged into the bundle at
//! `deps/gomod/pkg/mod/cache/download`. The private cache is seeded from the
//! shared one under `<deps_cache_dir>/gomod` and new downloads are published
//! back to it, so a module is downloaded once across requests. The steps are:
//!
//! 1. Apply the user's replacements with `go mod edit -replace`.
//! 2. Vendor (`gomod-vendor`, `gomod-vendor-check`) or download the modules.
//!    Repositories with a `vendor/` directory are rejected under strict
//!    vendoring unless one of the vendor flags is set.
//! 3. Run `go mod tidy` when replacements were applied or `force-gomod-tidy`
//!    is set.
//! 4. List the module graph (`go list -m`) and every package with its
//!    package-level dependencies (`go list -deps`).
//! 5. Vet dependencies replaced by local paths against the configured
//!    allowlist.
//!
//! The module's own version comes from its git tags, falling back to a Go
//! pseudo-version.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use walkdir::WalkDir;

use super::{ResolveContext, ResolveOutput, check_replacements_apply, require_package_dir};
use crate::content_manifest::{contains_package, match_parent_module};
use crate::core::DepcacheError;
use crate::git::GitRepo;
use crate::package::{Component, Dependency, Package, PackageType};
use crate::request::{EnvVar, Flag, PackageManager, Replacement};
use crate::utils::fs::{join_relative, merge_dirs};
use crate::utils::lock::FileLock;
use crate::utils::{ToolCommand, ensure_dir};

/// Summary used for every failed `go` invocation.
pub const GOMOD_FAILURE: &str = "Processing gomod dependencies failed";

/// `go list -deps` format printing non-standard packages with their module.
pub const LIST_DEPS_TEMPLATE: &str = "{{if not .Standard}}{{.ImportPath}} {{.Module}}{{end}}";

const LIST_MODULES_TEMPLATE: &str = "{{.Path}} {{.Version}} {{.Replace}}";
const MODULE_NAME_ERROR: &str = "The Go module name could not be determined";
const DOWNLOAD_CACHE: &str = "pkg/mod/cache/download";
const BUNDLE_GOPATH: &str = "deps/gomod";

/// Runs the `go` tool.
pub trait GoToolchain: Send + Sync {
    /// Run `go <args>` in `dir` with exactly `env` and return stdout.
    fn run<'a>(
        &'a self,
        args: &'a [&'a str],
        dir: &'a Path,
        env: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<String>>;
}

/// The system `go` binary.
#[derive(Debug, Clone)]
pub struct GoCommand {
    timeout: Duration,
}

impl GoCommand {
    /// Invocations bounded by `timeout`.
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
        }
    }
}

impl GoToolchain for GoCommand {
    fn run<'a>(
        &'a self,
        args: &'a [&'a str],
        dir: &'a Path,
        env: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let output = ToolCommand::new("go")
                .args(args.iter().copied())
                .current_dir(dir)
                .env_clear()
                .envs(env.iter().map(|(k, v)| (k.clone(), v.clone())))
                .timeout(self.timeout)
                .failure_message(GOMOD_FAILURE)
                .with_context("gomod")
                .execute()
                .await?;
            Ok(output.stdout)
        })
    }
}

/// Resolve every configured Go module of the request.
pub async fn resolve(ctx: &ResolveContext<'_>) -> Result<ResolveOutput> {
    let request = ctx.request;
    let configs = request.package_configs(PackageManager::Gomod);
    let replacements = request.replacements_for(PackageManager::Gomod);
    if !replacements.is_empty() && configs.len() > 1 {
        return Err(DepcacheError::UnsupportedFeature {
            reason: "Dependency replacements are only supported for a single go module path."
                .to_string(),
        }
        .into());
    }

    let source_dir = ctx.source_dir();
    for config in &configs {
        fail_if_workspace(&source_dir, &config.path)?;
    }

    let mut output = ResolveOutput::default();
    for config in &configs {
        let module_dir = require_package_dir(ctx, &config.path)?;
        tracing::info!(
            target: "resolver::gomod",
            "({}) Fetching the gomod dependencies at the \"{}\" directory",
            ctx.label(),
            config.path
        );
        let (module, packages) = resolve_module(ctx, &module_dir, &config.path, &replacements).await?;
        output.packages.push(module);
        output.packages.extend(packages);
    }

    if vendoring(ctx) {
        output.environment.insert("GOFLAGS".to_string(), EnvVar::literal("-mod=vendor"));
    }
    output.environment.insert("GOPATH".to_string(), EnvVar::path(BUNDLE_GOPATH));
    output.environment.insert("GOCACHE".to_string(), EnvVar::path(BUNDLE_GOPATH));
    output.environment.insert("GOMODCACHE".to_string(), EnvVar::path(format!("{BUNDLE_GOPATH}/pkg/mod")));
    Ok(output)
}

fn vendoring(ctx: &ResolveContext<'_>) -> bool {
    ctx.request.has_flag(Flag::GomodVendor) || ctx.request.has_flag(Flag::GomodVendorCheck)
}

/// Reject a `go.work` at the package path or any parent inside the repository.
fn fail_if_workspace(source_dir: &Path, subpath: &str) -> Result<(), DepcacheError> {
    let package_dir = join_relative(source_dir, subpath);
    for dir in package_dir.ancestors().take_while(|dir| dir.starts_with(source_dir)) {
        if dir.join("go.work").exists() {
            tracing::warn!(target: "resolver::gomod", "go.work file found at {}", dir.display());
            return Err(DepcacheError::InvalidRepoStructure {
                reason: "Go workspaces are not supported".to_string(),
            });
        }
    }
    Ok(())
}

fn go_env(ctx: &ResolveContext<'_>, gopath: &Path) -> BTreeMap<String, String> {
    let gopath_str = gopath.display().to_string();
    let mut env = BTreeMap::from([
        ("GOPATH".to_string(), gopath_str.clone()),
        ("GO111MODULE".to_string(), "on".to_string()),
        ("GOCACHE".to_string(), gopath_str.clone()),
        ("GOPROXY".to_string(), ctx.config.goproxy_url.clone()),
        ("PATH".to_string(), std::env::var("PATH").unwrap_or_default()),
        ("GOMODCACHE".to_string(), format!("{gopath_str}/pkg/mod")),
    ]);
    if ctx.request.has_flag(Flag::CgoDisable) {
        env.insert("CGO_ENABLED".to_string(), "0".to_string());
    }
    env
}

async fn resolve_module(
    ctx: &ResolveContext<'_>,
    module_dir: &Path,
    subpath: &str,
    replacements: &[Replacement],
) -> Result<(Package, Vec<Package>)> {
    let gopath = tempfile::Builder::new()
        .prefix("depcache-gomod-")
        .tempdir()
        .context("Failed to create a temporary GOPATH")?;
    let env = go_env(ctx, gopath.path());
    let private_downloads = gopath.path().join(DOWNLOAD_CACHE);
    let shared_downloads = ctx.deps_cache.ecosystem_dir("gomod").join(DOWNLOAD_CACHE);

    let seeded = sync_download_cache(ctx, &shared_downloads, &private_downloads).await?;
    tracing::debug!(target: "resolver::gomod", "Seeded {} module cache files from the shared cache", seeded);

    let mut result = fetch_module(ctx, module_dir, subpath, replacements, &env, gopath.path()).await;
    if result.is_ok() {
        match sync_download_cache(ctx, &private_downloads, &shared_downloads).await {
            Ok(published) => {
                tracing::debug!(target: "resolver::gomod", "Published {} module cache files", published);
            }
            Err(e) => result = Err(e),
        }
    }

    // files in the module cache are read-only until cleaned
    if let Err(e) = ctx.go.run(&["clean", "-modcache"], module_dir, &env).await {
        tracing::warn!(target: "resolver::gomod", "Failed to clean the module cache: {:#}", e);
    }
    result
}

/// Merge the module download cache at `from` into `to` under the shared
/// gomod cache lock.
async fn sync_download_cache(ctx: &ResolveContext<'_>, from: &Path, to: &Path) -> Result<usize> {
    let _lock = FileLock::acquire(&ctx.deps_cache.ecosystem_dir("gomod"), "download").await?;
    if !from.is_dir() {
        return Ok(0);
    }
    let (from, to) = (from.to_path_buf(), to.to_path_buf());
    tokio::task::spawn_blocking(move || merge_dirs(&from, &to))
        .await
        .context("Failed to spawn blocking task for syncing the module cache")?
}

async fn fetch_module(
    ctx: &ResolveContext<'_>,
    module_dir: &Path,
    subpath: &str,
    replacements: &[Replacement],
    env: &BTreeMap<String, String>,
    gopath: &Path,
) -> Result<(Package, Vec<Package>)> {
    let request = ctx.request;
    let label = ctx.label();

    for replacement in replacements {
        let new_name = replacement.new_name.as_deref().unwrap_or(&replacement.name);
        let spec = format!("{}={}@{}", replacement.name, new_name, replacement.version);
        tracing::info!(
            target: "resolver::gomod",
            "({}) Applying the gomod replacement {} => {}@{}",
            label,
            replacement.name,
            new_name,
            replacement.version
        );
        ctx.go.run(&["mod", "edit", "-replace", spec.as_str()], module_dir, env).await?;
    }

    let vendor_dir = module_dir.join("vendor");
    if request.has_flag(Flag::GomodVendorCheck) {
        let before = if vendor_dir.is_dir() { Some(hash_tree(&vendor_dir)?) } else { None };
        tracing::info!(target: "resolver::gomod", "({}) Vendoring the gomod dependencies", label);
        ctx.go.run(&["mod", "vendor"], module_dir, env).await?;
        if before.is_some_and(|before| hash_tree(&vendor_dir).ok() != Some(before)) {
            return Err(DepcacheError::InvalidRequestData {
                reason: "The content of the vendor directory is not consistent with go.mod. \
                         Run `go mod vendor` locally to fix this problem."
                    .to_string(),
            }
            .into());
        }
    } else if request.has_flag(Flag::GomodVendor) {
        tracing::info!(target: "resolver::gomod", "({}) Vendoring the gomod dependencies", label);
        ctx.go.run(&["mod", "vendor"], module_dir, env).await?;
    } else if ctx.config.gomod_strict_vendor && vendor_dir.is_dir() {
        return Err(DepcacheError::InvalidRequestData {
            reason: "The \"gomod-vendor\" flag must be set when your repository has vendored \
                     dependencies."
                .to_string(),
        }
        .into());
    } else {
        tracing::info!(target: "resolver::gomod", "({}) Downloading the gomod dependencies", label);
        ctx.go.run(&["mod", "download"], module_dir, env).await?;
    }

    if !replacements.is_empty() || request.has_flag(Flag::ForceGomodTidy) {
        ctx.go.run(&["mod", "tidy"], module_dir, env).await?;
    }

    let module_list = ctx
        .go
        .run(&["list", "-mod", "readonly", "-m", "-f", LIST_MODULES_TEMPLATE, "all"], module_dir, env)
        .await?;
    let replaced: BTreeSet<String> = replacements.iter().map(|r| r.name.clone()).collect();
    let modules = parse_module_list(&module_list, &replaced)?;
    check_replacements_apply(PackageManager::Gomod, replacements, &modules.applied)?;

    let module_version =
        golang_version(&modules.name, &GitRepo::new(ctx.source_dir()), &request.git_ref).await?;
    tracing::info!(
        target: "resolver::gomod",
        "({}) Module {} is at version {}",
        label,
        modules.name,
        module_version
    );

    let bundle_download_dir = ctx.deps_dir("gomod").join(DOWNLOAD_CACHE);
    if vendoring(ctx) {
        ensure_dir(&bundle_download_dir)?;
    } else {
        let download_dir = gopath.join(DOWNLOAD_CACHE);
        ensure_dir(&download_dir)?;
        tracing::debug!(
            target: "resolver::gomod",
            "Adding dependencies from {} to {}",
            download_dir.display(),
            bundle_download_dir.display()
        );
        let written = tokio::task::spawn_blocking(move || merge_dirs(&download_dir, &bundle_download_dir))
            .await
            .context("Failed to spawn blocking task for merging the module cache")??;
        tracing::debug!(target: "resolver::gomod", "Merged {} module cache files", written);
    }

    tracing::info!(target: "resolver::gomod", "({}) Retrieving the list of package level dependencies", label);
    let listed = ctx.go.run(&["list", "-find", "./..."], module_dir, env).await?;
    let mut processed = BTreeSet::new();
    let mut go_packages = Vec::new();
    for package_name in listed.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if processed.contains(package_name) {
            tracing::debug!(
                target: "resolver::gomod",
                "Package {} is already listed as a package dependency. Skipping...",
                package_name
            );
            continue;
        }

        let deps_output =
            ctx.go.run(&["list", "-deps", "-f", LIST_DEPS_TEMPLATE, package_name], module_dir, env).await?;
        let mut deps = Vec::new();
        for line in deps_output.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (name, version) = parse_name_and_version(line)?;
            processed.insert(name.to_string());
            deps.push(Component::new(name, PackageType::GoPackage, version.unwrap_or(&module_version)));
        }
        // the package itself comes last
        if let Some(package) = deps.pop() {
            go_packages.push((package, deps));
        }
    }

    let allowlist = ctx.config.gomod_allowed_local_deps(&modules.name);
    tracing::debug!(
        target: "resolver::gomod",
        "Allowed local dependencies for {}: {:?}",
        modules.name,
        allowlist
    );
    let module_components: Vec<Component> = modules.deps.iter().map(|d| d.component.clone()).collect();
    vet_local_deps(&module_components, &modules.name, &allowlist)?;

    let path = Some(subpath);
    let mut packages = Vec::new();
    for (package, mut deps) in go_packages {
        // local dependencies are relative to the main module, even for subpackages
        vet_local_deps(&deps, &modules.name, &allowlist)?;
        set_full_local_dep_relpaths(&mut deps, &module_components)?;
        packages.push(
            Package::new(package)
                .at_path(path)
                .with_dependencies(deps.into_iter().map(Dependency::new).collect()),
        );
    }

    let module = Package::new(Component::new(&modules.name, PackageType::Gomod, &module_version))
        .at_path(path)
        .with_dependencies(modules.deps);
    Ok((module, packages))
}

/// Parsed `go list -m` output.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ModuleList {
    /// The main module
    pub name: String,
    /// Module-level dependencies in listing order
    pub deps: Vec<Dependency>,
    /// User replacements that matched a dependency
    pub applied: BTreeSet<String>,
}

/// Parse `go list -m -f "{{.Path}} {{.Version}} {{.Replace}}" all`.
///
/// Lines with one column name the main module. Three columns are a
/// replacement by a local path, four a replacement by another module; only
/// replacements the user asked for are recorded as `replaces`.
pub fn parse_module_list(output: &str, replaced: &BTreeSet<String>) -> Result<ModuleList, DepcacheError> {
    let mut list = ModuleList::default();
    let mut module_name: Option<String> = None;

    for line in output.lines() {
        let mut parts: Vec<&str> = line.split(' ').filter(|p| !p.is_empty() && *p != "<nil>").collect();
        if parts.is_empty() {
            continue;
        }
        if parts.len() == 1 {
            if let Some(existing) = &module_name {
                tracing::error!(
                    target: "resolver::gomod",
                    "go list produced two lines which look like module names: \"{}\" and \"{}\"",
                    existing,
                    parts[0]
                );
                return Err(DepcacheError::InvalidRepoStructure {
                    reason: MODULE_NAME_ERROR.to_string(),
                });
            }
            module_name = Some(parts[0].to_string());
            continue;
        }

        let mut replaces = None;
        if parts.len() == 3 {
            // k8s.io/metrics v0.0.0 ./staging/src/k8s.io/metrics
            parts = vec![parts[0], parts[2]];
        } else if parts.len() == 4 {
            // github.com/pkg/errors v0.8.0 github.com/pkg/errors v0.8.1
            let (old_name, old_version) = (parts[0], parts[1]);
            if replaced.contains(old_name) {
                list.applied.insert(old_name.to_string());
                replaces = Some(Component::new(old_name, PackageType::Gomod, old_version));
            }
            parts = parts[2..].to_vec();
        }

        if parts.len() == 2 {
            list.deps.push(Dependency {
                component: Component::new(parts[0], PackageType::Gomod, parts[1]),
                replaces,
            });
        } else {
            tracing::warn!(target: "resolver::gomod", "Unexpected go module output: {}", line);
        }
    }

    list.name = module_name.ok_or_else(|| DepcacheError::InvalidRepoStructure {
        reason: MODULE_NAME_ERROR.to_string(),
    })?;
    Ok(list)
}

/// Package name and, when present, version from one `go list -deps` line.
///
/// The package is always the first column. With 3 to 6 columns the version
/// in effect is the last one, whether it is a plain version, a replacement
/// version or a local path.
pub fn parse_name_and_version(line: &str) -> Result<(&str, Option<&str>)> {
    let parts: Vec<&str> = line.split(' ').collect();
    match parts.len() {
        0..=2 => Ok((parts[0], None)),
        3..=6 => Ok((parts[0], parts.last().copied())),
        _ => Err(anyhow::anyhow!("Unrecognized line in go list -deps output: {line:?}")),
    }
}

fn is_absolute_path(version: &str) -> bool {
    let bytes = version.as_bytes();
    version.starts_with('/')
        || version.starts_with('\\')
        || (bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && matches!(bytes[2], b'\\' | b'/'))
}

/// Fail if a dependency is replaced by a local path that is not allowed.
pub fn vet_local_deps(deps: &[Component], module_name: &str, allowlist: &[String]) -> Result<(), DepcacheError> {
    for dep in deps {
        let version = dep.version.as_str();
        if version.starts_with('.') {
            tracing::debug!(
                target: "resolver::gomod",
                "Module {} wants to replace {} with a local dependency: {}",
                module_name,
                dep.name,
                version
            );
            if version.split(['/', '\\']).any(|part| part == "..") {
                return Err(DepcacheError::UnsupportedFeature {
                    reason: format!(
                        "Path to gomod dependency contains '..': {version}. This case is not supported."
                    ),
                });
            }
            let allowed = allowlist.iter().any(|pattern| match glob::Pattern::new(pattern) {
                Ok(pattern) => pattern.matches(&dep.name),
                Err(e) => {
                    tracing::warn!(target: "resolver::gomod", "Ignoring invalid allowlist pattern {}: {}", pattern, e);
                    false
                }
            });
            if !allowed {
                return Err(DepcacheError::UnsupportedFeature {
                    reason: format!(
                        "The module {module_name} is not allowed to replace {} with a local dependency. \
                         Please contact the maintainers of this service about adding an exception.",
                        dep.name
                    ),
                });
            }
        } else if is_absolute_path(version) {
            return Err(DepcacheError::UnsupportedFeature {
                reason: format!("Absolute paths to gomod dependencies are not supported: {version}"),
            });
        }
    }
    Ok(())
}

/// Relative path from `parent` to a package inside it.
pub fn path_to_subpackage<'a>(parent: &str, subpackage: &'a str) -> Option<&'a str> {
    if !contains_package(parent, subpackage) {
        return None;
    }
    Some(subpackage[parent.len()..].trim_start_matches('/'))
}

/// Point local package dependencies at the package directory instead of its module.
fn set_full_local_dep_relpaths(deps: &mut [Component], module_deps: &[Component]) -> Result<()> {
    let local_modules: Vec<&str> =
        module_deps.iter().filter(|m| m.version.starts_with('.')).map(|m| m.name.as_str()).collect();

    for dep in deps.iter_mut().filter(|d| d.version.starts_with('.')) {
        let module = match_parent_module(&dep.name, local_modules.iter().copied()).ok_or_else(|| {
            anyhow::anyhow!("Could not find parent Go module for local dependency: {}", dep.name)
        })?;
        let relative = path_to_subpackage(module, &dep.name).unwrap_or_default();
        if !relative.is_empty() {
            dep.version = format!("{}/{}", dep.version.trim_end_matches('/'), relative);
        }
    }
    Ok(())
}

/// Digest of every file path and content under `root`.
fn hash_tree(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let content = std::fs::read(entry.path())
            .with_context(|| format!("Failed to read {}", entry.path().display()))?;
        hasher.update(&content);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Major version encoded in a module path, e.g. 2 for `example.com/m/v2`.
fn module_major_version(module_name: &str) -> Option<u64> {
    let (base, major) = module_name.rsplit_once("/v")?;
    if base.is_empty() || major.is_empty() || !major.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    major.parse().ok().filter(|major| *major > 0)
}

/// Highest `v`-prefixed semver tag with the given major version.
fn highest_semver_tag(tags: &[String], major: u64) -> Option<semver::Version> {
    tags.iter()
        .filter_map(|tag| {
            let version = tag.strip_prefix('v').and_then(|v| semver::Version::parse(v).ok());
            if version.is_none() {
                tracing::debug!(target: "resolver::gomod", "{} is not a semantic version tag", tag);
            }
            version
        })
        .filter(|version| version.major == major)
        .max()
}

/// Go pseudo-version for `commit`.
///
/// Without a base tag the result is `vX.0.0-<time>-<hash>`. A prerelease base
/// `vX.Y.Z-pre` gives `vX.Y.Z-pre.0.<time>-<hash>`; a release base `vX.Y.Z`
/// gives `vX.Y.(Z+1)-0.<time>-<hash>`.
pub fn pseudo_version(
    commit: &str,
    committed: DateTime<Utc>,
    base: Option<&semver::Version>,
    major: Option<u64>,
) -> String {
    let timestamp = committed.format("%Y%m%d%H%M%S");
    let hash = &commit[..commit.len().min(12)];
    match base {
        None => format!("v{}.0.0-{timestamp}-{hash}", major.unwrap_or(0)),
        Some(base) if !base.pre.is_empty() => format!("v{base}.0.{timestamp}-{hash}"),
        Some(base) => format!(
            "v{}.{}.{}-0.{timestamp}-{hash}",
            base.major,
            base.minor,
            base.patch + 1
        ),
    }
}

/// Version of `module_name` at `commit`, as `go list` would report it.
///
/// The highest semver tag on the commit wins. Otherwise the highest tag
/// reachable from the commit is the base of a pseudo-version. Modules
/// without a major version suffix prefer v1 tags over v0 tags.
pub async fn golang_version(module_name: &str, repo: &GitRepo, commit: &str) -> Result<String> {
    let major = module_major_version(module_name);
    let candidates: Vec<u64> = match major {
        Some(major) => vec![major],
        None => vec![1, 0],
    };
    let tag_error = || format!("Failed to get the tags associated with the reference {commit}");

    let on_commit = repo.tags_at(commit).await.with_context(tag_error)?;
    for candidate in &candidates {
        if let Some(version) = highest_semver_tag(&on_commit, *candidate) {
            tracing::debug!(target: "resolver::gomod", "Using the semantic version tag v{} for {}", version, commit);
            return Ok(format!("v{version}"));
        }
    }

    let committed = repo.commit_time(commit).await?;
    let reachable = repo.tags_reachable_from(commit).await.with_context(tag_error)?;
    for candidate in &candidates {
        if let Some(base) = highest_semver_tag(&reachable, *candidate) {
            return Ok(pseudo_version(commit, committed, Some(&base), Some(*candidate)));
        }
    }

    tracing::debug!(target: "resolver::gomod", "No valid semantic version tag was found");
    Ok(pseudo_version(commit, committed, None, major))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::find_depcache_error;
    use crate::test_utils::{FakeGo, ResolverFixture, TestGit, test_request};
    use chrono::TimeZone;

    const MODULE_LIST: &str = "example.com/m <nil> <nil>\n\
        github.com/pkg/errors v0.8.0 github.com/pkg/errors v0.9.1\n\
        golang.org/x/text v0.3.0 <nil>\n\
        example.com/m/staging v0.0.0 ./staging\n";

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_parse_module_list() {
        let list = parse_module_list(MODULE_LIST, &set(&["github.com/pkg/errors"])).unwrap();
        assert_eq!(list.name, "example.com/m");
        assert_eq!(list.applied, set(&["github.com/pkg/errors"]));
        assert_eq!(list.deps.len(), 3);
        assert_eq!(list.deps[0].component.version, "v0.9.1");
        assert_eq!(list.deps[0].replaces.as_ref().unwrap().version, "v0.8.0");
        assert_eq!(list.deps[2].component.version, "./staging");
        assert!(list.deps[2].replaces.is_none());
    }

    #[test]
    fn test_parse_module_list_ignores_repository_replacements() {
        let list = parse_module_list(MODULE_LIST, &BTreeSet::new()).unwrap();
        assert!(list.applied.is_empty());
        assert!(list.deps[0].replaces.is_none());
    }

    #[test]
    fn test_parse_module_list_requires_exactly_one_name() {
        let err = parse_module_list("a <nil> <nil>\nb <nil> <nil>\n", &BTreeSet::new()).unwrap_err();
        assert_eq!(err.to_string(), "The Go module name could not be determined");
        assert!(parse_module_list("golang.org/x/text v0.3.0 <nil>\n", &BTreeSet::new()).is_err());
    }

    #[test]
    fn test_parse_name_and_version() {
        assert_eq!(parse_name_and_version("example.com/m/cmd example.com/m").unwrap(), ("example.com/m/cmd", None));
        assert_eq!(
            parse_name_and_version("golang.org/x/text/unicode golang.org/x/text v0.3.0").unwrap(),
            ("golang.org/x/text/unicode", Some("v0.3.0"))
        );
        assert_eq!(
            parse_name_and_version("example.com/m/staging/util example.com/m/staging v0.0.0 => ./staging").unwrap(),
            ("example.com/m/staging/util", Some("./staging"))
        );
        assert!(parse_name_and_version("a b c d e f g").is_err());
    }

    #[test]
    fn test_vet_local_deps() {
        let local = [Component::new("example.com/m/staging", PackageType::Gomod, "./staging")];
        assert!(vet_local_deps(&local, "example.com/m", &["example.com/m/*".to_string()]).is_ok());

        let err = vet_local_deps(&local, "example.com/m", &[]).unwrap_err();
        assert!(err.to_string().starts_with(
            "The module example.com/m is not allowed to replace example.com/m/staging with a local dependency"
        ));

        let parent = [Component::new("x", PackageType::Gomod, "./../x")];
        let err = vet_local_deps(&parent, "example.com/m", &["*".to_string()]).unwrap_err();
        assert!(err.to_string().starts_with("Path to gomod dependency contains '..': ./../x."));

        for absolute in ["/abs/path", "C:\\abs"] {
            let deps = [Component::new("x", PackageType::Gomod, absolute)];
            assert_eq!(
                vet_local_deps(&deps, "example.com/m", &[]).unwrap_err().to_string(),
                format!("Absolute paths to gomod dependencies are not supported: {absolute}")
            );
        }
    }

    #[test]
    fn test_full_local_dep_relpaths() {
        let modules = [Component::new("example.com/m/staging", PackageType::Gomod, "./staging")];
        let mut deps = vec![
            Component::new("example.com/m/staging/pkg/util", PackageType::GoPackage, "./staging"),
            Component::new("example.com/m/staging", PackageType::GoPackage, "./staging"),
            Component::new("golang.org/x/text", PackageType::GoPackage, "v0.3.0"),
        ];
        set_full_local_dep_relpaths(&mut deps, &modules).unwrap();
        assert_eq!(deps[0].version, "./staging/pkg/util");
        assert_eq!(deps[1].version, "./staging");
        assert_eq!(deps[2].version, "v0.3.0");
        assert_eq!(path_to_subpackage("example.com/m", "example.com/other"), None);
    }

    #[test]
    fn test_pseudo_versions() {
        let time = Utc.with_ymd_and_hms(2020, 5, 6, 7, 8, 9).unwrap();
        let commit = "0123456789abcdef0123456789abcdef01234567";
        assert_eq!(pseudo_version(commit, time, None, None), "v0.0.0-20200506070809-0123456789ab");
        assert_eq!(pseudo_version(commit, time, None, Some(3)), "v3.0.0-20200506070809-0123456789ab");
        let release = semver::Version::parse("1.4.2").unwrap();
        assert_eq!(
            pseudo_version(commit, time, Some(&release), Some(1)),
            "v1.4.3-0.20200506070809-0123456789ab"
        );
        let pre = semver::Version::parse("2.2.0-alpha").unwrap();
        assert_eq!(
            pseudo_version(commit, time, Some(&pre), Some(2)),
            "v2.2.0-alpha.0.20200506070809-0123456789ab"
        );
    }

    #[test]
    fn test_module_major_version() {
        assert_eq!(module_major_version("example.com/m/v2"), Some(2));
        assert_eq!(module_major_version("example.com/m"), None);
        assert_eq!(module_major_version("example.com/m/v0"), None);
        assert_eq!(module_major_version("example.com/vendor"), None);
    }

    #[tokio::test]
    async fn test_golang_version_from_tags() {
        let temp = tempfile::TempDir::new().unwrap();
        let git = TestGit::new(temp.path().join("repo"));
        let first = git.init_with_files(&[("go.mod", "module example.com/m\n")]).unwrap();
        git.tag("v0.9.0").unwrap();
        git.tag("v1.2.0").unwrap();
        git.tag("not-semver").unwrap();
        let repo = GitRepo::new(git.repo_path());
        assert_eq!(golang_version("example.com/m", &repo, &first).await.unwrap(), "v1.2.0");

        let second = git.commit_files(&[("main.go", "package main\n")], "main").unwrap();
        let version = golang_version("example.com/m", &repo, &second).await.unwrap();
        assert!(version.starts_with("v1.2.1-0."), "{version}");
        assert!(version.ends_with(&format!("-{}", &second[..12])), "{version}");

        let v2 = golang_version("example.com/m/v2", &repo, &second).await.unwrap();
        assert!(v2.starts_with("v2.0.0-"), "{v2}");
    }

    fn gomod_fixture(flags: &[Flag]) -> ResolverFixture {
        let fixture = ResolverFixture::with_git_app(
            test_request(&[PackageManager::Gomod], flags),
            &[("go.mod", "module example.com/m\n"), ("main.go", "package main\n")],
        );
        fixture.tag_app("v1.0.0");
        fixture
    }

    fn scripted_go() -> FakeGo {
        FakeGo::new()
            .respond(&["list", "-mod", "readonly", "-m"], "example.com/m <nil> <nil>\ngithub.com/pkg/errors v0.9.1 <nil>\n")
            .respond(&["list", "-find"], "example.com/m\nexample.com/m/internal\n")
            .respond_deps(
                "example.com/m",
                "github.com/pkg/errors github.com/pkg/errors v0.9.1\nexample.com/m/internal example.com/m\nexample.com/m example.com/m\n",
            )
            .with_download_file("github.com/pkg/errors/@v/list", "v0.9.1\n")
            .with_download_file("github.com/pkg/errors/@v/v0.9.1.zip", "zip")
    }

    #[tokio::test]
    async fn test_resolve_module() {
        let mut fixture = gomod_fixture(&[Flag::CgoDisable]);
        fixture.go = scripted_go();
        let output = resolve(&fixture.context()).await.unwrap();

        assert_eq!(output.packages.len(), 2);
        let module = &output.packages[0];
        assert_eq!(module.component, Component::new("example.com/m", PackageType::Gomod, "v1.0.0"));
        assert_eq!(module.dependencies[0].component.name, "github.com/pkg/errors");
        let package = &output.packages[1];
        assert_eq!(package.component.kind, PackageType::GoPackage);
        assert_eq!(package.component.version, "v1.0.0");
        let dep_names: Vec<&str> = package.dependencies.iter().map(|d| d.component.name.as_str()).collect();
        assert_eq!(dep_names, vec!["github.com/pkg/errors", "example.com/m/internal"]);
        assert_eq!(package.dependencies[1].component.version, "v1.0.0");

        // internal was listed as a dependency of the root package
        assert!(!fixture.go.called_with(&["list", "-deps", "-f", LIST_DEPS_TEMPLATE, "example.com/m/internal"]));
        assert!(fixture.go.called_with(&["mod", "download"]));
        assert!(!fixture.go.called_with(&["mod", "tidy"]));
        assert_eq!(fixture.go.env_of(&["mod", "download"]).unwrap()["CGO_ENABLED"], "0");

        let download = fixture.bundle_dir.join("deps/gomod/pkg/mod/cache/download");
        assert!(download.join("github.com/pkg/errors/@v/v0.9.1.zip").is_file());
        assert_eq!(output.environment["GOMODCACHE"], EnvVar::path("deps/gomod/pkg/mod"));
        assert!(!output.environment.contains_key("GOFLAGS"));
    }

    #[tokio::test]
    async fn test_module_cache_is_shared_between_requests() {
        let mut fixture = gomod_fixture(&[]);
        fixture.go = scripted_go();
        resolve(&fixture.context()).await.unwrap();
        assert_eq!(fixture.go.downloaded().len(), 2);
        let shared = fixture.config.deps_cache_dir().join("gomod").join(DOWNLOAD_CACHE);
        assert!(shared.join("github.com/pkg/errors/@v/v0.9.1.zip").is_file());

        std::fs::remove_dir_all(fixture.bundle_dir.join("deps")).unwrap();
        fixture.go = scripted_go();
        resolve(&fixture.context()).await.unwrap();
        assert!(fixture.go.called_with(&["mod", "download"]));
        assert!(fixture.go.downloaded().is_empty(), "{:?}", fixture.go.downloaded());
        let download = fixture.bundle_dir.join("deps/gomod/pkg/mod/cache/download");
        assert!(download.join("github.com/pkg/errors/@v/v0.9.1.zip").is_file());
    }

    #[tokio::test]
    async fn test_failed_download_is_not_published() {
        let mut fixture = gomod_fixture(&[]);
        fixture.go = scripted_go().fail_on(&["list", "-find"], "go: cannot find main module");
        resolve(&fixture.context()).await.unwrap_err();
        let shared = fixture.config.deps_cache_dir().join("gomod").join(DOWNLOAD_CACHE);
        assert!(!shared.exists());
    }

    #[tokio::test]
    async fn test_replacements_are_applied_and_checked() {
        let mut fixture = gomod_fixture(&[]);
        fixture.request.dependency_replacements = vec![Replacement {
            name: "github.com/pkg/errors".to_string(),
            kind: PackageManager::Gomod,
            version: "v0.9.1".to_string(),
            new_name: None,
        }];
        fixture.go = scripted_go().respond(
            &["list", "-mod", "readonly", "-m"],
            "example.com/m <nil> <nil>\ngithub.com/pkg/errors v0.8.0 github.com/pkg/errors v0.9.1\n",
        );
        let output = resolve(&fixture.context()).await.unwrap();
        assert!(fixture.go.called_with(&["mod", "edit", "-replace", "github.com/pkg/errors=github.com/pkg/errors@v0.9.1"]));
        assert!(fixture.go.called_with(&["mod", "tidy"]));
        let dep = &output.packages[0].dependencies[0];
        assert_eq!(dep.replaces.as_ref().unwrap().version, "v0.8.0");

        fixture.request.dependency_replacements[0].name = "github.com/other/lib".to_string();
        fixture.go = scripted_go();
        let err = resolve(&fixture.context()).await.unwrap_err();
        assert!(matches!(find_depcache_error(&err), Some(DepcacheError::ReplacementsDontApply { .. })));
    }

    #[tokio::test]
    async fn test_vendor_flag_emits_goflags() {
        let mut fixture = gomod_fixture(&[Flag::GomodVendor]);
        fixture.go = scripted_go();
        let output = resolve(&fixture.context()).await.unwrap();
        assert!(fixture.go.called_with(&["mod", "vendor"]));
        assert!(!fixture.go.called_with(&["mod", "download"]));
        assert_eq!(output.environment["GOFLAGS"], EnvVar::literal("-mod=vendor"));
        let download = fixture.bundle_dir.join("deps/gomod/pkg/mod/cache/download");
        assert!(download.is_dir());
        assert_eq!(std::fs::read_dir(download).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_strict_vendor_rejects_vendored_repository() {
        let mut fixture = gomod_fixture(&[]);
        fixture.config.gomod_strict_vendor = true;
        fixture.write_app("vendor/modules.txt", "# github.com/pkg/errors v0.9.1\n");
        fixture.go = scripted_go();
        let err = resolve(&fixture.context()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "The \"gomod-vendor\" flag must be set when your repository has vendored dependencies."
        );
    }

    #[tokio::test]
    async fn test_vendor_check_detects_drift() {
        let mut fixture = gomod_fixture(&[Flag::GomodVendorCheck]);
        fixture.write_app("vendor/modules.txt", "# stale\n");
        fixture.go = scripted_go().with_vendor_file("modules.txt", "# github.com/pkg/errors v0.9.1\n");
        let err = resolve(&fixture.context()).await.unwrap_err();
        assert!(err.to_string().starts_with("The content of the vendor directory is not consistent"));
    }

    #[tokio::test]
    async fn test_workspaces_are_rejected() {
        let mut fixture = gomod_fixture(&[]);
        fixture.write_app("go.work", "go 1.21\n");
        fixture.write_app("sub/go.mod", "module example.com/sub\n");
        fixture.request.packages_config.insert(
            PackageManager::Gomod,
            vec![crate::request::PackageConfig::at("sub")],
        );
        fixture.go = scripted_go();
        let err = resolve(&fixture.context()).await.unwrap_err();
        assert_eq!(err.to_string(), "Go workspaces are not supported");
        assert!(fixture.go.calls().is_empty());
    }

    #[tokio::test]
    async fn test_replacements_with_multiple_paths_unsupported() {
        let mut fixture = gomod_fixture(&[]);
        fixture.request.packages_config.insert(
            PackageManager::Gomod,
            vec![crate::request::PackageConfig::at("."), crate::request::PackageConfig::at("sub")],
        );
        fixture.request.dependency_replacements = vec![Replacement {
            name: "github.com/pkg/errors".to_string(),
            kind: PackageManager::Gomod,
            version: "v0.9.1".to_string(),
            new_name: None,
        }];
        let err = resolve(&fixture.context()).await.unwrap_err();
        assert!(matches!(find_depcache_error(&err), Some(DepcacheError::UnsupportedFeature { .. })));
    }
}
