//! Bundler resolver
//!
//! Reads the `GEM`, `GIT` and `PATH` sources of `Gemfile.lock`. Gems come
//! from the configured RubyGems server, git gems through the source archive
//! cache, and path gems must stay inside the repository.

use anyhow::{Context, Result};
use std::path::Path;

use super::{ResolveContext, ResolveOutput, git_dependency_path, require_package_dir};
use crate::core::DepcacheError;
use crate::git::repo_name_from_url;
use crate::package::{Component, Dependency, Package, PackageType};
use crate::request::PackageManager;
use crate::utils::fs::is_within;

const GEMFILE_LOCK: &str = "Gemfile.lock";

/// Where a locked gem comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GemSource {
    /// A RubyGems server
    Gem {
        /// Server URL
        remote: String,
    },
    /// A git repository
    Git {
        /// Repository URL
        remote: String,
        /// Locked commit
        revision: String,
        /// Branch, when the Gemfile names one
        branch: Option<String>,
    },
    /// A directory relative to the lock file
    Path {
        /// Relative directory
        path: String,
    },
}

/// One gem from `Gemfile.lock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedGem {
    pub name: String,
    pub version: String,
    pub source: GemSource,
}

#[derive(Default)]
struct Section {
    kind: String,
    remote: Option<String>,
    revision: Option<String>,
    branch: Option<String>,
    specs: Vec<(String, String)>,
}

fn invalid(reason: impl Into<String>) -> DepcacheError {
    DepcacheError::InvalidRequestData {
        reason: reason.into(),
    }
}

fn finish_section(section: Section, gems: &mut Vec<LockedGem>) -> Result<(), DepcacheError> {
    let Some(remote) = section.remote else {
        return Ok(());
    };
    let source = match section.kind.as_str() {
        "GEM" => GemSource::Gem {
            remote,
        },
        "GIT" => GemSource::Git {
            remote,
            revision: section.revision.unwrap_or_default(),
            branch: section.branch,
        },
        "PATH" => GemSource::Path {
            path: remote,
        },
        _ => return Err(invalid("Gemfile.lock contains unsupported dependency type.")),
    };
    gems.extend(section.specs.into_iter().map(|(name, version)| LockedGem {
        name,
        version,
        source: source.clone(),
    }));
    Ok(())
}

/// Parse `Gemfile.lock`, returning the locked gems and the platforms.
pub fn parse_gemfile_lock(content: &str) -> Result<(Vec<LockedGem>, Vec<String>), DepcacheError> {
    let mut gems = Vec::new();
    let mut platforms = Vec::new();
    let mut section = Section::default();

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let indent = line.len() - line.trim_start().len();
        let text = line.trim();
        if indent == 0 {
            finish_section(std::mem::take(&mut section), &mut gems)?;
            section.kind = text.to_string();
            continue;
        }

        match section.kind.as_str() {
            "PLATFORMS" if indent == 2 => platforms.push(text.to_string()),
            _ if indent == 2 => {
                if let Some((key, value)) = text.split_once(": ") {
                    match key {
                        "remote" => section.remote = Some(value.to_string()),
                        "revision" => section.revision = Some(value.to_string()),
                        "branch" => section.branch = Some(value.to_string()),
                        _ => {}
                    }
                }
            }
            // nested entries at indent 6 are the gem's own requirements
            _ if indent == 4 => {
                let Some((name, rest)) = text.split_once(" (") else {
                    continue;
                };
                let version = rest.trim_end_matches(')');
                section.specs.push((name.to_string(), version.to_string()));
            }
            _ => {}
        }
    }
    finish_section(section, &mut gems)?;
    Ok((gems, platforms))
}

/// Check the lock file against what can be fetched.
pub fn validate_gems(
    gems: &[LockedGem],
    platforms: &[String],
    rubygems_url: &str,
    source_root: &Path,
    lock_dir: &Path,
) -> Result<(), DepcacheError> {
    if platforms != ["ruby"] {
        return Err(invalid(
            "PLATFORMS section of Gemfile.lock has to contain one and only platform - ruby.",
        ));
    }
    for gem in gems {
        match &gem.source {
            GemSource::Gem {
                remote,
            } => {
                if remote.trim_end_matches('/') != rubygems_url.trim_end_matches('/') {
                    return Err(invalid(format!(
                        "Only {rubygems_url} is supported as a remote for gem dependencies, {} uses {remote}",
                        gem.name
                    )));
                }
            }
            GemSource::Git {
                remote,
                revision,
                ..
            } => {
                if !remote.starts_with("https://") {
                    return Err(invalid("All Ruby GIT dependencies have to use HTTPS protocol."));
                }
                if revision.len() != 40 || !revision.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(invalid(format!(
                        "No git ref for gem: {} (expected 40 hexadecimal characters, got: {revision}).",
                        gem.name
                    )));
                }
            }
            GemSource::Path {
                path,
            } => {
                let dir = lock_dir.join(path);
                if !dir.exists() {
                    return Err(invalid(format!(
                        "PATH dependency {} references a non-existing path: {path}.",
                        gem.name
                    )));
                }
                if !is_within(source_root, &dir) {
                    return Err(invalid(format!(
                        "PATH dependency {} at {path} is not inside the repository",
                        gem.name
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Name of the top-level package: the repository name plus the package subpath.
fn package_name(repo: &str, path: &str) -> Result<String> {
    let repo_name = repo_name_from_url(repo)?;
    let base = repo_name.rsplit('/').next().unwrap_or(&repo_name).to_string();
    Ok(if path == "." { base } else { format!("{base}/{path}") })
}

async fn fetch_gem(ctx: &ResolveContext<'_>, gem: &LockedGem) -> Result<Component> {
    let deps_dir = ctx.deps_dir("rubygems");
    let version = match &gem.source {
        GemSource::Gem {
            ..
        } => {
            let file_name = format!("{}-{}.gem", gem.name, gem.version);
            let url = format!("{}/gems/{file_name}", ctx.config.rubygems_url.trim_end_matches('/'));
            let cached = ctx.deps_cache.fetch("rubygems", &url, &file_name, None).await?;
            ctx.deps_cache.copy_into(&cached, &deps_dir.join(&gem.name).join(&file_name)).await?;
            gem.version.clone()
        }
        GemSource::Git {
            remote,
            revision,
            branch,
        } => {
            let revision = revision.to_lowercase();
            tracing::debug!(
                target: "resolver::rubygems",
                "Fetching {} from {} at {} (branch {})",
                gem.name,
                remote,
                revision,
                branch.as_deref().unwrap_or("-")
            );
            let archive = ctx.archives.fetch(remote, &revision, false).await?;
            let dest = git_dependency_path(&deps_dir, remote, &revision)?;
            ctx.deps_cache.copy_into(&archive.path, &dest).await?;
            format!("git+{remote}@{revision}")
        }
        GemSource::Path {
            path,
        } => {
            let normalized = crate::utils::fs::normalize_relative_path(path).unwrap_or_else(|| path.clone());
            if normalized.starts_with('.') { normalized } else { format!("./{normalized}") }
        }
    };
    Ok(Component::new(&gem.name, PackageType::Rubygems, version))
}

/// Resolve every configured Bundler package of the request.
pub async fn resolve(ctx: &ResolveContext<'_>) -> Result<ResolveOutput> {
    let mut output = ResolveOutput::default();
    let source_root = ctx.source_dir();

    for config in ctx.request.package_configs(PackageManager::Rubygems) {
        let package_dir = require_package_dir(ctx, &config.path)?;
        let lock_path = package_dir.join(GEMFILE_LOCK);
        if !lock_path.is_file() {
            return Err(DepcacheError::InvalidRepoStructure {
                reason: format!("Gemfile.lock at path {} does not exist or is not a regular file.", config.path),
            }
            .into());
        }
        let content = tokio::fs::read_to_string(&lock_path)
            .await
            .with_context(|| format!("Failed to read {}", lock_path.display()))?;
        let (gems, platforms) = parse_gemfile_lock(&content)?;
        validate_gems(&gems, &platforms, &ctx.config.rubygems_url, &source_root, &package_dir)?;

        let mut dependencies = Vec::new();
        for gem in &gems {
            tracing::info!(target: "resolver::rubygems", "Downloading {} ({})", gem.name, gem.version);
            dependencies.push(Dependency::new(fetch_gem(ctx, gem).await?));
        }

        let name = package_name(&ctx.request.repo, &config.path)?;
        output.packages.push(
            Package::new(Component::new(name, PackageType::Rubygems, &ctx.request.git_ref))
                .at_path(Some(config.path.as_str()))
                .with_dependencies(dependencies),
        );
    }
    Ok(output)
}
