//! Dependency sources shared by the npm and yarn resolvers

use anyhow::Result;
use std::path::{Path, PathBuf};

use super::ResolveContext;
use crate::core::DepcacheError;
use crate::request::is_request_ref_valid;
use crate::utils::fs::is_within;

/// Hosts serving the public npm registry.
pub const NPM_REGISTRY_HOSTS: [&str; 2] = ["registry.npmjs.org", "registry.yarnpkg.com"];

const GIT_PREFIXES: [&str; 7] =
    ["git://", "git+http://", "git+https://", "git+ssh://", "github:", "gitlab:", "bitbucket:"];

/// Where a JavaScript dependency comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsSource {
    /// A registry tarball
    Registry {
        /// Tarball URL
        url: String,
    },
    /// A tarball at an arbitrary URL
    Http {
        /// Tarball URL
        url: String,
    },
    /// A git repository pinned to a commit
    Git {
        /// URL `git clone` accepts
        clone_url: String,
        /// Pinned commit
        commit: String,
    },
    /// A directory of the repository
    File {
        /// Path relative to the package directory
        path: String,
    },
}

/// Whether `url` points at the configured or the public npm registry.
pub fn is_registry_url(url: &str, registry: &str) -> bool {
    if url.starts_with(registry.trim_end_matches('/')) {
        return true;
    }
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(|host| NPM_REGISTRY_HOSTS.contains(&host)))
        .unwrap_or(false)
}

/// Whether a version or URL uses one of the git forms npm and yarn understand.
pub fn is_git_spec(spec: &str) -> bool {
    GIT_PREFIXES.iter().any(|prefix| spec.starts_with(prefix))
}

/// Default tarball URL of a registry package.
pub fn registry_tarball_url(registry: &str, name: &str, version: &str) -> String {
    let basename = name.rsplit('/').next().unwrap_or(name);
    format!("{}/{name}/-/{basename}-{version}.tgz", registry.trim_end_matches('/'))
}

/// Split a git form into a clonable URL and commit.
pub fn parse_git_spec(spec: &str) -> Result<JsSource, DepcacheError> {
    let (location, commit) = spec.rsplit_once('#').ok_or_else(|| DepcacheError::UnsupportedFeature {
        reason: format!("The dependency {spec} is not pinned to a commit"),
    })?;

    let commit = commit.to_lowercase();
    if !is_request_ref_valid(&commit) {
        return Err(DepcacheError::InvalidRequestData {
            reason: format!("The dependency {spec} must be pinned to a full 40 character commit hash"),
        });
    }

    let clone_url = if let Some(path) = location.strip_prefix("github:") {
        format!("https://github.com/{path}.git")
    } else if let Some(path) = location.strip_prefix("gitlab:") {
        format!("https://gitlab.com/{path}.git")
    } else if let Some(path) = location.strip_prefix("bitbucket:") {
        format!("https://bitbucket.org/{path}.git")
    } else {
        location.strip_prefix("git+").unwrap_or(location).to_string()
    };

    Ok(JsSource::Git {
        clone_url,
        commit,
    })
}

/// Last path segment of a URL, without query or fragment.
pub fn url_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    if name.is_empty() { "package.tgz".to_string() } else { name.to_string() }
}

/// Relative directory for a package name: `name` or `@scope/name`.
///
/// Anything else (absolute paths, `.` or `..` segments, deeper nesting)
/// could place files outside `deps/<ecosystem>/`.
pub fn package_name_path(ecosystem: &str, name: &str) -> Result<PathBuf, DepcacheError> {
    let parts: Vec<&str> = name.split('/').collect();
    let valid_part = |part: &str| !part.is_empty() && part != "." && part != ".." && !part.contains('\\');
    let valid = match parts.as_slice() {
        [name] => valid_part(name) && !name.starts_with('@'),
        [scope, name] => scope.len() > 1 && scope.starts_with('@') && valid_part(scope) && valid_part(name),
        _ => false,
    };
    if !valid {
        return Err(DepcacheError::InvalidFileFormat {
            file: format!("the {ecosystem} lock file"),
            reason: format!("{name:?} is not a valid package name"),
        });
    }
    Ok(parts.iter().collect())
}

/// Put the artifact of one dependency into `deps/<ecosystem>/<name>/`.
///
/// File dependencies are only checked to stay inside the repository; they
/// are already part of the source tree.
pub async fn fetch_dependency(
    ctx: &ResolveContext<'_>,
    ecosystem: &str,
    package_dir: &Path,
    name: &str,
    source: &JsSource,
) -> Result<()> {
    let dest_dir = ctx.deps_dir(ecosystem).join(package_name_path(ecosystem, name)?);
    match source {
        JsSource::Registry {
            url,
        }
        | JsSource::Http {
            url,
        } => {
            let file_name = url_file_name(url);
            let cached = ctx.deps_cache.fetch(ecosystem, url, &file_name, None).await?;
            ctx.deps_cache.copy_into(&cached, &dest_dir.join(&file_name)).await?;
        }
        JsSource::Git {
            clone_url,
            commit,
        } => {
            tracing::info!(
                target: "resolver::js",
                "Fetching the {} dependency {} from {} at {}",
                ecosystem,
                name,
                clone_url,
                commit
            );
            let archive = ctx.archives.fetch(clone_url, commit, false).await?;
            let file_name = format!("external-gitcommit-{commit}.tar.gz");
            ctx.deps_cache.copy_into(&archive.path, &dest_dir.join(file_name)).await?;
        }
        JsSource::File {
            path,
        } => {
            if !is_within(&ctx.source_dir(), &package_dir.join(path)) {
                return Err(DepcacheError::UnsupportedFeature {
                    reason: format!(
                        "The {ecosystem} dependency {name} at file:{path} is not a directory inside the repository"
                    ),
                }
                .into());
            }
        }
    }
    Ok(())
}
