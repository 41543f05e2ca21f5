//! pip resolver
//!
//! Every requirement must be reproducible without resolving anything:
//!
//! - PyPI requirements pinned with `==` (or `===`) to a single version
//! - HTTP(S) URLs carrying a `cachito_hash=<algorithm>:<digest>` qualifier or
//!   a `--hash` option
//! - `git+` VCS URLs pinned to a full 40-character commit
//!
//! The source distribution of each requirement is fetched into `deps/pip/`
//! and the build is pointed at it with `PIP_FIND_LINKS` and `PIP_NO_INDEX`.
//! Requirements from build requirement files are reported as dev
//! dependencies.

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use super::{Checksum, ResolveContext, ResolveOutput, git_dependency_path, require_package_dir};
use crate::core::DepcacheError;
use crate::package::{Component, Dependency, Package, PackageType};
use crate::request::{EnvVar, PackageConfig, PackageManager};
use crate::utils::fs::join_relative;

const DEFAULT_REQUIREMENTS: &str = "requirements.txt";
const DEFAULT_BUILD_REQUIREMENTS: &str = "requirements-build.txt";
const PIP_DEPS: &str = "deps/pip";

/// Global options the bundle cannot honour.
const REJECTED_OPTIONS: [&str; 7] =
    ["-i", "--index-url", "--extra-index-url", "--no-index", "-f", "--find-links", "--only-binary"];

const NAME: &str = r"[A-Za-z0-9][A-Za-z0-9._-]*";

/// How a requirement is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequirementKind {
    /// A PyPI release
    Pypi {
        /// The pinned version
        version: String,
    },
    /// A remote archive
    Url {
        /// Archive URL, possibly with qualifiers in the fragment
        url: String,
    },
    /// A git repository at a commit
    Vcs {
        /// URL `git clone` accepts
        repo_url: String,
        /// 40-character commit
        git_ref: String,
    },
}

/// One line of a requirements file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub kind: RequirementKind,
    /// `--hash` values
    pub hashes: Vec<String>,
    /// The requirement as written, for messages
    pub line: String,
}

impl Requirement {
    /// The `cachito_hash` qualifier of a URL requirement.
    pub fn qualifier_hash(&self) -> Option<String> {
        let RequirementKind::Url {
            url,
        } = &self.kind
        else {
            return None;
        };
        let fragment = url::Url::parse(url).ok()?.fragment()?.to_string();
        url::form_urlencoded::parse(fragment.as_bytes())
            .find(|(key, _)| key == "cachito_hash")
            .map(|(_, value)| value.into_owned())
    }
}

/// A parsed requirements file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequirementsFile {
    pub requirements: Vec<Requirement>,
    /// Global option names, e.g. `--require-hashes`
    pub options: Vec<String>,
}

fn invalid(reason: impl Into<String>) -> DepcacheError {
    DepcacheError::InvalidRequestData {
        reason: reason.into(),
    }
}

fn regex(pattern: &str) -> Result<Regex, DepcacheError> {
    Regex::new(pattern).map_err(|e| DepcacheError::Other {
        message: format!("Invalid pattern {pattern}: {e}"),
    })
}

/// Join continuation lines and drop comments and blank lines.
fn logical_lines(content: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for raw in content.lines() {
        if let Some(continued) = raw.strip_suffix('\\') {
            current.push_str(continued);
            current.push(' ');
            continue;
        }
        current.push_str(raw);
        let line = std::mem::take(&mut current);
        let without_comment = if line.trim_start().starts_with('#') {
            ""
        } else {
            match line.find(" #").or_else(|| line.find("\t#")) {
                Some(position) => &line[..position],
                None => line.as_str(),
            }
        };
        if !without_comment.trim().is_empty() {
            lines.push(without_comment.trim().to_string());
        }
    }
    if !current.trim().is_empty() {
        lines.push(current.trim().to_string());
    }
    lines
}

/// Parse the text of a requirements file.
pub fn parse_requirements(content: &str) -> Result<RequirementsFile, DepcacheError> {
    let mut file = RequirementsFile::default();
    for line in logical_lines(content) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let first = tokens[0];
        if first.starts_with('-') && !matches!(first, "-e" | "--editable") && !first.starts_with("--hash") {
            let option = first.split('=').next().unwrap_or(first);
            file.options.push(option.to_string());
            continue;
        }

        let mut hashes = Vec::new();
        let mut spec_parts = Vec::new();
        let mut tokens = tokens.into_iter();
        while let Some(token) = tokens.next() {
            if let Some(hash) = token.strip_prefix("--hash=") {
                hashes.push(hash.to_string());
            } else if token == "--hash" {
                let hash = tokens
                    .next()
                    .ok_or_else(|| invalid("Requirements file option '--hash' requires a value"))?;
                hashes.push(hash.to_string());
            } else if matches!(token, "-e" | "--editable") {
                continue;
            } else if token.starts_with('-') {
                return Err(invalid(format!(
                    "Requirements file option {token} can only be applied to all requirements"
                )));
            } else {
                spec_parts.push(token);
            }
        }
        file.requirements.push(parse_requirement(&spec_parts.join(" "), hashes, &line)?);
    }
    Ok(file)
}

fn parse_requirement(spec: &str, hashes: Vec<String>, line: &str) -> Result<Requirement, DepcacheError> {
    let direct = regex(&format!(r"^({NAME})\s*(?:\[[^\]]*\])?\s*@\s*(\S+)"))?;
    let (name, url) = if let Some(captures) = direct.captures(spec) {
        (Some(captures[1].to_string()), Some(captures[2].to_string()))
    } else if spec.contains("://") {
        let url = spec.split(';').next().unwrap_or(spec).trim().to_string();
        (None, Some(url))
    } else {
        (None, None)
    };

    let Some(url) = url else {
        let (name, version) = parse_pinned(spec, line)?;
        return Ok(Requirement {
            name,
            kind: RequirementKind::Pypi {
                version,
            },
            hashes,
            line: line.to_string(),
        });
    };

    let name = match name {
        Some(name) => name,
        None => egg_name(&url).ok_or_else(|| {
            invalid(format!("Egg name could not be determined from the requirement {line}"))
        })?,
    };
    let scheme = url.split("://").next().unwrap_or_default().to_lowercase();
    let kind = if scheme.starts_with("git+") {
        parse_vcs_url(&url, line)?
    } else if matches!(scheme.as_str(), "http" | "https") {
        RequirementKind::Url {
            url,
        }
    } else if ["hg+", "svn+", "bzr+"].iter().any(|prefix| scheme.starts_with(prefix)) {
        return Err(DepcacheError::UnsupportedFeature {
            reason: format!("Unsupported VCS for {line}: {scheme}"),
        });
    } else {
        return Err(DepcacheError::UnsupportedFeature {
            reason: format!("Direct references with '{scheme}' scheme are not supported, {line}"),
        });
    };

    Ok(Requirement {
        name,
        kind,
        hashes,
        line: line.to_string(),
    })
}

fn egg_name(url: &str) -> Option<String> {
    let (_, fragment) = url.split_once('#')?;
    url::form_urlencoded::parse(fragment.as_bytes())
        .find(|(key, _)| key == "egg")
        .map(|(_, value)| value.into_owned())
        .filter(|name| !name.is_empty())
}

fn parse_pinned(spec: &str, line: &str) -> Result<(String, String), DepcacheError> {
    let requirement = regex(&format!(r"^({NAME})\s*(?:\[[^\]]*\])?\s*([^;]*?)\s*(?:;.*)?$"))?;
    let specifier = regex(r"^(===|==|~=|!=|<=|>=|<|>)\s*(\S+)$")?;
    let unpinned = || invalid(format!("Requirement must be pinned to an exact version: {line}"));

    let captures = requirement
        .captures(spec)
        .ok_or_else(|| invalid(format!("Unable to parse the requirement {line:?}")))?;
    let specs: Vec<&str> = captures[2].split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    let [single] = specs.as_slice() else {
        return Err(unpinned());
    };
    let parts = specifier.captures(single).ok_or_else(unpinned)?;
    if !matches!(&parts[1], "==" | "===") || parts[2].contains('*') {
        return Err(unpinned());
    }
    Ok((captures[1].to_string(), parts[2].to_string()))
}

fn parse_vcs_url(url: &str, line: &str) -> Result<RequirementKind, DepcacheError> {
    let base = url.split(['#', '?']).next().unwrap_or(url);
    let no_ref = || invalid(format!("No valid git ref in {line} (expected 40 hexadecimal characters)"));
    let (location, git_ref) = base.rsplit_once('@').ok_or_else(no_ref)?;
    if git_ref.len() != 40 || !git_ref.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(no_ref());
    }
    let repo_url = location.strip_prefix("git+").unwrap_or(location);
    Ok(RequirementKind::Vcs {
        repo_url: repo_url.to_string(),
        git_ref: git_ref.to_lowercase(),
    })
}

/// Check global options and hashes. Returns whether hashes are required.
pub fn validate_requirements(file: &RequirementsFile) -> Result<bool, DepcacheError> {
    let rejected: Vec<&str> = file
        .options
        .iter()
        .map(String::as_str)
        .filter(|option| REJECTED_OPTIONS.contains(option))
        .collect();
    if !rejected.is_empty() {
        return Err(invalid(format!(
            "The following requirements file options are not supported: {}",
            rejected.join(", ")
        )));
    }
    let ignored: Vec<&str> =
        file.options.iter().map(String::as_str).filter(|o| *o != "--require-hashes").collect();
    if !ignored.is_empty() {
        tracing::info!(target: "resolver::pip", "Ignoring requirements file options: {}", ignored.join(", "));
    }

    let require_hashes = file.options.iter().any(|o| o == "--require-hashes")
        || file.requirements.iter().any(|r| !r.hashes.is_empty());
    for requirement in &file.requirements {
        let needs_hash = require_hashes || matches!(requirement.kind, RequirementKind::Url { .. });
        if needs_hash && requirement.hashes.is_empty() && requirement.qualifier_hash().is_none() {
            return Err(invalid(format!(
                "Hash is required, dependency does not specify any: {}",
                requirement.line
            )));
        }
    }
    Ok(require_hashes)
}

fn parse_checksums(hashes: &[String]) -> Result<Vec<Checksum>, DepcacheError> {
    hashes
        .iter()
        .map(|spec| {
            Checksum::parse(spec).ok_or_else(|| {
                invalid(format!("Not a valid hash specifier: {spec:?} (expected algorithm:digest)"))
            })
        })
        .collect()
}

fn verify_any(path: &Path, checksums: &[Checksum]) -> Result<()> {
    if checksums.is_empty() || checksums.iter().any(|c| c.verify(path).is_ok()) {
        return Ok(());
    }
    let file_name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    Err(DepcacheError::FileAccess {
        path: path.display().to_string(),
        reason: format!("Failed to verify checksum of {file_name} against any of the provided hashes"),
    }
    .into())
}

/// Pick the sdist to download: not yanked first, then `.tar.gz` over `.zip`.
pub fn select_sdist<'a>(release: &'a Value, name: &str, version: &str) -> Result<&'a Value, DepcacheError> {
    let preference = |sdist: &&Value| {
        let yanked = sdist.get("yanked").and_then(Value::as_bool).unwrap_or(false);
        let filename = sdist.get("filename").and_then(Value::as_str).unwrap_or_default();
        let filetype = if filename.ends_with(".tar.gz") {
            2
        } else if filename.ends_with(".zip") {
            1
        } else {
            0
        };
        (u8::from(!yanked), filetype)
    };
    let sdist = release
        .get("urls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|file| file.get("packagetype").and_then(Value::as_str) == Some("sdist"))
        .max_by_key(preference)
        .ok_or_else(|| DepcacheError::FileAccess {
            path: format!("{name}=={version}"),
            reason: format!("No sdists found for package {name}=={version}"),
        })?;
    if sdist.get("yanked").and_then(Value::as_bool).unwrap_or(false) {
        return Err(DepcacheError::FileAccess {
            path: format!("{name}=={version}"),
            reason: format!("All sdists for package {name}=={version} are yanked"),
        });
    }
    Ok(sdist)
}

/// Fetch one requirement into the bundle and return the reported component.
async fn fetch_requirement(ctx: &ResolveContext<'_>, requirement: &Requirement) -> Result<Component> {
    let deps_dir = ctx.deps_dir("pip");
    let checksums = parse_checksums(&requirement.hashes)?;
    let name = &requirement.name;

    match &requirement.kind {
        RequirementKind::Pypi {
            version,
        } => {
            let metadata_url = format!("{}/pypi/{name}/{version}/json", ctx.config.pypi_url.trim_end_matches('/'));
            let release = ctx.deps_cache.get_json(&metadata_url).await?;
            let sdist = select_sdist(&release, name, version)?;
            let (Some(url), Some(filename)) = (
                sdist.get("url").and_then(Value::as_str),
                sdist.get("filename").and_then(Value::as_str),
            ) else {
                return Err(DepcacheError::InvalidFileFormat {
                    file: metadata_url,
                    reason: "the sdist has no url or filename".to_string(),
                }
                .into());
            };
            let digest = sdist
                .pointer("/digests/sha256")
                .and_then(Value::as_str)
                .and_then(|hex| Checksum::parse(&format!("sha256:{hex}")));

            let cached = ctx.deps_cache.fetch("pip", url, filename, digest.as_ref()).await?;
            verify_any(&cached, &checksums)?;
            ctx.deps_cache.copy_into(&cached, &deps_dir.join(name).join(filename)).await?;

            let info = release.get("info");
            let reported_name = info.and_then(|i| i.get("name")).and_then(Value::as_str).unwrap_or(name);
            let reported_version =
                info.and_then(|i| i.get("version")).and_then(Value::as_str).unwrap_or(version);
            Ok(Component::new(reported_name, PackageType::Pip, reported_version))
        }
        RequirementKind::Url {
            url,
        } => {
            let qualifier = match requirement.qualifier_hash() {
                Some(hash) => Some(parse_checksums(&[hash])?.remove(0)),
                None => None,
            };
            let checksum = qualifier.or_else(|| checksums.first().cloned()).ok_or_else(|| {
                invalid(format!("Hash is required, dependency does not specify any: {}", requirement.line))
            })?;
            let download_url = url.split('#').next().unwrap_or(url);
            let extension = if download_url.ends_with(".tar.gz") {
                "tar.gz"
            } else {
                download_url.rsplit('.').next().unwrap_or("tar.gz")
            };
            let file_name = format!("{name}-external-{}-{}.{extension}", checksum.algorithm, checksum.hex);

            let cached = ctx.deps_cache.fetch("pip", download_url, &file_name, Some(&checksum)).await?;
            verify_any(&cached, &checksums)?;
            ctx.deps_cache
                .copy_into(&cached, &deps_dir.join(format!("external-{name}")).join(&file_name))
                .await?;
            Ok(Component::new(
                name,
                PackageType::Pip,
                format!("{download_url}#cachito_hash={}:{}", checksum.algorithm, checksum.hex),
            ))
        }
        RequirementKind::Vcs {
            repo_url,
            git_ref,
        } => {
            let archive = ctx.archives.fetch(repo_url, git_ref, false).await?;
            verify_any(&archive.path, &checksums)?;
            let dest = git_dependency_path(&deps_dir, repo_url, git_ref)?;
            ctx.deps_cache.copy_into(&archive.path, &dest).await?;
            Ok(Component::new(name, PackageType::Pip, format!("git+{repo_url}@{git_ref}")))
        }
    }
}

fn parse_setup_cfg(content: &str) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    let mut in_metadata = false;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(['#', ';']) {
            continue;
        }
        if trimmed.starts_with('[') {
            in_metadata = trimmed == "[metadata]";
            continue;
        }
        if !in_metadata || line.starts_with([' ', '\t']) {
            continue;
        }
        if let Some((key, value)) = trimmed.split_once(['=', ':']) {
            metadata.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    metadata
}

/// Name and version of the Python package at `package_dir`.
///
/// `pyproject.toml` `[project]` is preferred; `setup.cfg` `[metadata]` fills
/// in what it lacks. A `file:` version in `setup.cfg` is read from that
/// file.
pub fn package_metadata(package_dir: &Path) -> Result<(String, String)> {
    let mut name = None;
    let mut version = None;

    let pyproject = package_dir.join("pyproject.toml");
    if pyproject.is_file() {
        let content = std::fs::read_to_string(&pyproject)
            .with_context(|| format!("Failed to read {}", pyproject.display()))?;
        let document: toml::Value = toml::from_str(&content).map_err(|e| DepcacheError::InvalidFileFormat {
            file: "pyproject.toml".to_string(),
            reason: e.to_string(),
        })?;
        let project = document.get("project");
        name = project.and_then(|p| p.get("name")).and_then(toml::Value::as_str).map(str::to_string);
        version = project.and_then(|p| p.get("version")).and_then(toml::Value::as_str).map(str::to_string);
    }

    let setup_cfg = package_dir.join("setup.cfg");
    if (name.is_none() || version.is_none()) && setup_cfg.is_file() {
        let content = std::fs::read_to_string(&setup_cfg)
            .with_context(|| format!("Failed to read {}", setup_cfg.display()))?;
        let metadata = parse_setup_cfg(&content);
        if name.is_none() {
            name = metadata.get("name").cloned();
        }
        if version.is_none() {
            version = match metadata.get("version").map(String::as_str) {
                Some(value) if value.starts_with("file:") => {
                    let relative = value.trim_start_matches("file:").trim();
                    read_version_file(package_dir, relative)
                }
                Some(value) if value.starts_with("attr:") => {
                    tracing::warn!(target: "resolver::pip", "Versions from module attributes are not supported: {}", value);
                    None
                }
                other => other.map(str::to_string),
            };
        }
    }

    match (name, version) {
        (Some(name), Some(version)) => Ok((name, version)),
        (name, version) => {
            let missing: Vec<&str> = [("name", name.is_none()), ("version", version.is_none())]
                .into_iter()
                .filter_map(|(field, absent)| absent.then_some(field))
                .collect();
            Err(DepcacheError::InvalidRepoStructure {
                reason: format!("Could not resolve package metadata: {}", missing.join(", ")),
            }
            .into())
        }
    }
}

fn read_version_file(package_dir: &Path, relative: &str) -> Option<String> {
    let normalized = crate::utils::fs::normalize_relative_path(relative)?;
    std::fs::read_to_string(join_relative(package_dir, &normalized))
        .ok()
        .map(|content| content.trim().to_string())
        .filter(|version| !version.is_empty())
}

/// Requirement files of a configuration, with whether they are build files.
fn requirement_files(config: &PackageConfig, package_dir: &Path) -> Result<Vec<(std::path::PathBuf, bool)>> {
    let mut files = Vec::new();
    for (configured, default, dev) in [
        (&config.requirements_files, DEFAULT_REQUIREMENTS, false),
        (&config.requirements_build_files, DEFAULT_BUILD_REQUIREMENTS, true),
    ] {
        if configured.is_empty() {
            let path = package_dir.join(default);
            if path.is_file() {
                files.push((path, dev));
            }
            continue;
        }
        for relative in configured {
            let path = join_relative(package_dir, relative);
            if !path.is_file() {
                return Err(DepcacheError::InvalidRepoStructure {
                    reason: format!("The requirements file does not exist: {relative}"),
                }
                .into());
            }
            files.push((path, dev));
        }
    }
    Ok(files)
}

/// Resolve every configured Python package of the request.
pub async fn resolve(ctx: &ResolveContext<'_>) -> Result<ResolveOutput> {
    let mut output = ResolveOutput::default();

    for config in ctx.request.package_configs(PackageManager::Pip) {
        let package_dir = require_package_dir(ctx, &config.path)?;
        let (name, version) = package_metadata(&package_dir)?;
        tracing::info!(
            target: "resolver::pip",
            "({}) Resolving the pip package {}=={} at \"{}\"",
            ctx.label(),
            name,
            version,
            config.path
        );

        let mut dependencies: Vec<Component> = Vec::new();
        for (path, dev) in requirement_files(&config, &package_dir)? {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let file = parse_requirements(&content)?;
            if validate_requirements(&file)? {
                tracing::debug!(target: "resolver::pip", "Hashes are required for {}", path.display());
            }
            for requirement in &file.requirements {
                tracing::info!(target: "resolver::pip", "Downloading {}", requirement.line);
                let component = fetch_requirement(ctx, requirement).await?.dev(dev);
                match dependencies
                    .iter_mut()
                    .find(|d| d.name == component.name && d.version == component.version)
                {
                    Some(existing) => existing.dev &= component.dev,
                    None => dependencies.push(component),
                }
            }
        }

        output.packages.push(
            Package::new(Component::new(name, PackageType::Pip, version))
                .at_path(Some(config.path.as_str()))
                .with_dependencies(dependencies.into_iter().map(Dependency::new).collect()),
        );
    }

    output.environment.insert("PIP_FIND_LINKS".to_string(), EnvVar::path(PIP_DEPS));
    output.environment.insert("PIP_NO_INDEX".to_string(), EnvVar::literal("true"));
    Ok(output)
}
