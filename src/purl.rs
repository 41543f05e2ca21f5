//! Package URL construction
//!
//! Each ecosystem has its own rules for turning a (name, version) pair into a
//! purl. Versions that are not registry versions (git, forge shorthands, plain
//! URLs, local paths) map to `pkg:github`, `pkg:bitbucket` or `pkg:generic`
//! with a qualifier describing the source.

use regex::Regex;

use crate::constants::PARENT_PURL_PLACEHOLDER;
use crate::core::DepcacheError;
use crate::package::{Component, PackageType};
use crate::request::Request;

const NPM_PROTOCOL: &str = r"^(?P<protocol>[^:]+):(?P<authority>//)?(?P<suffix>.+)$";
const FORGE_SHORTHAND: &str = r"^(?P<namespace>.+)/(?P<name>[^#/]+)#(?P<version>.+)$";

fn regex(pattern: &str) -> Result<Regex, DepcacheError> {
    Regex::new(pattern).map_err(|e| content_error(format!("Invalid pattern {pattern}: {e}")))
}

/// Percent-encode `input`, leaving unreserved characters and `safe` intact.
pub fn quote(input: &str, safe: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        let c = byte as char;
        if c.is_ascii_alphanumeric() || "_.-~".contains(c) || (c.is_ascii() && safe.contains(c)) {
            out.push(c);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn content_error(reason: impl Into<String>) -> DepcacheError {
    DepcacheError::ContentManifest {
        reason: reason.into(),
    }
}

/// Purl of a package or dependency.
pub fn to_purl(component: &Component) -> Result<String, DepcacheError> {
    match component.kind {
        PackageType::Gomod | PackageType::GoPackage => Ok(golang_purl(component)),
        PackageType::Npm | PackageType::Yarn => npm_purl(component),
        PackageType::Pip => pip_purl(component),
        PackageType::GitSubmodule => {
            let (repo_url, git_ref) = component.version.rsplit_once('#').ok_or_else(|| {
                content_error(format!(
                    "The git-submodule version {} is not <url>#<ref>",
                    component.version
                ))
            })?;
            Ok(to_vcs_purl(&component.name, repo_url, git_ref))
        }
        PackageType::Rubygems => Err(content_error(format!(
            "The PURL spec is not defined for {} packages",
            component.kind
        ))),
    }
}

fn golang_purl(component: &Component) -> String {
    if component.version.starts_with('.') {
        // local replacement, relative to the parent module
        let normalized = crate::utils::fs::normalize_relative_path(&component.version)
            .unwrap_or_else(|| component.version.clone());
        return format!("{PARENT_PURL_PLACEHOLDER}#{normalized}");
    }

    let name = quote(&component.name, "");
    if component.version.is_empty() {
        format!("pkg:golang/{name}")
    } else {
        format!("pkg:golang/{name}@{}", component.version)
    }
}

fn npm_purl(component: &Component) -> Result<String, DepcacheError> {
    let name = quote(&component.name, "/");
    let version = &component.version;
    let protocol_pattern = regex(NPM_PROTOCOL)?;
    let Some(captures) = protocol_pattern.captures(version) else {
        return Ok(format!("pkg:npm/{name}@{version}"));
    };

    let protocol = &captures["protocol"];
    let has_authority = captures.name("authority").is_some();
    let qualifier = quote(version, "");

    if protocol == "file" {
        return Ok(format!("pkg:generic/{name}?{qualifier}"));
    }
    if !has_authority {
        // github:namespace/name#ref or gitlab:ns1/ns2/name#ref
        let forge = regex(FORGE_SHORTHAND)?
            .captures(&captures["suffix"])
            .ok_or_else(|| content_error(format!("Could not convert version {version} to purl")))?;
        return Ok(format!(
            "pkg:{protocol}/{}/{}@{}",
            &forge["namespace"], &forge["name"], &forge["version"]
        ));
    }
    match protocol {
        "git" | "git+http" | "git+https" | "git+ssh" => {
            Ok(format!("pkg:generic/{name}?vcs_url={qualifier}"))
        }
        "http" | "https" => Ok(format!("pkg:generic/{name}?download_url={qualifier}")),
        _ => Err(content_error(format!(
            "Unknown protocol in {} package version: {version}",
            component.kind
        ))),
    }
}

/// PyPI name normalisation: lowercase, runs of other characters become `-`.
pub fn pypi_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() || c == '.' {
            normalized.push(c);
            in_run = false;
        } else if !in_run {
            normalized.push('-');
            in_run = true;
        }
    }
    normalized
}

fn pip_purl(component: &Component) -> Result<String, DepcacheError> {
    let name = pypi_name(&component.name);
    let version = &component.version;

    if let Some(vcs) = version.strip_prefix("git+") {
        let vcs_url = vcs.split(['#', '?']).next().unwrap_or(vcs);
        let (repo_url, git_ref) = vcs_url.rsplit_once('@').ok_or_else(|| {
            content_error(format!("The pip VCS requirement {version} does not pin a ref"))
        })?;
        return Ok(to_vcs_purl(&component.name, repo_url, git_ref));
    }

    match url::Url::parse(version) {
        Ok(parsed) => {
            let checksum = parsed
                .fragment()
                .and_then(|fragment| {
                    url::form_urlencoded::parse(fragment.as_bytes())
                        .find(|(key, _)| key == "cachito_hash")
                        .map(|(_, value)| value.into_owned())
                })
                .ok_or_else(|| {
                    content_error(format!("The pip URL requirement {version} has no cachito_hash"))
                })?;
            Ok(format!(
                "pkg:generic/{name}?download_url={}&checksum={checksum}",
                quote(version, "")
            ))
        }
        Err(_) => Ok(format!("pkg:pypi/{name}@{version}")),
    }
}

/// Purl of a package fetched from a git repository.
///
/// GitHub and Bitbucket repositories get their dedicated purl types; anything
/// else becomes `pkg:generic` with a `vcs_url` qualifier.
pub fn to_vcs_purl(name: &str, repo_url: &str, git_ref: &str) -> String {
    let repo_url = repo_url.trim_end_matches('/');

    let forge = url::Url::parse(repo_url).ok().and_then(|parsed| {
        let kind = match parsed.host_str()? {
            "github.com" => "github",
            "bitbucket.org" => "bitbucket",
            _ => return None,
        };
        let path = parsed.path().trim_start_matches('/').to_string();
        let (namespace, repo) = path.rsplit_once('/')?;
        let repo = repo.strip_suffix(".git").unwrap_or(repo);
        Some(format!(
            "pkg:{kind}/{}/{}@{git_ref}",
            namespace.to_lowercase(),
            repo.to_lowercase()
        ))
    });

    forge.unwrap_or_else(|| {
        format!("pkg:generic/{name}?vcs_url={}", quote(&format!("{repo_url}@{git_ref}"), ""))
    })
}

/// Purl of a top-level package of `request`.
///
/// Application packages (npm, pip, yarn) come from the requested repository,
/// so their purl points at it, with the subpath as the purl subpath. Go
/// packages and submodules already name their source.
pub fn to_top_level_purl(
    component: &Component,
    request: &Request,
    subpath: Option<&str>,
) -> Result<String, DepcacheError> {
    match component.kind {
        PackageType::Gomod | PackageType::GoPackage | PackageType::GitSubmodule => {
            to_purl(component)
        }
        PackageType::Npm | PackageType::Pip | PackageType::Yarn => {
            let purl = to_vcs_purl(&component.name, &request.repo, &request.git_ref);
            Ok(match subpath.filter(|s| !s.is_empty() && *s != ".") {
                Some(subpath) => format!("{purl}#{subpath}"),
                None => purl,
            })
        }
        PackageType::Rubygems => Err(content_error(format!(
            "'{}' is not a valid top level package",
            component.kind
        ))),
    }
}

/// Substitute the parent module purl into a local Go dependency purl.
pub fn replace_parent_purl(purl: &str, parent_purl: &str) -> String {
    purl.replace(PARENT_PURL_PLACEHOLDER, parent_purl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{NewRequest, PackageManager};
    use std::collections::{BTreeMap, BTreeSet};

    fn purl(name: &str, kind: PackageType, version: &str) -> String {
        to_purl(&Component::new(name, kind, version)).unwrap()
    }

    #[test]
    fn test_golang() {
        assert_eq!(
            purl("example.com/org/project", PackageType::GoPackage, "1.1.1"),
            "pkg:golang/example.com%2Forg%2Fproject@1.1.1"
        );
        assert_eq!(
            purl("example.com/org/project/lib", PackageType::Gomod, "./lib/"),
            "PARENT_PURL#lib"
        );
        assert_eq!(purl("fmt", PackageType::GoPackage, ""), "pkg:golang/fmt");
    }

    #[test]
    fn test_npm_variants() {
        assert_eq!(purl("@scope/pkg", PackageType::Npm, "1.0.0"), "pkg:npm/%40scope/pkg@1.0.0");
        assert_eq!(
            purl("repo", PackageType::Npm, "github:org/repo#5a3b6f0"),
            "pkg:github/org/repo@5a3b6f0"
        );
        assert_eq!(
            purl("proj", PackageType::Yarn, "gitlab:ns1/ns2/proj#abc"),
            "pkg:gitlab/ns1/ns2/proj@abc"
        );
        assert_eq!(
            purl("fecha", PackageType::Npm, "git+https://gitlab.com/x/fecha.git#123"),
            "pkg:generic/fecha?vcs_url=git%2Bhttps%3A%2F%2Fgitlab.com%2Fx%2Ffecha.git%23123"
        );
        assert_eq!(
            purl("pkg", PackageType::Npm, "https://example.org/pkg.tgz"),
            "pkg:generic/pkg?download_url=https%3A%2F%2Fexample.org%2Fpkg.tgz"
        );
        assert_eq!(purl("local", PackageType::Npm, "file:lib/local"), "pkg:generic/local?file%3Alib%2Flocal");
        assert!(to_purl(&Component::new("x", PackageType::Npm, "svn://example.org/x")).is_err());
        assert!(to_purl(&Component::new("x", PackageType::Npm, "github:nohash")).is_err());
    }

    #[test]
    fn test_pip_variants() {
        assert_eq!(purl("Django_Rest", PackageType::Pip, "1.0.0"), "pkg:pypi/django-rest@1.0.0");
        assert_eq!(
            purl("req", PackageType::Pip, "git+https://github.com/Org/Req.git@abcdef"),
            "pkg:github/org/req@abcdef"
        );
        assert_eq!(
            purl("pkg", PackageType::Pip, "https://example.org/pkg.tar.gz#cachito_hash=sha256:abc"),
            "pkg:generic/pkg?download_url=https%3A%2F%2Fexample.org%2Fpkg.tar.gz%23cachito_hash%3Dsha256%3Aabc&checksum=sha256:abc"
        );
        assert!(to_purl(&Component::new("pkg", PackageType::Pip, "https://example.org/p.tgz")).is_err());
    }

    #[test]
    fn test_vcs_purl() {
        assert_eq!(
            to_vcs_purl("x", "https://bitbucket.org/Team/Repo.git/", "deadbeef"),
            "pkg:bitbucket/team/repo@deadbeef"
        );
        assert_eq!(
            to_vcs_purl("x", "https://gitlab.com/a/b", "r1"),
            "pkg:generic/x?vcs_url=https%3A%2F%2Fgitlab.com%2Fa%2Fb%40r1"
        );
        assert_eq!(
            purl("sub", PackageType::GitSubmodule, "https://github.com/org/sub.git#522fb816"),
            "pkg:github/org/sub@522fb816"
        );
    }

    #[test]
    fn test_top_level() {
        let request = Request::new(
            1,
            NewRequest {
                repo: "https://github.com/org/web".to_string(),
                git_ref: "d".repeat(40),
                pkg_managers: vec![PackageManager::Npm],
                packages_config: BTreeMap::new(),
                dependency_replacements: Vec::new(),
                flags: BTreeSet::new(),
                user: None,
            },
        );
        let app = Component::new("web", PackageType::Npm, "1.0.0");
        assert_eq!(
            to_top_level_purl(&app, &request, Some("client")).unwrap(),
            format!("pkg:github/org/web@{}#client", "d".repeat(40))
        );
        assert_eq!(
            to_top_level_purl(&app, &request, None).unwrap(),
            format!("pkg:github/org/web@{}", "d".repeat(40))
        );
        let gem = Component::new("rails", PackageType::Rubygems, "7.0.0");
        assert!(to_top_level_purl(&gem, &request, None).is_err());
    }
}
