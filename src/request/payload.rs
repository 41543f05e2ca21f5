//! Validation of request submission payloads
//!
//! Everything a client can get wrong is rejected here, before a request is
//! stored or any pipeline step runs. Messages are user-facing.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use super::{Flag, PackageConfig, PackageManager, Replacement, is_request_ref_valid};
use crate::core::DepcacheError;
use crate::utils::fs::normalize_relative_path;

/// Package managers that must not process the same path.
///
/// When one side is `git-submodule` every non-root path of the other side
/// conflicts, since submodule paths are only known after fetching.
pub const MUTUALLY_EXCLUSIVE: [(PackageManager, PackageManager); 2] = [
    (PackageManager::Gomod, PackageManager::GitSubmodule),
    (PackageManager::Npm, PackageManager::Yarn),
];

const ALLOWED_KEYS: [&str; 7] =
    ["dependency_replacements", "flags", "packages", "pkg_managers", "ref", "repo", "user"];

/// A validated submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRequest {
    /// Repository URL
    pub repo: String,
    /// Commit hash
    pub git_ref: String,
    /// Package managers in submission order, without duplicates
    pub pkg_managers: Vec<PackageManager>,
    /// Per-package-manager path configuration
    pub packages_config: BTreeMap<PackageManager, Vec<PackageConfig>>,
    /// Dependency replacements
    pub dependency_replacements: Vec<Replacement>,
    /// Flags
    pub flags: BTreeSet<Flag>,
    /// Submitting user
    pub user: Option<String>,
}

fn invalid(reason: impl Into<String>) -> DepcacheError {
    DepcacheError::validation(reason)
}

/// Validate a submission payload against the enabled package managers.
pub fn validate_payload(payload: &Value, enabled: &[String]) -> Result<NewRequest, DepcacheError> {
    let Some(object) = payload.as_object() else {
        return Err(invalid("The input data must be a JSON object"));
    };

    let unknown: Vec<&str> =
        object.keys().map(String::as_str).filter(|k| !ALLOWED_KEYS.contains(k)).collect();
    if !unknown.is_empty() {
        return Err(invalid(format!(
            "The following keys are not allowed: {}",
            unknown.join(", ")
        )));
    }

    let missing: Vec<&str> =
        ["ref", "repo"].into_iter().filter(|key| !object.contains_key(*key)).collect();
    if !missing.is_empty() {
        return Err(invalid(format!("Missing required parameter(s): {}", missing.join(", "))));
    }

    let repo = match object.get("repo") {
        Some(Value::String(repo)) if !repo.trim().is_empty() => repo.trim().to_string(),
        _ => return Err(invalid("The \"repo\" parameter must be a non-empty string")),
    };

    let git_ref = match object.get("ref") {
        Some(Value::String(git_ref)) if is_request_ref_valid(git_ref) => git_ref.clone(),
        _ => return Err(invalid("The \"ref\" parameter must be a 40 character hex string")),
    };

    let pkg_managers = parse_pkg_managers(object, enabled)?;
    let flags = parse_flags(object)?;
    let packages_config = parse_packages(object, &pkg_managers)?;
    let dependency_replacements = parse_replacements(object, &pkg_managers)?;

    let user = match object.get("user") {
        None | Some(Value::Null) => None,
        Some(Value::String(user)) => Some(user.clone()),
        Some(_) => return Err(invalid("The \"user\" parameter must be a string")),
    };

    check_mutual_exclusivity(&pkg_managers, &packages_config)?;

    Ok(NewRequest {
        repo,
        git_ref,
        pkg_managers,
        packages_config,
        dependency_replacements,
        flags,
        user,
    })
}

fn string_array<'a>(value: &'a Value, message: &str) -> Result<Vec<&'a str>, DepcacheError> {
    value
        .as_array()
        .and_then(|items| items.iter().map(Value::as_str).collect::<Option<Vec<_>>>())
        .ok_or_else(|| invalid(message))
}

fn parse_pkg_managers(
    object: &Map<String, Value>,
    enabled: &[String],
) -> Result<Vec<PackageManager>, DepcacheError> {
    let names = match object.get("pkg_managers") {
        None => vec!["gomod"],
        Some(value) => string_array(value, "\"pkg_managers\" must be an array of strings")?,
    };

    let invalid_names: Vec<&str> =
        names.iter().copied().filter(|n| PackageManager::from_name(n).is_none()).collect();
    if !invalid_names.is_empty() {
        return Err(invalid(format!(
            "The following package managers are invalid: {}",
            invalid_names.join(", ")
        )));
    }

    let disabled: Vec<&str> =
        names.iter().copied().filter(|n| !enabled.iter().any(|e| e == n)).collect();
    if !disabled.is_empty() {
        return Err(invalid(format!(
            "The following package managers are not enabled: {}",
            disabled.join(", ")
        )));
    }

    let mut selected = Vec::new();
    for pm in names.into_iter().filter_map(PackageManager::from_name) {
        if !selected.contains(&pm) {
            selected.push(pm);
        }
    }
    Ok(selected)
}

fn parse_flags(object: &Map<String, Value>) -> Result<BTreeSet<Flag>, DepcacheError> {
    let Some(value) = object.get("flags") else {
        return Ok(BTreeSet::new());
    };
    let names = string_array(value, "\"flags\" must be an array of strings")?;

    let unknown: Vec<&str> =
        names.iter().copied().filter(|n| Flag::from_name(n).is_none()).collect();
    if !unknown.is_empty() {
        return Err(invalid(format!("Invalid/Inactive flag(s): {}", unknown.join(", "))));
    }
    Ok(names.into_iter().filter_map(Flag::from_name).collect())
}

fn parse_packages(
    object: &Map<String, Value>,
    selected: &[PackageManager],
) -> Result<BTreeMap<PackageManager, Vec<PackageConfig>>, DepcacheError> {
    let mut result = BTreeMap::new();
    let Some(value) = object.get("packages") else {
        return Ok(result);
    };
    let Some(packages) = value.as_object() else {
        return Err(invalid("The \"packages\" parameter must be an object"));
    };

    let not_applicable: Vec<&str> = packages
        .keys()
        .map(String::as_str)
        .filter(|k| !PackageManager::from_name(k).is_some_and(|pm| selected.contains(&pm)))
        .collect();
    if !not_applicable.is_empty() {
        return Err(invalid(format!(
            "The following package managers in the \"packages\" object do not apply: {}",
            not_applicable.join(", ")
        )));
    }

    for (name, configs) in packages {
        let Some(pm) = PackageManager::from_name(name) else {
            continue;
        };
        let allowed: &[&str] = if pm == PackageManager::Pip {
            &["path", "requirements_build_files", "requirements_files"]
        } else {
            &["path"]
        };
        let shape_error = || {
            invalid(format!(
                "The value of \"packages.{name}\" must be an array of objects with the following keys: {}",
                allowed.join(", ")
            ))
        };

        let entries = configs.as_array().ok_or_else(shape_error)?;
        let mut parsed = Vec::new();
        for entry in entries {
            let entry = entry.as_object().ok_or_else(shape_error)?;
            if entry.keys().any(|k| !allowed.contains(&k.as_str())) {
                return Err(shape_error());
            }

            let path = match entry.get("path") {
                None => ".".to_string(),
                Some(Value::String(path)) => normalize_relative_path(path).ok_or_else(|| {
                    invalid(format!(
                        "The \"path\" values in \"packages.{name}\" must be relative paths without \"..\""
                    ))
                })?,
                Some(_) => return Err(shape_error()),
            };

            let mut config = PackageConfig::at(path);
            for (key, target) in [
                ("requirements_files", &mut config.requirements_files),
                ("requirements_build_files", &mut config.requirements_build_files),
            ] {
                if let Some(files) = entry.get(key) {
                    for file in string_array(files, &format!("\"{key}\" must be an array of strings"))? {
                        let normalized = normalize_relative_path(file).ok_or_else(|| {
                            invalid(format!(
                                "The \"{key}\" values must be relative paths without \"..\""
                            ))
                        })?;
                        target.push(normalized);
                    }
                }
            }

            if parsed.iter().any(|c: &PackageConfig| c.path == config.path) {
                return Err(invalid(format!(
                    "The path \"{}\" is listed more than once in \"packages.{name}\"",
                    config.path
                )));
            }
            parsed.push(config);
        }
        result.insert(pm, parsed);
    }
    Ok(result)
}

fn parse_replacements(
    object: &Map<String, Value>,
    selected: &[PackageManager],
) -> Result<Vec<Replacement>, DepcacheError> {
    let Some(value) = object.get("dependency_replacements") else {
        return Ok(Vec::new());
    };
    let Some(items) = value.as_array() else {
        return Err(invalid("\"dependency_replacements\" must be an array"));
    };

    let mut replacements = Vec::new();
    for item in items {
        let replacement = validate_replacement(item)?;
        let Some(pm) = PackageManager::from_name(&replacement.0) else {
            return Err(invalid(format!(
                "The following package managers are invalid: {}",
                replacement.0
            )));
        };
        if !selected.contains(&pm) {
            return Err(invalid(format!(
                "A dependency replacement of type \"{pm}\" requires the \"{pm}\" package manager"
            )));
        }
        if !pm.supports_replacements() {
            return Err(invalid(format!(
                "Dependency replacements are not yet supported for the {pm} package manager"
            )));
        }
        replacements.push(Replacement {
            name: replacement.1,
            kind: pm,
            version: replacement.2,
            new_name: replacement.3,
        });
    }
    Ok(replacements)
}

/// Check one replacement object, returning (type, name, version, new_name).
fn validate_replacement(
    item: &Value,
) -> Result<(String, String, String, Option<String>), DepcacheError> {
    const REQUIRED: [&str; 3] = ["name", "type", "version"];
    const OPTIONAL: [&str; 1] = ["new_name"];

    let shape_error = || {
        invalid(format!(
            "A dependency replacement must be a JSON object with the following keys: {}. \
             It may also contain the following optional keys: {}.",
            REQUIRED.join(", "),
            OPTIONAL.join(", ")
        ))
    };

    let object = item.as_object().ok_or_else(shape_error)?;
    if object.keys().any(|k| !REQUIRED.contains(&k.as_str()) && !OPTIONAL.contains(&k.as_str())) {
        return Err(shape_error());
    }

    let mut values = Vec::new();
    for key in REQUIRED {
        match object.get(key) {
            Some(Value::String(value)) => values.push(value.clone()),
            Some(_) => {
                return Err(invalid(format!(
                    "The \"{key}\" key of the dependency replacement must be a string"
                )));
            }
            None => return Err(shape_error()),
        }
    }
    let new_name = match object.get("new_name") {
        None => None,
        Some(Value::String(value)) => Some(value.clone()),
        Some(_) => {
            return Err(invalid(
                "The \"new_name\" key of the dependency replacement must be a string",
            ));
        }
    };

    let version = values.pop().unwrap_or_default();
    let kind = values.pop().unwrap_or_default();
    let name = values.pop().unwrap_or_default();
    Ok((kind, name, version, new_name))
}

fn configured_paths(
    pm: PackageManager,
    configs: &BTreeMap<PackageManager, Vec<PackageConfig>>,
) -> Vec<String> {
    match configs.get(&pm) {
        Some(entries) if !entries.is_empty() => entries.iter().map(|c| c.path.clone()).collect(),
        _ => vec![".".to_string()],
    }
}

/// Reject selections where two exclusive package managers would handle the same path.
pub fn check_mutual_exclusivity(
    selected: &[PackageManager],
    configs: &BTreeMap<PackageManager, Vec<PackageConfig>>,
) -> Result<(), DepcacheError> {
    for (first, second) in MUTUALLY_EXCLUSIVE {
        if !selected.contains(&first) || !selected.contains(&second) {
            continue;
        }

        let (other, conflicts): (PackageManager, Vec<String>) =
            if first == PackageManager::GitSubmodule || second == PackageManager::GitSubmodule {
                let other = if first == PackageManager::GitSubmodule { second } else { first };
                let paths =
                    configured_paths(other, configs).into_iter().filter(|p| p != ".").collect();
                (other, paths)
            } else {
                let first_paths: BTreeSet<String> =
                    configured_paths(first, configs).into_iter().collect();
                let shared = configured_paths(second, configs)
                    .into_iter()
                    .filter(|p| first_paths.contains(p))
                    .collect();
                (second, shared)
            };

        if conflicts.is_empty() {
            continue;
        }

        let reason = if other == second && second != PackageManager::GitSubmodule {
            format!(
                "The \"{first}\" and \"{second}\" package managers cannot process the same path: {}",
                conflicts.join(", ")
            )
        } else {
            format!(
                "The \"{other}\" package manager cannot process paths other than the repository \
                 root together with \"git-submodule\": {}",
                conflicts.join(", ")
            )
        };
        return Err(invalid(reason));
    }
    Ok(())
}
