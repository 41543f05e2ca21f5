//! Yarn (v1) resolver
//!
//! Reads `package.json` and `yarn.lock`. A lock entry is a dev dependency
//! iff it cannot be reached from the non-dev roots of `package.json`
//! (`dependencies`, `peerDependencies`, `optionalDependencies`) by
//! following the lock file's dependency edges.

use anyhow::{Context, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::js::{JsSource, fetch_dependency, is_git_spec, is_registry_url, parse_git_spec};
use super::{ResolveContext, ResolveOutput, require_package_dir};
use crate::core::DepcacheError;
use crate::package::{Component, Dependency, Package, PackageType};
use crate::request::PackageManager;

const LOCK_FILE: &str = "yarn.lock";
const NON_DEV_SECTIONS: [&str; 3] = ["dependencies", "peerDependencies", "optionalDependencies"];

/// One block of a `yarn.lock` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockEntry {
    /// `name@range` keys sharing this resolution
    pub specs: Vec<String>,
    pub version: String,
    pub resolved: Option<String>,
    pub integrity: Option<String>,
    /// `(name, range)` pairs from `dependencies` and `optionalDependencies`
    pub dependencies: Vec<(String, String)>,
}

impl LockEntry {
    /// Package name, taken from the first spec.
    pub fn name(&self) -> &str {
        self.specs.first().map_or("", |spec| spec_name(spec))
    }
}

/// Name part of a `name@range` spec. Scoped names keep their leading `@`.
pub fn spec_name(spec: &str) -> &str {
    match spec.get(1..).and_then(|rest| rest.find('@')) {
        Some(at) => &spec[..=at],
        None => spec,
    }
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('"').to_string()
}

/// Split `key value`, where the key may be quoted and contain spaces.
fn split_key_value(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix('"') {
        let end = rest.find('"')?;
        return Some((rest[..end].to_string(), unquote(&rest[end + 1..])));
    }
    let (key, value) = line.split_once(' ')?;
    Some((key.to_string(), unquote(value)))
}

fn lock_format_error(line_number: usize, reason: &str) -> DepcacheError {
    DepcacheError::InvalidFileFormat {
        file: LOCK_FILE.to_string(),
        reason: format!("line {line_number}: {reason}"),
    }
}

/// Parse a yarn v1 lock file.
pub fn parse_yarn_lock(content: &str) -> Result<Vec<LockEntry>, DepcacheError> {
    let mut entries: Vec<LockEntry> = Vec::new();
    let mut in_dependencies = false;

    for (number, raw) in content.lines().enumerate() {
        let line_number = number + 1;
        if raw.trim().is_empty() || raw.trim_start().starts_with('#') {
            continue;
        }
        let indent = raw.len() - raw.trim_start().len();
        let line = raw.trim();

        match indent {
            0 => {
                let header = line
                    .strip_suffix(':')
                    .ok_or_else(|| lock_format_error(line_number, "expected an entry header"))?;
                entries.push(LockEntry {
                    specs: header.split(", ").map(unquote).collect(),
                    ..LockEntry::default()
                });
                in_dependencies = false;
            }
            2 => {
                let entry = entries
                    .last_mut()
                    .ok_or_else(|| lock_format_error(line_number, "field outside of an entry"))?;
                if let Some(section) = line.strip_suffix(':') {
                    in_dependencies = matches!(section, "dependencies" | "optionalDependencies");
                    continue;
                }
                in_dependencies = false;
                let (key, value) = split_key_value(line)
                    .ok_or_else(|| lock_format_error(line_number, "expected a key and a value"))?;
                match key.as_str() {
                    "version" => entry.version = value,
                    "resolved" => entry.resolved = Some(value),
                    "integrity" => entry.integrity = Some(value),
                    _ => {}
                }
            }
            _ => {
                if !in_dependencies {
                    continue;
                }
                let entry = entries
                    .last_mut()
                    .ok_or_else(|| lock_format_error(line_number, "dependency outside of an entry"))?;
                let dependency = split_key_value(line)
                    .ok_or_else(|| lock_format_error(line_number, "expected a dependency and a range"))?;
                entry.dependencies.push(dependency);
            }
        }
    }

    if let Some(entry) = entries.iter().find(|e| e.version.is_empty()) {
        return Err(DepcacheError::InvalidFileFormat {
            file: LOCK_FILE.to_string(),
            reason: format!("the entry {} has no version", entry.specs.join(", ")),
        });
    }
    Ok(entries)
}

/// Lock entries connected by their dependency edges.
struct LockGraph {
    graph: DiGraph<usize, ()>,
    by_spec: HashMap<String, NodeIndex>,
}

impl LockGraph {
    fn new(entries: &[LockEntry]) -> Self {
        let mut graph = DiGraph::new();
        let mut by_spec = HashMap::new();
        for (position, entry) in entries.iter().enumerate() {
            let node = graph.add_node(position);
            for spec in &entry.specs {
                by_spec.insert(spec.clone(), node);
            }
        }
        for (position, entry) in entries.iter().enumerate() {
            let from = NodeIndex::new(position);
            for (name, range) in &entry.dependencies {
                match by_spec.get(&format!("{name}@{range}")) {
                    Some(&to) => {
                        graph.update_edge(from, to, ());
                    }
                    None => {
                        tracing::debug!(target: "resolver::yarn", "{}@{} is not in the lock file", name, range);
                    }
                }
            }
        }
        Self {
            graph,
            by_spec,
        }
    }

    /// Entries reachable from `roots`.
    fn reachable<'a>(&self, roots: impl IntoIterator<Item = &'a str>) -> HashSet<usize> {
        let mut seen = HashSet::new();
        for root in roots {
            let Some(&start) = self.by_spec.get(root) else {
                tracing::debug!(target: "resolver::yarn", "{} is not in the lock file", root);
                continue;
            };
            if seen.contains(&self.graph[start]) {
                continue;
            }
            let mut bfs = Bfs::new(&self.graph, start);
            while let Some(node) = bfs.next(&self.graph) {
                seen.insert(self.graph[node]);
            }
        }
        seen
    }
}

/// Positions of lock entries used only for development.
pub fn dev_entries(package_json: &Value, entries: &[LockEntry]) -> HashSet<usize> {
    let roots: Vec<String> = NON_DEV_SECTIONS
        .iter()
        .filter_map(|section| package_json.get(*section).and_then(Value::as_object))
        .flat_map(|deps| {
            deps.iter().map(|(name, range)| format!("{name}@{}", range.as_str().unwrap_or_default()))
        })
        .collect();
    let non_dev = LockGraph::new(entries).reachable(roots.iter().map(String::as_str));
    (0..entries.len()).filter(|position| !non_dev.contains(position)).collect()
}

/// Reported version and fetch source of a lock entry.
pub fn entry_source(entry: &LockEntry, registry: &str) -> Result<(String, JsSource), DepcacheError> {
    if let Some(resolved) = &entry.resolved {
        if is_git_spec(resolved) {
            return Ok((resolved.clone(), parse_git_spec(resolved)?));
        }
        if is_registry_url(resolved, registry) {
            return Ok((
                entry.version.clone(),
                JsSource::Registry {
                    url: resolved.clone(),
                },
            ));
        }
        return Ok((
            resolved.clone(),
            JsSource::Http {
                url: resolved.clone(),
            },
        ));
    }

    let local = entry.specs.iter().find_map(|spec| {
        let range = &spec[spec_name(spec).len()..];
        let range = range.strip_prefix('@').unwrap_or(range);
        range.strip_prefix("file:").or_else(|| range.strip_prefix("link:"))
    });
    match local {
        Some(path) => Ok((
            format!("file:{path}"),
            JsSource::File {
                path: path.to_string(),
            },
        )),
        None => Err(DepcacheError::InvalidRequestData {
            reason: format!("The dependency {}@{} has no source", entry.name(), entry.version),
        }),
    }
}

async fn read_package_json(package_dir: &Path) -> Result<Value> {
    let path = package_dir.join("package.json");
    if !path.is_file() {
        return Err(DepcacheError::InvalidRepoStructure {
            reason: "The package.json file must be present for the yarn package manager".to_string(),
        }
        .into());
    }
    let content =
        tokio::fs::read_to_string(&path).await.with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).map_err(|e| {
        DepcacheError::InvalidFileFormat {
            file: "package.json".to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Resolve every configured yarn package of the request.
pub async fn resolve(ctx: &ResolveContext<'_>) -> Result<ResolveOutput> {
    let registry = ctx.config.npm_registry_url.as_str();
    let mut output = ResolveOutput::default();

    for config in ctx.request.package_configs(PackageManager::Yarn) {
        let package_dir = require_package_dir(ctx, &config.path)?;
        let lock_path = package_dir.join(LOCK_FILE);
        if !lock_path.is_file() {
            return Err(DepcacheError::InvalidRepoStructure {
                reason: "The yarn.lock file must be present for the yarn package manager".to_string(),
            }
            .into());
        }
        let package_json = read_package_json(&package_dir).await?;
        let (Some(name), Some(version)) = (
            package_json.get("name").and_then(Value::as_str),
            package_json.get("version").and_then(Value::as_str),
        ) else {
            return Err(DepcacheError::InvalidRequestData {
                reason: "The package.json file is missing required data (name, version)".to_string(),
            }
            .into());
        };

        let content = tokio::fs::read_to_string(&lock_path)
            .await
            .with_context(|| format!("Failed to read {}", lock_path.display()))?;
        let entries = parse_yarn_lock(&content)?;
        let dev = dev_entries(&package_json, &entries);
        tracing::info!(
            target: "resolver::yarn",
            "({}) Fetching {} yarn dependencies of {}@{} at \"{}\" ({} dev)",
            ctx.label(),
            entries.len(),
            name,
            version,
            config.path,
            dev.len()
        );

        let mut dependencies = Vec::with_capacity(entries.len());
        for (position, entry) in entries.iter().enumerate() {
            let (dep_version, source) = entry_source(entry, registry)?;
            fetch_dependency(ctx, "yarn", &package_dir, entry.name(), &source).await?;
            dependencies.push(Dependency::new(
                Component::new(entry.name(), PackageType::Yarn, dep_version).dev(dev.contains(&position)),
            ));
        }

        output.packages.push(
            Package::new(Component::new(name, PackageType::Yarn, version))
                .at_path(Some(config.path.as_str()))
                .with_dependencies(dependencies),
        );
    }
    Ok(output)
}
