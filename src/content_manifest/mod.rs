//! Content manifest generation
//!
//! [`generate`] turns a request's resolved packages into an image content
//! manifest: one `image_contents` entry per top-level component with the
//! purls of its runtime `dependencies` and of every `sources` component it
//! was built from.
//!
//! Go needs two extra steps. Go modules are not entries of their own; each Go
//! package is attached to the module that owns it (see
//! [`match_parent_module`]) and inherits the module's dependencies as its
//! sources. Local module replacements carry a placeholder purl that is
//! resolved against the owning module's purl.
//!
//! The output is deep-sorted so that generating twice from the same input is
//! byte-identical.

use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

use crate::core::DepcacheError;
use crate::package::{Package, PackageType};
use crate::purl::{replace_parent_purl, to_purl, to_top_level_purl};
use crate::request::Request;

/// Manifest format version.
pub const ICM_VERSION: u64 = 1;

/// JSON schema the manifest conforms to.
pub const ICM_SPEC_URL: &str = "https://raw.githubusercontent.com/containerbuildsystem/atomic-reactor/\
f4abcfdaf8247a6b074f94fa84f3846f82d781c6/atomic_reactor/schemas/content_manifest.json";

/// Layer index used when the image layer is unknown.
pub const UNKNOWN_LAYER_INDEX: i64 = -1;

#[derive(Debug, Default)]
struct Entry {
    purl: String,
    dependencies: Vec<String>,
    sources: Vec<String>,
}

impl Entry {
    fn new(purl: String) -> Self {
        Self {
            purl,
            ..Self::default()
        }
    }

    fn to_value(&self) -> Value {
        let purls = |list: &[String]| list.iter().map(|p| json!({ "purl": p })).collect::<Vec<_>>();
        json!({
            "purl": self.purl,
            "dependencies": purls(&self.dependencies),
            "sources": purls(&self.sources),
        })
    }
}

/// Whether `package_name` is `module_name` or lies under it.
pub fn contains_package(module_name: &str, package_name: &str) -> bool {
    package_name
        .strip_prefix(module_name)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// The longest module name that contains `package_name`.
pub fn match_parent_module<'a, I>(package_name: &str, module_names: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    module_names
        .into_iter()
        .filter(|module| contains_package(module, package_name))
        .max_by_key(|module| module.len())
}

/// Build the content manifest of `request` from its resolved packages.
pub fn generate(request: &Request, packages: &[Package]) -> Result<Value, DepcacheError> {
    // module name -> (module purl, source purls)
    let mut modules: BTreeMap<&str, (String, Vec<String>)> = BTreeMap::new();
    let mut go_packages: Vec<(&str, Entry)> = Vec::new();
    let mut entries: BTreeMap<PackageType, Vec<Entry>> = BTreeMap::new();

    for package in packages {
        let component = &package.component;
        let path = package.path.as_deref();
        match component.kind {
            PackageType::Gomod => {
                let module_purl = to_top_level_purl(component, request, path)?;
                let mut sources = Vec::new();
                for dep in package.dependencies.iter().filter(|d| d.component.kind == PackageType::Gomod) {
                    sources.push(replace_parent_purl(&to_purl(&dep.component)?, &module_purl));
                }
                // the first module of a name wins
                modules.entry(component.name.as_str()).or_insert((module_purl, sources));
            }
            PackageType::GoPackage => {
                let mut entry = Entry::new(to_top_level_purl(component, request, path)?);
                for dep in package.dependencies.iter().filter(|d| d.component.kind == PackageType::GoPackage) {
                    entry.dependencies.push(to_purl(&dep.component)?);
                }
                go_packages.push((component.name.as_str(), entry));
            }
            PackageType::Npm | PackageType::Pip | PackageType::Yarn => {
                let mut entry = Entry::new(to_top_level_purl(component, request, path)?);
                for dep in package.dependencies.iter().filter(|d| d.component.kind == component.kind) {
                    let purl = to_purl(&dep.component)?;
                    if !dep.component.dev {
                        entry.dependencies.push(purl.clone());
                    }
                    entry.sources.push(purl);
                }
                entries.entry(component.kind).or_default().push(entry);
            }
            PackageType::GitSubmodule => {
                let entry = Entry::new(to_top_level_purl(component, request, path)?);
                entries.entry(component.kind).or_default().push(entry);
            }
            PackageType::Rubygems => {
                tracing::debug!(
                    target: "manifest",
                    "No content manifest implementation for '{}' packages",
                    component.kind
                );
            }
        }
    }

    let mut image_contents = Vec::new();
    for (name, mut entry) in go_packages {
        match match_parent_module(name, modules.keys().copied()) {
            Some(module_name) => {
                let (module_purl, sources) = &modules[module_name];
                entry.sources = sources.clone();
                for dep in &mut entry.dependencies {
                    *dep = replace_parent_purl(dep, module_purl);
                }
            }
            None => {
                tracing::warn!(target: "manifest", "Could not find a Go module for {}", entry.purl);
            }
        }
        image_contents.push(entry.to_value());
    }
    for group in entries.values() {
        image_contents.extend(group.iter().map(Entry::to_value));
    }

    Ok(deep_sort(json!({
        "metadata": {
            "icm_version": ICM_VERSION,
            "icm_spec": ICM_SPEC_URL,
            "image_layer_index": UNKNOWN_LAYER_INDEX,
        },
        "image_contents": image_contents,
    })))
}

/// Recursively sort object keys and lists of objects.
///
/// Lists of objects are ordered by their rendered JSON, which for purl
/// entries is the purl order.
pub fn deep_sort(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut pairs: Vec<(String, Value)> =
                object.into_iter().map(|(k, v)| (k, deep_sort(v))).collect();
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(pairs.into_iter().collect::<Map<String, Value>>())
        }
        Value::Array(items) => {
            let mut items: Vec<Value> = items.into_iter().map(deep_sort).collect();
            if items.iter().all(Value::is_object) {
                items.sort_by_cached_key(|item| item.to_string());
            }
            Value::Array(items)
        }
        other => other,
    }
}
