//! Normalized package and dependency records
//!
//! Every resolver reports its results in the same shape regardless of
//! ecosystem: top-level [`Package`]s, each owning an ordered list of
//! [`Dependency`] records. A dependency may carry a `replaces` back-reference
//! to the component it substituted when a dependency replacement applied.
//!
//! Components are content-addressed by (name, type, version, dev) through
//! [`Component::content_key`], which lets the store share one record across
//! every request that encounters it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

use crate::core::DepcacheError;

/// Ecosystem tag of a package or dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageType {
    /// A Go module
    Gomod,
    /// A Go package inside a module
    GoPackage,
    /// npm package
    Npm,
    /// Python package
    Pip,
    /// Yarn package
    Yarn,
    /// Ruby gem
    Rubygems,
    /// Git submodule
    GitSubmodule,
}

impl PackageType {
    /// Wire name of the type.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gomod => "gomod",
            Self::GoPackage => "go-package",
            Self::Npm => "npm",
            Self::Pip => "pip",
            Self::Yarn => "yarn",
            Self::Rubygems => "rubygems",
            Self::GitSubmodule => "git-submodule",
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content address of a component: hex SHA-256 over its identity fields.
pub type ContentKey = String;

/// Identity of a package or dependency.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Component {
    /// Package name in its ecosystem
    pub name: String,
    /// Ecosystem tag
    #[serde(rename = "type")]
    pub kind: PackageType,
    /// Version, or a URL/path form for non-registry sources
    pub version: String,
    /// Only needed for development
    #[serde(default)]
    pub dev: bool,
}

impl Component {
    /// A non-dev component.
    pub fn new(name: impl Into<String>, kind: PackageType, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            version: version.into(),
            dev: false,
        }
    }

    /// Same component flagged as dev-only.
    #[must_use]
    pub fn dev(mut self, dev: bool) -> Self {
        self.dev = dev;
        self
    }

    /// Content address of this component.
    pub fn content_key(&self) -> ContentKey {
        let mut hasher = Sha256::new();
        for field in [self.name.as_str(), self.kind.as_str(), self.version.as_str()] {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([u8::from(self.dev)]);
        hex::encode(hasher.finalize())
    }

    fn sort_key(&self) -> (&'static str, bool, &str, &str) {
        (self.kind.as_str(), self.dev, self.name.as_str(), self.version.as_str())
    }
}

/// A resolved transitive dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// The dependency itself
    #[serde(flatten)]
    pub component: Component,
    /// The component it substituted, when a replacement applied
    pub replaces: Option<Component>,
}

impl Dependency {
    /// A dependency that replaces nothing.
    pub const fn new(component: Component) -> Self {
        Self {
            component,
            replaces: None,
        }
    }
}

impl From<Component> for Dependency {
    fn from(component: Component) -> Self {
        Self::new(component)
    }
}

/// A resolved top-level unit (application, Go package, submodule).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// The package identity
    #[serde(flatten)]
    pub component: Component,
    /// Path relative to the repository root; `None` for the root itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Dependencies in resolver order
    pub dependencies: Vec<Dependency>,
}

impl Package {
    /// A package with no dependencies at the repository root.
    pub const fn new(component: Component) -> Self {
        Self {
            component,
            path: None,
            dependencies: Vec::new(),
        }
    }

    /// Set the subpath, mapping the repository root to `None`.
    #[must_use]
    pub fn at_path(mut self, path: Option<&str>) -> Self {
        self.path = path.filter(|p| *p != ".").map(String::from);
        self
    }

    /// Set the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<Dependency>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Aggregated per-request results before they are stored.
///
/// Adding the same (name, type, version) twice is an error; two resolvers
/// must never report the same top-level package. [`sorted`](Self::sorted)
/// yields a deterministic order with duplicate dependencies removed.
#[derive(Debug, Default, Clone)]
pub struct PackagesData {
    packages: Vec<Package>,
}

impl PackagesData {
    /// Empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one top-level package.
    pub fn add_package(&mut self, package: Package) -> Result<(), DepcacheError> {
        let duplicate = self.packages.iter().any(|p| {
            p.component.name == package.component.name
                && p.component.kind == package.component.kind
                && p.component.version == package.component.version
        });
        if duplicate {
            return Err(DepcacheError::InvalidRequestData {
                reason: format!(
                    "Duplicate package: name={}, type={}, version={}",
                    package.component.name, package.component.kind, package.component.version
                ),
            });
        }
        self.packages.push(package);
        Ok(())
    }

    /// Add every package from another collection.
    pub fn extend(&mut self, packages: impl IntoIterator<Item = Package>) -> Result<(), DepcacheError> {
        for package in packages {
            self.add_package(package)?;
        }
        Ok(())
    }

    /// Number of packages collected so far.
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Whether nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Packages sorted by (type, dev, name, version), each with its dependencies
    /// sorted the same way and deduplicated.
    pub fn sorted(mut self) -> Vec<Package> {
        for package in &mut self.packages {
            let mut seen = BTreeSet::new();
            package.dependencies.retain(|d| seen.insert((d.component.clone(), d.replaces.clone())));
            package.dependencies.sort_by(|a, b| {
                a.component.sort_key().cmp(&b.component.sort_key()).then_with(|| a.replaces.cmp(&b.replaces))
            });
        }
        self.packages.sort_by(|a, b| a.component.sort_key().cmp(&b.component.sort_key()));
        self.packages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_key_depends_on_every_identity_field() {
        let base = Component::new("rsc.io/quote", PackageType::Gomod, "v1.5.2");
        let key = base.content_key();
        assert_eq!(key.len(), 64);
        assert_eq!(key, base.clone().content_key());
        assert_ne!(key, base.clone().dev(true).content_key());
        assert_ne!(key, Component::new("rsc.io/quote", PackageType::GoPackage, "v1.5.2").content_key());
        // field boundaries are not ambiguous
        assert_ne!(
            Component::new("ab", PackageType::Npm, "c").content_key(),
            Component::new("a", PackageType::Npm, "bc").content_key()
        );
    }

    #[test]
    fn test_serialized_shape() {
        let dep = Dependency {
            component: Component::new("github.com/pkg/errors", PackageType::Gomod, "v0.9.1"),
            replaces: Some(Component::new("github.com/pkg/errors", PackageType::Gomod, "v0.8.0")),
        };
        let value = serde_json::to_value(&dep).unwrap();
        assert_eq!(value["type"], "gomod");
        assert_eq!(value["dev"], false);
        assert_eq!(value["replaces"]["version"], "v0.8.0");
    }

    #[test]
    fn test_duplicate_package_rejected() {
        let mut data = PackagesData::new();
        data.add_package(Package::new(Component::new("app", PackageType::Npm, "1.0.0"))).unwrap();
        let err = data
            .add_package(Package::new(Component::new("app", PackageType::Npm, "1.0.0")))
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate package"));
    }

    #[test]
    fn test_sorted_orders_and_dedupes() {
        let mut data = PackagesData::new();
        let deps = vec![
            Dependency::new(Component::new("z", PackageType::Npm, "1.0.0")),
            Dependency::new(Component::new("a", PackageType::Npm, "1.0.0").dev(true)),
            Dependency::new(Component::new("b", PackageType::Npm, "1.0.0")),
            Dependency::new(Component::new("z", PackageType::Npm, "1.0.0")),
        ];
        data.add_package(
            Package::new(Component::new("web", PackageType::Npm, "2.0.0")).with_dependencies(deps),
        )
        .unwrap();
        data.add_package(Package::new(Component::new("example.com/m", PackageType::Gomod, "v1.0.0")))
            .unwrap();

        let sorted = data.sorted();
        assert_eq!(sorted[0].component.kind, PackageType::Gomod);
        let names: Vec<_> = sorted[1].dependencies.iter().map(|d| d.component.name.as_str()).collect();
        assert_eq!(names, vec!["b", "z", "a"]);
    }
}
