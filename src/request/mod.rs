//! Request model and lifecycle state machine
//!
//! A [`Request`] identifies one resolution job: a repository at a commit, the
//! package managers to run, their per-path configuration, flags and
//! dependency replacements. Its lifecycle is an append-only history of
//! [`RequestState`] records governed by [`allow_transition`]:
//!
//! ```text
//! in_progress -> in_progress | complete | failed | stale
//! complete    -> stale
//! failed      -> stale
//! ```
//!
//! Prior history entries are never modified or removed.

pub mod payload;
pub mod view;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::core::{DepcacheError, ErrorOrigin};
use crate::package::ContentKey;

pub use payload::{NewRequest, validate_payload};
pub use view::{Listing, RequestView};

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    /// Pipeline steps are running
    InProgress,
    /// Bundle and results are available
    Complete,
    /// A step failed; see the state reason
    Failed,
    /// Results expired
    Stale,
}

impl StateKind {
    /// Every state, in the order used for error messages.
    pub const ALL: [Self; 4] = [Self::Complete, Self::Failed, Self::InProgress, Self::Stale];

    /// Wire name of the state.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Stale => "stale",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateKind {
    type Err = DepcacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|state| state.as_str() == s).ok_or_else(|| {
            DepcacheError::UnknownState {
                state: s.to_string(),
                valid: Self::ALL.iter().map(|st| st.as_str()).collect::<Vec<_>>().join(", "),
            }
        })
    }
}

/// Whether the static transition table allows `from -> to`.
pub const fn allow_transition(from: StateKind, to: StateKind) -> bool {
    matches!(
        (from, to),
        (StateKind::InProgress, StateKind::InProgress)
            | (StateKind::InProgress, StateKind::Complete)
            | (StateKind::InProgress, StateKind::Failed)
            | (StateKind::InProgress, StateKind::Stale)
            | (StateKind::Complete, StateKind::Stale)
            | (StateKind::Failed, StateKind::Stale)
    )
}

/// Whether `git_ref` is a full 40 character lowercase hex commit hash.
pub fn is_request_ref_valid(git_ref: &str) -> bool {
    git_ref.len() == 40 && git_ref.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// One immutable history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestState {
    /// Sequence number within the request, starting at 1
    pub id: u64,
    /// The state entered
    pub state: StateKind,
    /// Why the state was entered
    pub reason: String,
    /// When the state was entered
    pub updated: DateTime<Utc>,
}

/// A package manager that can be selected for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageManager {
    /// Go modules
    Gomod,
    /// npm
    Npm,
    /// pip
    Pip,
    /// Yarn (v1 lock files)
    Yarn,
    /// Bundler / RubyGems
    Rubygems,
    /// Git submodules
    GitSubmodule,
}

impl PackageManager {
    /// Every known package manager.
    pub const ALL: [Self; 6] =
        [Self::Gomod, Self::Npm, Self::Pip, Self::Yarn, Self::Rubygems, Self::GitSubmodule];

    /// Wire name of the package manager.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gomod => "gomod",
            Self::Npm => "npm",
            Self::Pip => "pip",
            Self::Yarn => "yarn",
            Self::Rubygems => "rubygems",
            Self::GitSubmodule => "git-submodule",
        }
    }

    /// Parse a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|pm| pm.as_str() == name)
    }

    /// Whether dependency replacements can be applied for this package manager.
    pub const fn supports_replacements(self) -> bool {
        matches!(self, Self::Gomod)
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature toggles accepted in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Flag {
    /// Build Go code with `CGO_ENABLED=0`
    CgoDisable,
    /// Run `go mod tidy` even without replacements
    ForceGomodTidy,
    /// Vendor Go dependencies with `go mod vendor`
    GomodVendor,
    /// Vendor Go dependencies and require the result to match the repository
    GomodVendorCheck,
    /// Keep `.git` in the bundle's `app/`
    IncludeGitDir,
    /// Drop symlinks pointing outside the source tree instead of failing
    RemoveUnsafeSymlinks,
    /// Accept the pip resolver while it is in preview
    PipDevPreview,
}

impl Flag {
    /// Every known flag.
    pub const ALL: [Self; 7] = [
        Self::CgoDisable,
        Self::ForceGomodTidy,
        Self::GomodVendor,
        Self::GomodVendorCheck,
        Self::IncludeGitDir,
        Self::RemoveUnsafeSymlinks,
        Self::PipDevPreview,
    ];

    /// Wire name of the flag.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CgoDisable => "cgo-disable",
            Self::ForceGomodTidy => "force-gomod-tidy",
            Self::GomodVendor => "gomod-vendor",
            Self::GomodVendorCheck => "gomod-vendor-check",
            Self::IncludeGitDir => "include-git-dir",
            Self::RemoveUnsafeSymlinks => "remove-unsafe-symlinks",
            Self::PipDevPreview => "pip-dev-preview",
        }
    }

    /// Parse a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|flag| flag.as_str() == name)
    }
}

/// Per-path configuration for one package manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageConfig {
    /// Normalised path relative to the repository root (`"."` for the root)
    pub path: String,
    /// pip: requirement files, relative to `path`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements_files: Vec<String>,
    /// pip: build requirement files, relative to `path`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements_build_files: Vec<String>,
}

impl PackageConfig {
    /// Configuration for the repository root.
    pub fn root() -> Self {
        Self::at(".")
    }

    /// Configuration for a path with no extra settings.
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            requirements_files: Vec::new(),
            requirements_build_files: Vec::new(),
        }
    }
}

/// A user-requested dependency substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    /// Dependency to replace
    pub name: String,
    /// Package manager it belongs to
    #[serde(rename = "type")]
    pub kind: PackageManager,
    /// Version to use instead
    pub version: String,
    /// Replace with a differently named dependency
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
}

/// How an environment variable value should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvVarKind {
    /// Use the value as-is
    Literal,
    /// The value is a path relative to the bundle root
    Path,
}

/// An environment variable the build should set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Value
    pub value: String,
    /// Interpretation of the value
    pub kind: EnvVarKind,
}

impl EnvVar {
    /// A literal value.
    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: EnvVarKind::Literal,
        }
    }

    /// A bundle-relative path.
    pub fn path(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: EnvVarKind::Path,
        }
    }
}

/// Association of a stored package with a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPackage {
    /// Content key of the package
    pub package: ContentKey,
    /// Subpath the package was found at
    pub path: Option<String>,
}

/// Association of a stored dependency with a request and package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDependency {
    /// Content key of the owning package
    pub package: ContentKey,
    /// Content key of the dependency
    pub dependency: ContentKey,
    /// Content key of the replaced dependency
    pub replaces: Option<ContentKey>,
}

/// Classification recorded when a request fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureClass {
    /// Client or server
    pub origin: ErrorOrigin,
    /// Failure class tag
    pub error_type: String,
}

/// One resolution job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Identifier allocated by the store
    pub id: u64,
    /// Repository URL
    pub repo: String,
    /// Commit hash
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Selected package managers in processing order
    pub pkg_managers: Vec<PackageManager>,
    /// Per-package-manager path configuration
    #[serde(default)]
    pub packages_config: BTreeMap<PackageManager, Vec<PackageConfig>>,
    /// Requested dependency replacements
    #[serde(default)]
    pub dependency_replacements: Vec<Replacement>,
    /// Enabled flags
    #[serde(default)]
    pub flags: BTreeSet<Flag>,
    /// Submitting user, if known
    #[serde(default)]
    pub user: Option<String>,
    /// Environment variables emitted by resolvers
    #[serde(default)]
    pub environment_variables: BTreeMap<String, EnvVar>,
    /// State history, oldest first
    pub state_history: Vec<RequestState>,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Associated packages
    #[serde(default)]
    pub packages: Vec<RequestPackage>,
    /// Associated dependencies
    #[serde(default)]
    pub dependencies: Vec<RequestDependency>,
    /// Failure classification, set only while failed
    #[serde(default)]
    pub failure: Option<FailureClass>,
}

impl Request {
    /// Build a request from a validated payload. The history starts empty.
    pub fn new(id: u64, new: NewRequest) -> Self {
        Self {
            id,
            repo: new.repo,
            git_ref: new.git_ref,
            pkg_managers: new.pkg_managers,
            packages_config: new.packages_config,
            dependency_replacements: new.dependency_replacements,
            flags: new.flags,
            user: new.user,
            environment_variables: BTreeMap::new(),
            state_history: Vec::new(),
            created: Utc::now(),
            packages: Vec::new(),
            dependencies: Vec::new(),
            failure: None,
        }
    }

    /// The latest history entry.
    pub fn current_state(&self) -> Option<&RequestState> {
        self.state_history.last()
    }

    /// The latest state.
    pub fn state(&self) -> Option<StateKind> {
        self.current_state().map(|s| s.state)
    }

    /// Whether the request completed, whether or not it went stale later.
    pub fn has_completed(&self) -> bool {
        self.state_history
            .iter()
            .rev()
            .find(|s| s.state != StateKind::Stale)
            .is_some_and(|s| s.state == StateKind::Complete)
    }

    /// Append a state after validating the name and the transition.
    ///
    /// Re-applying the current state with the same reason is a no-op and
    /// returns `Ok(false)`. The first state of a new request must be
    /// `in_progress`. A stale request may be marked stale again with a new
    /// reason; that is the only state change out of `stale`, and it is kept
    /// out of [`allow_transition`], which lists transitions between states.
    pub fn add_state(&mut self, new_state: &str, reason: &str) -> Result<bool, DepcacheError> {
        let new_state: StateKind = new_state.parse()?;

        match self.current_state() {
            Some(current) if current.state == new_state && current.reason == reason => {
                tracing::info!(
                    target: "request",
                    "Request {}: not adding a new state since it matches the last state",
                    self.id
                );
                return Ok(false);
            }
            Some(current) if current.state == StateKind::Stale && new_state == StateKind::Stale => {}
            Some(current) if !allow_transition(current.state, new_state) => {
                return Err(DepcacheError::InvalidStateTransition {
                    from: current.state.to_string(),
                    to: new_state.to_string(),
                });
            }
            None if new_state != StateKind::InProgress => {
                return Err(DepcacheError::InvalidStateTransition {
                    from: "none".to_string(),
                    to: new_state.to_string(),
                });
            }
            _ => {}
        }

        let entry = RequestState {
            id: self.state_history.len() as u64 + 1,
            state: new_state,
            reason: reason.to_string(),
            updated: Utc::now(),
        };
        tracing::info!(
            target: "request",
            "Request {} moved to {}: {}",
            self.id,
            entry.state,
            entry.reason
        );
        self.state_history.push(entry);
        if new_state != StateKind::Failed {
            self.failure = None;
        }
        Ok(true)
    }

    /// Whether a flag is set.
    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// Path configuration for a package manager, defaulting to the root.
    pub fn package_configs(&self, pm: PackageManager) -> Vec<PackageConfig> {
        match self.packages_config.get(&pm) {
            Some(configs) if !configs.is_empty() => configs.clone(),
            _ => vec![PackageConfig::root()],
        }
    }

    /// Replacements targeting a package manager.
    pub fn replacements_for(&self, pm: PackageManager) -> Vec<Replacement> {
        self.dependency_replacements.iter().filter(|r| r.kind == pm).cloned().collect()
    }

    /// Whether submodules must be checked out when fetching the source.
    pub fn wants_submodules(&self) -> bool {
        self.pkg_managers.contains(&PackageManager::GitSubmodule)
    }

    /// Number of distinct packages.
    pub fn packages_count(&self) -> usize {
        self.packages.len()
    }

    /// Number of distinct dependencies.
    pub fn dependencies_count(&self) -> usize {
        self.dependencies.iter().map(|d| &d.dependency).collect::<BTreeSet<_>>().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        Request::new(
            1,
            NewRequest {
                repo: "https://github.com/org/project".to_string(),
                git_ref: "a".repeat(40),
                pkg_managers: vec![PackageManager::Gomod],
                packages_config: BTreeMap::new(),
                dependency_replacements: Vec::new(),
                flags: BTreeSet::new(),
                user: None,
            },
        )
    }

    #[test]
    fn test_ref_validation() {
        assert!(is_request_ref_valid(&"a".repeat(40)));
        assert!(is_request_ref_valid("c50b93a32df1c9d700e3e80996845bc2e13be848"));
        assert!(!is_request_ref_valid(""));
        assert!(!is_request_ref_valid(&"a".repeat(39)));
        assert!(!is_request_ref_valid(&"a".repeat(41)));
        assert!(!is_request_ref_valid(&"g".repeat(40)));
        assert!(!is_request_ref_valid(&"A".repeat(40)));
        assert!(!is_request_ref_valid("main"));
    }

    #[test]
    fn test_transition_table() {
        use StateKind::*;
        let allowed = [
            (InProgress, InProgress),
            (InProgress, Complete),
            (InProgress, Failed),
            (InProgress, Stale),
            (Complete, Stale),
            (Failed, Stale),
        ];
        for from in StateKind::ALL {
            for to in StateKind::ALL {
                assert_eq!(
                    allow_transition(from, to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
        assert!(!allow_transition(Failed, Complete));
        assert!(allow_transition(Complete, Stale));
    }

    #[test]
    fn test_add_state_appends_history() {
        let mut req = request();
        assert!(req.add_state("in_progress", "The request was initiated").unwrap());
        assert!(req.add_state("in_progress", "Fetching the application source").unwrap());
        assert!(req.add_state("complete", "Completed successfully").unwrap());
        assert_eq!(req.state_history.len(), 3);
        assert_eq!(req.state(), Some(StateKind::Complete));
        assert_eq!(req.state_history[0].reason, "The request was initiated");
        assert_eq!(req.state_history[2].id, 3);
    }

    #[test]
    fn test_add_state_rejects_unknown_and_illegal() {
        let mut req = request();
        req.add_state("in_progress", "started").unwrap();
        req.add_state("failed", "boom").unwrap();

        let err = req.add_state("complete", "nope").unwrap_err();
        assert!(matches!(err, DepcacheError::InvalidStateTransition { .. }));

        let err = req.add_state("x", "nope").unwrap_err();
        assert_eq!(
            err.to_string(),
            "The state \"x\" is invalid. It must be one of: complete, failed, in_progress, stale."
        );
        assert_eq!(req.state_history.len(), 2);
    }

    #[test]
    fn test_same_state_same_reason_is_noop() {
        let mut req = request();
        req.add_state("in_progress", "started").unwrap();
        req.add_state("failed", "boom").unwrap();
        assert!(!req.add_state("failed", "boom").unwrap());
        assert_eq!(req.state_history.len(), 2);
    }

    #[test]
    fn test_stale_requests_can_only_be_restaled() {
        let mut req = request();
        req.add_state("in_progress", "started").unwrap();
        req.add_state("complete", "done").unwrap();
        req.add_state("stale", "The request has expired").unwrap();

        assert!(req.add_state("stale", "Expired again by an administrator").unwrap());
        assert_eq!(req.state_history.len(), 4);
        assert_eq!(req.state(), Some(StateKind::Stale));
        for state in ["in_progress", "complete", "failed"] {
            let err = req.add_state(state, "revive").unwrap_err();
            assert!(matches!(err, DepcacheError::InvalidStateTransition { .. }), "{state}");
        }
    }

    #[test]
    fn test_has_completed_looks_past_stale() {
        let mut completed = request();
        completed.add_state("in_progress", "started").unwrap();
        assert!(!completed.has_completed());
        completed.add_state("complete", "done").unwrap();
        completed.add_state("stale", "expired").unwrap();
        assert!(completed.has_completed());

        let mut failed = request();
        failed.add_state("in_progress", "started").unwrap();
        failed.add_state("failed", "boom").unwrap();
        failed.add_state("stale", "expired").unwrap();
        assert!(!failed.has_completed());
    }

    #[test]
    fn test_first_state_must_be_in_progress() {
        let mut req = request();
        assert!(req.add_state("complete", "skip").is_err());
    }

    #[test]
    fn test_package_configs_default_to_root() {
        let req = request();
        assert_eq!(req.package_configs(PackageManager::Gomod), vec![PackageConfig::root()]);
    }
}
