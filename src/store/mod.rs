//! Request store
//!
//! Holds requests by id and every package or dependency ever resolved,
//! content-addressed by [`Component::content_key`] so that records are shared
//! across requests and never duplicated. Insertion is get-or-create through
//! the `DashMap` entry API, which makes concurrent inserts of the same
//! component converge on one record.
//!
//! When backed by a state file, every mutation is persisted as one JSON
//! document written atomically under a cross-process [`FileLock`].

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::bundle;
use crate::config::Config;
use crate::core::{DepcacheError, ErrorOrigin, find_depcache_error};
use crate::package::{Component, ContentKey, Dependency, Package};
use crate::request::{
    EnvVar, FailureClass, NewRequest, Request, RequestDependency, RequestPackage, StateKind,
};
use crate::utils::fs::{remove_dir_if_exists, remove_file_if_exists};
use crate::utils::{FileLock, atomic_write};

/// Reason recorded on every new request.
pub const INITIAL_REASON: &str = "The request was initiated";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    next_id: u64,
    requests: Vec<Request>,
    components: BTreeMap<ContentKey, Component>,
}

/// Requests plus the shared package and dependency records.
#[derive(Debug)]
pub struct Store {
    requests: DashMap<u64, Request>,
    components: DashMap<ContentKey, Component>,
    next_id: AtomicU64,
    bundles_dir: PathBuf,
    state_file: Option<PathBuf>,
    persist_guard: tokio::sync::Mutex<()>,
}

impl Store {
    /// A store that lives only in memory.
    pub fn in_memory(bundles_dir: impl Into<PathBuf>) -> Self {
        Self {
            requests: DashMap::new(),
            components: DashMap::new(),
            next_id: AtomicU64::new(1),
            bundles_dir: bundles_dir.into(),
            state_file: None,
            persist_guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Open the store backed by the configured state file, loading it if present.
    pub async fn open(config: &Config) -> Result<Self> {
        let state_file = config.state_file();
        let mut store = Self::in_memory(config.bundles_dir());

        if tokio::fs::try_exists(&state_file).await.unwrap_or(false) {
            let content = tokio::fs::read(&state_file)
                .await
                .with_context(|| format!("Failed to read state file: {}", state_file.display()))?;
            let snapshot: Snapshot = serde_json::from_slice(&content)
                .with_context(|| format!("Failed to parse state file: {}", state_file.display()))?;

            let highest = snapshot.requests.iter().map(|r| r.id).max().unwrap_or(0);
            store.next_id = AtomicU64::new(snapshot.next_id.max(highest + 1));
            for request in snapshot.requests {
                store.requests.insert(request.id, request);
            }
            for (key, component) in snapshot.components {
                store.components.insert(key, component);
            }
            tracing::debug!(
                target: "store",
                "Loaded {} requests from {}",
                store.requests.len(),
                state_file.display()
            );
        }

        store.state_file = Some(state_file);
        Ok(store)
    }

    /// Directory holding bundles and per-request temporary directories.
    pub fn bundles_dir(&self) -> &Path {
        &self.bundles_dir
    }

    /// Store a validated submission and put it in `in_progress`.
    pub async fn create_request(&self, new: NewRequest) -> Result<Request> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut request = Request::new(id, new);
        request.add_state(StateKind::InProgress.as_str(), INITIAL_REASON)?;
        self.requests.insert(id, request.clone());
        tracing::info!(target: "store", "Created request {} for {}", id, request.repo);
        self.persist().await?;
        Ok(request)
    }

    /// A copy of a request.
    pub fn get(&self, id: u64) -> Result<Request, DepcacheError> {
        self.requests
            .get(&id)
            .map(|r| r.clone())
            .ok_or(DepcacheError::RequestNotFound {
                id,
            })
    }

    /// Every request, ordered by id.
    pub fn list(&self) -> Vec<Request> {
        let mut requests: Vec<Request> = self.requests.iter().map(|r| r.clone()).collect();
        requests.sort_by_key(|r| r.id);
        requests
    }

    /// Apply a state transition and its side effects.
    ///
    /// Entering `complete` or `failed` removes the request's temporary
    /// directory; marking a non-failed request `stale` removes its bundle.
    /// Returns `false` when the state and reason already matched.
    pub async fn set_state(&self, id: u64, state: &str, reason: &str) -> Result<bool> {
        let (previous, changed) = {
            let mut request = self.requests.get_mut(&id).ok_or(DepcacheError::RequestNotFound {
                id,
            })?;
            let previous = request.state();
            let changed = request.add_state(state, reason)?;
            (previous, changed)
        };
        if !changed {
            return Ok(false);
        }

        let new_state: StateKind = state.parse()?;
        match new_state {
            StateKind::Stale if previous != Some(StateKind::Failed) => {
                let bundle = bundle::bundle_archive_path(&self.bundles_dir, id);
                tracing::info!(target: "store", "Deleting the bundle of stale request {}", id);
                remove_file_if_exists(&bundle)?;
            }
            StateKind::Complete | StateKind::Failed => {
                remove_dir_if_exists(&bundle::temp_dir(&self.bundles_dir, id))?;
            }
            _ => {}
        }

        self.persist().await?;
        Ok(true)
    }

    /// Move a request to `failed`, classifying the error.
    ///
    /// Results stored before the failure are dropped.
    ///
    /// Typed errors found anywhere in the chain provide the reason text and
    /// the origin/type tags; anything else is recorded as an unclassified
    /// server fault.
    pub async fn record_failure(&self, id: u64, error: &anyhow::Error) -> Result<()> {
        let (reason, failure) = match find_depcache_error(error) {
            Some(typed) => {
                let failure = match (typed.origin(), typed.error_type()) {
                    (Some(origin), Some(error_type)) => Some(FailureClass {
                        origin,
                        error_type: error_type.to_string(),
                    }),
                    _ => None,
                };
                (typed.to_string(), failure)
            }
            None => (
                format!("An unexpected error occurred: {error:#}"),
                Some(FailureClass {
                    origin: ErrorOrigin::Server,
                    error_type: "UnknownError".to_string(),
                }),
            ),
        };

        self.set_state(id, StateKind::Failed.as_str(), &reason).await?;
        if let Some(mut request) = self.requests.get_mut(&id) {
            request.failure = failure;
            request.packages.clear();
            request.dependencies.clear();
            request.environment_variables.clear();
        }
        self.persist().await
    }

    /// Get or create the shared record for a component.
    pub fn intern(&self, component: &Component) -> ContentKey {
        let key = component.content_key();
        self.components.entry(key.clone()).or_insert_with(|| component.clone());
        key
    }

    /// Number of shared package and dependency records.
    pub fn components_count(&self) -> usize {
        self.components.len()
    }

    /// Associate resolved packages and their dependencies with a request.
    pub async fn add_results(&self, id: u64, packages: &[Package]) -> Result<()> {
        let mut package_rows = Vec::new();
        let mut dependency_rows = Vec::new();
        for package in packages {
            let package_key = self.intern(&package.component);
            package_rows.push(RequestPackage {
                package: package_key.clone(),
                path: package.path.clone(),
            });
            for dependency in &package.dependencies {
                dependency_rows.push(RequestDependency {
                    package: package_key.clone(),
                    dependency: self.intern(&dependency.component),
                    replaces: dependency.replaces.as_ref().map(|r| self.intern(r)),
                });
            }
        }

        {
            let mut request = self.requests.get_mut(&id).ok_or(DepcacheError::RequestNotFound {
                id,
            })?;
            for row in package_rows {
                if !request.packages.contains(&row) {
                    request.packages.push(row);
                }
            }
            for row in dependency_rows {
                if !request.dependencies.contains(&row) {
                    request.dependencies.push(row);
                }
            }
        }
        self.persist().await
    }

    /// Attach environment variables to a request, later values winning.
    pub async fn set_environment(&self, id: u64, variables: BTreeMap<String, EnvVar>) -> Result<()> {
        {
            let mut request = self.requests.get_mut(&id).ok_or(DepcacheError::RequestNotFound {
                id,
            })?;
            request.environment_variables.extend(variables);
        }
        self.persist().await
    }

    /// Rebuild the full package list of a request from the shared records.
    pub fn request_packages(&self, id: u64) -> Result<Vec<Package>, DepcacheError> {
        let request = self.get(id)?;
        let lookup = |key: &ContentKey| {
            self.components.get(key).map(|c| c.clone()).ok_or_else(|| DepcacheError::Other {
                message: format!("Request {id} references an unknown package record {key}"),
            })
        };

        let mut packages = Vec::new();
        for row in &request.packages {
            let mut dependencies = Vec::new();
            for dep in request.dependencies.iter().filter(|d| d.package == row.package) {
                dependencies.push(Dependency {
                    component: lookup(&dep.dependency)?,
                    replaces: dep.replaces.as_ref().map(lookup).transpose()?,
                });
            }
            packages.push(
                Package::new(lookup(&row.package)?)
                    .at_path(row.path.as_deref())
                    .with_dependencies(dependencies),
            );
        }
        Ok(packages)
    }

    /// Write the state file, if any.
    pub async fn persist(&self) -> Result<()> {
        let Some(state_file) = &self.state_file else {
            return Ok(());
        };

        let _guard = self.persist_guard.lock().await;
        let snapshot = Snapshot {
            next_id: self.next_id.load(Ordering::SeqCst),
            requests: self.list(),
            components: self
                .components
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        };
        let content = serde_json::to_vec_pretty(&snapshot)?;

        let dir = state_file.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let _lock = FileLock::acquire(&dir, "state").await?;
        let path = state_file.clone();
        tokio::task::spawn_blocking(move || atomic_write(&path, &content))
            .await
            .context("Failed to spawn blocking task for state write")??;
        tracing::trace!(target: "store", "Persisted state to {}", state_file.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::PackageType;
    use crate::request::PackageManager;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn submission() -> NewRequest {
        NewRequest {
            repo: "https://github.com/org/project".to_string(),
            git_ref: "c".repeat(40),
            pkg_managers: vec![PackageManager::Gomod],
            packages_config: BTreeMap::new(),
            dependency_replacements: Vec::new(),
            flags: BTreeSet::new(),
            user: Some("alice".to_string()),
        }
    }

    fn module_with_deps() -> Package {
        Package::new(Component::new("example.com/m", PackageType::Gomod, "v1.0.0")).with_dependencies(
            vec![Dependency {
                component: Component::new("github.com/pkg/errors", PackageType::Gomod, "v0.9.1"),
                replaces: Some(Component::new("github.com/pkg/errors", PackageType::Gomod, "v0.8.1")),
            }],
        )
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_start_in_progress() {
        let temp = TempDir::new().unwrap();
        let store = Store::in_memory(temp.path());
        let first = store.create_request(submission()).await.unwrap();
        let second = store.create_request(submission()).await.unwrap();
        assert!(second.id > first.id);
        assert_eq!(first.state(), Some(StateKind::InProgress));
        assert_eq!(first.state_history[0].reason, INITIAL_REASON);
    }

    #[tokio::test]
    async fn test_components_shared_across_requests() {
        let temp = TempDir::new().unwrap();
        let store = Store::in_memory(temp.path());
        let a = store.create_request(submission()).await.unwrap();
        let b = store.create_request(submission()).await.unwrap();
        store.add_results(a.id, &[module_with_deps()]).await.unwrap();
        store.add_results(b.id, &[module_with_deps()]).await.unwrap();
        // module, dependency and the replaced version
        assert_eq!(store.components_count(), 3);

        let packages = store.request_packages(b.id).unwrap();
        assert_eq!(packages, vec![module_with_deps()]);
        assert_eq!(store.get(b.id).unwrap().dependencies_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_intern_converges() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(Store::in_memory(temp.path()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.intern(&Component::new("left-pad", PackageType::Npm, "1.3.0"))
            }));
        }
        let mut keys = BTreeSet::new();
        for handle in handles {
            keys.insert(handle.await.unwrap());
        }
        assert_eq!(keys.len(), 1);
        assert_eq!(store.components_count(), 1);
    }

    #[tokio::test]
    async fn test_record_failure_classifies() {
        let temp = TempDir::new().unwrap();
        let store = Store::in_memory(temp.path());
        let request = store.create_request(submission()).await.unwrap();
        let error = anyhow::Error::new(DepcacheError::ReplacementsDontApply {
            package_manager: "gomod".to_string(),
            names: vec!["github.com/pkg/errors".to_string()],
        })
        .context("Resolving gomod");
        store.record_failure(request.id, &error).await.unwrap();

        let failed = store.get(request.id).unwrap();
        assert_eq!(failed.state(), Some(StateKind::Failed));
        assert_eq!(
            failed.current_state().unwrap().reason,
            "The following gomod dependency replacements don't apply: github.com/pkg/errors"
        );
        let failure = failed.failure.unwrap();
        assert_eq!(failure.origin, ErrorOrigin::Client);
        assert_eq!(failure.error_type, "InvalidRequestData");
    }

    #[tokio::test]
    async fn test_record_failure_drops_stored_results() {
        let temp = TempDir::new().unwrap();
        let store = Store::in_memory(temp.path());
        let request = store.create_request(submission()).await.unwrap();
        store.add_results(request.id, &[module_with_deps()]).await.unwrap();
        store
            .set_environment(request.id, BTreeMap::from([("GOPATH".to_string(), EnvVar::path("deps/gomod"))]))
            .await
            .unwrap();

        store.record_failure(request.id, &anyhow::anyhow!("disk full")).await.unwrap();
        let failed = store.get(request.id).unwrap();
        assert!(failed.packages.is_empty());
        assert!(failed.dependencies.is_empty());
        assert!(failed.environment_variables.is_empty());
        assert!(store.request_packages(request.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_removes_bundle_and_terminal_removes_temp() {
        let temp = TempDir::new().unwrap();
        let store = Store::in_memory(temp.path());
        let request = store.create_request(submission()).await.unwrap();

        let temp_dir = bundle::temp_dir(temp.path(), request.id);
        std::fs::create_dir_all(&temp_dir).unwrap();
        let archive = bundle::bundle_archive_path(temp.path(), request.id);
        std::fs::write(&archive, b"bundle").unwrap();

        store.set_state(request.id, "complete", "Completed successfully").await.unwrap();
        assert!(!temp_dir.exists());
        assert!(archive.exists());

        store.set_state(request.id, "stale", "The request has expired").await.unwrap();
        assert!(!archive.exists());
        assert!(!store.set_state(request.id, "stale", "The request has expired").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_request() {
        let temp = TempDir::new().unwrap();
        let store = Store::in_memory(temp.path());
        assert!(matches!(store.get(42), Err(DepcacheError::RequestNotFound { id: 42 })));
        assert!(store.set_state(42, "stale", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_root(temp.path());
        let id = {
            let store = Store::open(&config).await.unwrap();
            let request = store.create_request(submission()).await.unwrap();
            store.add_results(request.id, &[module_with_deps()]).await.unwrap();
            store
                .set_environment(
                    request.id,
                    BTreeMap::from([("GOFLAGS".to_string(), EnvVar::literal("-mod=vendor"))]),
                )
                .await
                .unwrap();
            request.id
        };

        let reopened = Store::open(&config).await.unwrap();
        let request = reopened.get(id).unwrap();
        assert_eq!(request.user.as_deref(), Some("alice"));
        assert_eq!(request.environment_variables["GOFLAGS"].value, "-mod=vendor");
        assert_eq!(reopened.request_packages(id).unwrap(), vec![module_with_deps()]);
        let next = reopened.create_request(submission()).await.unwrap();
        assert!(next.id > id);
    }
}
