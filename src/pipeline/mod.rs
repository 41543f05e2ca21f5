//! Request orchestration
//!
//! A request runs as a fixed sequence of [`Step`]s: fetch the source, run
//! each selected resolver in request order, assemble the bundle, complete.
//! Before every step the driver records the step in the request's state
//! history (`in_progress` with a new reason) and stops quietly if the request
//! left `in_progress` in the meantime, e.g. because it was marked stale. The
//! first failing step ends the run and the error is recorded on the request
//! as a `failed` state with its classification.
//!
//! Steps within one request never overlap. Different requests run
//! concurrently through the [`worker::WorkerPool`]; a per-request mutex
//! guarantees a request is driven by one worker at a time.

pub mod worker;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::archive::SourceArchiveCache;
use crate::bundle::{BundleDir, BundleOptions};
use crate::config::Config;
use crate::core::DepcacheError;
use crate::git::is_git_installed;
use crate::package::PackagesData;
use crate::pkg_managers::{
    ArtifactFetcher, DependencyCache, GoCommand, GoToolchain, HttpFetcher, ResolveContext, ResolveOutput,
    Resolver,
};
use crate::request::{Flag, PackageManager, Request, StateKind, validate_payload};
use crate::store::Store;

pub use worker::{WorkQueue, WorkerPool};

/// Reason recorded when a request completes.
pub const COMPLETE_REASON: &str = "Completed successfully";

/// One unit of a request's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Fetch the source archive and extract it into the bundle directory
    FetchSource,
    /// Run one package manager's resolver
    Resolve(PackageManager),
    /// Write the bundle, then store the results
    Assemble,
    /// Mark the request complete
    Complete,
}

impl Step {
    /// The state reason recorded when the step starts.
    pub fn reason(self) -> String {
        match self {
            Self::FetchSource => "Fetching the application source".to_string(),
            Self::Resolve(pm) => format!("Fetching the {pm} dependencies"),
            Self::Assemble => "Assembling the bundle".to_string(),
            Self::Complete => COMPLETE_REASON.to_string(),
        }
    }
}

/// The steps of `request`, in execution order.
pub fn plan(request: &Request) -> Vec<Step> {
    let mut steps = vec![Step::FetchSource];
    steps.extend(request.pkg_managers.iter().copied().map(Step::Resolve));
    steps.push(Step::Assemble);
    steps.push(Step::Complete);
    steps
}

/// Drives requests through their steps.
pub struct Pipeline {
    config: Config,
    store: Arc<Store>,
    archives: SourceArchiveCache,
    deps_cache: DependencyCache,
    go: Arc<dyn GoToolchain>,
    active: DashMap<u64, Arc<Mutex<()>>>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: Arc<Store>,
        fetcher: Arc<dyn ArtifactFetcher>,
        go: Arc<dyn GoToolchain>,
    ) -> Self {
        let archives = SourceArchiveCache::new(config.sources_dir());
        let deps_cache = DependencyCache::new(config.deps_cache_dir(), fetcher);
        Self {
            config,
            store,
            archives,
            deps_cache,
            go,
            active: DashMap::new(),
        }
    }

    /// A pipeline talking to the real registries and Go toolchain, with the
    /// store opened from the configured state file.
    pub async fn from_config(config: Config) -> Result<Self> {
        if !is_git_installed() {
            return Err(DepcacheError::ConfigError {
                message: "git is not installed or not found in PATH".to_string(),
            }
            .into());
        }
        let store = Arc::new(Store::open(&config).await?);
        let fetcher = Arc::new(HttpFetcher::new()?);
        let go = Arc::new(GoCommand::new(config.subprocess_timeout()));
        Ok(Self::new(config, store, fetcher, go))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn archives(&self) -> &SourceArchiveCache {
        &self.archives
    }

    /// Validate a submission payload and create the request.
    pub async fn submit(&self, payload: &Value) -> Result<Request> {
        let new = validate_payload(payload, &self.config.enabled_package_managers)?;
        self.store.create_request(new).await
    }

    /// Run every remaining step of request `id`.
    ///
    /// Failures are recorded on the request rather than returned; the
    /// returned state is the request's state afterwards, or `None` when
    /// another worker is already driving it.
    pub async fn process(&self, id: u64) -> Result<Option<StateKind>> {
        let lock = self.active.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone();
        let Ok(guard) = lock.try_lock() else {
            tracing::warn!(target: "pipeline", "Request {} is already being processed", id);
            return Ok(None);
        };

        // the failure is recorded before the request is released to other workers
        let recorded = match self.run(id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(target: "pipeline", "Request {} failed: {:#}", id, e);
                self.store.record_failure(id, &e).await
            }
        };
        drop(guard);
        self.active.remove_if(&id, |_, active| Arc::ptr_eq(active, &lock));
        recorded?;
        Ok(self.store.get(id)?.state())
    }

    fn in_progress(&self, id: u64) -> Result<bool> {
        Ok(self.store.get(id)?.state() == Some(StateKind::InProgress))
    }

    async fn run(&self, id: u64) -> Result<()> {
        let request = self.store.get(id)?;
        let bundle = BundleDir::new(self.store.bundles_dir(), id);
        let options = BundleOptions {
            include_git_dir: request.has_flag(Flag::IncludeGitDir),
            remove_unsafe_symlinks: request.has_flag(Flag::RemoveUnsafeSymlinks),
        };
        let mut results = ResolveOutput::default();

        for step in plan(&request) {
            if !self.in_progress(id)? {
                tracing::info!(target: "pipeline", "Request {} is no longer in progress, stopping", id);
                return Ok(());
            }
            if step == Step::Complete {
                self.store.set_state(id, StateKind::Complete.as_str(), COMPLETE_REASON).await?;
                break;
            }
            self.store.set_state(id, StateKind::InProgress.as_str(), &step.reason()).await?;
            tracing::info!(target: "pipeline", "(request {}) {}", id, step.reason());

            match step {
                Step::FetchSource => {
                    let archive =
                        self.archives.fetch(&request.repo, &request.git_ref, request.wants_submodules()).await?;
                    bundle.prepare_source(&archive.path, options).await?;
                }
                Step::Resolve(pm) => {
                    let ctx = ResolveContext {
                        request: &request,
                        config: &self.config,
                        bundle_dir: bundle.root(),
                        deps_cache: &self.deps_cache,
                        archives: &self.archives,
                        go: self.go.as_ref(),
                    };
                    let output = Resolver::for_package_manager(pm)
                        .resolve(&ctx)
                        .await
                        .with_context(|| format!("Processing {pm} dependencies failed"))?;
                    results.merge(output);
                }
                Step::Assemble => {
                    let mut data = PackagesData::new();
                    data.extend(std::mem::take(&mut results.packages))?;
                    bundle.assemble(options).await?;
                    self.store.add_results(id, &data.sorted()).await?;
                    self.store.set_environment(id, std::mem::take(&mut results.environment)).await?;
                }
                Step::Complete => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::bundle_archive_path;
    use crate::core::ErrorOrigin;
    use crate::test_utils::{FakeFetcher, FakeGo, TestGit};
    use crate::utils::tarball::list_entries;
    use serde_json::json;
    use tempfile::TempDir;

    struct Setup {
        temp: TempDir,
        pipeline: Pipeline,
        repo: TestGit,
        commit: String,
    }

    fn setup(files: &[(&str, &str)], go: FakeGo) -> Setup {
        let temp = TempDir::new().unwrap();
        let repo = TestGit::new(temp.path().join("upstream"));
        let commit = repo.init_with_files(files).unwrap();
        let config = Config::for_root(temp.path().join("root"));
        let store = Arc::new(Store::in_memory(config.bundles_dir()));
        let pipeline = Pipeline::new(config, store, Arc::new(FakeFetcher::new()), Arc::new(go));
        Setup {
            temp,
            pipeline,
            repo,
            commit,
        }
    }

    fn payload(setup: &Setup, pkg_managers: &[&str]) -> Value {
        json!({"repo": setup.repo.file_url(), "ref": setup.commit, "pkg_managers": pkg_managers})
    }

    #[test]
    fn test_plan_follows_request_order() {
        let request = crate::test_utils::test_request(&[PackageManager::Npm, PackageManager::Gomod], &[]);
        assert_eq!(
            plan(&request),
            vec![
                Step::FetchSource,
                Step::Resolve(PackageManager::Npm),
                Step::Resolve(PackageManager::Gomod),
                Step::Assemble,
                Step::Complete,
            ]
        );
    }

    #[tokio::test]
    async fn test_git_submodule_request_completes() {
        let setup = setup(&[("README.md", "hello\n")], FakeGo::new());
        let request = setup.pipeline.submit(&payload(&setup, &["git-submodule"])).await.unwrap();

        let state = setup.pipeline.process(request.id).await.unwrap();
        assert_eq!(state, Some(StateKind::Complete));

        let stored = setup.pipeline.store().get(request.id).unwrap();
        let reasons: Vec<&str> = stored.state_history.iter().map(|s| s.reason.as_str()).collect();
        assert_eq!(
            reasons,
            vec![
                "The request was initiated",
                "Fetching the application source",
                "Fetching the git-submodule dependencies",
                "Assembling the bundle",
                COMPLETE_REASON,
            ]
        );

        let bundle = bundle_archive_path(setup.pipeline.store().bundles_dir(), request.id);
        let entries = list_entries(&bundle).unwrap();
        assert!(entries.contains(&"app/README.md".to_string()));
        assert!(!entries.iter().any(|e| e.starts_with("app/.git")));
        assert!(!crate::bundle::temp_dir(setup.pipeline.store().bundles_dir(), request.id).exists());
    }

    #[tokio::test]
    async fn test_resolver_failure_marks_request_failed() {
        let setup = setup(&[("README.md", "hello\n")], FakeGo::new());
        let request = setup.pipeline.submit(&payload(&setup, &["npm"])).await.unwrap();

        let state = setup.pipeline.process(request.id).await.unwrap();
        assert_eq!(state, Some(StateKind::Failed));
        let stored = setup.pipeline.store().get(request.id).unwrap();
        let failure = stored.failure.as_ref().unwrap();
        assert_eq!(failure.origin, ErrorOrigin::Client);
        assert!(stored.current_state().unwrap().reason.contains("package-lock.json"));
        assert!(!bundle_archive_path(setup.pipeline.store().bundles_dir(), request.id).exists());
    }

    #[tokio::test]
    async fn test_concurrent_processing_of_a_failing_request() {
        let setup = setup(&[("README.md", "hello\n")], FakeGo::new());
        let request = setup.pipeline.submit(&payload(&setup, &["npm"])).await.unwrap();

        let (first, second) = tokio::join!(setup.pipeline.process(request.id), setup.pipeline.process(request.id));
        let states = [first.unwrap(), second.unwrap()];
        assert!(states.contains(&Some(StateKind::Failed)), "{states:?}");
        assert!(states.iter().all(|s| matches!(s, None | Some(StateKind::Failed))), "{states:?}");

        // a later run finds the request failed and leaves it alone
        assert_eq!(setup.pipeline.process(request.id).await.unwrap(), Some(StateKind::Failed));
        let stored = setup.pipeline.store().get(request.id).unwrap();
        let states: Vec<StateKind> = stored.state_history.iter().map(|s| s.state).collect();
        assert_eq!(states.iter().filter(|s| **s == StateKind::Failed).count(), 1);
        assert_eq!(stored.state_history.len(), 4);
        assert!(setup.pipeline.active.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_repository_fails() {
        let setup = setup(&[("README.md", "hello\n")], FakeGo::new());
        let mut body = payload(&setup, &["git-submodule"]);
        body["repo"] = json!(format!("file://{}/missing", setup.temp.path().display()));
        let request = setup.pipeline.submit(&body).await.unwrap();

        assert_eq!(setup.pipeline.process(request.id).await.unwrap(), Some(StateKind::Failed));
        let failure = setup.pipeline.store().get(request.id).unwrap().failure.unwrap();
        assert_eq!(failure.error_type, "RepositoryAccessError");
    }

    #[tokio::test]
    async fn test_stale_request_is_not_resumed() {
        let setup = setup(&[("README.md", "hello\n")], FakeGo::new());
        let request = setup.pipeline.submit(&payload(&setup, &["git-submodule"])).await.unwrap();
        setup.pipeline.store().set_state(request.id, "stale", "The request has expired").await.unwrap();

        assert_eq!(setup.pipeline.process(request.id).await.unwrap(), Some(StateKind::Stale));
        let stored = setup.pipeline.store().get(request.id).unwrap();
        assert_eq!(stored.state_history.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_rejected() {
        let setup = setup(&[("README.md", "hello\n")], FakeGo::new());
        let err = setup
            .pipeline
            .submit(&json!({"repo": setup.repo.file_url(), "ref": "abc", "pkg_managers": ["gomod"]}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ref"));
        assert!(setup.pipeline.store().list().is_empty());
    }
}
