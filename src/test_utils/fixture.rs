//! Prepared request directories for resolver tests

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use super::{FakeFetcher, FakeGo, TestGit};
use crate::archive::SourceArchiveCache;
use crate::config::Config;
use crate::constants::APP_DIR;
use crate::pkg_managers::{DependencyCache, ResolveContext};
use crate::request::{Flag, NewRequest, PackageManager, Request};

/// A request for `https://github.com/org/project` with the given package managers and flags.
pub fn test_request(pkg_managers: &[PackageManager], flags: &[Flag]) -> Request {
    Request::new(
        1,
        NewRequest {
            repo: "https://github.com/org/project".to_string(),
            git_ref: "a".repeat(40),
            pkg_managers: pkg_managers.to_vec(),
            packages_config: BTreeMap::new(),
            dependency_replacements: Vec::new(),
            flags: flags.iter().copied().collect::<BTreeSet<_>>(),
            user: None,
        },
    )
}

/// Everything a [`ResolveContext`] borrows, rooted in a temporary directory.
///
/// The application source lives at `<bundle_dir>/app`.
pub struct ResolverFixture {
    pub temp: TempDir,
    pub config: Config,
    pub request: Request,
    pub deps_cache: DependencyCache,
    pub archives: SourceArchiveCache,
    pub go: FakeGo,
    pub fetcher: Arc<FakeFetcher>,
    pub bundle_dir: PathBuf,
}

impl ResolverFixture {
    pub fn new(request: Request) -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let config = Config::for_root(temp.path().join("root"));
        let fetcher = Arc::new(FakeFetcher::new());
        let deps_cache = DependencyCache::new(config.deps_cache_dir(), fetcher.clone());
        let archives = SourceArchiveCache::new(config.sources_dir());
        let bundle_dir = temp.path().join("bundle");
        std::fs::create_dir_all(bundle_dir.join(APP_DIR)).expect("Failed to create app dir");
        Self {
            temp,
            config,
            request,
            deps_cache,
            archives,
            go: FakeGo::new(),
            fetcher,
            bundle_dir,
        }
    }

    /// Fixture whose application directory is a git repository holding `files`.
    /// The request ref is set to the resulting commit.
    pub fn with_git_app(request: Request, files: &[(&str, &str)]) -> Self {
        let mut fixture = Self::new(request);
        let git = TestGit::new(fixture.app_dir());
        fixture.request.git_ref = git.init_with_files(files).expect("Failed to create app repository");
        fixture
    }

    /// Serve registry content from `fetcher`.
    pub fn with_fetcher(mut self, fetcher: FakeFetcher) -> Self {
        self.fetcher = Arc::new(fetcher);
        self.deps_cache = DependencyCache::new(self.config.deps_cache_dir(), self.fetcher.clone());
        self
    }

    pub fn app_dir(&self) -> PathBuf {
        self.bundle_dir.join(APP_DIR)
    }

    /// Write a file relative to the application directory.
    pub fn write_app(&self, relative: &str, content: &str) {
        let path = self.app_dir().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        std::fs::write(path, content).expect("Failed to write app file");
    }

    /// Tag the application repository's HEAD.
    pub fn tag_app(&self, tag: &str) {
        TestGit::new(self.app_dir()).tag(tag).expect("Failed to tag app repository");
    }

    pub fn deps_path(&self, relative: &str) -> PathBuf {
        self.bundle_dir.join("deps").join(relative)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn context(&self) -> ResolveContext<'_> {
        ResolveContext {
            request: &self.request,
            config: &self.config,
            bundle_dir: &self.bundle_dir,
            deps_cache: &self.deps_cache,
            archives: &self.archives,
            go: &self.go,
        }
    }
}
