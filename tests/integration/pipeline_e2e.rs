use depcache::bundle::bundle_archive_path;
use depcache::config::Config;
use depcache::content_manifest::generate;
use depcache::core::ErrorOrigin;
use depcache::pipeline::{Pipeline, WorkerPool};
use depcache::pkg_managers::gomod::LIST_DEPS_TEMPLATE;
use depcache::request::{EnvVar, StateKind};
use depcache::store::Store;
use depcache::test_utils::{FakeFetcher, FakeGo, TestGit, init_test_logging};
use depcache::utils::tarball::list_entries;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

const PACKAGE_LOCK: &str = r#"{
    "name": "web", "version": "1.0.0", "lockfileVersion": 1,
    "dependencies": {
        "left-pad": {"version": "1.3.0", "resolved": "https://registry.npmjs.org/left-pad/-/left-pad-1.3.0.tgz"}
    }
}"#;

fn scripted_go() -> FakeGo {
    FakeGo::new()
        .respond(&["list", "-mod", "readonly", "-m"], "example.com/m <nil> <nil>\ngithub.com/pkg/errors v0.9.1 <nil>\n")
        .respond(&["list", "-find"], "example.com/m\n")
        .respond(
            &["list", "-deps", "-f", LIST_DEPS_TEMPLATE, "example.com/m"],
            "github.com/pkg/errors github.com/pkg/errors v0.9.1\nexample.com/m example.com/m\n",
        )
        .with_download_file("github.com/pkg/errors/@v/list", "v0.9.1\n")
        .with_download_file("github.com/pkg/errors/@v/v0.9.1.zip", "zip")
}

struct Service {
    _temp: TempDir,
    upstream: TestGit,
    commit: String,
    pipeline: Arc<Pipeline>,
}

fn service(go: FakeGo, fetcher: FakeFetcher) -> Service {
    init_test_logging(None);
    let temp = TempDir::new().unwrap();
    let upstream = TestGit::new(temp.path().join("upstream"));
    let commit = upstream
        .init_with_files(&[
            ("go.mod", "module example.com/m\n"),
            ("main.go", "package main\n"),
            ("web/package.json", r#"{"name": "web", "version": "1.0.0"}"#),
            ("web/package-lock.json", PACKAGE_LOCK),
        ])
        .unwrap();
    upstream.tag("v1.0.0").unwrap();

    let config = Config::for_root(temp.path().join("root"));
    let store = Arc::new(Store::in_memory(config.bundles_dir()));
    let pipeline = Arc::new(Pipeline::new(config, store, Arc::new(fetcher), Arc::new(go)));
    Service {
        _temp: temp,
        upstream,
        commit,
        pipeline,
    }
}

async fn run_one(service: &Service, payload: serde_json::Value) -> u64 {
    let request = service.pipeline.submit(&payload).await.unwrap();
    let (queue, pool) = WorkerPool::spawn(service.pipeline.clone(), 2);
    queue.enqueue(request.id).await.unwrap();
    drop(queue);
    pool.join().await.unwrap();
    request.id
}

/// A gomod plus npm request produces one bundle holding both dependency trees
#[tokio::test]
async fn test_gomod_and_npm_request_end_to_end() {
    let fetcher =
        FakeFetcher::new().with_file("https://registry.npmjs.org/left-pad/-/left-pad-1.3.0.tgz", b"left-pad");
    let service = service(scripted_go(), fetcher);
    let id = run_one(
        &service,
        json!({
            "repo": service.upstream.file_url(),
            "ref": service.commit,
            "pkg_managers": ["gomod", "npm"],
            "packages": {"npm": [{"path": "web"}]},
        }),
    )
    .await;

    let store = service.pipeline.store();
    let request = store.get(id).unwrap();
    assert_eq!(request.state(), Some(StateKind::Complete), "{:?}", request.current_state());
    assert!(request.failure.is_none());
    assert_eq!(request.environment_variables["GOMODCACHE"], EnvVar::path("deps/gomod/pkg/mod"));

    let entries = list_entries(&bundle_archive_path(store.bundles_dir(), id)).unwrap();
    for expected in [
        "app/go.mod",
        "app/web/package-lock.json",
        "deps/gomod/pkg/mod/cache/download/github.com/pkg/errors/@v/v0.9.1.zip",
        "deps/npm/left-pad/left-pad-1.3.0.tgz",
    ] {
        assert!(entries.iter().any(|e| e == expected), "{expected} missing from {entries:#?}");
    }

    let packages = store.request_packages(id).unwrap();
    let manifest = generate(&request, &packages).unwrap();
    let contents = manifest["image_contents"].as_array().unwrap();
    assert_eq!(contents.len(), 2);
    let rendered = serde_json::to_string(contents).unwrap();
    assert!(rendered.contains("pkg:golang/github.com%2Fpkg%2Ferrors@v0.9.1"), "{rendered}");
    assert!(rendered.contains("pkg:npm/left-pad@1.3.0"), "{rendered}");
}

/// A failing resolver leaves a classified failure and no bundle
#[tokio::test]
async fn test_failed_go_command_is_classified() {
    let go = scripted_go().fail_on(&["mod", "download"], "go: github.com/pkg/errors@v0.9.1: unknown revision");
    let service = service(go, FakeFetcher::new());
    let id = run_one(
        &service,
        json!({"repo": service.upstream.file_url(), "ref": service.commit, "pkg_managers": ["gomod"]}),
    )
    .await;

    let store = service.pipeline.store();
    let request = store.get(id).unwrap();
    assert_eq!(request.state(), Some(StateKind::Failed));
    let failure = request.failure.as_ref().unwrap();
    assert_eq!(failure.origin, ErrorOrigin::Server);
    assert_eq!(failure.error_type, "SubprocessCallError");
    assert!(!bundle_archive_path(store.bundles_dir(), id).exists());
    assert!(store.request_packages(id).unwrap().is_empty());
}

/// A bundle that cannot be written leaves neither packages nor environment behind
#[tokio::test]
async fn test_assemble_failure_stores_no_results() {
    let service = service(scripted_go(), FakeFetcher::new());
    let request = service
        .pipeline
        .submit(&json!({"repo": service.upstream.file_url(), "ref": service.commit, "pkg_managers": ["gomod"]}))
        .await
        .unwrap();
    let store = service.pipeline.store();
    // a directory in the way of the final rename
    std::fs::create_dir_all(bundle_archive_path(store.bundles_dir(), request.id)).unwrap();

    assert_eq!(service.pipeline.process(request.id).await.unwrap(), Some(StateKind::Failed));
    let failed = store.get(request.id).unwrap();
    assert_eq!(failed.current_state().unwrap().state, StateKind::Failed);
    assert!(failed.packages.is_empty());
    assert!(failed.dependencies.is_empty());
    assert!(failed.environment_variables.is_empty());
    assert!(store.request_packages(request.id).unwrap().is_empty());
}

/// Requests survive a restart through the state file
#[tokio::test]
async fn test_state_file_round_trip() {
    let temp = TempDir::new().unwrap();
    let config = Config::for_root(temp.path());
    let upstream = TestGit::new(temp.path().join("upstream"));
    let commit = upstream.init_with_files(&[("README.md", "hi\n")]).unwrap();

    let pipeline = Pipeline::new(
        config.clone(),
        Arc::new(Store::open(&config).await.unwrap()),
        Arc::new(FakeFetcher::new()),
        Arc::new(FakeGo::new()),
    );
    let request = pipeline
        .submit(&json!({"repo": upstream.file_url(), "ref": commit, "pkg_managers": ["git-submodule"]}))
        .await
        .unwrap();
    assert_eq!(pipeline.process(request.id).await.unwrap(), Some(StateKind::Complete));

    let reopened = Store::open(&config).await.unwrap();
    let stored = reopened.get(request.id).unwrap();
    assert_eq!(stored.state(), Some(StateKind::Complete));
    assert_eq!(stored.state_history.len(), 5);

    let next = reopened
        .create_request(depcache::request::validate_payload(
            &json!({"repo": upstream.file_url(), "ref": commit}),
            &config.enabled_package_managers,
        )
        .unwrap())
        .await
        .unwrap();
    assert_eq!(next.id, request.id + 1);
}
