use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;

use crate::common::TestHome;

fn depcache(home: &TestHome) -> Command {
    let mut cmd = Command::cargo_bin("depcache").unwrap();
    cmd.current_dir(home.path())
        .env("DEPCACHE_HOME", home.home())
        .env_remove("DEPCACHE_CONFIG")
        .env_remove("RUST_LOG")
        .env("NO_COLOR", "1");
    cmd
}

/// An empty home lists no requests
#[test]
fn test_show_empty_home() {
    let home = TestHome::new().unwrap();
    depcache(&home).arg("show").assert().success().stdout(predicate::str::diff("[]\n"));
}

/// Submitting, inspecting, downloading and expiring a request
#[test]
#[serial]
fn test_request_lifecycle() {
    let home = TestHome::new().unwrap();
    let commit = home.upstream.init_with_files(&[("README.md", "hello\n")]).unwrap();
    let payload = home.write_payload(&commit, &["git-submodule"]).unwrap();

    let output = home.run_depcache(&["submit", payload.to_str().unwrap(), "--wait"]).unwrap();
    output.assert_success();
    let view = output.json();
    assert_eq!(view["id"], 1);
    assert_eq!(view["state"], "complete");
    assert_eq!(view["state_reason"], "Completed successfully");
    assert!(view.get("error_origin").is_none());

    let shown = home.run_depcache(&["show", "1", "--full"]).unwrap();
    shown.assert_success();
    let history = shown.json()["state_history"].as_array().unwrap().clone();
    assert_eq!(history.len(), 5);
    assert_eq!(history[0]["state"], "complete");

    let manifest = home.run_depcache(&["manifest", "1"]).unwrap();
    manifest.assert_success();
    assert_eq!(manifest.json()["metadata"]["icm_version"], 1);

    let bundle = home.path().join("bundle.tar.gz");
    depcache(&home)
        .args(["download", "1", "-o", bundle.to_str().unwrap()])
        .assert()
        .success();
    let entries = depcache::utils::tarball::list_entries(&bundle).unwrap();
    assert!(entries.contains(&"app/README.md".to_string()));

    depcache(&home)
        .args(["stale", "1", "--reason", "The request has expired"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"stale\""));
    depcache(&home)
        .args(["download", "1", "-o", bundle.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("the request is stale"));
    depcache(&home).args(["manifest", "1"]).assert().success();

    depcache(&home)
        .args(["cache", "prune", "--older-than-days", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 source archive(s)"));
}

/// Invalid payloads are rejected before any request exists
#[test]
fn test_submit_rejects_bad_ref() {
    let home = TestHome::new().unwrap();
    home.upstream.init_with_files(&[("README.md", "hello\n")]).unwrap();
    let payload = home.write_payload("main", &["git-submodule"]).unwrap();

    depcache(&home)
        .args(["submit", payload.to_str().unwrap()])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("The \"ref\" parameter must be a 40 character hex string"));
    depcache(&home).arg("show").assert().success().stdout(predicate::str::diff("[]\n"));
}

/// A failed request is reported through the exit code with its reason
#[test]
#[serial]
fn test_failed_request_exit_code() {
    let home = TestHome::new().unwrap();
    let commit = home.upstream.init_with_files(&[("package.json", "{}")]).unwrap();
    let payload = home.write_payload(&commit, &["npm"]).unwrap();

    let output = home.run_depcache(&["submit", payload.to_str().unwrap(), "--wait"]).unwrap();
    output.assert_failure();
    assert_eq!(output.json()["state"], "failed");
    assert_eq!(output.json()["error_origin"], "client");
    assert!(output.stderr.contains("package-lock.json"), "{}", output.stderr);

    depcache(&home)
        .args(["manifest", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("only available for requests in the \"complete\" or \"stale\" state"));

    // going stale does not make a failed request's manifest available
    depcache(&home).args(["stale", "1", "--reason", "The request has expired"]).assert().success();
    depcache(&home)
        .args(["manifest", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("that completed successfully, request 1 is stale"));
}

/// Unknown ids are reported as such
#[test]
fn test_show_unknown_request() {
    let home = TestHome::new().unwrap();
    depcache(&home)
        .args(["show", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Request 42 was not found"));
}
