//! Scripted stand-ins for the Go toolchain and the registry fetcher

use anyhow::Result;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use crate::core::DepcacheError;
use crate::pkg_managers::ArtifactFetcher;
use crate::pkg_managers::gomod::{GOMOD_FAILURE, GoToolchain, LIST_DEPS_TEMPLATE};

/// One recorded `go` invocation.
#[derive(Debug, Clone)]
pub struct GoCall {
    /// Arguments after `go`
    pub args: Vec<String>,
    /// Environment the command ran with
    pub env: BTreeMap<String, String>,
}

/// A [`GoToolchain`] answering from canned output.
///
/// Responses are matched on argument prefixes, the longest prefix winning.
/// Unmatched commands succeed with empty output. `go mod download` and
/// `go mod vendor` materialise the configured files the way the real tool
/// would; `go mod download` skips files already in `GOMODCACHE` and records
/// the ones it had to fetch.
#[derive(Debug, Default)]
pub struct FakeGo {
    responses: Vec<(Vec<String>, Result<String, String>)>,
    download_files: Vec<(String, String)>,
    vendor_files: Vec<(String, String)>,
    calls: Mutex<Vec<GoCall>>,
    downloaded: Mutex<Vec<String>>,
}

impl FakeGo {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(mut self, prefix: &[&str], response: Result<String, String>) -> Self {
        let prefix: Vec<String> = prefix.iter().map(ToString::to_string).collect();
        self.responses.retain(|(existing, _)| *existing != prefix);
        self.responses.push((prefix, response));
        self
    }

    /// Print `output` for commands starting with `prefix`.
    pub fn respond(self, prefix: &[&str], output: &str) -> Self {
        self.script(prefix, Ok(output.to_string()))
    }

    /// Output of `go list -deps` for `package`.
    pub fn respond_deps(self, package: &str, output: &str) -> Self {
        self.respond(&["list", "-deps", "-f", LIST_DEPS_TEMPLATE, package], output)
    }

    /// Fail commands starting with `prefix`.
    pub fn fail_on(self, prefix: &[&str], stderr: &str) -> Self {
        self.script(prefix, Err(stderr.to_string()))
    }

    /// File placed in the module download cache by `go mod download`.
    pub fn with_download_file(mut self, relative: &str, content: &str) -> Self {
        self.download_files.push((relative.to_string(), content.to_string()));
        self
    }

    /// File written to `vendor/` by `go mod vendor`.
    pub fn with_vendor_file(mut self, relative: &str, content: &str) -> Self {
        self.vendor_files.push((relative.to_string(), content.to_string()));
        self
    }

    /// Every invocation so far.
    pub fn calls(&self) -> Vec<GoCall> {
        self.calls.lock().expect("calls lock poisoned").clone()
    }

    /// Module cache files fetched by `go mod download` so far.
    pub fn downloaded(&self) -> Vec<String> {
        self.downloaded.lock().expect("downloaded lock poisoned").clone()
    }

    /// Whether a command with exactly `args` ran.
    pub fn called_with(&self, args: &[&str]) -> bool {
        self.env_of(args).is_some()
    }

    /// Environment of the first command with exactly `args`.
    pub fn env_of(&self, args: &[&str]) -> Option<BTreeMap<String, String>> {
        self.calls().into_iter().find(|call| call.args == args).map(|call| call.env)
    }

    fn materialise(files: &[(String, String)], root: &Path) -> Result<()> {
        for (relative, content) in files {
            let path = root.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)?;
        }
        Ok(())
    }
}

impl GoToolchain for FakeGo {
    fn run<'a>(
        &'a self,
        args: &'a [&'a str],
        dir: &'a Path,
        env: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.calls.lock().expect("calls lock poisoned").push(GoCall {
                args: args.iter().map(ToString::to_string).collect(),
                env: env.clone(),
            });

            if args.starts_with(&["mod", "download"]) {
                if let Some(modcache) = env.get("GOMODCACHE") {
                    let root = Path::new(modcache).join("cache/download");
                    let missing: Vec<(String, String)> =
                        self.download_files.iter().filter(|(relative, _)| !root.join(relative).exists()).cloned().collect();
                    Self::materialise(&missing, &root)?;
                    self.downloaded
                        .lock()
                        .expect("downloaded lock poisoned")
                        .extend(missing.into_iter().map(|(relative, _)| relative));
                }
            } else if args.starts_with(&["mod", "vendor"]) {
                Self::materialise(&self.vendor_files, &dir.join("vendor"))?;
            }

            let matched = self
                .responses
                .iter()
                .filter(|(prefix, _)| args.len() >= prefix.len() && args[..prefix.len()] == prefix[..])
                .max_by_key(|(prefix, _)| prefix.len());
            match matched {
                Some((_, Ok(output))) => Ok(output.clone()),
                Some((_, Err(stderr))) => Err(DepcacheError::SubprocessCall {
                    command: format!("go {}", args.join(" ")),
                    message: GOMOD_FAILURE.to_string(),
                    stderr: stderr.clone(),
                    code: Some(1),
                }
                .into()),
                None => Ok(String::new()),
            }
        })
    }
}

/// An [`ArtifactFetcher`] serving in-memory content and counting requests.
#[derive(Debug, Default)]
pub struct FakeFetcher {
    files: HashMap<String, Vec<u8>>,
    json: HashMap<String, serde_json::Value>,
    requests: Mutex<HashMap<String, usize>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `content` at `url`.
    pub fn with_file(mut self, url: &str, content: &[u8]) -> Self {
        self.files.insert(url.to_string(), content.to_vec());
        self
    }

    /// Serve a JSON document at `url`.
    pub fn with_json(mut self, url: &str, value: serde_json::Value) -> Self {
        self.json.insert(url.to_string(), value);
        self
    }

    /// How many times `url` was requested.
    pub fn download_count(&self, url: &str) -> usize {
        self.requests.lock().expect("requests lock poisoned").get(url).copied().unwrap_or(0)
    }

    fn record(&self, url: &str) {
        *self.requests.lock().expect("requests lock poisoned").entry(url.to_string()).or_default() += 1;
    }

    fn not_found(url: &str) -> DepcacheError {
        DepcacheError::Network {
            operation: format!("GET {url}"),
            reason: "HTTP 404 Not Found".to_string(),
        }
    }
}

impl ArtifactFetcher for FakeFetcher {
    fn download<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(url);
            let content = self.files.get(url).ok_or_else(|| Self::not_found(url))?;
            tokio::fs::write(dest, content).await?;
            Ok(())
        })
    }

    fn get_json<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            self.record(url);
            Ok(self.json.get(url).cloned().ok_or_else(|| Self::not_found(url))?)
        })
    }
}
