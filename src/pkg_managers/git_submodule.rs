//! Git submodules reported as packages
//!
//! Submodule content is already part of the source archive, so nothing is
//! downloaded. Each submodule becomes a package at its path whose version is
//! `<url>#<commit>`.

use anyhow::Result;

use super::{ResolveContext, ResolveOutput};
use crate::git::GitRepo;
use crate::package::{Component, Package, PackageType};

pub async fn resolve(ctx: &ResolveContext<'_>) -> Result<ResolveOutput> {
    let repo = GitRepo::new(ctx.source_dir());
    let mut output = ResolveOutput::default();
    for submodule in repo.submodules().await? {
        tracing::debug!(
            target: "resolver::git_submodule",
            "({}) Adding submodule {} at {}",
            ctx.label(),
            submodule.name,
            submodule.path
        );
        let version = format!("{}#{}", submodule.url, submodule.sha);
        output.packages.push(
            Package::new(Component::new(&submodule.name, PackageType::GitSubmodule, version))
                .at_path(Some(submodule.path.as_str())),
        );
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::PackageManager;
    use crate::test_utils::{ResolverFixture, TestGit, test_request};

    #[tokio::test]
    async fn test_submodules_become_packages() {
        let fixture = ResolverFixture::new(test_request(&[PackageManager::GitSubmodule], &[]));
        let sub = TestGit::new(fixture.root().join("sub"));
        let sub_commit = sub.init_with_files(&[("lib.c", "int x;\n")]).unwrap();

        let app = TestGit::new(fixture.app_dir());
        app.init_with_files(&[("README.md", "app\n")]).unwrap();
        app.submodule_add(&sub.file_url(), "libs/sub").unwrap();
        app.commit_files(&[], "Add submodule").unwrap();

        let output = resolve(&fixture.context()).await.unwrap();
        assert_eq!(output.packages.len(), 1);
        let package = &output.packages[0];
        assert_eq!(package.component.name, "libs/sub");
        assert_eq!(package.component.kind, PackageType::GitSubmodule);
        assert_eq!(package.component.version, format!("{}#{sub_commit}", sub.file_url()));
        assert_eq!(package.path.as_deref(), Some("libs/sub"));
        assert!(package.dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_no_submodules() {
        let fixture = ResolverFixture::with_git_app(
            test_request(&[PackageManager::GitSubmodule], &[]),
            &[("main.go", "package main\n")],
        );
        let output = resolve(&fixture.context()).await.unwrap();
        assert!(output.packages.is_empty());
    }
}
