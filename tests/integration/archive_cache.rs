use depcache::archive::{SourceArchiveCache, verify_archive};
use depcache::test_utils::{TestGit, init_test_logging};
use depcache::utils::tarball::extract_tar_gz;
use serial_test::serial;
use std::time::Duration;
use tempfile::TempDir;

/// Archives of successive commits each hold the tree of their own commit
#[tokio::test]
async fn test_archives_follow_history() {
    init_test_logging(None);
    let temp = TempDir::new().unwrap();
    let upstream = TestGit::new(temp.path().join("upstream"));
    let first = upstream.init_with_files(&[("README.md", "first\n")]).unwrap();
    let second = upstream.commit_files(&[("README.md", "second\n")], "Second").unwrap();
    let cache = SourceArchiveCache::new(temp.path().join("sources"));

    let newer = cache.fetch(&upstream.file_url(), &second, false).await.unwrap();
    let older = cache.fetch(&upstream.file_url(), &first, false).await.unwrap();
    assert_ne!(newer.path, older.path);
    assert_eq!(newer.path.parent(), older.path.parent());

    for (archive, expected) in [(&older, "first\n"), (&newer, "second\n")] {
        verify_archive(&archive.path).await.unwrap();
        let out = temp.path().join(format!("out-{}", archive.git_ref));
        extract_tar_gz(&archive.path, &out).unwrap();
        assert_eq!(std::fs::read_to_string(out.join("app/README.md")).unwrap(), expected);
        assert!(out.join("app/.git").is_dir());
    }
}

/// Many concurrent requests for the same commit converge on one archive
#[tokio::test]
#[serial]
async fn test_parallel_fetches_share_one_archive() {
    let temp = TempDir::new().unwrap();
    let upstream = TestGit::new(temp.path().join("upstream"));
    let commit = upstream.init_with_files(&[("go.mod", "module example.com/m\n")]).unwrap();
    let cache = SourceArchiveCache::new(temp.path().join("sources"));
    let url = upstream.file_url();

    let fetches = (0..4).map(|_| cache.fetch(&url, &commit, false));
    let archives = futures::future::try_join_all(fetches).await.unwrap();
    assert!(archives.windows(2).all(|pair| pair[0] == pair[1]));

    let published: Vec<_> = walkdir::WalkDir::new(cache.sources_dir())
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.file_name().to_string_lossy().ends_with(".tar.gz"))
        .collect();
    assert_eq!(published.len(), 1);
    assert_eq!(cache.prune_archives(Duration::ZERO).await.unwrap(), 1);
}
