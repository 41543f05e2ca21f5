//! Cross-process file locks.
//!
//! Locks live in `<dir>/.locks/<name>.lock` and are released when the
//! [`FileLock`] is dropped. Acquisition blocks, so it runs on the blocking
//! thread pool.

use anyhow::{Context, Result};
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// An exclusive lock held until drop.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire the exclusive lock `name` under `dir`, waiting for other holders.
    pub async fn acquire(dir: &Path, name: &str) -> Result<Self> {
        let locks_dir = dir.join(".locks");
        tokio::fs::create_dir_all(&locks_dir)
            .await
            .with_context(|| format!("Failed to create locks directory {}", locks_dir.display()))?;

        let lock_path = locks_dir.join(format!("{name}.lock"));
        let path = lock_path.clone();
        let name = name.to_string();

        let file = tokio::task::spawn_blocking(move || -> Result<File> {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .with_context(|| format!("Failed to open lock file: {}", path.display()))?;
            file.lock_exclusive().with_context(|| format!("Failed to acquire lock for: {name}"))?;
            Ok(file)
        })
        .await
        .context("Failed to spawn blocking task for lock acquisition")??;

        tracing::trace!(target: "lock", "Acquired {}", lock_path.display());
        Ok(Self {
            file,
            path: lock_path,
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[allow(unstable_name_collisions)]
        if let Err(e) = self.file.unlock() {
            tracing::warn!(target: "lock", "Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lock_creates_lock_file() {
        let temp = TempDir::new().unwrap();
        let lock = FileLock::acquire(temp.path(), "state").await.unwrap();
        assert!(temp.path().join(".locks/state.lock").exists());
        drop(lock);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().to_path_buf();
        let first = FileLock::acquire(&dir, "state").await.unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let flag = acquired.clone();
        let waiter = tokio::spawn(async move {
            let _lock = FileLock::acquire(&dir, "state").await.unwrap();
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!acquired.load(Ordering::SeqCst));
        drop(first);
        waiter.await.unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
