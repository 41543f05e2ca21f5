//! Deterministic gzip-compressed tar archives
//!
//! Source archives and bundles are written with a fixed layout: entries sorted
//! by path, mtime/uid/gid zeroed, symlinks stored as links rather than followed.
//! The same tree always produces the same bytes.
//!
//! All functions here block; async callers wrap them in `spawn_blocking`.

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::Path;
use tar::{EntryType, Header};
use walkdir::WalkDir;

use crate::core::DepcacheError;

/// Streaming writer for a deterministic `.tar.gz`.
///
/// Trees added under different prefixes are merged; a directory present in
/// several trees is written once, while a file or link path written twice is a
/// [`DepcacheError::DuplicatePath`].
pub struct TarGzWriter {
    builder: tar::Builder<GzEncoder<BufWriter<File>>>,
    seen_files: HashSet<String>,
    seen_dirs: HashSet<String>,
}

impl TarGzWriter {
    /// Create the archive file at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create archive {}", path.display()))?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        Ok(Self {
            builder,
            seen_files: HashSet::new(),
            seen_dirs: HashSet::new(),
        })
    }

    fn header(entry_type: EntryType, mode: u32, size: u64) -> Header {
        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_entry_type(entry_type);
        header.set_mode(mode);
        header.set_size(size);
        header
    }

    fn add_dir_entry(&mut self, archive_path: &str) -> Result<()> {
        if !self.seen_dirs.insert(archive_path.to_string()) {
            return Ok(());
        }
        if self.seen_files.contains(archive_path) {
            return Err(DepcacheError::DuplicatePath {
                path: archive_path.to_string(),
            }
            .into());
        }
        let mut header = Self::header(EntryType::Directory, 0o755, 0);
        self.builder.append_data(&mut header, format!("{archive_path}/"), io::empty())?;
        Ok(())
    }

    fn claim_file_path(&mut self, archive_path: &str) -> Result<()> {
        if self.seen_dirs.contains(archive_path) || !self.seen_files.insert(archive_path.to_string())
        {
            return Err(DepcacheError::DuplicatePath {
                path: archive_path.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Add an empty directory entry and its missing parents.
    pub fn append_empty_dir(&mut self, archive_path: &str) -> Result<()> {
        let mut current = String::new();
        for part in archive_path.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            self.add_dir_entry(&current)?;
        }
        Ok(())
    }

    /// Add every entry under `root`, stored below `prefix`.
    ///
    /// `skip` receives each path relative to `root` and excludes it (and, for
    /// directories, everything below it) when it returns `true`.
    pub fn append_tree<F>(&mut self, root: &Path, prefix: &str, skip: F) -> Result<()>
    where
        F: Fn(&Path) -> bool,
    {
        self.append_empty_dir(prefix)?;

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.path().strip_prefix(root).map_or(true, |rel| rel.as_os_str().is_empty() || !skip(rel))
            });

        for entry in walker {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            if relative.as_os_str().is_empty() {
                continue;
            }
            let relative = relative.to_string_lossy().replace('\\', "/");
            let archive_path = format!("{}/{relative}", prefix.trim_end_matches('/'));
            let metadata = fs::symlink_metadata(entry.path())
                .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
            let file_type = metadata.file_type();

            if file_type.is_dir() {
                self.add_dir_entry(&archive_path)?;
            } else if file_type.is_symlink() {
                self.claim_file_path(&archive_path)?;
                let target = fs::read_link(entry.path()).with_context(|| {
                    format!("Failed to read symlink {}", entry.path().display())
                })?;
                let mut header = Self::header(EntryType::Symlink, 0o777, 0);
                header.set_link_name(&target).with_context(|| {
                    format!("Symlink target too long: {}", entry.path().display())
                })?;
                self.builder.append_data(&mut header, &archive_path, io::empty())?;
            } else if file_type.is_file() {
                self.claim_file_path(&archive_path)?;
                let mut header = Self::header(EntryType::Regular, file_mode(&metadata), metadata.len());
                let file = File::open(entry.path())
                    .with_context(|| format!("Failed to open {}", entry.path().display()))?;
                self.builder.append_data(&mut header, &archive_path, file)?;
            }
        }
        Ok(())
    }

    /// Flush and close the archive.
    pub fn finish(self) -> Result<()> {
        let encoder = self.builder.into_inner().context("Failed to finish tar stream")?;
        let writer = encoder.finish().context("Failed to finish gzip stream")?;
        let file = writer.into_inner().map_err(|e| e.into_error()).context("Failed to flush archive")?;
        file.sync_all().context("Failed to sync archive to disk")?;
        Ok(())
    }
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 { 0o755 } else { 0o644 }
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
    0o644
}

/// Archive the whole of `root` below `prefix` into `dest`.
pub fn create_tar_gz(root: &Path, prefix: &str, dest: &Path) -> Result<()> {
    let mut writer = TarGzWriter::create(dest)?;
    writer.append_tree(root, prefix, |_| false)?;
    writer.finish()
}

/// Extract `archive` into `dest`, creating it if needed.
///
/// Entries that would escape `dest` are refused by the tar reader.
pub fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create directory {}", dest.display()))?;
    let file = File::open(archive)
        .with_context(|| format!("Failed to open archive {}", archive.display()))?;
    let mut reader = tar::Archive::new(GzDecoder::new(file));
    reader.set_preserve_permissions(true);
    reader
        .unpack(dest)
        .with_context(|| format!("Failed to extract {} to {}", archive.display(), dest.display()))
}

/// Whether `path` is a readable gzip-compressed tar archive.
///
/// Every entry is read to the end so truncated archives are caught.
pub fn is_valid_tar_gz(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let mut reader = tar::Archive::new(GzDecoder::new(file));
    let Ok(entries) = reader.entries() else {
        return false;
    };
    let mut count = 0usize;
    for entry in entries {
        let Ok(mut entry) = entry else {
            return false;
        };
        if io::copy(&mut entry, &mut io::sink()).is_err() {
            return false;
        }
        count += 1;
    }
    count > 0
}

/// Paths of every entry in the archive, in stored order.
pub fn list_entries(path: &Path) -> Result<Vec<String>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open archive {}", path.display()))?;
    let mut reader = tar::Archive::new(GzDecoder::new(file));
    let mut names = Vec::new();
    for entry in reader.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().trim_end_matches('/').to_string());
    }
    Ok(names)
}
