//! Layout of the recovery-storage directory.
//!
//! Recovery archives are kept in a hidden directory at the top of the
//! working tree. Its shape mirrors the protected tree: the archive for
//! `<root>/a/b` lives in `<root>/.partree/a/b/b.par2`. Any `*.par2` file in
//! a mirrored directory (volume files included) belongs to that directory.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const RECOVERY_DIR_NAME: &str = ".partree";
pub const ARCHIVE_EXTENSION: &str = "par2";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(std::io::Error),
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("Unable to start scan workers: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl StoreError {
    fn from_io(path: &Path, e: std::io::Error) -> Self {
        if e.kind() == ErrorKind::PermissionDenied {
            StoreError::PermissionDenied(path.to_path_buf())
        } else {
            StoreError::Io(e)
        }
    }
}

pub fn is_archive(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == ARCHIVE_EXTENSION)
}

/// Archive files kept directly in `recovery_dir`; empty if it does not exist.
pub fn archive_files(recovery_dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let read_dir = match std::fs::read_dir(recovery_dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::from_io(recovery_dir, e)),
    };

    let mut archives = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|e| StoreError::from_io(recovery_dir, e))?;
        let path = entry.path();
        let is_file = entry
            .file_type()
            .map_err(|e| StoreError::from_io(&path, e))?
            .is_file();
        if is_file && is_archive(&path) {
            archives.push(path);
        }
    }
    archives.sort();
    Ok(archives)
}

/// Deletes every archive file in `recovery_dir`, returning how many were removed.
pub fn delete_archives(recovery_dir: &Path) -> Result<usize, StoreError> {
    let archives = archive_files(recovery_dir)?;
    for archive in &archives {
        std::fs::remove_file(archive).map_err(|e| StoreError::from_io(archive, e))?;
    }
    Ok(archives.len())
}

pub fn create_dir_all(dir: &Path) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir).map_err(|e| StoreError::from_io(dir, e))
}

/// Removes `recovery_dir` if it exists and holds nothing. Returns whether it was removed.
pub fn prune_if_empty(recovery_dir: &Path) -> Result<bool, StoreError> {
    let mut read_dir = match std::fs::read_dir(recovery_dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(StoreError::from_io(recovery_dir, e)),
    };
    if read_dir.next().is_some() {
        return Ok(false);
    }
    std::fs::remove_dir(recovery_dir).map_err(|e| StoreError::from_io(recovery_dir, e))?;
    Ok(true)
}

/// Directories of the protected tree that currently own recovery data.
///
/// Paths are relative to the working root; the root itself is the empty path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveIndex {
    dirs: BTreeSet<PathBuf>,
}

impl ArchiveIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, rel: &Path) -> bool {
        self.dirs.contains(rel)
    }

    pub fn insert(&mut self, rel: &Path) -> bool {
        self.dirs.insert(rel.to_path_buf())
    }

    pub fn remove(&mut self, rel: &Path) -> bool {
        self.dirs.remove(rel)
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.dirs.iter().map(PathBuf::as_path)
    }

    /// Whether some directory strictly below `rel` owns recovery data.
    pub fn has_descendant(&self, rel: &Path) -> bool {
        self.dirs.iter().any(|d| d != rel && d.starts_with(rel))
    }

    /// Names of the immediate children of `rel` that lead to recovery data.
    pub fn children_with_archives(&self, rel: &Path) -> BTreeSet<OsString> {
        self.dirs
            .iter()
            .filter_map(|d| d.strip_prefix(rel).ok())
            .filter_map(|rest| rest.components().next())
            .map(|first| first.as_os_str().to_os_string())
            .collect()
    }
}

impl FromIterator<PathBuf> for ArchiveIndex {
    fn from_iter<I: IntoIterator<Item = PathBuf>>(iter: I) -> Self {
        ArchiveIndex {
            dirs: iter.into_iter().collect(),
        }
    }
}
