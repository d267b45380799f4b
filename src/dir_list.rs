//! Non-recursive directory listing.
//!
//! Lists the immediate subdirectories and files of one directory, skipping
//! the recovery-storage directory wherever it appears so that recovery data
//! is never mistaken for protected content.

use crate::recovery_store::RECOVERY_DIR_NAME;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum DirListError {
    #[error("IO error: {0}")]
    Io(std::io::Error),
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),
}

impl DirListError {
    fn from_io(path: &Path, e: std::io::Error) -> Self {
        if e.kind() == ErrorKind::PermissionDenied {
            DirListError::PermissionDenied(path.to_path_buf())
        } else {
            DirListError::Io(e)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DirListError::Io(e) if e.kind() == ErrorKind::NotFound)
    }
}

/// Immediate contents of a directory, as absolute paths sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirListing {
    pub dirs: Vec<PathBuf>,
    pub files: Vec<PathBuf>,
}

/// Lists the immediate children of `dir`.
///
/// Symlinks to files are listed as files. Symlinks to directories are
/// skipped, which keeps recursive walks free of cycles.
pub fn list_directory(dir: &Path) -> Result<DirListing, DirListError> {
    let read_dir = std::fs::read_dir(dir).map_err(|e| DirListError::from_io(dir, e))?;

    let mut listing = DirListing::default();

    for entry in read_dir {
        let entry = entry.map_err(|e| DirListError::from_io(dir, e))?;
        let path = entry.path();

        if entry.file_name() == RECOVERY_DIR_NAME {
            continue;
        }

        let file_type = entry
            .file_type()
            .map_err(|e| DirListError::from_io(&path, e))?;

        if file_type.is_dir() {
            listing.dirs.push(path);
        } else if file_type.is_symlink() {
            match std::fs::metadata(&path) {
                Ok(target) if target.is_file() => listing.files.push(path),
                Ok(_) => debug!("Skipping symlinked directory {}", path.display()),
                Err(e) => debug!("Skipping dangling symlink {}: {}", path.display(), e),
            }
        } else {
            listing.files.push(path);
        }
    }

    listing.dirs.sort();
    listing.files.sort();

    Ok(listing)
}

/// Like [`list_directory`], but a directory that does not exist is empty.
pub fn list_directory_or_empty(dir: &Path) -> Result<DirListing, DirListError> {
    match list_directory(dir) {
        Err(e) if e.is_not_found() => Ok(DirListing::default()),
        other => other,
    }
}

/// All files below `dir` whose names mark them as hidden.
pub fn hidden_files_recursive(dir: &Path) -> Result<Vec<PathBuf>, DirListError> {
    let mut hidden = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let listing = list_directory_or_empty(&current)?;
        hidden.extend(listing.files.into_iter().filter(|f| {
            f.file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with('.'))
        }));
        pending.extend(listing.dirs);
    }

    hidden.sort();
    Ok(hidden)
}
