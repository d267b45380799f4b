//! Discovery of existing recovery data when a working directory is opened.
//!
//! The recovery-storage directory is walked in parallel on a bounded
//! rayon pool; the walk is I/O bound, so a handful of threads helps on
//! large trees while the ceiling keeps it polite on big machines.

use crate::cancel::{CancelToken, Outcome};
use crate::recovery_store::{ArchiveIndex, StoreError, is_archive};
use rayon::prelude::*;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const MAX_SCAN_THREADS: usize = 16;

pub fn scan_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_SCAN_THREADS)
}

/// Builds the index of directories owning recovery data below `storage_root`.
///
/// Unreadable directories are logged and skipped.
pub fn scan_recovery_storage(
    storage_root: &Path,
    cancel: &CancelToken,
) -> Result<Outcome<ArchiveIndex>, StoreError> {
    if !storage_root.is_dir() {
        return Ok(Outcome::Completed(ArchiveIndex::new()));
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(scan_parallelism())
        .thread_name(|i| format!("partree-scan-{i}"))
        .build()?;

    let found = Mutex::new(Vec::new());
    pool.install(|| visit(storage_root, PathBuf::new(), &found, cancel));

    if cancel.is_cancelled() {
        return Ok(Outcome::Cancelled);
    }

    let found = found.into_inner().unwrap_or_else(|e| e.into_inner());
    debug!("Found recovery data for {} directories", found.len());
    Ok(Outcome::Completed(found.into_iter().collect()))
}

fn visit(storage_root: &Path, rel: PathBuf, found: &Mutex<Vec<PathBuf>>, cancel: &CancelToken) {
    if cancel.is_cancelled() {
        return;
    }

    let dir = storage_root.join(&rel);
    let read_dir = match std::fs::read_dir(&dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return,
        Err(e) => {
            warn!("Unable to scan {}: {}", dir.display(), e);
            return;
        }
    };

    let mut subdirs = Vec::new();
    let mut has_archive = false;
    for entry in read_dir.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => subdirs.push(rel.join(entry.file_name())),
            Ok(t) if t.is_file() && is_archive(&path) => has_archive = true,
            Ok(_) => {}
            Err(e) => warn!("Unable to inspect {}: {}", path.display(), e),
        }
    }

    if has_archive {
        found
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(rel);
    }

    subdirs
        .into_par_iter()
        .for_each(|child| visit(storage_root, child, found, cancel));
}
