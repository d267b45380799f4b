//! A working root opened for protection work.
//!
//! The session owns the directory tree, resolves user supplied paths to
//! nodes and runs the bulk operations the command line offers. After every
//! mutating operation the tree's invalidation notices are drained into the
//! debug log.

use crate::cancel::{CancelToken, Outcome};
use crate::config::Redundancy;
use crate::engine::RecoveryEngine;
use crate::recovery_store::{RECOVERY_DIR_NAME, StoreError};
use crate::scan::scan_recovery_storage;
use crate::tree::{
    DirectoryTree, FileEntry, NodeId, OperationReport, SelectionState, TreeError,
    VerificationState, resolve_engine_path,
};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Unable to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("{} is outside of the working directory {}", .path.display(), .root.display())]
    OutsideRoot { path: PathBuf, root: PathBuf },
    #[error("No such directory: {0}")]
    NotFound(PathBuf),
    #[error("{} is inside protected directory {}", .path.display(), .base.display())]
    Nested { path: PathBuf, base: PathBuf },
    #[error("Unable to read {0}")]
    Inaccessible(PathBuf),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    fn open(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == ErrorKind::PermissionDenied {
            SessionError::PermissionDenied(path.to_path_buf())
        } else {
            SessionError::Open {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// One line of `status` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryStatus {
    pub path: PathBuf,
    pub selection: SelectionState,
    pub verification: VerificationState,
    pub accessible: bool,
    pub enabled: bool,
}

pub struct Session {
    root: PathBuf,
    tree: DirectoryTree,
}

impl Session {
    /// Opens `root` and discovers the recovery data already stored for it.
    pub fn open(
        root: &Path,
        engine: Box<dyn RecoveryEngine>,
        cancel: &CancelToken,
    ) -> Result<Outcome<Session>, SessionError> {
        let root = root
            .canonicalize()
            .map_err(|e| SessionError::open(root, e))?;
        let storage_root = root.join(RECOVERY_DIR_NAME);

        let archives = match scan_recovery_storage(&storage_root, cancel)? {
            Outcome::Completed(archives) => archives,
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
        };
        info!(
            "Opened {} with {} protected directories",
            root.display(),
            archives.len()
        );

        let tree = DirectoryTree::new(root.clone(), storage_root, archives, engine, cancel.clone());
        Ok(Outcome::Completed(Session { root, tree }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tree(&self) -> &DirectoryTree {
        &self.tree
    }

    /// Finds the node for `path`, relative to the current directory.
    ///
    /// Directories that no longer exist can still be named as long as the
    /// tree knows about them through their recovery data.
    pub fn resolve(&mut self, path: &Path) -> Result<NodeId, SessionError> {
        let absolute = match path.canonicalize() {
            Ok(absolute) => absolute,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let cwd = std::env::current_dir().map_err(|e| SessionError::open(path, e))?;
                resolve_engine_path(&cwd, &path.to_string_lossy())
            }
            Err(e) => return Err(SessionError::open(path, e)),
        };

        let rel = absolute
            .strip_prefix(&self.root)
            .map_err(|_| SessionError::OutsideRoot {
                path: path.to_path_buf(),
                root: self.root.clone(),
            })?;
        if rel.starts_with(RECOVERY_DIR_NAME) {
            return Err(SessionError::NotFound(path.to_path_buf()));
        }

        self.tree
            .find(rel)
            .ok_or_else(|| SessionError::NotFound(path.to_path_buf()))
    }

    pub fn display_path(&self, id: NodeId) -> PathBuf {
        let rel = self.tree.node(id).relative_path();
        if rel.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            rel.to_path_buf()
        }
    }

    /// Makes `id` a base directory and creates its recovery file. Recovery
    /// data of directories below it is removed afterwards. If creation does
    /// not finish, the directory is left unprotected.
    pub fn protect(
        &mut self,
        id: NodeId,
        redundancy: Redundancy,
        progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
    ) -> Result<OperationReport, SessionError> {
        let node = self.tree.node(id);
        if !node.is_accessible() {
            return Err(SessionError::Inaccessible(node.path().to_path_buf()));
        }
        if let Some(parent) = node.parent()
            && let Some(base) = self.tree.base_dir(parent)
        {
            return Err(SessionError::Nested {
                path: node.path().to_path_buf(),
                base: self.tree.node(base).path().to_path_buf(),
            });
        }

        self.tree.set_selected(id, true);
        let report = match self
            .tree
            .create_recovery_files(id, redundancy, false, progress, cancel)
        {
            Ok(report) => report,
            Err(e) => {
                self.tree.set_selected(id, false);
                self.tree.delete_unused_recovery_files(id)?;
                self.log_invalidations();
                return Err(e.into());
            }
        };

        if !report.is_clean() {
            info!(
                "Protection of {} did not finish, reverting",
                self.display_path(id).display()
            );
            self.tree.set_selected(id, false);
        }
        let removed = self.tree.delete_unused_recovery_files(id)?;
        debug!("Removed {removed} recovery files no longer in use");

        self.log_invalidations();
        Ok(report)
    }

    /// Removes `id` as a base directory along with its recovery data.
    pub fn unprotect(&mut self, id: NodeId) -> Result<usize, SessionError> {
        self.tree.set_selected(id, false);
        let removed = self.tree.delete_unused_recovery_files(id)?;
        self.log_invalidations();
        Ok(removed)
    }

    pub fn recreate(
        &mut self,
        id: NodeId,
        redundancy: Redundancy,
        progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
    ) -> Result<OperationReport, SessionError> {
        let report = self
            .tree
            .create_recovery_files(id, redundancy, true, progress, cancel)?;
        self.log_invalidations();
        Ok(report)
    }

    pub fn verify(
        &mut self,
        id: NodeId,
        progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
    ) -> Result<OperationReport, SessionError> {
        let report = self.tree.verify_files(id, progress, cancel)?;
        self.log_invalidations();
        Ok(report)
    }

    pub fn repair(
        &mut self,
        id: NodeId,
        progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
    ) -> Result<OperationReport, SessionError> {
        let report = self.tree.repair_files(id, progress, cancel)?;
        self.log_invalidations();
        Ok(report)
    }

    pub fn clean(&mut self, id: NodeId) -> Result<usize, SessionError> {
        let removed = self.tree.delete_unused_recovery_files(id)?;
        self.log_invalidations();
        Ok(removed)
    }

    pub fn new_files(&mut self, id: NodeId) -> Vec<PathBuf> {
        self.tree.new_files(id)
    }

    pub fn status_summary(&mut self, id: NodeId) -> String {
        self.tree.status_summary(id)
    }

    /// Missing and corrupt files in the scopes verify or repair would touch
    /// for `id`.
    pub fn incomplete_files(&mut self, id: NodeId) -> Vec<FileEntry> {
        let start = self.tree.operation_root(id);
        let mut found = Vec::new();
        for node in self.tree.subtree(start) {
            found.extend(
                self.tree
                    .files(node)
                    .iter()
                    .filter(|f| f.status().is_incomplete())
                    .cloned(),
            );
        }
        found
    }

    /// Directories at and below `id` worth showing. Unless `all` is set,
    /// only directories involved in protection are visited.
    pub fn directory_statuses(&mut self, id: NodeId, all: bool) -> Vec<DirectoryStatus> {
        let mut rows = Vec::new();
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            let selection = self.tree.selection_state(node);
            // Listing first so an unreadable directory is reported as such.
            let children = if all || selection == SelectionState::Indeterminate {
                self.tree.children(node)
            } else {
                Vec::new()
            };
            let accessible = self.tree.node(node).is_accessible();
            if all || selection != SelectionState::Unselected || !accessible || node == id {
                rows.push(DirectoryStatus {
                    path: self.display_path(node),
                    selection,
                    verification: self.tree.verification_state(node),
                    accessible,
                    enabled: self.tree.is_enabled(node),
                });
            }
            stack.extend(children.into_iter().rev());
        }
        rows
    }

    fn log_invalidations(&mut self) {
        for (id, invalidation) in self.tree.take_invalidations() {
            debug!(
                "Refresh {}: selection {}, verification {}",
                self.display_path(id).display(),
                invalidation.selection,
                invalidation.verification
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Par2Engine;
    use std::fs;
    use tempfile::TempDir;

    fn open(root: &Path) -> Session {
        // Nothing in these tests reaches the engine.
        let engine = Par2Engine::new(root.join("no-engine"));
        match Session::open(root, Box::new(engine), &CancelToken::new()).unwrap() {
            Outcome::Completed(session) => session,
            Outcome::Cancelled => panic!("open was cancelled"),
        }
    }

    #[test]
    fn test_open_missing_root() {
        let temp = TempDir::new().unwrap();
        let result = Session::open(
            &temp.path().join("absent"),
            Box::new(Par2Engine::default()),
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(SessionError::Open { .. })));
    }

    #[test]
    fn test_open_cancelled() {
        let temp = TempDir::new().unwrap();
        let storage = temp.path().join(RECOVERY_DIR_NAME);
        fs::create_dir(&storage).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = Session::open(temp.path(), Box::new(Par2Engine::default()), &cancel).unwrap();
        assert!(matches!(outcome, Outcome::Cancelled));
    }

    #[test]
    fn test_resolve() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::create_dir(root.join(RECOVERY_DIR_NAME)).unwrap();

        let mut session = open(&root);

        let b = session.resolve(&root.join("a/b")).unwrap();
        assert_eq!(session.display_path(b), PathBuf::from("a/b"));
        assert_eq!(session.resolve(&root).unwrap(), session.tree().root());
        assert_eq!(session.display_path(session.tree().root()), PathBuf::from("."));

        assert!(matches!(
            session.resolve(&root.join("a/missing")),
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            session.resolve(&root.join(RECOVERY_DIR_NAME)),
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            session.resolve(temp.path().parent().unwrap()),
            Err(SessionError::OutsideRoot { .. })
        ));
    }

    #[test]
    fn test_directory_statuses_default_shows_root_only() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("a/b")).unwrap();

        let mut session = open(temp.path());
        let root = session.tree().root();

        let rows = session.directory_statuses(root, false);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, PathBuf::from("."));
        assert_eq!(rows[0].selection, SelectionState::Unselected);
        assert_eq!(rows[0].verification, VerificationState::Unknown);

        let all: Vec<PathBuf> = session
            .directory_statuses(root, true)
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(
            all,
            vec![PathBuf::from("."), PathBuf::from("a"), PathBuf::from("a/b")]
        );
    }

    #[test]
    fn test_protect_rejects_nested_directory() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("a/b")).unwrap();
        let storage = root.join(RECOVERY_DIR_NAME);
        fs::create_dir_all(storage.join("a")).unwrap();
        fs::write(storage.join("a/a.par2"), "PAR2").unwrap();

        let mut session = open(&root);
        let b = session.resolve(&root.join("a/b")).unwrap();
        let result = session.protect(
            b,
            Redundancy::default(),
            &mut |_, _| {},
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(SessionError::Nested { .. })));
    }

    #[test]
    fn test_unprotect_removes_recovery_data() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        fs::create_dir(root.join("a")).unwrap();
        let storage = root.join(RECOVERY_DIR_NAME);
        fs::create_dir_all(storage.join("a")).unwrap();
        fs::write(storage.join("a/a.par2"), "PAR2").unwrap();
        fs::write(storage.join("a/a.vol00+01.par2"), "PAR2").unwrap();

        let mut session = open(&root);
        let a = session.resolve(&root.join("a")).unwrap();
        assert_eq!(session.unprotect(a).unwrap(), 2);
        assert!(!storage.join("a").exists());
        assert_eq!(session.clean(session.tree().root()).unwrap(), 0);
        assert!(!storage.exists());
    }

    #[test]
    fn test_unprotect_parent_removes_unread_nested_recovery_data() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("a/b")).unwrap();
        let storage = root.join(RECOVERY_DIR_NAME);
        fs::create_dir_all(storage.join("a/b")).unwrap();
        fs::write(storage.join("a/b/b.par2"), "PAR2").unwrap();

        let mut session = open(&root);
        let a = session.resolve(&root.join("a")).unwrap();
        assert_eq!(session.unprotect(a).unwrap(), 1);
        assert!(!storage.join("a").exists());
    }
}
