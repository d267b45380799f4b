//! Bulk operations over a subtree: creating, verifying and repairing
//! recovery data, and removing recovery data nobody owns anymore.
//!
//! Nodes are processed one at a time in pre-order, siblings by name. The
//! cancellation signal is checked before each node's work; work that already
//! finished is kept.

use super::{DirectoryTree, FileStatus, NodeId, SelectionState, TreeError, resolve_engine_path};
use crate::cancel::{CancelToken, Outcome};
use crate::config::Redundancy;
use crate::engine::{EngineExit, ScopeVerification, Verb, verify_scope};
use crate::recovery_store::{archive_files, create_dir_all, delete_archives, prune_if_empty};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// An engine run that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFailure {
    pub dir: PathBuf,
    pub verb: Verb,
    pub exit: EngineExit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationReport {
    /// Base directories the engine was run on.
    pub scopes_processed: usize,
    pub failures: Vec<EngineFailure>,
    pub cancelled: bool,
}

impl OperationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    fn fail(&mut self, dir: &Path, verb: Verb, exit: EngineExit) {
        warn!("{verb} failed for {} with {exit}", dir.display());
        self.failures.push(EngineFailure {
            dir: dir.to_path_buf(),
            verb,
            exit,
        });
    }
}

impl DirectoryTree {
    /// Creates recovery files for every base directory at or below `id`.
    ///
    /// Base directories that already have recovery data are left alone
    /// unless `recreate_existing` is set.
    pub fn create_recovery_files(
        &mut self,
        id: NodeId,
        redundancy: Redundancy,
        recreate_existing: bool,
        progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
    ) -> Result<OperationReport, TreeError> {
        let mut report = OperationReport::default();
        self.create_in(id, redundancy, recreate_existing, progress, cancel, &mut report)?;
        Ok(report)
    }

    fn create_in(
        &mut self,
        id: NodeId,
        redundancy: Redundancy,
        recreate_existing: bool,
        progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
        report: &mut OperationReport,
    ) -> Result<(), TreeError> {
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(());
        }

        if !self.nodes[id.0].selected {
            for child in self.children(id) {
                if self.selection_state(child) != SelectionState::Unselected {
                    self.create_in(child, redundancy, recreate_existing, progress, cancel, report)?;
                    if report.cancelled {
                        break;
                    }
                }
            }
            return Ok(());
        }

        let rel = self.nodes[id.0].rel.clone();
        if self.archives.contains(&rel) && !recreate_existing {
            debug!("{} already has recovery data", self.nodes[id.0].path.display());
            return Ok(());
        }

        let dir = self.nodes[id.0].path.clone();
        let recovery_dir = self.recovery_dir(id);
        let stale = delete_archives(&recovery_dir)?;
        if stale > 0 {
            debug!("Removed {stale} stale recovery files for {}", dir.display());
        }
        create_dir_all(&recovery_dir)?;

        let archive = self.archive_path(id);
        let outcome = self
            .engine
            .create(&dir, &archive, redundancy, progress, cancel)?;

        // The engine may have written part of its output before stopping.
        if archive_files(&recovery_dir)?.is_empty() {
            self.archives.remove(&rel);
        } else {
            self.archives.insert(&rel);
        }
        self.nodes[id.0].covered = None;
        self.invalidate(id, true, true);
        self.invalidate_ancestors(id, true, true);

        match outcome {
            Outcome::Cancelled => report.cancelled = true,
            Outcome::Completed(exit) => {
                report.scopes_processed += 1;
                if exit.is_success() {
                    info!("Created {}", archive.display());
                    self.mark_created(id);
                } else {
                    report.fail(&dir, Verb::Create, exit);
                }
            }
        }
        Ok(())
    }

    /// A fresh recovery file covers exactly the files present now.
    fn mark_created(&mut self, base: NodeId) {
        self.nodes[base.0].files = None;
        for node in self.materialized_descendants(base) {
            self.nodes[node.0].files = None;
        }
        self.nodes[base.0].covered = Some(BTreeSet::new());

        let mut covered = BTreeSet::new();
        for node in self.subtree(base) {
            if let Some(files) = self.nodes[node.0].files.as_mut() {
                files.retain(|f| f.status != FileStatus::Missing);
                for file in files.iter_mut() {
                    file.status = FileStatus::Complete;
                    covered.insert(file.path.clone());
                }
            }
            self.invalidate(node, false, true);
        }
        self.nodes[base.0].covered = Some(covered);
    }

    /// Deletes recovery data at or below `id` that belongs to directories
    /// that are not base directories, pruning emptied storage directories.
    /// Returns how many recovery files were deleted.
    pub fn delete_unused_recovery_files(&mut self, id: NodeId) -> Result<usize, TreeError> {
        let mut deleted = 0;
        self.delete_unused_in(id, &mut deleted)?;
        Ok(deleted)
    }

    fn delete_unused_in(&mut self, id: NodeId, deleted: &mut usize) -> Result<(), TreeError> {
        for child in self.children(id) {
            if self.recovery_dir(child).is_dir() {
                self.delete_unused_in(child, deleted)?;
            }
        }

        if self.nodes[id.0].selected {
            return Ok(());
        }

        let recovery_dir = self.recovery_dir(id);
        let removed = delete_archives(&recovery_dir)?;
        if removed > 0 {
            info!(
                "Deleted {removed} unused recovery files for {}",
                self.nodes[id.0].path.display()
            );
            *deleted += removed;
            let rel = self.nodes[id.0].rel.clone();
            self.archives.remove(&rel);
            self.nodes[id.0].covered = None;
        }

        let pruned = prune_if_empty(&recovery_dir)?;
        if pruned {
            debug!("Removed empty {}", recovery_dir.display());
        }
        if removed > 0 || pruned {
            self.invalidate(id, true, true);
            self.invalidate_ancestors(id, true, true);
        }
        Ok(())
    }

    /// Where verify and repair start for `id`: a directory inside a scope
    /// stands for the whole scope.
    pub fn operation_root(&self, id: NodeId) -> NodeId {
        if !self.nodes[id.0].selected && self.has_selected_ancestor(id) {
            self.base_dir(id).unwrap_or(id)
        } else {
            id
        }
    }

    /// Every base directory at or below the operation target that has
    /// recovery data, in pre-order.
    fn recoverable_scopes(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut scopes = Vec::new();
        let mut stack = vec![self.operation_root(id)];
        while let Some(node) = stack.pop() {
            if self.nodes[node.0].selected {
                if self.has_recovery_scope(node) {
                    scopes.push(node);
                } else {
                    debug!(
                        "{} has no recovery data yet",
                        self.nodes[node.0].path.display()
                    );
                }
                continue;
            }
            let children = self.children(node);
            stack.extend(
                children
                    .into_iter()
                    .rev()
                    .filter(|&c| self.contains_recoverable(c)),
            );
        }
        scopes
    }

    /// Checks every scope at or below `id` and records per-file statuses.
    pub fn verify_files(
        &mut self,
        id: NodeId,
        progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
    ) -> Result<OperationReport, TreeError> {
        let mut report = OperationReport::default();

        for base in self.recoverable_scopes(id) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let dir = self.nodes[base.0].path.clone();
            let archive = self.archive_path(base);
            let outcome = verify_scope(self.engine.as_ref(), &dir, &archive, progress, cancel)?;

            match outcome {
                Outcome::Cancelled => {
                    report.cancelled = true;
                    break;
                }
                Outcome::Completed(ScopeVerification::DirectoryMissing) => {
                    report.scopes_processed += 1;
                    self.set_scope_statuses(base, |_, _| FileStatus::Missing);
                }
                Outcome::Completed(ScopeVerification::Checked(result)) => {
                    report.scopes_processed += 1;
                    if result.records.is_empty() && !result.exit.is_success() {
                        report.fail(&dir, Verb::Verify, result.exit);
                        continue;
                    }
                    if !result.exit.is_success() {
                        debug!("Verify of {} ended with {}", dir.display(), result.exit);
                    }

                    let tokens: BTreeMap<PathBuf, String> = result
                        .records
                        .into_iter()
                        .map(|r| (resolve_engine_path(&dir, &r.filename), r.status))
                        .collect();
                    self.set_scope_statuses(base, |path, _| {
                        FileStatus::from_verify_token(tokens.get(path).map(String::as_str))
                    });
                }
            }
        }

        Ok(report)
    }

    /// Repairs every scope at or below `id`.
    pub fn repair_files(
        &mut self,
        id: NodeId,
        progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
    ) -> Result<OperationReport, TreeError> {
        let mut report = OperationReport::default();

        for base in self.recoverable_scopes(id) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let dir = self.nodes[base.0].path.clone();
            let archive = self.archive_path(base);
            match self.engine.repair(&dir, &archive, progress, cancel)? {
                Outcome::Cancelled => {
                    report.cancelled = true;
                    break;
                }
                Outcome::Completed(exit) => {
                    report.scopes_processed += 1;
                    if exit.is_repair_success() {
                        info!("Repaired {}", dir.display());
                        self.set_scope_statuses(base, |_, status| {
                            if status.is_verifiable() {
                                FileStatus::Complete
                            } else {
                                status
                            }
                        });
                    } else {
                        report.fail(&dir, Verb::Repair, exit);
                    }
                }
            }
        }

        Ok(report)
    }

    fn set_scope_statuses(&mut self, base: NodeId, status_of: impl Fn(&Path, FileStatus) -> FileStatus) {
        for node in self.subtree(base) {
            if let Some(files) = self.nodes[node.0].files.as_mut() {
                for file in files.iter_mut() {
                    file.status = status_of(&file.path, file.status);
                }
            }
            self.invalidate(node, false, true);
        }
        self.invalidate_ancestors(base, false, true);
    }
}
