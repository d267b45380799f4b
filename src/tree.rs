//! Lazily populated model of the protected directory tree.
//!
//! Nodes live in a flat arena and refer to each other by [`NodeId`]. A node
//! owns its children and file entries, which are only read from disk the
//! first time they are asked for. Everything else about a node (whether it
//! is covered by recovery data, its checkbox state, its verification state)
//! is derived on demand from the arena and the [`ArchiveIndex`].
//!
//! Mutating operations record which nodes' derived state changed in an
//! invalidation set that a front end can drain to refresh its display.

mod operations;

pub use operations::OperationReport;

use crate::cancel::{CancelToken, Outcome};
use crate::dir_list::list_directory_or_empty;
use crate::engine::{EngineError, RecoveryEngine};
use crate::recovery_store::{ARCHIVE_EXTENSION, ArchiveIndex, StoreError};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("Recovery engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Recovery storage error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileStatus {
    /// No recovery file covers this file.
    Unknown,
    /// Covered by a recovery file but not checked against it yet.
    Unverified,
    /// Present, but not included in the recovery file of its scope.
    New,
    /// Listed in the recovery file but not found.
    Missing,
    /// Consistent with the recovery file.
    Complete,
    /// Present but inconsistent with the recovery file.
    Corrupt,
}

impl FileStatus {
    /// Maps a per-file token from a verify report. Files the report does not
    /// mention are new; every kind of damage counts as corruption.
    pub fn from_verify_token(token: Option<&str>) -> Self {
        match token {
            Some("Complete") => FileStatus::Complete,
            Some("Missing") => FileStatus::Missing,
            Some(_) => FileStatus::Corrupt,
            None => FileStatus::New,
        }
    }

    /// Could be checked against a recovery file.
    pub fn is_verifiable(self) -> bool {
        !matches!(self, FileStatus::Unknown | FileStatus::New)
    }

    /// Has a definite outcome; nothing is pending.
    pub fn is_verified(self) -> bool {
        !matches!(self, FileStatus::Unknown | FileStatus::Unverified)
    }

    pub fn is_incomplete(self) -> bool {
        matches!(self, FileStatus::Missing | FileStatus::Corrupt)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileStatus::Unknown => "Unknown",
            FileStatus::Unverified => "Unverified",
            FileStatus::New => "New",
            FileStatus::Missing => "Missing",
            FileStatus::Complete => "Complete",
            FileStatus::Corrupt => "Corrupt",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionState {
    Selected,
    Unselected,
    /// Not selected itself, but something below it is protected.
    Indeterminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    Verified,
    Corrupt,
    Unknown,
}

/// Which derived state of a node needs to be recomputed by a viewer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Invalidation {
    /// Selection state or enabled-ness.
    pub selection: bool,
    pub verification: bool,
}

/// A file that exists in a directory, or that a recovery file expects there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    path: PathBuf,
    status: FileStatus,
}

impl FileEntry {
    pub fn new(path: PathBuf, status: FileStatus) -> Self {
        FileEntry { path, status }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> Cow<'_, str> {
        self.path
            .file_name()
            .map(OsStr::to_string_lossy)
            .unwrap_or_default()
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }
}

#[derive(Debug)]
pub struct DirectoryNode {
    path: PathBuf,
    /// Path relative to the working root; empty for the root.
    rel: PathBuf,
    parent: Option<NodeId>,
    /// This is a base directory owning (or about to own) a recovery file.
    selected: bool,
    /// Latched false once the directory could not be read.
    accessible: bool,
    expanded: bool,
    /// Set once the node's selection was changed explicitly: subdirectories
    /// read after that start unselected, whatever recovery data they have.
    descendants_deselected: bool,
    children: Option<Vec<NodeId>>,
    files: Option<Vec<FileEntry>>,
    /// Base directories only: absolute paths of every file the recovery
    /// file covers, anywhere in the scope.
    covered: Option<BTreeSet<PathBuf>>,
}

impl DirectoryNode {
    fn new(path: PathBuf, rel: PathBuf, parent: Option<NodeId>, selected: bool) -> Self {
        DirectoryNode {
            path,
            rel,
            parent,
            selected,
            accessible: true,
            expanded: false,
            descendants_deselected: false,
            children: None,
            files: None,
            covered: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn relative_path(&self) -> &Path {
        &self.rel
    }

    pub fn name(&self) -> Cow<'_, str> {
        self.path
            .file_name()
            .map(OsStr::to_string_lossy)
            .unwrap_or_else(|| self.path.to_string_lossy())
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn is_accessible(&self) -> bool {
        self.accessible
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded
    }
}

fn archive_file_name(dir: &Path) -> String {
    let name = dir
        .file_name()
        .map(OsStr::to_string_lossy)
        .unwrap_or(Cow::Borrowed("root"));
    format!("{name}.{ARCHIVE_EXTENSION}")
}

/// Resolves a file name printed by the engine against the directory it was
/// run on, folding `.` and `..` lexically.
pub(crate) fn resolve_engine_path(dir: &Path, name: &str) -> PathBuf {
    let name = Path::new(name);
    let mut resolved = if name.is_absolute() {
        PathBuf::new()
    } else {
        dir.to_path_buf()
    };
    for component in name.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    resolved
}

pub struct DirectoryTree {
    nodes: Vec<DirectoryNode>,
    storage_root: PathBuf,
    archives: ArchiveIndex,
    engine: Box<dyn RecoveryEngine>,
    /// Interrupts the engine calls made while reading nodes lazily.
    cancel: CancelToken,
    invalidated: BTreeMap<NodeId, Invalidation>,
}

impl DirectoryTree {
    /// Creates a tree rooted at `root`, which must be an absolute path.
    ///
    /// `archives` describes the recovery data already present in the
    /// recovery-storage directory under `storage_root`. `cancel` stops the
    /// engine when it is asked which files a recovery file covers.
    pub fn new(
        root: PathBuf,
        storage_root: PathBuf,
        archives: ArchiveIndex,
        engine: Box<dyn RecoveryEngine>,
        cancel: CancelToken,
    ) -> Self {
        let selected = storage_root.join(archive_file_name(&root)).is_file();
        let mut node = DirectoryNode::new(root, PathBuf::new(), None, selected);
        node.expanded = true;

        DirectoryTree {
            nodes: vec![node],
            storage_root,
            archives,
            engine,
            cancel,
            invalidated: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &DirectoryNode {
        &self.nodes[id.0]
    }

    pub fn archives(&self) -> &ArchiveIndex {
        &self.archives
    }

    pub fn set_expanded(&mut self, id: NodeId, expanded: bool) {
        self.nodes[id.0].expanded = expanded;
    }

    /// Where recovery files for this directory itself are kept.
    pub fn recovery_dir(&self, id: NodeId) -> PathBuf {
        let rel = &self.nodes[id.0].rel;
        if rel.as_os_str().is_empty() {
            self.storage_root.clone()
        } else {
            self.storage_root.join(rel)
        }
    }

    pub fn archive_path(&self, id: NodeId) -> PathBuf {
        self.recovery_dir(id)
            .join(archive_file_name(&self.nodes[id.0].path))
    }

    /// Finds the node for a path relative to the root, enumerating along the way.
    pub fn find(&mut self, rel: &Path) -> Option<NodeId> {
        let mut current = self.root();
        for component in rel.components() {
            match component {
                Component::CurDir => {}
                Component::Normal(name) => {
                    current = self
                        .children(current)
                        .into_iter()
                        .find(|c| self.nodes[c.0].path.file_name() == Some(name))?;
                }
                _ => return None,
            }
        }
        Some(current)
    }

    /// Children already read from disk, without touching the filesystem.
    pub fn materialized_children(&self, id: NodeId) -> Option<&[NodeId]> {
        self.nodes[id.0].children.as_deref()
    }

    /// Subdirectories of a node, read on first access.
    ///
    /// The union of directories present on disk, directories that covered
    /// files are expected in, and directories that have recovery data of
    /// their own even if the directory itself is gone.
    ///
    /// Empty, and not remembered, if reading was cancelled.
    pub fn children(&mut self, id: NodeId) -> Vec<NodeId> {
        if let Some(children) = &self.nodes[id.0].children {
            return children.clone();
        }
        match self.load_children(id) {
            Some(children) => {
                self.nodes[id.0].children = Some(children.clone());
                children
            }
            None => Vec::new(),
        }
    }

    /// Files of a node, read on first access.
    ///
    /// Empty, and not remembered, if reading was cancelled.
    pub fn files(&mut self, id: NodeId) -> &[FileEntry] {
        if self.nodes[id.0].files.is_none() {
            match self.load_files(id) {
                Some(files) => self.nodes[id.0].files = Some(files),
                None => return &[],
            }
        }
        self.nodes[id.0].files.as_deref().unwrap_or_default()
    }

    fn load_children(&mut self, id: NodeId) -> Option<Vec<NodeId>> {
        let path = self.nodes[id.0].path.clone();
        let rel = self.nodes[id.0].rel.clone();

        let mut child_paths: BTreeSet<PathBuf> = match list_directory_or_empty(&path) {
            Ok(listing) => listing.dirs.into_iter().collect(),
            Err(e) => {
                warn!("Unable to read {}: {}", path.display(), e);
                self.mark_inaccessible(id);
                return Some(Vec::new());
            }
        };

        if let Some(base) = self.base_dir(id)
            && self.has_recovery_scope(id)
        {
            for file in self.covered_files(base)? {
                if let Ok(below) = file.strip_prefix(&path) {
                    let mut components = below.components();
                    if let (Some(first), Some(_)) = (components.next(), components.next()) {
                        child_paths.insert(path.join(first));
                    }
                }
            }
        }

        for name in self.archives.children_with_archives(&rel) {
            child_paths.insert(path.join(name));
        }

        // A protected scope cannot contain another one.
        let inside_scope = self.deselects_descendants(id);

        let mut children = Vec::with_capacity(child_paths.len());
        for child_path in child_paths {
            let Some(name) = child_path.file_name().map(OsStr::to_os_string) else {
                continue;
            };
            let child_rel = rel.join(&name);
            let has_archive = self
                .storage_root
                .join(&child_rel)
                .join(archive_file_name(&child_path))
                .is_file();
            if has_archive && inside_scope {
                debug!(
                    "Ignoring nested recovery file for {}",
                    child_path.display()
                );
            }

            let child = NodeId(self.nodes.len());
            self.nodes.push(DirectoryNode::new(
                child_path,
                child_rel,
                Some(id),
                has_archive && !inside_scope,
            ));
            children.push(child);
        }
        Some(children)
    }

    fn load_files(&mut self, id: NodeId) -> Option<Vec<FileEntry>> {
        let path = self.nodes[id.0].path.clone();

        let existing = match list_directory_or_empty(&path) {
            Ok(listing) => listing.files,
            Err(e) => {
                warn!("Unable to read {}: {}", path.display(), e);
                self.mark_inaccessible(id);
                return Some(Vec::new());
            }
        };

        let base = match self.base_dir(id) {
            Some(base) if self.has_recovery_scope(id) => base,
            _ => {
                return Some(
                    existing
                        .into_iter()
                        .map(|p| FileEntry::new(p, FileStatus::Unknown))
                        .collect(),
                );
            }
        };

        let mut statuses: BTreeMap<PathBuf, FileStatus> = self
            .covered_files(base)?
            .iter()
            .filter(|f| f.parent() == Some(path.as_path()))
            .map(|f| (f.clone(), FileStatus::Missing))
            .collect();

        for file in existing {
            statuses
                .entry(file)
                .and_modify(|s| *s = FileStatus::Unverified)
                .or_insert(FileStatus::New);
        }

        Some(
            statuses
                .into_iter()
                .map(|(path, status)| FileEntry::new(path, status))
                .collect(),
        )
    }

    /// Files covered by the recovery file of base directory `base`, asking
    /// the engine on first use. `None` if the engine was cancelled.
    fn covered_files(&mut self, base: NodeId) -> Option<&BTreeSet<PathBuf>> {
        if self.nodes[base.0].covered.is_none() {
            let covered = self.load_covered(base)?;
            self.nodes[base.0].covered = Some(covered);
        }
        self.nodes[base.0].covered.as_ref()
    }

    fn load_covered(&self, base: NodeId) -> Option<BTreeSet<PathBuf>> {
        let node = &self.nodes[base.0];
        if !self.archives.contains(&node.rel) {
            return Some(BTreeSet::new());
        }

        let archive = self.archive_path(base);
        match self.engine.list(&archive, &self.cancel) {
            Ok(Outcome::Completed(names)) => Some(
                names
                    .iter()
                    .map(|name| resolve_engine_path(&node.path, name))
                    .collect(),
            ),
            Ok(Outcome::Cancelled) => {
                debug!("Listing {} was cancelled", archive.display());
                None
            }
            Err(e) => {
                warn!("Unable to list {}: {}", archive.display(), e);
                Some(BTreeSet::new())
            }
        }
    }

    fn mark_inaccessible(&mut self, id: NodeId) {
        self.nodes[id.0].accessible = false;
        self.invalidate(id, true, false);
    }

    /// The node itself and every node below it, read from disk as needed,
    /// in pre-order.
    pub fn subtree(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            self.files(current);
            order.push(current);
            stack.extend(self.children(current).into_iter().rev());
        }
        order
    }

    fn materialized_descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut found = Vec::new();
        let mut stack: Vec<NodeId> = self.materialized_children(id).unwrap_or_default().to_vec();
        while let Some(current) = stack.pop() {
            found.push(current);
            stack.extend_from_slice(self.materialized_children(current).unwrap_or_default());
        }
        found
    }

    pub fn has_selected_ancestor(&self, id: NodeId) -> bool {
        let mut current = self.nodes[id.0].parent;
        while let Some(ancestor) = current {
            if self.nodes[ancestor.0].selected {
                return true;
            }
            current = self.nodes[ancestor.0].parent;
        }
        false
    }

    /// Subdirectories of `id` read from now on start unselected: `id` or
    /// one of its ancestors is selected, or had its selection set.
    fn deselects_descendants(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            let node = &self.nodes[node.0];
            if node.selected || node.descendants_deselected {
                return true;
            }
            current = node.parent;
        }
        false
    }

    /// Nearest node, starting with `id` itself, that is a base directory.
    pub fn base_dir(&self, id: NodeId) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(candidate) = current {
            if self.nodes[candidate.0].selected {
                return Some(candidate);
            }
            current = self.nodes[candidate.0].parent;
        }
        None
    }

    /// A recovery file covers this directory, owned by it or by the base
    /// directory of its scope.
    pub fn has_recovery_scope(&self, id: NodeId) -> bool {
        self.base_dir(id)
            .is_some_and(|base| self.archives.contains(&self.nodes[base.0].rel))
    }

    fn contains_selected_subdirectory(&self, id: NodeId) -> bool {
        let node = &self.nodes[id.0];
        if node.selected {
            return false;
        }
        // Recovery data below a deselected subtree no longer selects anything.
        let archived_below =
            !self.deselects_descendants(id) && self.archives.has_descendant(&node.rel);
        archived_below
            || self
                .materialized_descendants(id)
                .iter()
                .any(|d| self.nodes[d.0].selected)
    }

    pub fn contains_recoverable(&self, id: NodeId) -> bool {
        self.has_recovery_scope(id) || self.contains_selected_subdirectory(id)
    }

    /// Nested protection is not allowed, and unreadable directories cannot
    /// be protected.
    pub fn is_enabled(&self, id: NodeId) -> bool {
        !self.has_selected_ancestor(id) && self.nodes[id.0].accessible
    }

    pub fn selection_state(&self, id: NodeId) -> SelectionState {
        if self.nodes[id.0].selected {
            SelectionState::Selected
        } else if self.contains_selected_subdirectory(id) {
            SelectionState::Indeterminate
        } else {
            SelectionState::Unselected
        }
    }

    /// Verified when every verifiable file in the scope below this node is
    /// complete. Unknown while anything below has not been checked or not
    /// been read yet.
    pub fn verification_state(&self, id: NodeId) -> VerificationState {
        if !self.has_recovery_scope(id) {
            return VerificationState::Unknown;
        }
        let node = &self.nodes[id.0];
        let (Some(files), Some(children)) = (&node.files, &node.children) else {
            return VerificationState::Unknown;
        };
        if files.iter().any(|f| !f.status.is_verified()) {
            return VerificationState::Unknown;
        }

        let mut verified = files
            .iter()
            .filter(|f| f.status.is_verifiable())
            .all(|f| f.status == FileStatus::Complete);

        for &child in children {
            match self.verification_state(child) {
                VerificationState::Unknown => return VerificationState::Unknown,
                VerificationState::Corrupt => verified = false,
                VerificationState::Verified => {}
            }
        }

        if verified {
            VerificationState::Verified
        } else {
            VerificationState::Corrupt
        }
    }

    /// Marks or unmarks a node as a base directory.
    ///
    /// Either way, everything below the node ends up unselected, including
    /// subdirectories that have not been read yet. File statuses below the
    /// node were computed for the previous scope, so they are dropped and
    /// read again on next access.
    pub fn set_selected(&mut self, id: NodeId, selected: bool) {
        let mut changed = self.nodes[id.0].selected != selected;
        self.nodes[id.0].selected = selected;
        self.nodes[id.0].descendants_deselected = true;
        if !selected {
            self.nodes[id.0].covered = None;
        }

        let descendants = self.materialized_descendants(id);
        for &d in &descendants {
            if self.nodes[d.0].selected {
                self.nodes[d.0].selected = false;
                self.nodes[d.0].covered = None;
                changed = true;
            }
            self.invalidate(d, true, true);
        }

        if changed {
            self.nodes[id.0].files = None;
            for &d in &descendants {
                self.nodes[d.0].files = None;
            }
        }

        self.invalidate(id, true, true);
        self.invalidate_ancestors(id, true, true);
    }

    /// Files in protected scopes at or below this node that their recovery
    /// file does not cover.
    pub fn new_files(&mut self, id: NodeId) -> Vec<PathBuf> {
        if self.has_recovery_scope(id) {
            let mut found = Vec::new();
            for node in self.subtree(id) {
                found.extend(
                    self.files(node)
                        .iter()
                        .filter(|f| f.status == FileStatus::New)
                        .map(|f| f.path.clone()),
                );
            }
            return found;
        }

        let mut found = Vec::new();
        for child in self.children(id) {
            if self.contains_recoverable(child) {
                found.extend(self.new_files(child));
            }
        }
        found
    }

    /// Human readable overview of the files at and below a node.
    pub fn status_summary(&mut self, id: NodeId) -> String {
        if !self.nodes[id.0].accessible {
            return "Unable to read contents of this directory".to_string();
        }
        if !self.has_recovery_scope(id) {
            return "No recovery files for this directory".to_string();
        }

        let own: Vec<FileStatus> = self.files(id).iter().map(|f| f.status).collect();
        let mut below = Vec::new();
        for node in self.subtree(id).into_iter().skip(1) {
            below.extend(self.files(node).iter().map(|f| f.status));
        }

        if !self.nodes[id.0].accessible {
            return "Unable to read contents of this directory".to_string();
        }
        if own.is_empty() && below.is_empty() {
            return "Empty".to_string();
        }

        let mut sections = Vec::new();
        if !own.is_empty() {
            sections.push(format!("In this directory\n{}", count_by_status(&own)));
        }
        if !below.is_empty() {
            sections.push(format!("In subdirectories\n{}", count_by_status(&below)));
        }
        sections.join("\n\n")
    }

    /// Hands out the invalidations recorded since the last call.
    pub fn take_invalidations(&mut self) -> BTreeMap<NodeId, Invalidation> {
        std::mem::take(&mut self.invalidated)
    }

    fn invalidate(&mut self, id: NodeId, selection: bool, verification: bool) {
        let entry = self.invalidated.entry(id).or_default();
        entry.selection |= selection;
        entry.verification |= verification;
    }

    fn invalidate_ancestors(&mut self, id: NodeId, selection: bool, verification: bool) {
        let mut current = self.nodes[id.0].parent;
        while let Some(ancestor) = current {
            self.invalidate(ancestor, selection, verification);
            current = self.nodes[ancestor.0].parent;
        }
    }
}

fn count_by_status(statuses: &[FileStatus]) -> String {
    let mut counts: BTreeMap<FileStatus, usize> = BTreeMap::new();
    for status in statuses {
        *counts.entry(*status).or_default() += 1;
    }
    counts
        .iter()
        .map(|(status, count)| format!("{status}: {count}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests;
