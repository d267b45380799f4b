use super::*;
use crate::config::Redundancy;
use crate::engine::{EngineExit, VerifyReport, Verb};
use crate::output_parser::VerifyRecord;
use crate::recovery_store::RECOVERY_DIR_NAME;
use crate::scan::scan_recovery_storage;
use std::cell::RefCell;
use std::fs;
use std::rc::Rc;
use tempfile::TempDir;

/// Remembers the contents of every file an archive was created from, so
/// verify can tell missing and damaged files apart and repair can restore them.
#[derive(Debug)]
struct EngineState {
    snapshots: BTreeMap<PathBuf, BTreeMap<String, Vec<u8>>>,
    calls: Vec<(Verb, PathBuf)>,
    create_exit: i32,
    verify_exit: Option<i32>,
    repair_exit: i32,
    cancel_on: Option<Verb>,
}

#[derive(Debug, Clone)]
struct FakeEngine {
    state: Rc<RefCell<EngineState>>,
}

impl FakeEngine {
    fn new() -> Self {
        FakeEngine {
            state: Rc::new(RefCell::new(EngineState {
                snapshots: BTreeMap::new(),
                calls: Vec::new(),
                create_exit: 0,
                verify_exit: None,
                repair_exit: 0,
                cancel_on: None,
            })),
        }
    }

    fn calls(&self) -> Vec<(Verb, PathBuf)> {
        self.state.borrow().calls.clone()
    }

    fn calls_of(&self, verb: Verb) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter(|(v, _)| *v == verb)
            .map(|(_, p)| p)
            .collect()
    }

    fn set_create_exit(&self, code: i32) {
        self.state.borrow_mut().create_exit = code;
    }

    fn set_verify_exit(&self, code: i32) {
        self.state.borrow_mut().verify_exit = Some(code);
    }

    fn set_repair_exit(&self, code: i32) {
        self.state.borrow_mut().repair_exit = code;
    }

    fn cancel_on(&self, verb: Verb) {
        self.state.borrow_mut().cancel_on = Some(verb);
    }

    /// Records the call and reports whether it should be cancelled.
    fn enter(&self, verb: Verb, path: &Path, cancel: &CancelToken) -> bool {
        let mut state = self.state.borrow_mut();
        state.calls.push((verb, path.to_path_buf()));
        if state.cancel_on == Some(verb) {
            cancel.cancel();
            return true;
        }
        false
    }
}

fn snapshot(dir: &Path, prefix: &str, into: &mut BTreeMap<String, Vec<u8>>) {
    let listing = crate::dir_list::list_directory(dir).unwrap();
    for file in listing.files {
        let name = format!("{prefix}{}", file.file_name().unwrap().to_string_lossy());
        into.insert(name, fs::read(&file).unwrap());
    }
    for sub in listing.dirs {
        let prefix = format!("{prefix}{}/", sub.file_name().unwrap().to_string_lossy());
        snapshot(&sub, &prefix, into);
    }
}

impl RecoveryEngine for FakeEngine {
    fn create(
        &self,
        dir: &Path,
        archive: &Path,
        _redundancy: Redundancy,
        progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
    ) -> Result<Outcome<EngineExit>, EngineError> {
        if self.enter(Verb::Create, dir, cancel) {
            return Ok(Outcome::Cancelled);
        }
        progress("Creating recovery file", true);

        let exit = self.state.borrow().create_exit;
        if exit == 0 {
            let mut files = BTreeMap::new();
            snapshot(dir, "", &mut files);
            fs::write(archive, "PAR2").unwrap();
            self.state
                .borrow_mut()
                .snapshots
                .insert(archive.to_path_buf(), files);
        }
        Ok(Outcome::Completed(EngineExit(exit)))
    }

    fn list(
        &self,
        archive: &Path,
        cancel: &CancelToken,
    ) -> Result<Outcome<Vec<String>>, EngineError> {
        if self.enter(Verb::List, archive, cancel) {
            return Ok(Outcome::Cancelled);
        }
        let state = self.state.borrow();
        Ok(Outcome::Completed(
            state
                .snapshots
                .get(archive)
                .map(|files| files.keys().cloned().collect())
                .unwrap_or_default(),
        ))
    }

    fn verify(
        &self,
        dir: &Path,
        archive: &Path,
        progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
    ) -> Result<Outcome<VerifyReport>, EngineError> {
        if self.enter(Verb::Verify, dir, cancel) {
            return Ok(Outcome::Cancelled);
        }
        progress("50%", true);
        progress("100%", false);

        let state = self.state.borrow();
        if let Some(code) = state.verify_exit {
            return Ok(Outcome::Completed(VerifyReport {
                exit: EngineExit(code),
                records: Vec::new(),
            }));
        }

        let mut records = Vec::new();
        let mut damaged = false;
        for (name, expected) in state.snapshots.get(archive).into_iter().flatten() {
            let status = match fs::read(dir.join(name)) {
                Err(_) => "Missing",
                Ok(actual) if &actual == expected => "Complete",
                Ok(_) => "Damaged",
            };
            damaged |= status != "Complete";
            records.push(VerifyRecord {
                filename: name.clone(),
                status: status.to_string(),
            });
        }
        Ok(Outcome::Completed(VerifyReport {
            exit: EngineExit(if damaged { 1 } else { 0 }),
            records,
        }))
    }

    fn repair(
        &self,
        dir: &Path,
        archive: &Path,
        _progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
    ) -> Result<Outcome<EngineExit>, EngineError> {
        if self.enter(Verb::Repair, dir, cancel) {
            return Ok(Outcome::Cancelled);
        }
        let state = self.state.borrow();
        if state.repair_exit == 0 {
            for (name, contents) in state.snapshots.get(archive).into_iter().flatten() {
                let path = dir.join(name);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, contents).unwrap();
            }
        }
        Ok(Outcome::Completed(EngineExit(state.repair_exit)))
    }
}

/// A working root with a canonical path, so engine paths compare equal.
fn working_root() -> (TempDir, PathBuf) {
    let temp = TempDir::new().unwrap();
    let root = temp.path().canonicalize().unwrap();
    (temp, root)
}

fn open(root: &Path, engine: &FakeEngine) -> DirectoryTree {
    open_with_cancel(root, engine, &CancelToken::new())
}

fn open_with_cancel(root: &Path, engine: &FakeEngine, cancel: &CancelToken) -> DirectoryTree {
    let storage = root.join(RECOVERY_DIR_NAME);
    let index = match scan_recovery_storage(&storage, &CancelToken::new()).unwrap() {
        Outcome::Completed(index) => index,
        Outcome::Cancelled => panic!("scan was cancelled"),
    };
    DirectoryTree::new(
        root.to_path_buf(),
        storage,
        index,
        Box::new(engine.clone()),
        cancel.clone(),
    )
}

fn find(tree: &mut DirectoryTree, rel: &str) -> NodeId {
    tree.find(Path::new(rel))
        .unwrap_or_else(|| panic!("no node for {rel}"))
}

fn child_names(tree: &mut DirectoryTree, id: NodeId) -> Vec<String> {
    tree.children(id)
        .into_iter()
        .map(|c| tree.node(c).name().into_owned())
        .collect()
}

fn statuses(tree: &mut DirectoryTree, id: NodeId) -> Vec<(String, FileStatus)> {
    tree.files(id)
        .iter()
        .map(|f| (f.name().into_owned(), f.status()))
        .collect()
}

fn status_of(tree: &mut DirectoryTree, rel: &str, name: &str) -> FileStatus {
    let id = find(tree, rel);
    tree.files(id)
        .iter()
        .find(|f| f.name() == name)
        .unwrap_or_else(|| panic!("no file {name} in {rel}"))
        .status()
}

fn redundancy() -> Redundancy {
    Redundancy::new(10.0).unwrap()
}

/// Selects `rel` and creates its recovery file.
fn protect(tree: &mut DirectoryTree, rel: &str) -> OperationReport {
    let id = find(tree, rel);
    tree.set_selected(id, true);
    tree.create_recovery_files(id, redundancy(), false, &mut |_, _| {}, &CancelToken::new())
        .unwrap()
}

fn verify(tree: &mut DirectoryTree, rel: &str) -> OperationReport {
    let id = find(tree, rel);
    tree.verify_files(id, &mut |_, _| {}, &CancelToken::new())
        .unwrap()
}
