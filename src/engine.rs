//! Adapter for the external recovery engine.
//!
//! The erasure coding itself is done by a separate program (par2j or a
//! compatible build). It is driven through four verbs: `create`, `list`,
//! `verify` and `repair`. Its standard output is framed into lines and
//! run through the matching report grammar while it is still running.

use crate::cancel::{CancelToken, Outcome};
use crate::config::Redundancy;
use crate::dir_list::{DirListError, hidden_files_recursive};
use crate::line_framer::{FramedLine, LineFramer};
use crate::output_parser::{VerifyRecord, list_parser, verify_parser};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_ENGINE: &str = "par2j";

/// Exit code of `repair` when every file was already intact.
pub const REPAIR_NOT_NEEDED: i32 = 16;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Unable to start recovery engine {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("IO error while talking to the recovery engine: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to collect hidden files: {0}")]
    DirList(#[from] DirListError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    List,
    Verify,
    Repair,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Create => "create",
            Verb::List => "list",
            Verb::Verify => "verify",
            Verb::Repair => "repair",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit code reported by the engine. A process killed by a signal reports -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineExit(pub i32);

impl EngineExit {
    pub fn code(self) -> i32 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    pub fn is_repair_success(self) -> bool {
        self.0 == 0 || self.0 == REPAIR_NOT_NEEDED
    }
}

impl fmt::Display for EngineExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit code {}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub exit: EngineExit,
    pub records: Vec<VerifyRecord>,
}

pub trait RecoveryEngine {
    /// Writes `archive` covering every file below `dir`.
    fn create(
        &self,
        dir: &Path,
        archive: &Path,
        redundancy: Redundancy,
        progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
    ) -> Result<Outcome<EngineExit>, EngineError>;

    /// Names of the files `archive` covers, relative to its base directory.
    /// Whether the files still exist does not matter.
    fn list(&self, archive: &Path, cancel: &CancelToken)
    -> Result<Outcome<Vec<String>>, EngineError>;

    fn verify(
        &self,
        dir: &Path,
        archive: &Path,
        progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
    ) -> Result<Outcome<VerifyReport>, EngineError>;

    fn repair(
        &self,
        dir: &Path,
        archive: &Path,
        progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
    ) -> Result<Outcome<EngineExit>, EngineError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeVerification {
    Checked(VerifyReport),
    /// The base directory is gone, so every covered file is missing.
    DirectoryMissing,
}

/// Verifies a scope, skipping the engine when the directory no longer exists.
pub fn verify_scope(
    engine: &dyn RecoveryEngine,
    dir: &Path,
    archive: &Path,
    progress: &mut dyn FnMut(&str, bool),
    cancel: &CancelToken,
) -> Result<Outcome<ScopeVerification>, EngineError> {
    if !dir.is_dir() {
        info!(
            "{} does not exist, treating all its files as missing",
            dir.display()
        );
        return Ok(Outcome::Completed(ScopeVerification::DirectoryMissing));
    }

    Ok(match engine.verify(dir, archive, progress, cancel)? {
        Outcome::Completed(report) => Outcome::Completed(ScopeVerification::Checked(report)),
        Outcome::Cancelled => Outcome::Cancelled,
    })
}

/// Runs the engine as a child process.
#[derive(Debug, Clone)]
pub struct Par2Engine {
    program: PathBuf,
}

impl Par2Engine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Par2Engine {
            program: program.into(),
        }
    }

    /// Spawns the engine and feeds every framed line of its standard output
    /// to `on_line`. A cancellation kills the process outright: the engine
    /// only listens for its own cancel key on an interactive console.
    fn run(
        &self,
        args: Vec<OsString>,
        on_line: &mut dyn FnMut(&FramedLine),
        cancel: &CancelToken,
    ) -> Result<Outcome<EngineExit>, EngineError> {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        debug!(
            "Running {} {}",
            self.program.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("engine stdout was not captured"))?;

        let child = Mutex::new(child);
        let finished = AtomicBool::new(false);
        let killed = AtomicBool::new(false);

        let read_result = std::thread::scope(|scope| {
            scope.spawn(|| {
                while !finished.load(Ordering::SeqCst) {
                    if cancel.is_cancelled() {
                        let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
                        if let Err(e) = child.kill() {
                            warn!("Unable to stop the recovery engine: {e}");
                        }
                        killed.store(true, Ordering::SeqCst);
                        return;
                    }
                    std::thread::sleep(CANCEL_POLL_INTERVAL);
                }
            });

            let mut result = Ok(());
            for line in LineFramer::new(stdout) {
                match line {
                    Ok(line) => on_line(&line),
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            finished.store(true, Ordering::SeqCst);
            result
        });

        let status = child
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .wait()?;

        if killed.load(Ordering::SeqCst) {
            info!("Recovery engine stopped by cancellation");
            return Ok(Outcome::Cancelled);
        }
        read_result?;

        let exit = EngineExit(status.code().unwrap_or(-1));
        debug!("Recovery engine finished with {exit}");
        Ok(Outcome::Completed(exit))
    }
}

impl Default for Par2Engine {
    fn default() -> Self {
        Par2Engine::new(DEFAULT_ENGINE)
    }
}

fn dir_argument(dir: &Path) -> OsString {
    let mut arg = OsString::from("/d");
    arg.push(dir);
    arg
}

impl RecoveryEngine for Par2Engine {
    fn create(
        &self,
        dir: &Path,
        archive: &Path,
        redundancy: Redundancy,
        progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
    ) -> Result<Outcome<EngineExit>, EngineError> {
        info!(
            "Creating recovery file {} at {redundancy}% redundancy",
            archive.display()
        );

        let mut args: Vec<OsString> = vec![
            Verb::Create.as_str().into(),
            "/uo".into(),
            format!("/rr{redundancy}").into(),
            archive.into(),
            dir.join("*").into(),
        ];
        // The engine's wildcard skips hidden files, so name them explicitly.
        args.extend(hidden_files_recursive(dir)?.into_iter().map(OsString::from));

        self.run(args, &mut |line: &FramedLine| progress(&line.text, line.is_new_line), cancel)
    }

    fn list(
        &self,
        archive: &Path,
        cancel: &CancelToken,
    ) -> Result<Outcome<Vec<String>>, EngineError> {
        debug!("Listing files covered by {}", archive.display());

        let args: Vec<OsString> = vec![Verb::List.as_str().into(), "/uo".into(), archive.into()];
        let mut parser = list_parser();
        let outcome = self.run(
            args,
            &mut |line: &FramedLine| parser.process_line(line, &mut |_, _| {}),
            cancel,
        )?;

        Ok(match outcome {
            Outcome::Completed(exit) => {
                if !exit.is_success() {
                    warn!("Listing {} ended with {exit}", archive.display());
                }
                Outcome::Completed(parser.into_records())
            }
            Outcome::Cancelled => Outcome::Cancelled,
        })
    }

    fn verify(
        &self,
        dir: &Path,
        archive: &Path,
        progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
    ) -> Result<Outcome<VerifyReport>, EngineError> {
        info!("Verifying {} against {}", dir.display(), archive.display());

        let args: Vec<OsString> = vec![
            Verb::Verify.as_str().into(),
            "/uo".into(),
            dir_argument(dir),
            archive.into(),
        ];
        let mut parser = verify_parser();
        let outcome = self.run(
            args,
            &mut |line: &FramedLine| parser.process_line(line, &mut *progress),
            cancel,
        )?;

        Ok(match outcome {
            Outcome::Completed(exit) => Outcome::Completed(VerifyReport {
                exit,
                records: parser.into_records(),
            }),
            Outcome::Cancelled => Outcome::Cancelled,
        })
    }

    fn repair(
        &self,
        dir: &Path,
        archive: &Path,
        progress: &mut dyn FnMut(&str, bool),
        cancel: &CancelToken,
    ) -> Result<Outcome<EngineExit>, EngineError> {
        info!("Repairing {} from {}", dir.display(), archive.display());

        let args: Vec<OsString> = vec![
            Verb::Repair.as_str().into(),
            "/uo".into(),
            dir_argument(dir),
            archive.into(),
        ];
        self.run(args, &mut |line: &FramedLine| progress(&line.text, line.is_new_line), cancel)
    }
}
