mod cancel;
mod cli;
mod config;
mod dir_list;
mod engine;
mod line_framer;
mod output_parser;
mod progress;
mod recovery_store;
mod scan;
mod session;
mod tree;

use cancel::{CancelToken, Outcome};
use cli::{Cli, Command};
use config::{Redundancy, Settings};
use engine::{DEFAULT_ENGINE, Par2Engine};
use progress::ConsoleProgress;
use session::{DirectoryStatus, Session};
use std::fmt as stdfmt;
use std::io::{IsTerminal, stderr, stdout};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{Event, Level, Subscriber, debug, error, info, warn};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt as tracing_fmt;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tree::{OperationReport, SelectionState, VerificationState};

struct PartreeExitCode;

impl PartreeExitCode {
    /// Exit code used when damage was found, the engine failed, or the user interrupted.
    fn unclean() -> ExitCode {
        ExitCode::from(1)
    }

    /// Exit code used for other errors (I/O errors, invalid arguments, etc.).
    fn any_error() -> ExitCode {
        ExitCode::from(255)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.log_level.as_deref());

    // Resolve the settings path before -C changes what relative paths mean.
    let config_path = cli
        .config
        .clone()
        .or_else(Settings::default_path)
        .map(|p| std::path::absolute(&p).unwrap_or(p));

    if let Some(directory) = &cli.directory
        && let Err(e) = std::env::set_current_dir(directory)
    {
        error!(
            "Failed to change directory to {}: {}",
            directory.display(),
            e
        );
        return PartreeExitCode::any_error();
    }

    let mut settings = match &config_path {
        Some(path) => match Settings::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                error!("Unable to load settings from {}: {}", path.display(), e);
                return PartreeExitCode::any_error();
            }
        },
        None => Settings::default(),
    };
    let loaded = settings.clone();

    let program = cli
        .engine
        .clone()
        .or_else(|| settings.engine.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENGINE));

    let cancel = CancelToken::new();
    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGINT, cancel.flag()) {
        warn!("Unable to handle Ctrl-C, interrupting will stop immediately: {e}");
    }

    let result = run(cli.command, &mut settings, Par2Engine::new(program), &cancel);

    if settings != loaded
        && let Some(path) = &config_path
    {
        match settings.save(path) {
            Ok(()) => debug!("Saved settings to {}", path.display()),
            Err(e) => warn!("Unable to save settings to {}: {}", path.display(), e),
        }
    }

    match result {
        Ok(exit_code) => exit_code,
        Err(err) => {
            error!("{err}");
            PartreeExitCode::any_error()
        }
    }
}

fn run(
    command: Command,
    settings: &mut Settings,
    engine: Par2Engine,
    cancel: &CancelToken,
) -> anyhow::Result<ExitCode> {
    let mut session = match Session::open(Path::new("."), Box::new(engine), cancel)? {
        Outcome::Completed(session) => session,
        Outcome::Cancelled => {
            warn!("Interrupted while scanning recovery storage");
            return Ok(PartreeExitCode::unclean());
        }
    };

    match command {
        Command::Status { path, all } => handle_status(&mut session, &path, all),
        Command::Protect { path, redundancy } => {
            let redundancy = redundancy_for(settings, redundancy);
            handle_protect(&mut session, &path, redundancy, cancel)
        }
        Command::Unprotect { path } => handle_unprotect(&mut session, &path),
        Command::Recreate { path, redundancy } => {
            let redundancy = redundancy_for(settings, redundancy);
            handle_recreate(&mut session, &path, redundancy, cancel)
        }
        Command::Verify { path } => handle_verify(&mut session, &path, cancel),
        Command::Repair { path } => handle_repair(&mut session, &path, cancel),
        Command::Clean { path } => handle_clean(&mut session, &path),
        Command::NewFiles { path } => handle_new_files(&mut session, &path),
    }
}

/// A redundancy given on the command line becomes the new default.
fn redundancy_for(settings: &mut Settings, requested: Option<Redundancy>) -> Redundancy {
    if let Some(redundancy) = requested {
        settings.redundancy_percent = redundancy;
    }
    settings.redundancy_percent
}

/// Runs `op` with engine progress shown on stdout.
fn with_progress<T>(op: impl FnOnce(&mut dyn FnMut(&str, bool)) -> T) -> T {
    let out = stdout();
    let interactive = out.is_terminal();
    let mut console = ConsoleProgress::new(out.lock(), interactive);

    let result = op(&mut |text: &str, is_new_line: bool| {
        if let Err(e) = console.update(text, is_new_line) {
            debug!("Unable to show progress: {e}");
        }
    });

    if let Err(e) = console.finish() {
        debug!("Unable to show progress: {e}");
    }
    result
}

fn report_exit(report: &OperationReport) -> ExitCode {
    if !report.failures.is_empty() {
        error!(
            "The recovery engine failed for {} of {} directories",
            report.failures.len(),
            report.scopes_processed
        );
    }
    if report.cancelled {
        warn!("Interrupted; work finished before the interruption is kept");
    }

    if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        PartreeExitCode::unclean()
    }
}

fn relative_to_root<'a>(session: &Session, path: &'a Path) -> &'a Path {
    path.strip_prefix(session.root()).unwrap_or(path)
}

fn selection_marker(selection: SelectionState) -> &'static str {
    match selection {
        SelectionState::Selected => "[x]",
        SelectionState::Indeterminate => "[-]",
        SelectionState::Unselected => "[ ]",
    }
}

fn verification_label(verification: VerificationState) -> &'static str {
    match verification {
        VerificationState::Verified => "verified",
        VerificationState::Corrupt => "corrupt",
        VerificationState::Unknown => "unknown",
    }
}

fn status_line(row: &DirectoryStatus) -> String {
    let note = if !row.accessible {
        " (unreadable)"
    } else if !row.enabled {
        " (inside protected directory)"
    } else {
        ""
    };
    format!(
        "{} {:<8} {}{}",
        selection_marker(row.selection),
        verification_label(row.verification),
        row.path.display(),
        note
    )
}

fn handle_status(session: &mut Session, path: &Path, all: bool) -> anyhow::Result<ExitCode> {
    let id = session.resolve(path)?;

    for row in session.directory_statuses(id, all) {
        println!("{}", status_line(&row));
    }
    println!();
    println!("{}", session.status_summary(id));

    Ok(ExitCode::SUCCESS)
}

fn handle_protect(
    session: &mut Session,
    path: &Path,
    redundancy: Redundancy,
    cancel: &CancelToken,
) -> anyhow::Result<ExitCode> {
    let id = session.resolve(path)?;
    let report = with_progress(|progress| session.protect(id, redundancy, progress, cancel))?;

    if report.is_clean() {
        info!(
            "Protected {} with {redundancy}% redundancy",
            session.display_path(id).display()
        );
    }
    Ok(report_exit(&report))
}

fn handle_unprotect(session: &mut Session, path: &Path) -> anyhow::Result<ExitCode> {
    let id = session.resolve(path)?;
    let removed = session.unprotect(id)?;
    info!("Deleted {removed} recovery files");
    Ok(ExitCode::SUCCESS)
}

fn handle_recreate(
    session: &mut Session,
    path: &Path,
    redundancy: Redundancy,
    cancel: &CancelToken,
) -> anyhow::Result<ExitCode> {
    let id = session.resolve(path)?;
    let report = with_progress(|progress| session.recreate(id, redundancy, progress, cancel))?;
    info!(
        "Recreated recovery files for {} directories",
        report.scopes_processed
    );
    Ok(report_exit(&report))
}

fn handle_verify(session: &mut Session, path: &Path, cancel: &CancelToken) -> anyhow::Result<ExitCode> {
    let id = session.resolve(path)?;
    let report = with_progress(|progress| session.verify(id, progress, cancel))?;

    if report.scopes_processed == 0 && report.is_clean() {
        warn!("No protected directories to verify");
        return Ok(ExitCode::SUCCESS);
    }

    let damaged = session.incomplete_files(id);
    for file in &damaged {
        println!(
            "{:<8} {}",
            file.status(),
            relative_to_root(session, file.path()).display()
        );
    }

    if !damaged.is_empty() {
        error!(
            "Verification failed: {} missing or corrupt files",
            damaged.len()
        );
        report_exit(&report);
        return Ok(PartreeExitCode::unclean());
    }

    if report.is_clean() {
        info!(
            "Verification successful: {} protected directories intact",
            report.scopes_processed
        );
    }
    Ok(report_exit(&report))
}

fn handle_repair(session: &mut Session, path: &Path, cancel: &CancelToken) -> anyhow::Result<ExitCode> {
    let id = session.resolve(path)?;
    let report = with_progress(|progress| session.repair(id, progress, cancel))?;

    if report.is_clean() {
        info!("Repaired {} protected directories", report.scopes_processed);
    }
    Ok(report_exit(&report))
}

fn handle_clean(session: &mut Session, path: &Path) -> anyhow::Result<ExitCode> {
    let id = session.resolve(path)?;
    let removed = session.clean(id)?;
    info!("Deleted {removed} unused recovery files");
    Ok(ExitCode::SUCCESS)
}

fn handle_new_files(session: &mut Session, path: &Path) -> anyhow::Result<ExitCode> {
    let id = session.resolve(path)?;
    let new_files = session.new_files(id);
    for file in &new_files {
        println!("{}", relative_to_root(session, file).display());
    }
    info!("{} new files", new_files.len());
    Ok(ExitCode::SUCCESS)
}

fn init_tracing(verbose: u8, log_level: Option<&str>) {
    let stderr_is_terminal = stderr().is_terminal();
    let formatter = EmojiFormatter { stderr_is_terminal };

    let filter = match (log_level, verbose) {
        (Some(level), _) => EnvFilter::new(level),
        (None, 0) => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
        }
        (None, 1) => EnvFilter::new("info"),
        (None, _) => EnvFilter::new("debug"),
    };

    let fmt_layer = tracing_fmt::layer()
        .event_format(formatter)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

struct EmojiFormatter {
    stderr_is_terminal: bool,
}

impl<S, N> FormatEvent<S, N> for EmojiFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        let level = *event.metadata().level();
        if self.stderr_is_terminal {
            let prefix = match level {
                Level::TRACE => "🔬 ",
                Level::DEBUG => "🔍 ",
                Level::INFO => "ℹ️ ",
                Level::WARN => "⚠️  ",
                Level::ERROR => "❌️ ",
            };
            writer.write_str(prefix)?;
        } else {
            write!(writer, "{level}: ")?;
        }

        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
