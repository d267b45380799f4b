//! Grammars for the reports printed by the recovery engine.
//!
//! The engine prints each report as a fixed sequence of sections (a
//! preamble, a column header, a table of rows, a trailer). A parser walks
//! an ordered list of stages, one per section. Each line is handed to the
//! current stage only; when a stage reports that its section is over, the
//! parser moves on and never consults that stage again.

use crate::line_framer::FramedLine;
use regex::Regex;
use std::sync::LazyLock;

/// What a single stage made of a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome<T> {
    /// The current section has ended; later lines go to the next stage.
    pub advance: bool,
    /// The line is something a user would see on the console. Bare
    /// progress counters are not, since the engine immediately redraws them.
    pub printable: bool,
    pub record: Option<T>,
}

impl<T> StageOutcome<T> {
    fn stay(printable: bool) -> Self {
        StageOutcome {
            advance: false,
            printable,
            record: None,
        }
    }

    fn advance() -> Self {
        StageOutcome {
            advance: true,
            printable: true,
            record: None,
        }
    }

    fn record(record: T) -> Self {
        StageOutcome {
            advance: false,
            printable: true,
            record: Some(record),
        }
    }
}

pub type Stage<T> = fn(&str) -> StageOutcome<T>;

/// Final stage of every grammar: everything after the last section is ignored.
fn ignore_rest<T>(_line: &str) -> StageOutcome<T> {
    StageOutcome::stay(true)
}

pub struct StagedParser<T: 'static> {
    stages: &'static [Stage<T>],
    current: usize,
    records: Vec<T>,
}

impl<T: 'static> StagedParser<T> {
    fn new(stages: &'static [Stage<T>]) -> Self {
        StagedParser {
            stages,
            current: 0,
            records: Vec::new(),
        }
    }

    /// Feeds one framed line through the current stage.
    ///
    /// `progress` receives the line when the stage marks it printable or
    /// when it starts a new console line, so overwrite sequences still end
    /// in the right place on the caller's display.
    pub fn process_line(&mut self, line: &FramedLine, progress: &mut dyn FnMut(&str, bool)) {
        let outcome = match self.stages.get(self.current) {
            Some(stage) => stage(&line.text),
            None => ignore_rest(&line.text),
        };

        if outcome.advance {
            self.current += 1;
        } else if let Some(record) = outcome.record {
            self.records.push(record);
        }

        if outcome.printable || line.is_new_line {
            progress(&line.text, line.is_new_line);
        }
    }

    pub fn into_records(self) -> Vec<T> {
        self.records
    }
}

static LIST_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s+Size\s+Slice\s+(?:MD5 Hash\s+)?:\s+Filename").expect("valid regex")
});

static LIST_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\s+[\d?]+\s+[\d?]+\s+(?:[\da-fA-F?]+\s+)?:\s+"(.+)""#).expect("valid regex")
});

const LIST_STAGES: &[Stage<String>] = &[until_list_header, list_row, ignore_rest];

fn until_list_header(line: &str) -> StageOutcome<String> {
    if LIST_HEADER.is_match(line) {
        StageOutcome::advance()
    } else {
        StageOutcome::stay(true)
    }
}

fn list_row(line: &str) -> StageOutcome<String> {
    match LIST_ROW.captures(line) {
        // Directory rows carry no data of their own.
        Some(caps) if caps[1].ends_with('/') => StageOutcome::stay(true),
        Some(caps) => StageOutcome::record(caps[1].to_string()),
        None => StageOutcome::advance(),
    }
}

/// Parser for the output of `list`: yields the file names covered by an archive.
pub fn list_parser() -> StagedParser<String> {
    StagedParser::new(LIST_STAGES)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyRecord {
    /// Path relative to the verified directory, as printed by the engine.
    pub filename: String,
    /// Status token such as `Complete`, `Missing` or a damage description.
    pub status: String,
}

static VERIFY_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+Size\s+Status\s+:\s+Filename").expect("valid regex"));

static VERIFY_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#".+\s+(\S+)\s+:\s+"(.+)""#).expect("valid regex"));

static LEADING_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+\.?\d*(%)?[^:]*(:)?").expect("valid regex"));

static PURE_PROGRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+(?:\.\d+)?(%)?\s*$").expect("valid regex"));

const VERIFY_STAGES: &[Stage<VerifyRecord>] = &[until_verify_table, verify_row, ignore_rest];

/// Scans past everything before the verify table, including the section in
/// which the engine loads its recovery packets. Counters in that section
/// are only worth showing when they carry a percentage or a label.
fn until_verify_table(line: &str) -> StageOutcome<VerifyRecord> {
    if VERIFY_HEADER.is_match(line) {
        return StageOutcome::advance();
    }
    let printable = match LEADING_NUMBER.captures(line) {
        Some(caps) => caps.get(1).is_some() || caps.get(2).is_some(),
        None => true,
    };
    StageOutcome::stay(printable)
}

fn verify_row(line: &str) -> StageOutcome<VerifyRecord> {
    if let Some(caps) = VERIFY_ROW.captures(line) {
        return StageOutcome::record(VerifyRecord {
            filename: caps[2].to_string(),
            status: caps[1].to_string(),
        });
    }
    if let Some(caps) = PURE_PROGRESS.captures(line) {
        return StageOutcome::stay(caps.get(1).is_some());
    }
    StageOutcome::advance()
}

/// Parser for the output of `verify`: yields a status token per file.
pub fn verify_parser() -> StagedParser<VerifyRecord> {
    StagedParser::new(VERIFY_STAGES)
}
