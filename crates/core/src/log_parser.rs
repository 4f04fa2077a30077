// crates/core/src/log_parser.rs
//! Structured extraction from a run log.
//!
//! [`parse_log_text`] is a pure pass over the full text of one log. It never
//! fails: lines it does not recognise are ignored. The file and directory
//! helpers wrap it and turn I/O failures into a report carrying `error`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use chrono::{DateTime, Local, NaiveDateTime};
use memchr::memmem;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::error::LogError;
use crate::log_line::{parse_line, LOG_GRAMMAR_VERSION};
use crate::paths::is_plain_name;
use crate::types::{percent_of, LogLevel};

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Default number of files returned by directory listings.
pub const DEFAULT_LIST_LIMIT: usize = 10;

static PLAN_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)plan with ID: (plan_\d+)").expect("static pattern")
});
static PLAN_TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Plan: (.*?) \(ID: plan_\d+\)").expect("static pattern")
});
static STEP_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\.\s+\[([ ✓→!])\]\s+(.*)").expect("static pattern")
});
static EXECUTING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Executing step (\d+)/(\d+)").expect("static pattern")
});
static MARKED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Marked step (\d+) as completed").expect("static pattern")
});
static TOOLS_SELECTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[\w.-]+ )?selected \d+ tools? to use").expect("static pattern")
});
static TOOLS_PREPARED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Tools being prepared: \['([^']+)'").expect("static pattern")
});
static TOOL_ACTIVATING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Activating tool: '([^']+)'").expect("static pattern")
});
static TOOL_COMPLETED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Tool '([^']+)' completed its mission").expect("static pattern")
});
static FILE_STAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{8}_\d{6})$").expect("static pattern")
});

/// Status of one step in a plan's step list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    InProgress,
    Completed,
    Blocked,
}

impl StepStatus {
    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            " " => Some(Self::NotStarted),
            "✓" => Some(Self::Completed),
            "→" => Some(Self::InProgress),
            "!" => Some(Self::Blocked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub text: String,
    pub status: StepStatus,
}

/// One tool-related event. Exactly one of `tool` and `action` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolExecution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// ISO timestamp of the line, or empty when the line has no prefix.
    pub timestamp: String,
}

/// An `ERROR` or `WARNING` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    InProgress,
    Completed,
    Error,
    /// Nothing to parse, e.g. an empty logs directory.
    Unknown,
}

/// Everything [`parse_log_text`] extracts from one log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub grammar_version: u32,
    pub plan_id: Option<String>,
    pub plan_title: Option<String>,
    pub steps: Vec<PlanStep>,
    pub current_step: u32,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub progress_percentage: u8,
    pub tool_executions: Vec<ToolExecution>,
    pub errors: Vec<LogRecord>,
    pub warnings: Vec<LogRecord>,
    #[serde(rename = "status")]
    pub overall_status: RunStatus,
    /// When the run started, best effort. See [`parse_log_file`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    /// Set when the log could not be read at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    /// A report that only carries a failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            grammar_version: LOG_GRAMMAR_VERSION,
            overall_status: RunStatus::Error,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    fn no_logs() -> Self {
        Self {
            grammar_version: LOG_GRAMMAR_VERSION,
            overall_status: RunStatus::Unknown,
            error: Some("No log files found".to_string()),
            ..Self::default()
        }
    }
}

/// Literal phrases whose presence means the run finished.
struct CompletionMarkers {
    task_done: memmem::Finder<'static>,
    plan_done: memmem::Finder<'static>,
    terminate: memmem::Finder<'static>,
    mission: memmem::Finder<'static>,
}

impl CompletionMarkers {
    fn new() -> Self {
        Self {
            task_done: memmem::Finder::new("task processing completed"),
            plan_done: memmem::Finder::new("plan completed"),
            terminate: memmem::Finder::new("terminate"),
            mission: memmem::Finder::new("completed its mission"),
        }
    }

    fn present(&self, lowered: &[u8]) -> bool {
        self.task_done.find(lowered).is_some()
            || self.plan_done.find(lowered).is_some()
            || (self.terminate.find(lowered).is_some() && self.mission.find(lowered).is_some())
    }
}

fn iso(ts: &NaiveDateTime) -> String {
    ts.format(ISO_FORMAT).to_string()
}

fn line_timestamp(line: &str) -> String {
    parse_line(line).map(|l| iso(&l.timestamp)).unwrap_or_default()
}

/// Parse the full text of one log.
///
/// `completed_steps` comes from the `✓` markers in the first `Steps:` block,
/// unless the log contains `Marked step N as completed` lines, in which case
/// the number of distinct marked steps is used instead.
pub fn parse_log_text(content: &str) -> RunReport {
    let mut report = RunReport {
        grammar_version: LOG_GRAMMAR_VERSION,
        ..RunReport::default()
    };

    report.plan_id = PLAN_ID_RE
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    report.plan_title = PLAN_TITLE_RE
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    scan_steps_block(content, &mut report);

    let mut last_executing: Option<(u32, u32)> = None;
    let mut marked: BTreeSet<u32> = BTreeSet::new();

    for line in content.lines() {
        if let Some(caps) = EXECUTING_RE.captures(line) {
            let x = caps.get(1).and_then(|m| m.as_str().parse().ok());
            let y = caps.get(2).and_then(|m| m.as_str().parse().ok());
            if let (Some(x), Some(y)) = (x, y) {
                last_executing = Some((x, y));
            }
        }
        if let Some(n) = MARKED_RE
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
        {
            marked.insert(n);
        }
        scan_tools(line, &mut report.tool_executions);

        if let Some(parsed) = parse_line(line) {
            let record = || LogRecord {
                message: parsed.message.to_string(),
                timestamp: iso(&parsed.timestamp),
            };
            match parsed.level {
                LogLevel::Error => report.errors.push(record()),
                LogLevel::Warning => report.warnings.push(record()),
                _ => {}
            }
        }
    }

    if let Some((x, y)) = last_executing {
        report.current_step = x;
        report.total_steps = report.total_steps.max(y);
    }
    if !marked.is_empty() {
        report.completed_steps = marked.len() as u32;
    }
    // Marker lines can name steps the step list never showed.
    report.total_steps = report.total_steps.max(report.completed_steps);
    report.progress_percentage = percent_of(report.completed_steps, report.total_steps);

    report.overall_status = if !report.errors.is_empty() {
        RunStatus::Error
    } else if CompletionMarkers::new().present(content.to_lowercase().as_bytes())
        || (report.total_steps > 0 && report.completed_steps >= report.total_steps)
    {
        RunStatus::Completed
    } else {
        RunStatus::InProgress
    };

    report.timestamp = content.lines().next().and_then(parse_line).map(|l| iso(&l.timestamp));
    report
}

/// Read the first `Steps:` block: consecutive lines up to a blank line or EOF.
fn scan_steps_block(content: &str, report: &mut RunReport) {
    let mut lines = content.lines();
    if !lines.by_ref().any(|l| l.trim_end().ends_with("Steps:")) {
        return;
    }
    for line in lines {
        if line.trim().is_empty() {
            break;
        }
        let Some(caps) = STEP_LINE_RE.captures(line) else {
            continue;
        };
        let status = caps.get(2).and_then(|m| StepStatus::from_symbol(m.as_str()));
        let text = caps.get(3).map_or("", |m| m.as_str().trim_end());
        if let Some(status) = status {
            if status == StepStatus::Completed {
                report.completed_steps += 1;
            }
            report.steps.push(PlanStep {
                text: text.to_string(),
                status,
            });
        }
    }
    report.total_steps = report.steps.len() as u32;
}

fn scan_tools(line: &str, out: &mut Vec<ToolExecution>) {
    if let Some(m) = TOOLS_SELECTED_RE.find(line) {
        out.push(ToolExecution {
            tool: None,
            action: Some(m.as_str().to_string()),
            timestamp: line_timestamp(line),
        });
    }
    for re in [&*TOOLS_PREPARED_RE, &*TOOL_ACTIVATING_RE, &*TOOL_COMPLETED_RE] {
        if let Some(name) = re.captures(line).and_then(|c| c.get(1)) {
            out.push(ToolExecution {
                tool: Some(name.as_str().to_string()),
                action: None,
                timestamp: line_timestamp(line),
            });
        }
    }
}

/// Start time encoded in a `YYYYMMDD_HHMMSS.log` file name.
fn stamp_from_file_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let caps = FILE_STAMP_RE.captures(stem)?;
    let dt = NaiveDateTime::parse_from_str(caps.get(1)?.as_str(), "%Y%m%d_%H%M%S").ok()?;
    Some(iso(&dt))
}

fn iso_from_system_time(t: SystemTime) -> String {
    let local: DateTime<Local> = t.into();
    iso(&local.naive_local())
}

/// Parse one log file. Never fails; read errors are reported in the result.
///
/// The run timestamp comes from, in order: a `YYYYMMDD_HHMMSS` file name, the
/// first line's timestamp column, the file's mtime, the current time.
pub async fn parse_log_file(path: &Path) -> RunReport {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) => {
            let err = LogError::io(path, e);
            tracing::warn!(path = %path.display(), error = %err, "Failed to read log file");
            let mut report = RunReport::failed(format!("Failed to parse log file: {err}"));
            attach_file_identity(&mut report, path);
            return report;
        }
    };
    let content = String::from_utf8_lossy(&bytes);
    let mut report = parse_log_text(&content);
    attach_file_identity(&mut report, path);

    if let Some(stamp) = stamp_from_file_name(path) {
        report.timestamp = Some(stamp);
    } else if report.timestamp.is_none() {
        let mtime = tokio::fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());
        report.timestamp = Some(iso_from_system_time(mtime));
    }
    report
}

fn attach_file_identity(report: &mut RunReport, path: &Path) {
    report.log_file = path.file_name().map(|n| n.to_string_lossy().into_owned());
    report.log_path = Some(path.display().to_string());
}

/// A `*.log` file found in a logs directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFileInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    /// Last modification time, ISO formatted local time.
    pub modified: String,
    #[serde(skip)]
    modified_at: Option<SystemTime>,
}

/// List `*.log` files in `dir`, newest first, at most `limit` entries.
pub async fn list_log_files(dir: &Path, limit: usize) -> Result<Vec<LogFileInfo>, LogError> {
    let mut read_dir = tokio::fs::read_dir(dir).await.map_err(|e| LogError::dir(dir, e))?;
    let mut files = Vec::new();

    while let Some(entry) = read_dir.next_entry().await.map_err(|e| LogError::io(dir, e))? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let meta = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable log entry");
                continue;
            }
        };
        let modified_at = meta.modified().ok();
        files.push(LogFileInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: meta.len(),
            modified: modified_at.map(iso_from_system_time).unwrap_or_default(),
            modified_at,
            path,
        });
    }

    files.sort_by(|a, b| b.modified_at.cmp(&a.modified_at).then_with(|| b.name.cmp(&a.name)));
    files.truncate(limit);
    Ok(files)
}

/// Parse the most recently modified log in `dir`.
pub async fn latest_log_report(dir: &Path) -> RunReport {
    match list_log_files(dir, 1).await {
        Ok(files) => match files.first() {
            Some(info) => parse_log_file(&info.path).await,
            None => RunReport::no_logs(),
        },
        Err(LogError::DirNotFound { .. }) => RunReport::no_logs(),
        Err(e) => RunReport::failed(format!("Failed to list log files: {e}")),
    }
}

/// Parse up to `limit` logs in `dir`, newest first.
pub async fn list_log_reports(dir: &Path, limit: usize) -> Result<Vec<RunReport>, LogError> {
    let files = match list_log_files(dir, limit).await {
        Ok(files) => files,
        Err(LogError::DirNotFound { .. }) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut reports = Vec::with_capacity(files.len());
    for info in &files {
        reports.push(parse_log_file(&info.path).await);
    }
    Ok(reports)
}

/// Resolve a client-supplied log name inside `dir`, rejecting anything that
/// could escape it.
pub fn resolve_log_name(dir: &Path, name: &str) -> Result<PathBuf, LogError> {
    if !is_plain_name(name) {
        return Err(LogError::InvalidName {
            name: name.to_string(),
        });
    }
    if name.ends_with(".log") {
        Ok(dir.join(name))
    } else {
        Ok(dir.join(format!("{name}.log")))
    }
}
