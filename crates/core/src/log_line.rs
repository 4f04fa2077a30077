// crates/core/src/log_line.rs
//! Grammar of one structured run-log line.
//!
//! ```text
//! 2025-03-09 14:02:11.482 | INFO     | app.agent:run:42 - Executing step 2/5
//! ```
//!
//! The `source:function:line - ` segment is optional. Lines that do not start
//! with the timestamp and level columns are not structured and are treated as
//! plain text by every consumer.

use std::sync::LazyLock;

use chrono::{Local, NaiveDateTime, TimeZone};
use regex_lite::Regex;

use crate::types::{unix_now, LogEntry, LogLevel};

/// Bumped whenever the producing side changes its line layout.
pub const LOG_GRAMMAR_VERSION: u32 = 1;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\.\d+) \| ([A-Za-z]+)\s*\| ?(.*)$")
        .expect("static pattern")
});

static SOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^\s:]+:[^\s:]+:\d+) - (.*)$").expect("static pattern")
});

/// A structured line, borrowing from the input text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine<'a> {
    /// Timestamp column exactly as written.
    pub timestamp_text: &'a str,
    pub timestamp: NaiveDateTime,
    pub level: LogLevel,
    /// `source:function:line`, if the line carries one.
    pub source: Option<&'a str>,
    pub message: &'a str,
}

impl LogLine<'_> {
    /// Seconds since the epoch, reading the timestamp as local time.
    pub fn unix_timestamp(&self) -> Option<f64> {
        Local
            .from_local_datetime(&self.timestamp)
            .earliest()
            .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
    }
}

/// Parse one line. Returns `None` for anything outside the grammar.
pub fn parse_line(line: &str) -> Option<LogLine<'_>> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let caps = LINE_RE.captures(line)?;
    let timestamp_text = caps.get(1)?.as_str();
    let timestamp = NaiveDateTime::parse_from_str(timestamp_text, TIMESTAMP_FORMAT).ok()?;
    let level = LogLevel::from_name(caps.get(2)?.as_str())?;
    let rest = caps.get(3).map_or("", |m| m.as_str());

    let (source, message) = match SOURCE_RE.captures(rest) {
        Some(src) => (
            src.get(1).map(|m| m.as_str()),
            src.get(2).map_or("", |m| m.as_str()),
        ),
        None => (None, rest),
    };

    Some(LogLine {
        timestamp_text,
        timestamp,
        level,
        source,
        message,
    })
}

/// Convert a raw line into a registry entry. Unstructured text becomes `INFO`.
pub fn to_log_entry(line: &str) -> LogEntry {
    match parse_line(line) {
        Some(parsed) => LogEntry {
            level: parsed.level,
            message: parsed.message.to_string(),
            timestamp: parsed.unix_timestamp().unwrap_or_else(unix_now),
        },
        None => LogEntry::info(line.trim_end()),
    }
}

/// Render a line in the same grammar [`parse_line`] accepts.
pub fn format_line(
    timestamp: NaiveDateTime,
    level: LogLevel,
    source: Option<&str>,
    message: &str,
) -> String {
    let ts = timestamp.format("%Y-%m-%d %H:%M:%S%.3f");
    match source {
        Some(src) => format!("{ts} | {:<8} | {src} - {message}", level.as_str()),
        None => format!("{ts} | {:<8} | {message}", level.as_str()),
    }
}
