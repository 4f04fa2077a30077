// crates/core/src/types.rs
use serde::{Deserialize, Serialize};

/// Wall-clock seconds since the Unix epoch, with millisecond precision.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Kind of a timeline record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Thinking,
    Conclusion,
    Error,
    Communication,
}

/// One timeline record. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: f64,
}

impl Step {
    pub fn new(kind: StepKind, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            details,
            timestamp: unix_now(),
        }
    }
}

/// Progress summary for one session.
///
/// `percentage` is always derived from the step counters. While a run is
/// active it is capped at 99; only a conclusion forces it to 100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current_step: String,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub percentage: u8,
}

/// Highest percentage reported for a run that has not concluded.
pub const RUNNING_PERCENT_CAP: u8 = 99;

impl Progress {
    /// Progress reported for sessions that were never started.
    pub fn not_started() -> Self {
        Self {
            current_step: "not started".to_string(),
            total_steps: 0,
            completed_steps: 0,
            percentage: 0,
        }
    }

    pub fn initializing() -> Self {
        Self {
            current_step: "initializing".to_string(),
            ..Self::not_started()
        }
    }

    /// Recompute `percentage` for a run that is still active.
    pub fn rederive_running(&mut self) {
        self.percentage = percent_of(self.completed_steps, self.total_steps).min(RUNNING_PERCENT_CAP);
    }

    pub fn conclude(&mut self) {
        self.current_step = "completed".to_string();
        self.percentage = 100;
    }
}

/// `min(100, floor(100 * completed / total))`, or 0 when `total` is 0.
pub fn percent_of(completed: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (u64::from(completed) * 100) / u64::from(total);
    pct.min(100) as u8
}

/// Severity of a structured log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Map a level name as written by the run's logger.
    ///
    /// Unknown names return `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "TRACE" | "DEBUG" => Some(Self::Debug),
            "INFO" | "SUCCESS" => Some(Self::Info),
            "WARN" | "WARNING" => Some(Self::Warning),
            "ERROR" | "CRITICAL" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured log record held in a session's raw buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: f64,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: unix_now(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }
}

/// Session status as reported by the progress registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Thinking,
    Completed,
    Error,
    Stopped,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Thinking => "thinking",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_of_handles_zero_total() {
        assert_eq!(percent_of(3, 0), 0);
    }

    #[test]
    fn percent_of_floors_and_clamps() {
        assert_eq!(percent_of(1, 3), 33);
        assert_eq!(percent_of(2, 3), 66);
        assert_eq!(percent_of(5, 4), 100);
    }

    #[test]
    fn running_progress_never_reaches_100() {
        let mut p = Progress::initializing();
        p.total_steps = 4;
        p.completed_steps = 4;
        p.rederive_running();
        assert_eq!(p.percentage, 99);

        p.conclude();
        assert_eq!(p.percentage, 100);
        assert_eq!(p.current_step, "completed");
    }

    #[test]
    fn log_level_names() {
        assert_eq!(LogLevel::from_name("WARNING"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::from_name("success "), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_name("CRITICAL"), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_name("LOUD"), None);
    }

    #[test]
    fn step_serializes_kind_as_type() {
        let step = Step::new(StepKind::Communication, "Sent to agent", Some("hi".into()));
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "communication");
        assert_eq!(json["details"], "hi");

        let plain = Step::new(StepKind::Thinking, "plain", None);
        let json = serde_json::to_value(&plain).unwrap();
        assert!(json.get("details").is_none());
    }

    #[test]
    fn session_status_serialization() {
        assert_eq!(serde_json::to_string(&SessionStatus::Thinking).unwrap(), "\"thinking\"");
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(!SessionStatus::Pending.is_terminal());
    }
}
