//! Run identity: which job id and log file a run uses.
//!
//! A run's identity can be handed in through the environment; otherwise one
//! is generated. The same two variables are exported to the agent process so
//! both sides agree on where the log lives.

use std::path::{Path, PathBuf};

/// Externally supplied task id.
pub const TASK_ID_ENV: &str = "RUNWATCH_TASK_ID";
/// Externally supplied log file path.
pub const LOG_FILE_ENV: &str = "RUNWATCH_LOG_FILE";

const JOB_PREFIX: &str = "job_";

/// Job id and log file of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTarget {
    pub job_id: String,
    pub log_file: PathBuf,
}

/// Prefix `raw` with `job_` unless it already has it.
pub fn normalize_job_id(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with(JOB_PREFIX) {
        raw.to_string()
    } else {
        format!("{JOB_PREFIX}{raw}")
    }
}

/// A single path component that stays inside whatever directory it is
/// joined onto: no separators, no `..`, no leading dot.
pub fn is_plain_name(name: &str) -> bool {
    !(name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.'))
}

/// `job_<unix seconds>`.
pub fn generated_job_id() -> String {
    format!("{JOB_PREFIX}{}", chrono::Utc::now().timestamp())
}

/// `<logs_dir>/<job_id>.log`.
pub fn log_path_for(logs_dir: &Path, job_id: &str) -> PathBuf {
    logs_dir.join(format!("{job_id}.log"))
}

/// Resolve a run target from optional overrides. Blank values count as absent.
pub fn resolve_target(
    task_id: Option<&str>,
    log_file: Option<&Path>,
    logs_dir: &Path,
) -> RunTarget {
    let job_id = match task_id.map(str::trim).filter(|s| !s.is_empty()) {
        Some(id) => normalize_job_id(id),
        None => generated_job_id(),
    };
    let log_file = match log_file.filter(|p| !p.as_os_str().is_empty()) {
        Some(path) => path.to_path_buf(),
        None => log_path_for(logs_dir, &job_id),
    };
    RunTarget { job_id, log_file }
}

/// Resolve from [`TASK_ID_ENV`] and [`LOG_FILE_ENV`].
pub fn target_from_env(logs_dir: &Path) -> RunTarget {
    let task_id = std::env::var(TASK_ID_ENV).ok();
    let log_file = std::env::var_os(LOG_FILE_ENV).map(PathBuf::from);
    resolve_target(task_id.as_deref(), log_file.as_deref(), logs_dir)
}
