// crates/server/src/runs.rs
//! Run controller: drives one agent run end-to-end.
//!
//! A run owns a workspace directory, a log file and a [`LogTailer`] on that
//! file. While the agent works, a relay task copies newly tailed lines into
//! the [`ProgressRegistry`] every `sync_interval`. Stopping is cooperative: the
//! cancellation token is checked at fixed checkpoints and handed to the agent,
//! but an in-flight agent call is never aborted.
//!
//! Every terminal path (completed, error, stopped, agent panic) goes through
//! the same cleanup: final relay sync, tailer stopped, interception wrapper
//! dropped, `finished` signalled, eviction scheduled.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime};

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use runwatch_core::intercept::{Endpoint, Intercepted};
use runwatch_core::log_line::to_log_entry;
use runwatch_core::paths::{is_plain_name, log_path_for, normalize_job_id};
use runwatch_core::{LogEntry, LogLevel, ProgressRegistry};

use crate::agent::{AgentRequest, CommunicationObserver, DynAgent};
use crate::config::Config;
use crate::metrics::{record_run_finished, record_run_started};
use crate::tailer::LogTailer;

/// Status of a run record, as returned by `GET /api/chat/{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Processing,
    Completed,
    Error,
    Stopped,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub status: RunState,
    pub result: Option<String>,
    pub log: Vec<LogEntry>,
    pub generated_files: Vec<String>,
}

impl RunRecord {
    fn processing() -> Self {
        Self {
            status: RunState::Processing,
            result: None,
            log: Vec::new(),
            generated_files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub logs_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub sync_interval: Duration,
    pub retention: Duration,
}

impl From<&Config> for RunSettings {
    fn from(config: &Config) -> Self {
        Self {
            logs_dir: config.logs_dir.clone(),
            workspace_root: config.workspace_root.clone(),
            sync_interval: config.sync_interval(),
            retention: config.retention(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Prompt is empty")]
    EmptyPrompt,

    #[error("Invalid job id: {0}")]
    InvalidJobId(String),

    #[error("Cannot create {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// Run
// ============================================================================

pub struct Run {
    session_id: String,
    workspace_id: String,
    workspace_dir: PathBuf,
    log_file: PathBuf,
    prompt: String,
    record: Mutex<RunRecord>,
    cancel: CancellationToken,
    tailer: Arc<LogTailer>,
    finished: watch::Sender<bool>,
}

impl Run {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn tailer(&self) -> &LogTailer {
        &self.tailer
    }

    fn record(&self) -> MutexGuard<'_, RunRecord> {
        self.record.lock().unwrap_or_else(|poisoned| {
            tracing::error!(session_id = %self.session_id, "Run record mutex poisoned");
            poisoned.into_inner()
        })
    }

    pub fn snapshot(&self) -> RunRecord {
        self.record().clone()
    }

    pub fn status(&self) -> RunState {
        self.record().status
    }

    /// Controller log entries from `start` onwards.
    pub fn log_since(&self, start: usize) -> Vec<LogEntry> {
        self.record().log.get(start..).map(<[LogEntry]>::to_vec).unwrap_or_default()
    }

    /// Append to the run's own log and mirror it to tracing.
    pub fn capture(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Error => tracing::error!(session_id = %self.session_id, "{message}"),
            LogLevel::Warning => tracing::warn!(session_id = %self.session_id, "{message}"),
            LogLevel::Info => tracing::info!(session_id = %self.session_id, "{message}"),
            LogLevel::Debug => tracing::debug!(session_id = %self.session_id, "{message}"),
        }
        self.record().log.push(LogEntry::new(level, message));
    }

    /// Set the stop flag. Returns `true` if this call moved the run from
    /// processing to stopped.
    pub fn request_stop(&self) -> bool {
        self.cancel.cancel();
        let mut record = self.record();
        if record.status == RunState::Processing {
            record.status = RunState::Stopped;
            true
        } else {
            false
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until cleanup has finished, up to `limit`. Returns whether it did.
    pub async fn wait_finished(&self, limit: Duration) -> bool {
        let mut rx = self.finished.subscribe();
        let done = matches!(
            tokio::time::timeout(limit, rx.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        done
    }
}

enum Outcome {
    Completed(String),
    Failed(String),
    Stopped(&'static str),
}

// ============================================================================
// RunManager
// ============================================================================

/// Owns all runs. Shared through `AppState`.
pub struct RunManager {
    runs: RwLock<HashMap<String, Arc<Run>>>,
    registry: Arc<ProgressRegistry>,
    agent: Arc<DynAgent>,
    settings: RunSettings,
}

impl RunManager {
    pub fn new(registry: Arc<ProgressRegistry>, agent: Arc<DynAgent>, settings: RunSettings) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            registry,
            agent,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<ProgressRegistry> {
        &self.registry
    }

    /// Create a run and launch it in the background.
    ///
    /// `job_id` selects the workspace and log name; without one a fresh
    /// `job_<8 hex>` id is generated.
    pub async fn start(
        self: &Arc<Self>,
        prompt: &str,
        job_id: Option<&str>,
    ) -> Result<Arc<Run>, RunError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(RunError::EmptyPrompt);
        }

        let workspace_id = match job_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) if is_plain_name(id) => normalize_job_id(id),
            Some(id) => return Err(RunError::InvalidJobId(id.to_string())),
            None => new_workspace_id(),
        };
        let workspace_dir = self.settings.workspace_root.join(&workspace_id);
        for dir in [&workspace_dir, &self.settings.logs_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| RunError::Io {
                    path: dir.clone(),
                    source,
                })?;
        }
        let log_file = log_path_for(&self.settings.logs_dir, &workspace_id);

        let (finished, _) = watch::channel(false);
        let run = Arc::new(Run {
            session_id: Uuid::new_v4().to_string(),
            workspace_id,
            workspace_dir,
            tailer: Arc::new(LogTailer::new(log_file.clone())),
            log_file,
            prompt: prompt.to_string(),
            record: Mutex::new(RunRecord::processing()),
            cancel: CancellationToken::new(),
            finished,
        });

        self.registry.start_tracking(&run.session_id);
        match self.runs.write() {
            Ok(mut runs) => {
                runs.insert(run.session_id.clone(), run.clone());
            }
            Err(e) => tracing::error!("RwLock poisoned writing runs map: {e}"),
        }
        record_run_started();
        tracing::info!(
            session_id = %run.session_id,
            workspace = %run.workspace_id,
            log_file = %run.log_file.display(),
            "Run created"
        );

        let manager = self.clone();
        let task_run = run.clone();
        tokio::spawn(async move { manager.execute(task_run).await });

        Ok(run)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Run>> {
        match self.runs.read() {
            Ok(runs) => runs.get(session_id).cloned(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading runs map: {e}");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        match self.runs.read() {
            Ok(runs) => runs.len(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading runs map: {e}");
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs whose `execute` task has not finished cleanup yet.
    pub fn active_count(&self) -> usize {
        match self.runs.read() {
            Ok(runs) => runs.values().filter(|run| !*run.finished.borrow()).count(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading runs map: {e}");
                0
            }
        }
    }

    /// Request cancellation. Idempotent. Returns the run's status afterwards,
    /// or `None` for an unknown id.
    pub fn stop(&self, session_id: &str) -> Option<RunState> {
        let run = self.get(session_id)?;
        if run.request_stop() {
            run.capture(LogLevel::Warning, "Stop requested");
            self.registry.mark_stopped(session_id);
        }
        Some(run.status())
    }

    /// Drop the run and its registry session. Returns whether it existed.
    pub fn evict(&self, session_id: &str) -> bool {
        let removed = match self.runs.write() {
            Ok(mut runs) => runs.remove(session_id),
            Err(e) => {
                tracing::error!("RwLock poisoned writing runs map: {e}");
                None
            }
        };
        let Some(run) = removed else {
            return false;
        };
        run.cancel.cancel();
        self.registry.clear_session(session_id);
        tracing::info!(session_id = %session_id, "Run evicted");
        true
    }

    async fn execute(self: Arc<Self>, run: Arc<Run>) {
        let session_id = run.session_id.clone();
        run.capture(LogLevel::Info, format!("Run started in {}", run.workspace_id));

        if let Err(e) = run.tailer.start().await {
            run.capture(
                LogLevel::Warning,
                format!("Log watch unavailable, polling instead: {e}"),
            );
        }

        let relay_stop = CancellationToken::new();
        let relay = tokio::spawn(relay_loop(
            run.clone(),
            self.registry.clone(),
            self.settings.sync_interval,
            relay_stop.clone(),
        ));

        let before = snapshot_files(&run.workspace_dir).await;
        let outcome = self.drive(&run).await;

        // Cleanup, shared by every outcome.
        relay_stop.cancel();
        match relay.await {
            Ok(mut relay) => {
                run.tailer.sync().await;
                relay.forward(&run, &self.registry);
            }
            Err(e) => tracing::error!(session_id = %session_id, error = %e, "Log relay task failed"),
        }
        run.tailer.stop();

        let after = snapshot_files(&run.workspace_dir).await;
        let generated = generated_files(&before, &after, run.tailer.artifacts());
        let status = self.finish(&run, outcome, generated);

        record_run_finished(status.as_str());

        // Evicted while running: the relay may have re-created log entries.
        let evicted = self.get(&session_id).is_none();
        if evicted {
            self.registry.clear_session(&session_id);
        }
        run.finished.send_replace(true);
        if evicted {
            return;
        }

        let retention = self.settings.retention;
        let manager = Arc::downgrade(&self);
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(manager) = manager.upgrade() {
                manager.evict(&session_id);
            }
        });
    }

    /// Checkpoints, then the agent call. Never returns early without an outcome.
    async fn drive(&self, run: &Run) -> Outcome {
        if run.stop_requested() {
            return Outcome::Stopped("before start");
        }
        self.registry
            .update_progress(&run.session_id, None, Some("Running agent"));

        if run.stop_requested() {
            return Outcome::Stopped("before agent call");
        }
        run.capture(LogLevel::Info, "Calling agent");

        let agent = Intercepted::new(self.agent.clone());
        agent.register(Arc::new(CommunicationObserver::new(
            self.registry.clone(),
            run.session_id.clone(),
        )));
        let request = AgentRequest {
            prompt: run.prompt.clone(),
            job_id: run.workspace_id.clone(),
            workspace: run.workspace_dir.clone(),
            log_file: run.log_file.clone(),
            cancel: run.cancel.child_token(),
        };
        let result = AssertUnwindSafe(agent.call(&request)).catch_unwind().await;
        drop(agent);

        if run.stop_requested() {
            return Outcome::Stopped("after agent call");
        }
        match result {
            Ok(Ok(response)) => Outcome::Completed(response.output),
            Ok(Err(e)) => Outcome::Failed(e.to_string()),
            Err(_) => Outcome::Failed("Agent panicked".to_string()),
        }
    }

    fn finish(&self, run: &Run, outcome: Outcome, generated: Vec<String>) -> RunState {
        let session_id = run.session_id.as_str();
        let status = match outcome {
            Outcome::Completed(output) => {
                run.capture(LogLevel::Info, "Run completed");
                self.registry
                    .add_conclusion(session_id, "Run completed", Some(output.clone()));
                let mut record = run.record();
                record.result = Some(output);
                RunState::Completed
            }
            Outcome::Failed(message) => {
                run.capture(LogLevel::Error, format!("Run failed: {message}"));
                self.registry.add_error(session_id, &message);
                run.record().result = Some(message);
                RunState::Error
            }
            Outcome::Stopped(checkpoint) => {
                run.capture(LogLevel::Warning, format!("Run stopped {checkpoint}"));
                self.registry.mark_stopped(session_id);
                RunState::Stopped
            }
        };

        let mut record = run.record();
        record.status = status;
        record.generated_files = generated;
        status
    }
}

fn new_workspace_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("job_{}", &hex[..8])
}

// ============================================================================
// Log relay
// ============================================================================

/// Forwards tailed lines into the registry, remembering how far it got.
#[derive(Default)]
struct LogRelay {
    forwarded: usize,
}

impl LogRelay {
    fn forward(&mut self, run: &Run, registry: &ProgressRegistry) -> usize {
        let lines = run.tailer.lines_since(self.forwarded);
        if lines.is_empty() {
            return 0;
        }
        self.forwarded += lines.len();
        registry.add_log_entries(&run.session_id, lines.iter().map(|l| to_log_entry(l)));
        lines.len()
    }
}

async fn relay_loop(
    run: Arc<Run>,
    registry: Arc<ProgressRegistry>,
    every: Duration,
    stop: CancellationToken,
) -> LogRelay {
    let mut relay = LogRelay::default();
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return relay,
            _ = tick.tick() => {
                if !run.tailer.is_watching() {
                    run.tailer.sync().await;
                }
                relay.forward(&run, &registry);
            }
        }
    }
}

// ============================================================================
// Generated files
// ============================================================================

type FileSnapshot = HashMap<PathBuf, (u64, Option<SystemTime>)>;

/// Size and mtime of every file under `root`. Unreadable entries are skipped.
async fn snapshot_files(root: &Path) -> FileSnapshot {
    let mut snapshot = FileSnapshot::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(path = %dir.display(), error = %e, "Skipping unreadable directory");
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                pending.push(entry.path());
            } else if meta.is_file() {
                snapshot.insert(entry.path(), (meta.len(), meta.modified().ok()));
            }
        }
    }
    snapshot
}

/// New or changed files (sorted), followed by announced artifacts not
/// already listed.
fn generated_files(before: &FileSnapshot, after: &FileSnapshot, artifacts: Vec<String>) -> Vec<String> {
    let mut changed: Vec<String> = after
        .iter()
        .filter(|(path, stamp)| before.get(*path) != Some(stamp))
        .map(|(path, _)| path.display().to_string())
        .collect();
    changed.sort();

    let mut seen: HashSet<String> = changed.iter().cloned().collect();
    for artifact in artifacts {
        if seen.insert(artifact.clone()) {
            changed.push(artifact);
        }
    }
    changed
}
