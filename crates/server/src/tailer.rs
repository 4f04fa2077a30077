//! Log tailer: follows one run log and keeps every line it has seen.
//!
//! [`LogTailer::start`] first replays the existing file, then installs a
//! `notify` watcher. The watcher callback runs on notify's own thread and only
//! forwards a wake-up through a bounded channel; the read itself happens on a
//! tokio task. Reads are offset-based (see [`LineCursor`]), so a dropped
//! wake-up loses nothing: the next one reads to EOF.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use memchr::memmem;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex_lite::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::file_tracker::LineCursor;
use crate::metrics::record_tailed_lines;

const ARTIFACT_PHRASE: &str = "Content successfully saved to ";

static ARTIFACT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Content successfully saved to (.+)").expect("static pattern")
});

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum TailError {
    #[error("Log file has no parent directory: {path}")]
    NoParent { path: PathBuf },

    #[error("Cannot resolve log directory {path}: {source}")]
    Dir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

#[derive(Debug)]
enum WatchEvent {
    Changed,
    Error(String),
}

#[derive(Default)]
struct TailBuffer {
    lines: Vec<String>,
    /// Insertion-ordered, no duplicates.
    artifacts: Vec<String>,
    last_update: Option<DateTime<Utc>>,
}

struct TailState {
    cursor: tokio::sync::Mutex<LineCursor>,
    buffer: Mutex<TailBuffer>,
    artifact_finder: memmem::Finder<'static>,
}

impl TailState {
    fn buffer(&self) -> MutexGuard<'_, TailBuffer> {
        self.buffer.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Tail buffer mutex poisoned; continuing with inner state");
            poisoned.into_inner()
        })
    }

    /// Read whatever is new and run it through the line handler. Returns the
    /// number of lines added. I/O errors are logged and leave the offset alone.
    async fn pump(&self) -> usize {
        let mut cursor = self.cursor.lock().await;
        match cursor.read_new_lines().await {
            Ok(lines) if lines.is_empty() => 0,
            Ok(lines) => {
                let count = lines.len();
                self.handle_lines(lines);
                record_tailed_lines(count);
                count
            }
            Err(e) => {
                tracing::warn!(
                    path = %cursor.path().display(),
                    error = %e,
                    "Failed to read new log lines; will retry on next change"
                );
                0
            }
        }
    }

    fn handle_lines(&self, lines: Vec<String>) {
        let mut buffer = self.buffer();
        for line in lines {
            if let Some(path) = self.artifact_in(&line) {
                if !buffer.artifacts.contains(&path) {
                    tracing::debug!(artifact = %path, "Artifact announced in log");
                    buffer.artifacts.push(path);
                }
            }
            buffer.lines.push(line);
        }
        buffer.last_update = Some(Utc::now());
    }

    fn artifact_in(&self, line: &str) -> Option<String> {
        self.artifact_finder.find(line.as_bytes())?;
        let path = ARTIFACT_RE.captures(line)?.get(1)?.as_str().trim();
        (!path.is_empty()).then(|| path.to_string())
    }
}

struct WatchHandle {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

/// Follows one log file. Shared by handle; all methods take `&self`.
pub struct LogTailer {
    path: PathBuf,
    state: Arc<TailState>,
    watch: Mutex<Option<WatchHandle>>,
    dropped_events: Arc<AtomicU64>,
}

impl LogTailer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            state: Arc::new(TailState {
                cursor: tokio::sync::Mutex::new(LineCursor::new(path.clone())),
                buffer: Mutex::new(TailBuffer::default()),
                artifact_finder: memmem::Finder::new(ARTIFACT_PHRASE),
            }),
            path,
            watch: Mutex::new(None),
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    fn watch_slot(&self) -> MutexGuard<'_, Option<WatchHandle>> {
        self.watch.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Tailer watch mutex poisoned; continuing with inner state");
            poisoned.into_inner()
        })
    }

    pub fn is_watching(&self) -> bool {
        self.watch_slot().is_some()
    }

    /// Replay the existing file, then watch it for appends.
    ///
    /// Calling `start` on a tailer that is already watching only replays.
    pub async fn start(&self) -> Result<(), TailError> {
        let replayed = self.state.pump().await;
        tracing::debug!(path = %self.path.display(), replayed, "Replayed existing log lines");

        if self.is_watching() {
            return Ok(());
        }

        let (watcher, rx) = self.install_watcher().await?;
        let state = self.state.clone();
        let task = tokio::spawn(watch_loop(state, rx, self.path.clone()));

        let installed = {
            let mut slot = self.watch_slot();
            if slot.is_some() {
                // Lost a race with a concurrent start; keep the first watcher.
                task.abort();
                false
            } else {
                *slot = Some(WatchHandle {
                    _watcher: watcher,
                    task,
                });
                true
            }
        };
        if installed {
            // Appends between the replay and the watcher install raised no event.
            let caught_up = self.state.pump().await;
            tracing::info!(path = %self.path.display(), caught_up, "Tailing log file");
        }
        Ok(())
    }

    async fn install_watcher(
        &self,
    ) -> Result<(RecommendedWatcher, mpsc::Receiver<WatchEvent>), TailError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = self.path.file_name().ok_or_else(|| TailError::NoParent {
            path: self.path.clone(),
        })?;
        let dir = tokio::fs::canonicalize(parent)
            .await
            .map_err(|source| TailError::Dir {
                path: parent.to_path_buf(),
                source,
            })?;
        let target = dir.join(file_name);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let dropped = self.dropped_events.clone();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                let event = match res {
                    Ok(event) => {
                        if !event.paths.iter().any(|p| p == &target) {
                            return;
                        }
                        match event.kind {
                            EventKind::Modify(_) | EventKind::Create(_) => WatchEvent::Changed,
                            _ => return,
                        }
                    }
                    Err(e) => WatchEvent::Error(e.to_string()),
                };
                if tx.try_send(event).is_err() {
                    let count = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if count == 1 || count % 100 == 0 {
                        tracing::debug!(dropped_total = count, "Tail wake-up dropped; channel full");
                    }
                }
            })
            .map_err(|source| TailError::Watch {
                path: self.path.clone(),
                source,
            })?;

        // Some backends cannot watch a single file, so watch its directory.
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|source| TailError::Watch {
                path: dir.clone(),
                source,
            })?;

        Ok((watcher, rx))
    }

    /// Read up to EOF now, without waiting for a notification.
    pub async fn sync(&self) -> usize {
        self.state.pump().await
    }

    /// Release the OS watch. Buffered lines stay readable.
    pub fn stop(&self) {
        if let Some(handle) = self.watch_slot().take() {
            handle.task.abort();
            tracing::debug!(
                path = %self.path.display(),
                dropped_events = self.dropped_events.load(Ordering::Relaxed),
                "Stopped tailing log file"
            );
        }
    }

    /// Lines from `start` onwards.
    pub fn lines_since(&self, start: usize) -> Vec<String> {
        self.state
            .buffer()
            .lines
            .get(start..)
            .map(<[String]>::to_vec)
            .unwrap_or_default()
    }

    pub fn artifacts(&self) -> Vec<String> {
        self.state.buffer().artifacts.clone()
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.state.buffer().last_update
    }

}

impl Drop for LogTailer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn watch_loop(state: Arc<TailState>, mut rx: mpsc::Receiver<WatchEvent>, path: PathBuf) {
    while let Some(event) = rx.recv().await {
        match event {
            WatchEvent::Changed => {
                state.pump().await;
            }
            WatchEvent::Error(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Log watcher error");
            }
        }
    }
    tracing::debug!(path = %path.display(), "Log watcher channel closed");
}
