// crates/core/src/tracker.rs
//! Progress registry: the per-session source of truth for run progress.
//!
//! One [`ProgressRegistry`] is built at startup and shared by handle. All
//! per-session maps sit behind a single mutex; every operation holds it for
//! O(1) work and never across I/O or an `.await`.
//!
//! Status machine per session:
//!
//! ```text
//! pending ──start_tracking──▶ thinking ──┬─ add_conclusion ─▶ completed
//!                                        ├─ add_error ──────▶ error
//!                                        └─ mark_stopped ───▶ stopped
//! ```
//!
//! `pending` is never stored; it is what [`ProgressRegistry::get_status`]
//! reports for ids that were never started. Terminal states are not final
//! under [`TerminalPolicy::Overwrite`]: a later terminal call replaces them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex, MutexGuard};

use regex_lite::Regex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::types::{LogEntry, LogLevel, Progress, SessionStatus, Step, StepKind};

static EXECUTING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Executing step (\d+)/(\d+)").expect("static pattern")
});
static STEP_OF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)step (\d+)/(\d+)").expect("static pattern"));

/// What happens when a terminal transition hits a session that is already
/// terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TerminalPolicy {
    /// The later transition wins (`completed` can become `stopped`).
    #[default]
    Overwrite,
    /// The first terminal status is kept; later transitions only append
    /// their timeline record.
    Sticky,
}

/// Message delivered to push targets after each `add_log_entry`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogPush {
    pub status: SessionStatus,
    pub logs: Vec<LogEntry>,
}

/// Handle returned by [`ProgressRegistry::register_push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushId(u64);

/// New records since a pair of cursors, read under one lock acquisition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionDelta {
    pub status: SessionStatus,
    pub thinking_steps: Vec<Step>,
    pub logs: Vec<LogEntry>,
}

#[derive(Default)]
struct Maps {
    steps: HashMap<String, Vec<Step>>,
    status: HashMap<String, SessionStatus>,
    progress: HashMap<String, Progress>,
    logs: HashMap<String, Vec<LogEntry>>,
    push: HashMap<String, Vec<(PushId, mpsc::WeakSender<LogPush>)>>,
}

impl Maps {
    fn status_of(&self, session_id: &str) -> SessionStatus {
        self.status
            .get(session_id)
            .copied()
            .unwrap_or(SessionStatus::Pending)
    }
}

pub struct ProgressRegistry {
    maps: Mutex<Maps>,
    policy: TerminalPolicy,
    next_push_id: AtomicU64,
}

impl Default for ProgressRegistry {
    fn default() -> Self {
        Self::new(TerminalPolicy::default())
    }
}

impl ProgressRegistry {
    pub fn new(policy: TerminalPolicy) -> Self {
        Self {
            maps: Mutex::new(Maps::default()),
            policy,
            next_push_id: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> TerminalPolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Progress registry mutex poisoned; continuing with inner state");
            poisoned.into_inner()
        })
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Reset the timeline and progress for `session_id` and mark it thinking.
    ///
    /// Raw log entries are kept: the tailer may have delivered lines before
    /// tracking started.
    pub fn start_tracking(&self, session_id: &str) {
        let mut maps = self.lock();
        maps.steps.insert(session_id.to_string(), Vec::new());
        maps.status
            .insert(session_id.to_string(), SessionStatus::Thinking);
        maps.progress
            .insert(session_id.to_string(), Progress::initializing());
        tracing::debug!(session_id = %session_id, "Started tracking session");
    }

    pub fn add_thinking_step(&self, session_id: &str, message: &str, details: Option<String>) {
        let mut maps = self.lock();
        push_thinking(&mut maps, session_id, message, details);
    }

    /// Record traffic with the agent. `direction` is the short label shown in
    /// lists; the full payload goes into `details`.
    pub fn add_communication(&self, session_id: &str, direction: &str, content: &str) {
        let mut maps = self.lock();
        if let Some(steps) = maps.steps.get_mut(session_id) {
            steps.push(Step::new(
                StepKind::Communication,
                direction,
                Some(content.to_string()),
            ));
        }
    }

    /// Set the total step count and/or the current step label.
    pub fn update_progress(
        &self,
        session_id: &str,
        total_steps: Option<u32>,
        current_step: Option<&str>,
    ) {
        let mut maps = self.lock();
        let status = maps.status_of(session_id);
        if let Some(progress) = maps.progress.get_mut(session_id) {
            if let Some(total) = total_steps {
                progress.total_steps = total;
            }
            if let Some(label) = current_step {
                progress.current_step = label.to_string();
            }
            rederive(progress, status);
        }
    }

    pub fn add_conclusion(&self, session_id: &str, message: &str, details: Option<String>) {
        let mut maps = self.lock();
        let Some(steps) = maps.steps.get_mut(session_id) else {
            return;
        };
        steps.push(Step::new(StepKind::Conclusion, message, details));
        self.transition(&mut maps, session_id, SessionStatus::Completed);
    }

    pub fn add_error(&self, session_id: &str, message: &str) {
        let mut maps = self.lock();
        self.push_error(&mut maps, session_id, message);
    }

    /// Mark the session stopped. Unknown ids are ignored.
    pub fn mark_stopped(&self, session_id: &str) {
        let mut maps = self.lock();
        self.transition(&mut maps, session_id, SessionStatus::Stopped);
    }

    /// Append a raw entry, derive a timeline record from it, and notify push
    /// targets with that single entry.
    ///
    /// Entries are always buffered. Derived steps and progress updates only
    /// apply to sessions that were started with [`Self::start_tracking`].
    pub fn add_log_entry(&self, session_id: &str, entry: LogEntry) {
        let (status, targets) = {
            let mut maps = self.lock();
            maps.logs
                .entry(session_id.to_string())
                .or_default()
                .push(entry.clone());

            match derive_step(&entry) {
                Some(Derived::Thinking(message, details)) => {
                    push_thinking(&mut maps, session_id, &message, details);
                }
                Some(Derived::Error(message)) => {
                    self.push_error(&mut maps, session_id, &message);
                }
                None => {}
            }
            progress_from_message(&mut maps, session_id, &entry.message);

            let targets: Vec<(PushId, mpsc::WeakSender<LogPush>)> =
                maps.push.get(session_id).cloned().unwrap_or_default();
            (maps.status_of(session_id), targets)
        };

        if targets.is_empty() {
            return;
        }
        let push = LogPush {
            status,
            logs: vec![entry],
        };
        for (id, weak) in targets {
            self.deliver(session_id, id, &weak, push.clone());
        }
    }

    pub fn add_log_entries(&self, session_id: &str, entries: impl IntoIterator<Item = LogEntry>) {
        for entry in entries {
            self.add_log_entry(session_id, entry);
        }
    }

    /// Remove every record of `session_id`, including push targets.
    pub fn clear_session(&self, session_id: &str) {
        let mut maps = self.lock();
        maps.steps.remove(session_id);
        maps.status.remove(session_id);
        maps.progress.remove(session_id);
        maps.logs.remove(session_id);
        maps.push.remove(session_id);
        tracing::debug!(session_id = %session_id, "Cleared session from progress registry");
    }

    // ========================================================================
    // Push targets
    // ========================================================================

    /// Register a push target. The registry keeps only a weak handle: once
    /// every strong `Sender` is dropped the target is pruned on next use.
    pub fn register_push(&self, session_id: &str, sender: &mpsc::Sender<LogPush>) -> PushId {
        let id = PushId(self.next_push_id.fetch_add(1, Ordering::Relaxed));
        let mut maps = self.lock();
        maps.push
            .entry(session_id.to_string())
            .or_default()
            .push((id, sender.downgrade()));
        id
    }

    pub fn unregister_push(&self, session_id: &str, id: PushId) -> bool {
        let mut maps = self.lock();
        let Some(targets) = maps.push.get_mut(session_id) else {
            return false;
        };
        let before = targets.len();
        targets.retain(|(existing, _)| *existing != id);
        let removed = targets.len() != before;
        if targets.is_empty() {
            maps.push.remove(session_id);
        }
        removed
    }

    /// Best-effort delivery. A full channel drops the message; a closed one
    /// unregisters the target.
    fn deliver(
        &self,
        session_id: &str,
        id: PushId,
        weak: &mpsc::WeakSender<LogPush>,
        push: LogPush,
    ) {
        let Some(sender) = weak.upgrade() else {
            self.unregister_push(session_id, id);
            return;
        };
        match sender.try_send(push) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session_id = %session_id, "Push channel full; log update dropped");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(session_id = %session_id, "Push receiver gone; unregistering");
                self.unregister_push(session_id, id);
            }
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Timeline records from `start` onwards.
    pub fn get_thinking_steps(&self, session_id: &str, start: usize) -> Vec<Step> {
        let maps = self.lock();
        suffix(maps.steps.get(session_id), start)
    }

    /// Raw entries from `start` onwards.
    pub fn get_logs(&self, session_id: &str, start: usize) -> Vec<LogEntry> {
        let maps = self.lock();
        suffix(maps.logs.get(session_id), start)
    }

    pub fn get_progress(&self, session_id: &str) -> Progress {
        let maps = self.lock();
        maps.progress
            .get(session_id)
            .cloned()
            .unwrap_or_else(Progress::not_started)
    }

    pub fn get_status(&self, session_id: &str) -> SessionStatus {
        self.lock().status_of(session_id)
    }

    /// Status plus both suffixes, consistent with each other.
    pub fn delta(&self, session_id: &str, steps_from: usize, logs_from: usize) -> SessionDelta {
        let maps = self.lock();
        SessionDelta {
            status: maps.status_of(session_id),
            thinking_steps: suffix(maps.steps.get(session_id), steps_from),
            logs: suffix(maps.logs.get(session_id), logs_from),
        }
    }

    pub fn is_tracked(&self, session_id: &str) -> bool {
        self.lock().status.contains_key(session_id)
    }

    /// Ids of every session with stored state.
    pub fn session_ids(&self) -> Vec<String> {
        let maps = self.lock();
        let mut ids: Vec<String> = maps
            .status
            .keys()
            .chain(maps.logs.keys())
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    // ========================================================================
    // Internals (caller holds the lock)
    // ========================================================================

    fn push_error(&self, maps: &mut Maps, session_id: &str, message: &str) {
        let Some(steps) = maps.steps.get_mut(session_id) else {
            return;
        };
        steps.push(Step::new(StepKind::Error, message, None));
        self.transition(maps, session_id, SessionStatus::Error);
    }

    fn transition(&self, maps: &mut Maps, session_id: &str, to: SessionStatus) -> bool {
        let Some(current) = maps.status.get_mut(session_id) else {
            return false;
        };
        if self.policy == TerminalPolicy::Sticky && current.is_terminal() {
            tracing::debug!(
                session_id = %session_id,
                from = current.as_str(),
                to = to.as_str(),
                "Ignoring transition out of terminal state"
            );
            return false;
        }
        *current = to;
        if let Some(progress) = maps.progress.get_mut(session_id) {
            if to == SessionStatus::Completed {
                progress.conclude();
            } else {
                rederive(progress, to);
            }
        }
        true
    }
}

fn suffix<T: Clone>(items: Option<&Vec<T>>, start: usize) -> Vec<T> {
    items
        .and_then(|v| v.get(start..))
        .map(<[T]>::to_vec)
        .unwrap_or_default()
}

/// 100 only while completed; otherwise the running cap applies.
fn rederive(progress: &mut Progress, status: SessionStatus) {
    if status == SessionStatus::Completed {
        progress.percentage = 100;
    } else {
        progress.rederive_running();
    }
}

fn push_thinking(maps: &mut Maps, session_id: &str, message: &str, details: Option<String>) {
    let Some(steps) = maps.steps.get_mut(session_id) else {
        return;
    };
    steps.push(Step::new(StepKind::Thinking, message, details));

    let status = maps.status_of(session_id);
    if let Some(progress) = maps.progress.get_mut(session_id) {
        progress.current_step = message.to_string();
        if let Some((x, y)) = step_numbers(&EXECUTING_RE, message) {
            progress.total_steps = y;
            progress.completed_steps = x.saturating_sub(1);
        }
        rederive(progress, status);
    }
}

fn progress_from_message(maps: &mut Maps, session_id: &str, message: &str) {
    let Some((x, y)) = step_numbers(&STEP_OF_RE, message) else {
        return;
    };
    let status = maps.status_of(session_id);
    if let Some(progress) = maps.progress.get_mut(session_id) {
        progress.current_step = message.to_string();
        progress.total_steps = y;
        progress.completed_steps = x.saturating_sub(1);
        rederive(progress, status);
    }
}

fn step_numbers(re: &Regex, message: &str) -> Option<(u32, u32)> {
    let caps = re.captures(message)?;
    let x = caps.get(1)?.as_str().parse().ok()?;
    let y = caps.get(2)?.as_str().parse().ok()?;
    Some((x, y))
}

enum Derived {
    Thinking(String, Option<String>),
    Error(String),
}

/// Timeline record implied by a raw entry, so timeline-only viewers still
/// see log activity.
fn derive_step(entry: &LogEntry) -> Option<Derived> {
    let msg = entry.message.as_str();
    match entry.level {
        LogLevel::Info => {
            let lower = msg.to_lowercase();
            let label = if lower.contains("start") {
                "Started"
            } else if lower.contains("step") {
                "Executing"
            } else if ["complete", "success", "finished"]
                .iter()
                .any(|k| lower.contains(k))
            {
                "Completed"
            } else {
                "Info"
            };
            Some(Derived::Thinking(format!("{label}: {msg}"), None))
        }
        LogLevel::Warning => Some(Derived::Thinking(
            format!("Warning: {msg}"),
            Some("warning".to_string()),
        )),
        LogLevel::Error => Some(Derived::Error(format!("Error: {msg}"))),
        LogLevel::Debug => None,
    }
}
