// crates/server/src/routes/progress.rs
//! Polling endpoints over the progress registry and a run's tailer.
//!
//! Registry-backed reads never 404: an unknown session reads as `pending`
//! with empty lists, matching what the registry reports.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use runwatch_core::{LogEntry, Progress, SessionStatus, Step};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StartIndex {
    #[serde(default)]
    pub start_index: usize,
}

#[derive(Debug, Serialize)]
pub struct ThinkingResponse {
    pub status: SessionStatus,
    pub thinking_steps: Vec<Step>,
}

#[derive(Debug, Serialize)]
pub struct SessionLogsResponse {
    pub status: SessionStatus,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Serialize)]
pub struct SystemLogsResponse {
    pub logs: Vec<String>,
    /// When the tailer last read a line, if it has.
    pub last_update: Option<DateTime<Utc>>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/thinking/{id}", get(thinking))
        .route("/progress/{id}", get(progress))
        .route("/session_logs/{id}", get(session_logs))
        .route("/systemlogs/{id}", get(system_logs))
}

async fn thinking(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<StartIndex>,
) -> Json<ThinkingResponse> {
    let delta = state.registry.delta(&id, q.start_index, usize::MAX);
    Json(ThinkingResponse {
        status: delta.status,
        thinking_steps: delta.thinking_steps,
    })
}

async fn progress(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Json<Progress> {
    Json(state.registry.get_progress(&id))
}

async fn session_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<StartIndex>,
) -> Json<SessionLogsResponse> {
    let delta = state.registry.delta(&id, usize::MAX, q.start_index);
    Json(SessionLogsResponse {
        status: delta.status,
        logs: delta.logs,
    })
}

/// Raw tailed lines. Needs a live run record, so unknown ids are 404.
async fn system_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<StartIndex>,
) -> ApiResult<Json<SystemLogsResponse>> {
    let run = state.runs.get(&id).ok_or(ApiError::RunNotFound(id))?;
    let tailer = run.tailer();
    Ok(Json(SystemLogsResponse {
        logs: tailer.lines_since(q.start_index),
        last_update: tailer.last_update(),
    }))
}
