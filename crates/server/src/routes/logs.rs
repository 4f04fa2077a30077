// crates/server/src/routes/logs.rs
//! Log directory queries, answered by the log parser on demand.
//!
//! - GET /api/logs?limit              - file listing, newest first
//! - GET /api/logs/{name}?parsed      - raw text, or a report when `parsed=true`
//! - GET /api/logs_parsed?limit       - reports for the newest files
//! - GET /api/logs_parsed/{name}      - one report
//! - GET /api/latest_log              - report for the newest file

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use runwatch_core::log_parser::{
    latest_log_report, list_log_files, list_log_reports, parse_log_file, resolve_log_name,
    LogFileInfo, DEFAULT_LIST_LIMIT,
};
use runwatch_core::{LogError, RunReport};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_LIST_LIMIT
}

#[derive(Debug, Default, Deserialize)]
pub struct ContentQuery {
    #[serde(default)]
    pub parsed: bool,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/logs", get(list_logs))
        .route("/logs/{name}", get(get_log))
        .route("/logs_parsed", get(list_parsed))
        .route("/logs_parsed/{name}", get(get_parsed))
        .route("/latest_log", get(latest_log))
}

async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<Vec<LogFileInfo>>> {
    match list_log_files(&state.config.logs_dir, q.limit).await {
        Ok(files) => Ok(Json(files)),
        Err(LogError::DirNotFound { .. }) => Ok(Json(Vec::new())),
        Err(e) => Err(e.into()),
    }
}

async fn get_log(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(q): Query<ContentQuery>,
) -> ApiResult<Response> {
    let path = existing_log(&state.config.logs_dir, &name).await?;
    if q.parsed {
        return Ok(Json(parse_log_file(&path).await).into_response());
    }
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| LogError::io(&path, e))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        String::from_utf8_lossy(&bytes).into_owned(),
    )
        .into_response())
}

async fn list_parsed(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<Vec<RunReport>>> {
    Ok(Json(list_log_reports(&state.config.logs_dir, q.limit).await?))
}

async fn get_parsed(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<RunReport>> {
    let path = existing_log(&state.config.logs_dir, &name).await?;
    Ok(Json(parse_log_file(&path).await))
}

async fn latest_log(State(state): State<Arc<AppState>>) -> Json<RunReport> {
    Json(latest_log_report(&state.config.logs_dir).await)
}

/// Validate `name` and make sure the file is there, so a missing log is a
/// 404 rather than a report carrying a read error.
async fn existing_log(dir: &FsPath, name: &str) -> Result<PathBuf, LogError> {
    let path = resolve_log_name(dir, name)?;
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => Ok(path),
        Ok(_) => Err(LogError::not_found(path)),
        Err(e) => Err(LogError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    const LOG: &str = "\
2025-03-09 14:02:11.100 | INFO     | Created plan with ID: plan_7
2025-03-09 14:02:11.482 | INFO     | Plan: Build report (ID: plan_7)
Steps:
1. [✓] Collect data
2. [ ] Write summary

2025-03-09 14:02:12.001 | WARNING  | Rate limited
";

    fn state_with_logs(dir: &FsPath) -> Arc<AppState> {
        let logs = dir.join("logs");
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(logs.join("job_a.log"), LOG).unwrap();
        AppState::new(Config {
            logs_dir: logs,
            ..Config::default()
        })
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    // ========================================================================
    // Listing
    // ========================================================================

    #[tokio::test]
    async fn test_list_logs() {
        let dir = tempfile::tempdir().unwrap();
        let app = crate::create_app(state_with_logs(dir.path()));
        let (status, body) = get(app, "/api/logs").await;
        assert_eq!(status, StatusCode::OK);
        let files: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(files[0]["name"], "job_a.log");
        assert_eq!(files[0]["size"], LOG.len());
    }

    #[tokio::test]
    async fn test_missing_logs_dir_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let app = crate::create_app(AppState::new(Config {
            logs_dir: dir.path().join("absent"),
            ..Config::default()
        }));
        let (status, body) = get(app.clone(), "/api/logs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");

        let (_, body) = get(app.clone(), "/api/logs_parsed").await;
        assert_eq!(body, "[]");

        let (status, body) = get(app, "/api/latest_log").await;
        assert_eq!(status, StatusCode::OK);
        let report: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["error"], "No log files found");
        assert_eq!(report["status"], "unknown");
    }

    // ========================================================================
    // Single log
    // ========================================================================

    #[tokio::test]
    async fn test_raw_and_parsed_content() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_logs(dir.path());

        let (status, body) = get(crate::create_app(state.clone()), "/api/logs/job_a").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, LOG);

        let (status, body) = get(
            crate::create_app(state.clone()),
            "/api/logs/job_a.log?parsed=true",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let report: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["plan_id"], "plan_7");
        assert_eq!(report["total_steps"], 2);
        assert_eq!(report["completed_steps"], 1);
        assert_eq!(report["log_file"], "job_a.log");

        let (_, body) = get(crate::create_app(state), "/api/logs_parsed/job_a").await;
        let report: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["warnings"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_and_missing_names() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_logs(dir.path());

        let (status, _) = get(crate::create_app(state.clone()), "/api/logs/..secret").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get(crate::create_app(state.clone()), "/api/logs/.hidden").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get(crate::create_app(state), "/api/logs_parsed/job_zzz").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_latest_log() {
        let dir = tempfile::tempdir().unwrap();
        let app = crate::create_app(state_with_logs(dir.path()));
        let (_, body) = get(app, "/api/latest_log").await;
        let report: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["plan_title"], "Build report");
        assert_eq!(report["status"], "in_progress");
    }
}
