// crates/server/src/routes/chat.rs
//! Run lifecycle endpoints.
//!
//! - POST   /api/chat            - start a run
//! - GET    /api/chat/{id}       - run record
//! - POST   /api/chat/{id}/stop  - request cancellation
//! - DELETE /api/chat/{id}       - evict the run now

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::runs::{RunRecord, RunState};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
    /// Reuse a job id (and its workspace and log name) instead of generating one.
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct ChatStarted {
    pub session_id: String,
    pub workspace: String,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub status: RunState,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat", post(start_chat))
        .route("/chat/{id}", get(get_chat).delete(delete_chat))
        .route("/chat/{id}/stop", post(stop_chat))
}

async fn start_chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatRequest>,
) -> ApiResult<Json<ChatStarted>> {
    let run = state.runs.start(&body.prompt, body.job_id.as_deref()).await?;
    Ok(Json(ChatStarted {
        session_id: run.session_id().to_string(),
        workspace: run.workspace_id().to_string(),
    }))
}

async fn get_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<RunRecord>> {
    let run = state.runs.get(&id).ok_or(ApiError::RunNotFound(id))?;
    Ok(Json(run.snapshot()))
}

async fn stop_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<StopResponse>> {
    let status = state.runs.stop(&id).ok_or(ApiError::RunNotFound(id))?;
    Ok(Json(StopResponse { status }))
}

async fn delete_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.runs.evict(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::RunNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(dir: &std::path::Path) -> Arc<AppState> {
        AppState::new(Config {
            logs_dir: dir.join("logs"),
            workspace_root: dir.join("workspace"),
            ..Config::default()
        })
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, String) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_empty_prompt_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = crate::create_app(state(dir.path()));
        let (status, _) = send(app, "POST", "/api/chat", Some(r#"{"prompt":"  "}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_job_id_with_path_segments_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let (status, body) = send(
            crate::create_app(state.clone()),
            "POST",
            "/api/chat",
            Some(r#"{"prompt":"hi","job_id":"../../escaped"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("Invalid job id"));
        assert!(state.runs.is_empty());
        assert!(!dir.path().join("escaped").exists());
    }

    #[tokio::test]
    async fn test_unknown_run_is_404_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        for (method, uri) in [
            ("GET", "/api/chat/nope"),
            ("POST", "/api/chat/nope/stop"),
            ("DELETE", "/api/chat/nope"),
        ] {
            let (status, _) = send(crate::create_app(state.clone()), method, uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        }
    }

    #[tokio::test]
    async fn test_start_get_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let (status, body) = send(
            crate::create_app(state.clone()),
            "POST",
            "/api/chat",
            Some(r#"{"prompt":"hello"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let started: ChatStarted = serde_json::from_str(&body).unwrap();
        assert!(started.workspace.starts_with("job_"));

        // No agent is configured, so the run fails quickly.
        let run = state.runs.get(&started.session_id).unwrap();
        assert!(run.wait_finished(Duration::from_secs(5)).await);

        let uri = format!("/api/chat/{}", started.session_id);
        let (status, body) = send(crate::create_app(state.clone()), "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let record: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(record["status"], "error");
        assert_eq!(record["result"], "No agent program configured");
        assert!(record["log"].as_array().unwrap().len() >= 2);
        assert!(record["generated_files"].as_array().unwrap().is_empty());

        // Stopping a finished run reports its final status.
        let (status, body) = send(
            crate::create_app(state.clone()),
            "POST",
            &format!("{uri}/stop"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"error\""));

        let (status, _) = send(crate::create_app(state.clone()), "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(crate::create_app(state.clone()), "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
