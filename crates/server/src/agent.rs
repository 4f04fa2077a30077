//! The agent endpoint and its adapters.
//!
//! The agent is opaque: it takes a prompt, works inside the run workspace,
//! appends to the run log and eventually returns text. The run controller only
//! sees it through [`DynAgent`], so any [`Endpoint`] with these types plugs in.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use runwatch_core::intercept::{CallObserver, CallShape, Endpoint};
use runwatch_core::log_line::format_line;
use runwatch_core::paths::{LOG_FILE_ENV, TASK_ID_ENV};
use runwatch_core::{LogLevel, ProgressRegistry};

/// `source:function:line` column of lines the server writes into run logs.
const LOG_SOURCE: &str = concat!("runwatch.agent:append_log_line:", line!());

/// Step labels for the two directions of agent traffic.
pub const SENT_TO_AGENT: &str = "Sent to agent";
pub const RECEIVED_FROM_AGENT: &str = "Received from agent";

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub job_id: String,
    pub workspace: PathBuf,
    pub log_file: PathBuf,
    /// Cancelled when the run is asked to stop. Agents may ignore it.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    pub output: String,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("No agent program configured")]
    NotConfigured,

    #[error("Failed to spawn agent {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("Agent failed: {0}")]
    Failed(String),
}

pub type DynAgent =
    dyn Endpoint<Request = AgentRequest, Response = AgentResponse, Error = AgentError>;

/// Append one structured line to a run log. Failures are logged, not returned.
pub async fn append_log_line(path: &Path, level: LogLevel, message: &str) {
    let line = format_line(Local::now().naive_local(), level, Some(LOG_SOURCE), message);
    let result = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(format!("{line}\n").as_bytes()).await?;
        file.flush().await
    }
    .await;
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "Failed to append to run log");
    }
}

// ============================================================================
// CommandAgent
// ============================================================================

/// Runs an external program per request, with the prompt as its last argument.
pub struct CommandAgent {
    program: String,
    args: Vec<String>,
}

impl CommandAgent {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl CallShape for CommandAgent {
    type Request = AgentRequest;
    type Response = AgentResponse;
    type Error = AgentError;
}

#[async_trait]
impl Endpoint for CommandAgent {
    async fn call(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        tracing::info!(
            program = %self.program,
            job_id = %request.job_id,
            workspace = %request.workspace.display(),
            "Spawning agent"
        );
        append_log_line(
            &request.log_file,
            LogLevel::Info,
            &format!("Starting agent {}", self.program),
        )
        .await;

        let t0 = std::time::Instant::now();
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&request.prompt)
            .current_dir(&request.workspace)
            .env(TASK_ID_ENV, &request.job_id)
            .env(LOG_FILE_ENV, &request.log_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| {
                tracing::error!(program = %self.program, error = %source, "Failed to spawn agent");
                AgentError::Spawn {
                    program: self.program.clone(),
                    source,
                }
            })?;
        let elapsed_ms = t0.elapsed().as_millis() as u64;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::error!(
                elapsed_ms,
                exit_code = ?output.status.code(),
                stderr = %stderr.chars().take(500).collect::<String>(),
                "Agent exited non-zero"
            );
            append_log_line(
                &request.log_file,
                LogLevel::Error,
                &format!("Agent exited with {}", output.status),
            )
            .await;
            return Err(AgentError::Exit {
                status: output.status.to_string(),
                stderr,
            });
        }

        tracing::info!(elapsed_ms, job_id = %request.job_id, "Agent finished");
        append_log_line(&request.log_file, LogLevel::Info, "Agent finished").await;
        Ok(AgentResponse {
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

/// Stand-in used when no agent program is configured. Every call fails.
pub struct UnconfiguredAgent;

impl CallShape for UnconfiguredAgent {
    type Request = AgentRequest;
    type Response = AgentResponse;
    type Error = AgentError;
}

#[async_trait]
impl Endpoint for UnconfiguredAgent {
    async fn call(&self, _request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        Err(AgentError::NotConfigured)
    }
}

// ============================================================================
// Communication observer
// ============================================================================

/// Records agent traffic as communication steps on one session.
pub struct CommunicationObserver {
    registry: Arc<ProgressRegistry>,
    session_id: String,
}

impl CommunicationObserver {
    pub fn new(registry: Arc<ProgressRegistry>, session_id: impl Into<String>) -> Self {
        Self {
            registry,
            session_id: session_id.into(),
        }
    }

    fn record(&self, direction: &str, content: &str) {
        self.registry
            .add_communication(&self.session_id, direction, content);
    }
}

impl CallObserver<AgentRequest, AgentResponse, AgentError> for CommunicationObserver {
    fn before(&self, request: &AgentRequest) {
        self.record(SENT_TO_AGENT, &request.prompt);
    }

    fn after(&self, _request: &AgentRequest, response: &AgentResponse) {
        self.record(RECEIVED_FROM_AGENT, &response.output);
    }

    fn on_error(&self, _request: &AgentRequest, error: &AgentError) {
        tracing::warn!(session_id = %self.session_id, error = %error, "Agent call failed");
    }
}
