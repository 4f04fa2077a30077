// crates/server/src/main.rs
//! Runwatch server binary.
//!
//! `runwatch` serves the API. `runwatch report` prints the parsed report of
//! the run selected by `RUNWATCH_TASK_ID` / `RUNWATCH_LOG_FILE`.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use runwatch_core::log_parser::parse_log_file;
use runwatch_core::paths::target_from_env;
use runwatch_server::config::Command;
use runwatch_server::{create_app, init_metrics, AppState, Config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,runwatch_server=info,runwatch_core=info".into()),
        )
        .init();

    let config = Config::parse();

    if let Some(Command::Report) = config.command {
        let target = target_from_env(&config.logs_dir);
        tracing::info!(
            job_id = %target.job_id,
            log_file = %target.log_file.display(),
            "Parsing run log"
        );
        let report = parse_log_file(&target.log_file).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    init_metrics();

    for dir in [&config.logs_dir, &config.workspace_root] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(
        addr = %addr,
        logs_dir = %config.logs_dir.display(),
        workspace_root = %config.workspace_root.display(),
        "runwatch v{} listening",
        env!("CARGO_PKG_VERSION")
    );

    let app = create_app(AppState::new(config));
    axum::serve(listener, app).await?;

    Ok(())
}
