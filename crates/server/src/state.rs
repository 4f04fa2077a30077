// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::Instant;

use runwatch_core::ProgressRegistry;

use crate::agent::{CommandAgent, DynAgent, UnconfiguredAgent};
use crate::config::Config;
use crate::runs::{RunManager, RunSettings};

/// Shared application state accessible from all route handlers.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    pub config: Config,
    /// Per-session progress, shared with every run.
    pub registry: Arc<ProgressRegistry>,
    pub runs: Arc<RunManager>,
}

impl AppState {
    /// Build state with the agent described by `config`.
    pub fn new(config: Config) -> Arc<Self> {
        let agent: Arc<DynAgent> = match &config.agent_program {
            Some(program) => Arc::new(CommandAgent::new(program.clone(), config.agent_args.clone())),
            None => {
                tracing::warn!("No agent program configured; runs will fail immediately");
                Arc::new(UnconfiguredAgent)
            }
        };
        Self::with_agent(config, agent)
    }

    /// Build state around an explicit agent endpoint.
    pub fn with_agent(config: Config, agent: Arc<DynAgent>) -> Arc<Self> {
        let registry = Arc::new(ProgressRegistry::new(config.terminal_policy()));
        let runs = Arc::new(RunManager::new(
            registry.clone(),
            agent,
            RunSettings::from(&config),
        ));
        Arc::new(Self {
            start_time: Instant::now(),
            config,
            registry,
            runs,
        })
    }

    /// Get the server uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
