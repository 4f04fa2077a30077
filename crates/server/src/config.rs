//! Server configuration. Every flag can also come from the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use runwatch_core::TerminalPolicy;

pub const DEFAULT_PORT: u16 = 47900;

#[derive(Debug, Clone, Parser)]
#[command(name = "runwatch", version, about = "Live observability for agent runs")]
pub struct Config {
    /// Port to listen on.
    #[arg(long, env = "RUNWATCH_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(long, env = "RUNWATCH_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Directory holding run logs.
    #[arg(long, env = "RUNWATCH_LOGS_DIR", default_value = "logs")]
    pub logs_dir: PathBuf,

    /// Parent directory of per-run workspaces.
    #[arg(long, env = "RUNWATCH_WORKSPACE_ROOT", default_value = "workspace")]
    pub workspace_root: PathBuf,

    /// Agent program. Runs fail with "No agent program configured" when unset.
    #[arg(long, env = "RUNWATCH_AGENT")]
    pub agent_program: Option<String>,

    /// Extra argument for the agent program, before the prompt. Repeatable.
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    pub agent_args: Vec<String>,

    /// Live channel poll interval.
    #[arg(long, env = "RUNWATCH_POLL_INTERVAL_MS", default_value_t = 200)]
    pub poll_interval_ms: u64,

    /// Tailer-to-registry relay interval.
    #[arg(long, env = "RUNWATCH_SYNC_INTERVAL_MS", default_value_t = 100)]
    pub sync_interval_ms: u64,

    /// How long finished runs stay queryable.
    #[arg(long, env = "RUNWATCH_RETENTION_SECS", default_value_t = 600)]
    pub retention_secs: u64,

    /// Keep the first terminal status of a session instead of the last one.
    #[arg(long, env = "RUNWATCH_STICKY_TERMINAL")]
    pub sticky_terminal: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Print the parsed report of the run named by RUNWATCH_TASK_ID or
    /// RUNWATCH_LOG_FILE, then exit.
    Report,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: "127.0.0.1".to_string(),
            logs_dir: PathBuf::from("logs"),
            workspace_root: PathBuf::from("workspace"),
            agent_program: None,
            agent_args: Vec::new(),
            poll_interval_ms: 200,
            sync_interval_ms: 100,
            retention_secs: 600,
            sticky_terminal: false,
            command: None,
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn terminal_policy(&self) -> TerminalPolicy {
        if self.sticky_terminal {
            TerminalPolicy::Sticky
        } else {
            TerminalPolicy::Overwrite
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let config = Config::try_parse_from([
            "runwatch",
            "--port",
            "9000",
            "--logs-dir",
            "/tmp/l",
            "--agent-program",
            "my-agent",
            "--agent-arg",
            "--fast",
            "--agent-arg",
            "x",
            "--sticky-terminal",
        ])
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.logs_dir, PathBuf::from("/tmp/l"));
        assert_eq!(config.agent_program.as_deref(), Some("my-agent"));
        assert_eq!(config.agent_args, vec!["--fast", "x"]);
        assert_eq!(config.terminal_policy(), TerminalPolicy::Sticky);
        assert_eq!(config.bind_addr(), "127.0.0.1:9000");
        assert_eq!(config.command, None);
    }

    #[test]
    fn parses_report_subcommand() {
        let config = Config::try_parse_from(["runwatch", "--logs-dir", "/tmp/l", "report"]).unwrap();
        assert_eq!(config.command, Some(Command::Report));
    }

    #[test]
    fn default_matches_cli_defaults() {
        let d = Config::default();
        assert_eq!(d.port, DEFAULT_PORT);
        assert_eq!(d.poll_interval(), Duration::from_millis(200));
        assert_eq!(d.sync_interval(), Duration::from_millis(100));
        assert_eq!(d.retention(), Duration::from_secs(600));
        assert_eq!(d.terminal_policy(), TerminalPolicy::Overwrite);
    }
}
