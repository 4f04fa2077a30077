// crates/core/src/lib.rs
pub mod error;
pub mod intercept;
pub mod log_line;
pub mod log_parser;
pub mod paths;
pub mod tracker;
pub mod types;

pub use error::*;
pub use log_parser::{RunReport, RunStatus};
pub use tracker::{LogPush, ProgressRegistry, PushId, SessionDelta, TerminalPolicy};
pub use types::*;
