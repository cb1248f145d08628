//! Terminal session runtime
//!
//! Agents live in long-running terminal sessions. The manager only needs a
//! handful of operations on them, captured by [`SessionRuntime`]. The tmux
//! implementation shells out with a timeout on every call; the in-memory
//! implementation backs tests and embedding.

mod classifier;
mod detector;
mod memory;
mod tmux;

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use classifier::{
    ClassifierError, HeuristicClassifier, LlmClassifier, StuckClassifier, StuckVerdict, classifier_from_config,
};
pub use detector::{AgentState, StateDetection, StateDetector};
pub use memory::MemoryRuntime;
pub use tmux::TmuxRuntime;

/// Errors from a session runtime
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Session command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations the manager performs on agent sessions
#[async_trait]
pub trait SessionRuntime: Send + Sync {
    /// Names of every live session
    async fn list_live_sessions(&self) -> Result<Vec<String>, SessionError>;

    /// Start a detached session running `command` in `workdir`
    async fn spawn(&self, name: &str, workdir: &Path, command: &str) -> Result<(), SessionError>;

    /// The last `lines` lines of visible output
    async fn capture_output(&self, name: &str, lines: usize) -> Result<String, SessionError>;

    /// Type `text` literally, then press Enter
    async fn send_text(&self, name: &str, text: &str) -> Result<(), SessionError>;

    /// Kill a session; killing a missing session is not an error
    async fn kill(&self, name: &str) -> Result<(), SessionError>;
}
