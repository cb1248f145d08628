//! tmux implementation of the session runtime

use async_trait::async_trait;
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{SessionError, SessionRuntime};

/// Drives sessions through the `tmux` CLI
#[derive(Debug, Clone)]
pub struct TmuxRuntime {
    binary: String,
    timeout: Duration,
}

impl TmuxRuntime {
    pub fn new(timeout: Duration) -> Self {
        Self {
            binary: "tmux".to_string(),
            timeout,
        }
    }

    /// Use a different tmux binary (or wrapper script)
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run(&self, args: &[&str]) -> Result<Output, SessionError> {
        debug!(binary = %self.binary, ?args, "TmuxRuntime::run: called");
        let child = Command::new(&self.binary).args(args).kill_on_drop(true).output();
        match tokio::time::timeout(self.timeout, child).await {
            Err(_) => Err(SessionError::Timeout(self.timeout)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SessionError::Unavailable(format!("{} not found", self.binary)))
            }
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(output)) => Ok(output),
        }
    }

    /// Run and map a non-zero exit to a typed error
    async fn run_checked(&self, name: &str, args: &[&str]) -> Result<Output, SessionError> {
        let output = self.run(args).await?;
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_missing_session(&stderr) {
            return Err(SessionError::NotFound(name.to_string()));
        }
        Err(SessionError::CommandFailed {
            command: format!("{} {}", self.binary, args.join(" ")),
            stderr,
        })
    }
}

fn is_missing_session(stderr: &str) -> bool {
    stderr.contains("can't find session") || stderr.contains("no server running") || stderr.contains("session not found")
}

#[async_trait]
impl SessionRuntime for TmuxRuntime {
    async fn list_live_sessions(&self) -> Result<Vec<String>, SessionError> {
        debug!("TmuxRuntime::list_live_sessions: called");
        let output = self.run(&["list-sessions", "-F", "#{session_name}"]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // No server simply means no sessions
            if stderr.contains("no server running") || stderr.contains("error connecting") {
                return Ok(Vec::new());
            }
            return Err(SessionError::CommandFailed {
                command: "tmux list-sessions".to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn spawn(&self, name: &str, workdir: &Path, command: &str) -> Result<(), SessionError> {
        debug!(%name, workdir = %workdir.display(), %command, "TmuxRuntime::spawn: called");
        let workdir = workdir.to_string_lossy();
        self.run_checked(name, &["new-session", "-d", "-s", name, "-c", &workdir, command])
            .await?;
        Ok(())
    }

    async fn capture_output(&self, name: &str, lines: usize) -> Result<String, SessionError> {
        debug!(%name, lines, "TmuxRuntime::capture_output: called");
        let start = format!("-{}", lines);
        let output = self
            .run_checked(name, &["capture-pane", "-p", "-t", name, "-S", &start])
            .await?;
        let text = String::from_utf8_lossy(&output.stdout);
        let captured: Vec<&str> = text.lines().collect();
        let keep = &captured[captured.len().saturating_sub(lines)..];
        Ok(keep.join("\n"))
    }

    async fn send_text(&self, name: &str, text: &str) -> Result<(), SessionError> {
        debug!(%name, len = text.len(), "TmuxRuntime::send_text: called");
        self.run_checked(name, &["send-keys", "-t", name, "-l", text]).await?;
        self.run_checked(name, &["send-keys", "-t", name, "Enter"]).await?;
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<(), SessionError> {
        debug!(%name, "TmuxRuntime::kill: called");
        match self.run_checked(name, &["kill-session", "-t", name]).await {
            Ok(_) | Err(SessionError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
