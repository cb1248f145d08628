//! In-process session runtime

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{SessionError, SessionRuntime};

#[derive(Debug, Clone, Default)]
struct FakeSession {
    workdir: PathBuf,
    command: String,
    output: String,
    sent: Vec<String>,
}

/// Session runtime that keeps sessions in a map
///
/// Output is whatever was last set with [`MemoryRuntime::set_output`]; text
/// sent to a session is recorded and can be read back with
/// [`MemoryRuntime::sent_to`].
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    sessions: Mutex<BTreeMap<String, FakeSession>>,
    history: Mutex<HashMap<String, Vec<String>>>,
    fail_listing: AtomicBool,
    fail_spawn: AtomicBool,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, FakeSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a live session without going through `spawn`
    pub fn add_session(&self, name: &str) {
        self.sessions().entry(name.to_string()).or_default();
    }

    /// Simulate a session dying
    pub fn remove(&self, name: &str) {
        self.sessions().remove(name);
    }

    pub fn set_output(&self, name: &str, output: &str) {
        if let Some(session) = self.sessions().get_mut(name) {
            session.output = output.to_string();
        }
    }

    /// Everything sent to a session, including sessions that have since died
    pub fn sent_to(&self, name: &str) -> Vec<String> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Names of sessions started with `spawn`, with their commands
    pub fn spawned(&self) -> Vec<(String, String)> {
        self.sessions()
            .iter()
            .filter(|(_, s)| !s.command.is_empty())
            .map(|(name, s)| (name.clone(), s.command.clone()))
            .collect()
    }

    pub fn workdir(&self, name: &str) -> Option<PathBuf> {
        self.sessions().get(name).map(|s| s.workdir.clone())
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.sessions().contains_key(name)
    }

    /// Make `list_live_sessions` fail until reset
    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Make `spawn` fail until reset
    pub fn set_fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionRuntime for MemoryRuntime {
    async fn list_live_sessions(&self) -> Result<Vec<String>, SessionError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(SessionError::Unavailable("listing disabled".to_string()));
        }
        Ok(self.sessions().keys().cloned().collect())
    }

    async fn spawn(&self, name: &str, workdir: &Path, command: &str) -> Result<(), SessionError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(SessionError::CommandFailed {
                command: format!("spawn {}", name),
                stderr: "spawn disabled".to_string(),
            });
        }
        let mut sessions = self.sessions();
        if sessions.contains_key(name) {
            return Err(SessionError::CommandFailed {
                command: format!("spawn {}", name),
                stderr: format!("duplicate session: {}", name),
            });
        }
        sessions.insert(
            name.to_string(),
            FakeSession {
                workdir: workdir.to_path_buf(),
                command: command.to_string(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn capture_output(&self, name: &str, lines: usize) -> Result<String, SessionError> {
        let sessions = self.sessions();
        let session = sessions
            .get(name)
            .ok_or_else(|| SessionError::NotFound(name.to_string()))?;
        let all: Vec<&str> = session.output.lines().collect();
        Ok(all[all.len().saturating_sub(lines)..].join("\n"))
    }

    async fn send_text(&self, name: &str, text: &str) -> Result<(), SessionError> {
        {
            let mut sessions = self.sessions();
            let session = sessions
                .get_mut(name)
                .ok_or_else(|| SessionError::NotFound(name.to_string()))?;
            session.sent.push(text.to_string());
        }
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_default()
            .push(text.to_string());
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<(), SessionError> {
        self.sessions().remove(name);
        Ok(())
    }
}
