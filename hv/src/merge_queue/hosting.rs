//! Code hosting adapter
//!
//! The merge queue needs very little from the hosting service: which PRs are
//! open or merged, the state of one PR, and merge/close actions. [`GhCli`]
//! drives the GitHub `gh` CLI with JSON output; [`MemoryHost`] keeps PRs in a
//! map for tests.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors from the hosting service
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Hosting CLI unavailable: {0}")]
    Unavailable(String),

    #[error("Hosting command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Hosting command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected hosting output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Hosting I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote PR state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RemotePrState {
    Open,
    Merged,
    Closed,
}

/// A PR as the hosting service reports it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemotePr {
    pub number: u64,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "headRefName", default)]
    pub head_ref: String,
    pub state: RemotePrState,
}

#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn list_merged_prs(&self, repo: &str) -> Result<Vec<RemotePr>, HostError>;

    async fn list_open_prs(&self, repo: &str) -> Result<Vec<RemotePr>, HostError>;

    async fn pr_state(&self, repo: &str, number: u64) -> Result<RemotePrState, HostError>;

    async fn merge_pr(&self, repo: &str, number: u64) -> Result<(), HostError>;

    async fn close_pr(&self, repo: &str, number: u64, comment: &str) -> Result<(), HostError>;
}

const LIST_FIELDS: &str = "number,url,headRefName,state";

/// GitHub CLI implementation
#[derive(Debug, Clone)]
pub struct GhCli {
    binary: String,
    timeout: Duration,
}

impl GhCli {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Run `gh`; a local path repo becomes the working directory, anything else `--repo`
    async fn run(&self, repo: &str, args: &[&str]) -> Result<String, HostError> {
        debug!(binary = %self.binary, %repo, ?args, "GhCli::run: called");
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).kill_on_drop(true);
        if is_local_path(repo) {
            cmd.current_dir(repo);
        } else {
            cmd.args(["--repo", repo]);
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => return Err(HostError::Timeout(self.timeout)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HostError::Unavailable(format!("{} not found", self.binary)));
            }
            Ok(result) => result?,
        };

        if !output.status.success() {
            return Err(HostError::CommandFailed {
                command: format!("{} {}", self.binary, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn list(&self, repo: &str, state: &str) -> Result<Vec<RemotePr>, HostError> {
        let out = self
            .run(
                repo,
                &["pr", "list", "--state", state, "--json", LIST_FIELDS, "--limit", "200"],
            )
            .await?;
        parse_pr_list(&out)
    }
}

fn is_local_path(repo: &str) -> bool {
    repo.starts_with('/') || repo.starts_with('.') || Path::new(repo).is_dir()
}

pub(crate) fn parse_pr_list(json: &str) -> Result<Vec<RemotePr>, HostError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(json)?)
}

#[derive(Deserialize)]
struct StateOnly {
    state: RemotePrState,
}

#[async_trait]
impl CodeHost for GhCli {
    async fn list_merged_prs(&self, repo: &str) -> Result<Vec<RemotePr>, HostError> {
        self.list(repo, "merged").await
    }

    async fn list_open_prs(&self, repo: &str) -> Result<Vec<RemotePr>, HostError> {
        self.list(repo, "open").await
    }

    async fn pr_state(&self, repo: &str, number: u64) -> Result<RemotePrState, HostError> {
        let number = number.to_string();
        let out = self.run(repo, &["pr", "view", &number, "--json", "state"]).await?;
        let parsed: StateOnly = serde_json::from_str(&out)?;
        Ok(parsed.state)
    }

    async fn merge_pr(&self, repo: &str, number: u64) -> Result<(), HostError> {
        let number = number.to_string();
        self.run(repo, &["pr", "merge", &number, "--squash", "--delete-branch"])
            .await?;
        Ok(())
    }

    async fn close_pr(&self, repo: &str, number: u64, comment: &str) -> Result<(), HostError> {
        let number = number.to_string();
        self.run(repo, &["pr", "close", &number, "--comment", comment]).await?;
        Ok(())
    }
}

/// In-memory hosting service
#[derive(Debug, Default)]
pub struct MemoryHost {
    prs: Mutex<BTreeMap<(String, u64), RemotePr>>,
    comments: Mutex<Vec<(u64, String)>>,
    fail_merge: AtomicBool,
    fail_all: AtomicBool,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn prs(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, u64), RemotePr>> {
        self.prs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, repo: &str, number: u64, head_ref: &str, state: RemotePrState) {
        self.prs().insert(
            (repo.to_string(), number),
            RemotePr {
                number,
                url: format!("https://example.invalid/{}/pull/{}", repo, number),
                head_ref: head_ref.to_string(),
                state,
            },
        );
    }

    pub fn state_of(&self, repo: &str, number: u64) -> Option<RemotePrState> {
        self.prs().get(&(repo.to_string(), number)).map(|p| p.state)
    }

    pub fn close_comments(&self) -> Vec<(u64, String)> {
        self.comments.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_fail_merge(&self, fail: bool) {
        self.fail_merge.store(fail, Ordering::SeqCst);
    }

    /// Make every call fail, as if the service were unreachable
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), HostError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(HostError::Unavailable("memory host offline".to_string()));
        }
        Ok(())
    }

    fn list(&self, repo: &str, state: RemotePrState) -> Vec<RemotePr> {
        self.prs()
            .iter()
            .filter(|((r, _), pr)| r == repo && pr.state == state)
            .map(|(_, pr)| pr.clone())
            .collect()
    }
}

#[async_trait]
impl CodeHost for MemoryHost {
    async fn list_merged_prs(&self, repo: &str) -> Result<Vec<RemotePr>, HostError> {
        self.check()?;
        Ok(self.list(repo, RemotePrState::Merged))
    }

    async fn list_open_prs(&self, repo: &str) -> Result<Vec<RemotePr>, HostError> {
        self.check()?;
        Ok(self.list(repo, RemotePrState::Open))
    }

    async fn pr_state(&self, repo: &str, number: u64) -> Result<RemotePrState, HostError> {
        self.check()?;
        self.state_of(repo, number).ok_or_else(|| HostError::CommandFailed {
            command: format!("pr view {}", number),
            stderr: "no pull requests found".to_string(),
        })
    }

    async fn merge_pr(&self, repo: &str, number: u64) -> Result<(), HostError> {
        self.check()?;
        if self.fail_merge.load(Ordering::SeqCst) {
            return Err(HostError::CommandFailed {
                command: format!("pr merge {}", number),
                stderr: "merge blocked".to_string(),
            });
        }
        let mut prs = self.prs();
        let pr = prs
            .entry((repo.to_string(), number))
            .or_insert_with(|| RemotePr {
                number,
                url: String::new(),
                head_ref: String::new(),
                state: RemotePrState::Open,
            });
        pr.state = RemotePrState::Merged;
        Ok(())
    }

    async fn close_pr(&self, repo: &str, number: u64, comment: &str) -> Result<(), HostError> {
        self.check()?;
        if let Some(pr) = self.prs().get_mut(&(repo.to_string(), number)) {
            pr.state = RemotePrState::Closed;
        }
        self.comments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((number, comment.to_string()));
        Ok(())
    }
}
