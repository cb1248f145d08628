//! Daemon process control
//!
//! The manager lock doubles as the pid file: whoever holds `.hive/manager.lock`
//! is the running manager. Starting re-executes the binary detached as
//! `hive manager run-daemon`; stopping and tick requests are signals.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use eyre::{Context, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::domain::now_ms;
use crate::lock::{self, LockInfo};

/// Current version from git describe (set at compile time)
pub const VERSION: &str = env!("GIT_DESCRIBE");

const STOP_POLL: Duration = Duration::from_millis(100);
const STOP_ATTEMPTS: u32 = 100;

/// Manager daemon status
#[derive(Debug, Clone, serde::Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    /// Seconds since the last heartbeat
    pub heartbeat_age_secs: Option<i64>,
    pub lock_file: PathBuf,
}

/// Controls the manager daemon of one workspace
#[derive(Debug)]
pub struct DaemonManager {
    /// The `.hive` directory
    hive_dir: PathBuf,
}

impl DaemonManager {
    pub fn new(hive_dir: impl Into<PathBuf>) -> Self {
        Self {
            hive_dir: hive_dir.into(),
        }
    }

    pub fn hive_dir(&self) -> &Path {
        &self.hive_dir
    }

    fn lock_info(&self) -> Option<LockInfo> {
        lock::read_lock(&self.hive_dir)
    }

    /// Pid of the live lock holder
    pub fn running_pid(&self) -> Option<u32> {
        let result = self.lock_info().map(|info| info.pid).filter(|&pid| lock::is_process_running(pid));
        debug!(?result, "DaemonManager::running_pid: returning");
        result
    }

    pub fn is_running(&self) -> bool {
        self.running_pid().is_some()
    }

    pub fn status(&self) -> DaemonStatus {
        let info = self.lock_info();
        let pid = self.running_pid();
        DaemonStatus {
            running: pid.is_some(),
            pid,
            heartbeat_age_secs: info.filter(|_| pid.is_some()).map(|i| i.age_ms(now_ms()) / 1000),
            lock_file: self.hive_dir.join(lock::LOCK_FILE),
        }
    }

    /// Start the manager detached; returns the child pid
    pub fn start(&self, workspace_root: &Path, interval_secs: Option<u64>, config: Option<&Path>) -> Result<u32> {
        debug!(root = %workspace_root.display(), "DaemonManager::start: called");
        if let Some(pid) = self.running_pid() {
            return Err(eyre::eyre!("Manager already running with PID {}", pid));
        }

        let exe = std::env::current_exe().context("Failed to get current executable")?;
        let mut command = Command::new(&exe);
        if let Some(config) = config {
            command.arg("--config").arg(config);
        }
        command.args(["manager", "run-daemon"]);
        if let Some(secs) = interval_secs {
            command.arg("--interval").arg(secs.to_string());
        }

        let child = command
            .current_dir(workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn manager daemon")?;

        let pid = child.id();
        info!(pid, "Manager daemon started");
        Ok(pid)
    }

    /// SIGTERM the manager, SIGKILL it after the grace period
    pub fn stop(&self) -> Result<u32> {
        debug!("DaemonManager::stop: called");
        let pid = self
            .running_pid()
            .ok_or_else(|| eyre::eyre!("Manager is not running"))?;

        info!(pid, "Stopping manager");
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("Failed to send SIGTERM")?;

        let mut attempts = 0;
        while lock::is_process_running(pid) && attempts < STOP_ATTEMPTS {
            std::thread::sleep(STOP_POLL);
            attempts += 1;
        }

        if lock::is_process_running(pid) {
            warn!(pid, "Manager did not stop gracefully, sending SIGKILL");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            // The killed process could not release its lock
            let lock_file = self.hive_dir.join(lock::LOCK_FILE);
            if let Err(e) = std::fs::remove_file(&lock_file) {
                debug!(error = %e, "DaemonManager::stop: lock file not removed");
            }
        }
        info!(pid, "Manager stopped");
        Ok(pid)
    }

    /// Ask a running manager for an immediate tick; false when none is running
    pub fn trigger_tick(&self) -> Result<bool> {
        let Some(pid) = self.running_pid() else {
            return Ok(false);
        };
        if pid == std::process::id() {
            return Ok(false);
        }
        kill(Pid::from_raw(pid as i32), Signal::SIGUSR1).context("Failed to send SIGUSR1")?;
        info!(pid, "Requested tick");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::ManagerLock;
    use tempfile::TempDir;

    #[test]
    fn test_not_running_without_lock() {
        let dir = TempDir::new().unwrap();
        let daemon = DaemonManager::new(dir.path());
        assert!(!daemon.is_running());

        let status = daemon.status();
        assert!(!status.running);
        assert!(status.heartbeat_age_secs.is_none());
        assert_eq!(status.lock_file, dir.path().join("manager.lock"));
    }

    #[test]
    fn test_lock_holder_reported_running() {
        let dir = TempDir::new().unwrap();
        let lock = ManagerLock::acquire(dir.path(), Duration::from_secs(300)).unwrap();
        let daemon = DaemonManager::new(dir.path());

        assert_eq!(daemon.running_pid(), Some(std::process::id()));
        assert_eq!(daemon.status().heartbeat_age_secs, Some(0));

        // Never signal ourselves
        assert!(!daemon.trigger_tick().unwrap());
        lock.release().unwrap();
        assert!(!daemon.is_running());
    }

    #[test]
    fn test_stop_when_not_running_fails() {
        let dir = TempDir::new().unwrap();
        let daemon = DaemonManager::new(dir.path());
        assert!(daemon.stop().is_err());
        assert!(!daemon.trigger_tick().unwrap());
    }
}
