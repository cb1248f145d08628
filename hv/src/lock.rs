//! Singleton manager lock
//!
//! A JSON file in the workspace (`.hive/manager.lock`) naming the pid that
//! drives ticks and when it last proved it was alive. Every read-modify-write
//! of the file happens under an exclusive `fs2` file lock, so two managers
//! starting at once cannot both win.
//!
//! A lock is reclaimable when its owner is dead or its heartbeat is older than
//! the configured staleness timeout.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::now_ms;

/// Lock file name inside the workspace directory
pub const LOCK_FILE: &str = "manager.lock";

/// Errors from the singleton lock
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Manager already running (pid {pid}, heartbeat {age_secs}s ago)")]
    Held { pid: u32, age_secs: i64 },

    #[error("Lock was taken over by pid {pid}")]
    Lost { pid: u32 },

    #[error("Lock I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: i64,
    pub heartbeat_at: i64,
}

impl LockInfo {
    /// Milliseconds since the last heartbeat
    pub fn age_ms(&self, now: i64) -> i64 {
        now - self.heartbeat_at
    }

    /// Whether another manager may take this lock over
    pub fn is_stale(&self, now: i64, stale_after: Duration) -> bool {
        !is_process_running(self.pid) || self.age_ms(now) > stale_after.as_millis() as i64
    }
}

/// A held manager lock; released explicitly with [`ManagerLock::release`]
#[derive(Debug)]
pub struct ManagerLock {
    path: PathBuf,
    pid: u32,
}

impl ManagerLock {
    /// Acquire the lock for the current process
    pub fn acquire(dir: &Path, stale_after: Duration) -> Result<Self, LockError> {
        Self::acquire_as(dir, std::process::id(), stale_after)
    }

    fn acquire_as(dir: &Path, pid: u32, stale_after: Duration) -> Result<Self, LockError> {
        debug!(dir = %dir.display(), pid, "ManagerLock::acquire: called");
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);

        with_locked_file(&path, |file| {
            let now = now_ms();
            if let Some(existing) = read_info(file)? {
                if existing.pid != pid && !existing.is_stale(now, stale_after) {
                    return Err(LockError::Held {
                        pid: existing.pid,
                        age_secs: existing.age_ms(now) / 1000,
                    });
                }
                if existing.pid != pid {
                    warn!(
                        stale_pid = existing.pid,
                        age_ms = existing.age_ms(now),
                        "Reclaiming stale manager lock"
                    );
                }
            }
            write_info(
                file,
                &LockInfo {
                    pid,
                    acquired_at: now,
                    heartbeat_at: now,
                },
            )
        })?;

        info!(pid, path = %path.display(), "Manager lock acquired");
        Ok(Self { path, pid })
    }

    /// Record a heartbeat; fails if another process has taken the lock
    pub fn refresh(&self) -> Result<(), LockError> {
        debug!(pid = self.pid, "ManagerLock::refresh: called");
        with_locked_file(&self.path, |file| {
            let mut info = match read_info(file)? {
                Some(info) if info.pid != self.pid => return Err(LockError::Lost { pid: info.pid }),
                Some(info) => info,
                None => LockInfo {
                    pid: self.pid,
                    acquired_at: now_ms(),
                    heartbeat_at: now_ms(),
                },
            };
            info.heartbeat_at = now_ms();
            write_info(file, &info)
        })
    }

    /// Remove the lock file if this process still owns it
    pub fn release(self) -> Result<(), LockError> {
        debug!(pid = self.pid, "ManagerLock::release: called");
        let owned = with_locked_file(&self.path, |file| {
            Ok(read_info(file)?.is_none_or(|info| info.pid == self.pid))
        })?;
        if owned {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            info!(pid = self.pid, "Manager lock released");
        } else {
            warn!(pid = self.pid, "Manager lock owned by another process, leaving it");
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Read the current lock holder, if any
pub fn read_lock(dir: &Path) -> Option<LockInfo> {
    let content = fs::read_to_string(dir.join(LOCK_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}

fn with_locked_file<T>(path: &Path, f: impl FnOnce(&mut File) -> Result<T, LockError>) -> Result<T, LockError> {
    let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
    file.lock_exclusive()?;
    let result = f(&mut file);
    if let Err(e) = FileExt::unlock(&file) {
        debug!(error = %e, "with_locked_file: unlock failed");
    }
    result
}

fn read_info(file: &mut File) -> Result<Option<LockInfo>, LockError> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut content)?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    // A corrupt lock file is treated as absent
    Ok(serde_json::from_str(&content).ok())
}

fn write_info(file: &mut File, info: &LockInfo) -> Result<(), LockError> {
    let json = serde_json::to_string(info)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Check if a process with the given PID is running
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        // Signal 0 checks existence; EPERM means it exists under another user
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
