//! Manager runner
//!
//! Drives `Manager::tick` from a tokio interval and from SIGUSR1. Requests
//! that arrive while a tick is running are coalesced into exactly one follow-up
//! tick. SIGINT/SIGTERM stop the runner once the in-flight tick finishes.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::lock::{LockError, ManagerLock};

use super::tick::{Manager, TickSummary};

#[derive(Debug, Default)]
struct GateState {
    running: bool,
    rerun: bool,
}

/// Overlap protection: a running flag plus a re-run flag
#[derive(Debug, Default)]
pub struct TickGate {
    inner: StdMutex<GateState>,
}

impl TickGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the gate; if a tick is already running, ask it to run once more
    pub fn try_enter(&self) -> bool {
        let mut state = self.state();
        if state.running {
            state.rerun = true;
            false
        } else {
            state.running = true;
            true
        }
    }

    /// Finish a tick; returns true when a re-run was requested and the caller
    /// still holds the gate
    pub fn finish(&self) -> bool {
        let mut state = self.state();
        if state.rerun {
            state.rerun = false;
            true
        } else {
            state.running = false;
            false
        }
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }
}

/// Owns the manager, its gate and the singleton lock
pub struct ManagerRunner {
    manager: Mutex<Manager>,
    gate: TickGate,
    lock: StdMutex<Option<ManagerLock>>,
    stopping: AtomicBool,
    stop: Notify,
}

impl ManagerRunner {
    pub fn new(manager: Manager, lock: Option<ManagerLock>) -> Arc<Self> {
        Arc::new(Self {
            manager: Mutex::new(manager),
            gate: TickGate::new(),
            lock: StdMutex::new(lock),
            stopping: AtomicBool::new(false),
            stop: Notify::new(),
        })
    }

    /// Run a tick now, or coalesce into the one already running
    ///
    /// Returns the summary of the last tick this call ran, or None when the
    /// request was folded into an in-flight tick.
    pub async fn request_tick(&self) -> Option<TickSummary> {
        if self.stopping.load(Ordering::SeqCst) {
            return None;
        }
        if !self.gate.try_enter() {
            debug!("request_tick: tick in progress, coalesced");
            return None;
        }

        let mut last;
        loop {
            last = self.manager.lock().await.tick().await;
            self.heartbeat();
            if self.stopping.load(Ordering::SeqCst) {
                self.gate.finish();
                break;
            }
            if !self.gate.finish() {
                break;
            }
            debug!("request_tick: running coalesced tick");
        }
        Some(last)
    }

    fn heartbeat(&self) {
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let Some(ref lock) = *guard else {
            return;
        };
        match lock.refresh() {
            Ok(()) => {}
            Err(LockError::Lost { pid }) => {
                error!(pid, "Manager lock taken over, stopping");
                self.request_stop();
            }
            Err(e) => warn!(error = %e, "Failed to refresh manager lock"),
        }
    }

    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.stop.notify_one();
    }

    fn spawn_tick(self: &Arc<Self>) {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.request_tick().await;
        });
    }

    /// Tick on an interval until a stop signal arrives
    pub async fn run(self: Arc<Self>, interval: Duration) -> eyre::Result<()> {
        info!(interval_secs = interval.as_secs(), "Manager runner started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.spawn_tick(),
                _ = sigusr1.recv() => {
                    info!("SIGUSR1 received, requesting tick");
                    self.spawn_tick();
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, stopping");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, stopping");
                    break;
                }
                _ = self.stop.notified() => break,
            }
        }

        self.shutdown().await
    }

    /// Wait for the in-flight tick, then flush the store and release the lock
    pub async fn shutdown(&self) -> eyre::Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        let manager = self.manager.lock().await;
        debug!(ticks = manager.ticks(), "shutdown: in-flight tick finished");
        manager.state().flush().await?;

        let lock = self.lock.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(lock) = lock {
            lock.release()?;
        }
        info!("Manager runner stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::merge_queue::MemoryHost;
    use crate::session::{HeuristicClassifier, MemoryRuntime};
    use crate::state::StateManager;
    use tempfile::tempdir;

    fn manager() -> Manager {
        Manager::new(
            StateManager::in_memory().unwrap(),
            Arc::new(MemoryRuntime::new()),
            Arc::new(MemoryHost::new()),
            Arc::new(HeuristicClassifier),
            Arc::new(Config::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_gate_coalesces_requests() {
        let gate = TickGate::new();
        assert!(gate.try_enter());
        assert!(!gate.try_enter());
        assert!(!gate.try_enter());

        // Two requests during the tick collapse into one re-run
        assert!(gate.finish());
        assert!(gate.is_running());
        assert!(!gate.finish());
        assert!(!gate.is_running());
        assert!(gate.try_enter());
    }

    #[tokio::test]
    async fn test_request_tick_runs() {
        let runner = ManagerRunner::new(manager(), None);
        let summary = runner.request_tick().await.unwrap();
        assert_eq!(summary.tick, 1);
    }

    #[tokio::test]
    async fn test_requests_during_tick_coalesce_into_one_rerun() {
        let runner = ManagerRunner::new(manager(), None);

        // Hold the manager so the first request parks inside its tick
        let held = runner.manager.lock().await;
        let leader = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.request_tick().await })
        };
        while !runner.gate.is_running() {
            tokio::task::yield_now().await;
        }

        let followers: Vec<_> = (0..4)
            .map(|_| {
                let runner = Arc::clone(&runner);
                tokio::spawn(async move { runner.request_tick().await })
            })
            .collect();
        for follower in followers {
            assert!(follower.await.unwrap().is_none());
        }
        drop(held);

        let summary = leader.await.unwrap().unwrap();
        assert_eq!(summary.tick, 2);
        assert!(!runner.gate.is_running());
        assert_eq!(runner.manager.lock().await.ticks(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_releases_lock() {
        let dir = tempdir().unwrap();
        let lock = ManagerLock::acquire(dir.path(), Duration::from_secs(300)).unwrap();
        let runner = ManagerRunner::new(manager(), Some(lock));
        runner.request_tick().await.unwrap();

        runner.shutdown().await.unwrap();
        assert!(crate::lock::read_lock(dir.path()).is_none());
        assert!(runner.request_tick().await.is_none());
    }
}
