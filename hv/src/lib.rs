//! Hive - control plane for a fleet of coding agents
//!
//! Agents are long-lived terminal sessions driving a coding assistant. Hive
//! assigns them stories in dependency order, sizes the senior pool, repairs
//! state after sessions die, runs pull requests through a QA merge queue, and
//! watches every session for prompts, stalls and exits.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod health;
pub mod lock;
pub mod manager;
pub mod merge_queue;
pub mod scheduler;
pub mod session;
pub mod state;

// Re-export commonly used types
pub use config::Config;
pub use daemon::DaemonManager;
pub use health::{HealthReconciler, HealthReport};
pub use lock::{LockError, ManagerLock};
pub use manager::{Manager, ManagerRunner, TickGate, TickSummary};
pub use merge_queue::{CodeHost, GhCli, MergeQueueController};
pub use scheduler::{AssignmentEngine, ScalingController, topological_sort};
pub use session::{SessionRuntime, StateDetector, TmuxRuntime};
pub use state::StateManager;
