//! State manager messages
//!
//! Commands and responses for the actor pattern.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::Store;

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Channel error")]
    ChannelError,
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// A unit of work run against the store on the actor task
pub type StoreJob = Box<dyn FnOnce(&mut Store) + Send>;

/// Commands sent to the StateManager actor
pub enum StateCommand {
    /// Run one scoped section against the store
    Run(StoreJob),

    /// Checkpoint to durable storage
    Flush {
        reply: oneshot::Sender<StateResponse<()>>,
    },

    /// Flush and stop the actor
    Shutdown {
        reply: oneshot::Sender<StateResponse<()>>,
    },
}

impl std::fmt::Debug for StateCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run(_) => write!(f, "Run"),
            Self::Flush { .. } => write!(f, "Flush"),
            Self::Shutdown { .. } => write!(f, "Shutdown"),
        }
    }
}
