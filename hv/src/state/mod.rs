//! State management
//!
//! The StateManager actor owns the HiveStore. Backfill repairs inconsistent
//! records at the start of every tick.

mod backfill;
mod manager;
mod messages;

pub use backfill::{BackfillReport, backfill};
pub use manager::{StateManager, StatusSummary};
pub use messages::{StateCommand, StateError, StateResponse, StoreJob};
