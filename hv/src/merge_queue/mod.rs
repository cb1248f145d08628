//! Merge queue
//!
//! PR lifecycle: `queued -> reviewing -> {approved, rejected}`,
//! `approved -> merged`, and `closed` from any status but merged.

mod controller;
mod hosting;

pub use controller::{MergeQueueController, MergeQueueReport, review_message};
pub use hosting::{CodeHost, GhCli, HostError, MemoryHost, RemotePr, RemotePrState};
