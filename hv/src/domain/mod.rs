//! Domain types for Hive
//!
//! Teams, agents, stories, dependencies, escalations, pull requests, messages
//! and audit entries. All implement the Record trait for HiveStore persistence.
//!
//! Statuses are closed enums; the story and pull request lifecycles are
//! enforced by transition tables (`StoryStatus::can_transition`,
//! `PrStatus::can_transition`).

mod agent;
mod audit;
mod escalation;
mod id;
mod message;
mod pull_request;
mod story;
mod team;

use thiserror::Error;

pub use agent::{Agent, AgentRole, AgentStatus, CliTool};
pub use audit::{AuditEntry, MANAGER_ACTOR};
pub use escalation::{Escalation, EscalationStatus};
pub use id::{generate_id, short_hex, slugify};
pub use message::{Message, MessageStatus};
pub use pull_request::{PrStatus, PullRequest};
pub use story::{Story, StoryDependency, StoryStatus};
pub use team::Team;

// Re-export hivestore types for convenience
pub use hivestore::{Filter, FilterOp, IndexValue, Record, Store, Tx, now_ms};

/// A status change not allowed by the entity's transition table
#[derive(Debug, Error)]
#[error("Invalid {entity} transition for {id}: {from} -> {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub id: String,
    pub from: String,
    pub to: String,
}

impl TransitionError {
    pub fn new(entity: &'static str, id: &str, from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self {
            entity,
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
