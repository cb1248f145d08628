//! Manager loop
//!
//! A tick runs, in order: backfill, health, merge-queue check, auto-merge,
//! hosting sync, escalation cleanup, session discovery, per-session handling,
//! QA dispatch, rejection notices, qa_failed recovery, stuck-story nudges and
//! senior notifications.

mod escalation;
mod nudge;
mod runner;
mod tick;

pub use escalation::EscalationDesk;
pub use nudge::{
    AUTO_PROGRESS_TEXT, Ladder, NUDGE_TEXT, NudgeDecision, SessionTracker, SessionTrackers, StoryNudges,
    deliver_nudge, fingerprint,
};
pub use runner::{ManagerRunner, TickGate};
pub use tick::{Manager, PhaseError, TickSummary};
