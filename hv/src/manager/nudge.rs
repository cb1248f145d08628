//! Nudge ladder bookkeeping
//!
//! One tracker per live session holds an output fingerprint, the time the
//! output last changed and the nudge/restart counters. Stories get their own
//! counters for the stuck-story pass. Both maps are rebuilt from scratch when a
//! session dies or a story moves, so a restart or a status change resets the
//! ladder.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use tracing::{debug, info};

use crate::config::ManagerConfig;
use crate::domain::AuditEntry;
use crate::session::SessionRuntime;
use crate::state::StateManager;

/// Sent to a session whose output stopped changing
pub const NUDGE_TEXT: &str = "[hive] No progress detected for a while. Continue with your current story; if you are blocked, say exactly what you need.";

/// Sent when the secondary classifier thinks the work is finished
pub const AUTO_PROGRESS_TEXT: &str =
    "[hive] Your work looks complete. Commit, push and submit your PR for review, then wait for the next assignment.";

/// What the ladder says to do with an inactive session or story
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NudgeDecision {
    /// Still inside the inactivity window or the nudge cooldown
    Wait,
    /// Send one more nudge
    Nudge,
    /// Nudges exhausted, raise a human escalation
    Escalate,
    /// Already escalated; leave the session alone
    Exhausted,
}

/// Ladder counters shared by sessions and stories
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ladder {
    pub nudges: u32,
    pub last_nudge_at: Option<i64>,
    pub escalated: bool,
}

impl Ladder {
    /// Decide the next step given how long the subject has been idle
    pub fn decide(&self, idle_ms: i64, threshold_ms: i64, now: i64, config: &ManagerConfig) -> NudgeDecision {
        if idle_ms < threshold_ms {
            return NudgeDecision::Wait;
        }
        if self.escalated {
            return NudgeDecision::Exhausted;
        }
        if self.nudges >= config.max_nudges {
            return NudgeDecision::Escalate;
        }
        match self.last_nudge_at {
            Some(at) if now - at < config.nudge_cooldown_ms() => NudgeDecision::Wait,
            _ => NudgeDecision::Nudge,
        }
    }

    pub fn record_nudge(&mut self, now: i64) {
        self.nudges += 1;
        self.last_nudge_at = Some(now);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Per-session state carried between ticks
#[derive(Debug, Clone)]
pub struct SessionTracker {
    pub fingerprint: u64,
    pub last_change_at: i64,
    pub story_id: Option<String>,
    pub ladder: Ladder,
    pub restarts: u32,
}

impl SessionTracker {
    fn new(fingerprint: u64, story_id: Option<&str>, now: i64) -> Self {
        Self {
            fingerprint,
            last_change_at: now,
            story_id: story_id.map(str::to_string),
            ladder: Ladder::default(),
            restarts: 0,
        }
    }

    pub fn idle_ms(&self, now: i64) -> i64 {
        now - self.last_change_at
    }
}

/// Hash of the captured output, ignoring trailing whitespace
pub fn fingerprint(output: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    for line in output.lines() {
        line.trim_end().hash(&mut hasher);
    }
    hasher.finish()
}

/// Session trackers keyed by session name
#[derive(Debug, Default)]
pub struct SessionTrackers {
    trackers: HashMap<String, SessionTracker>,
}

impl SessionTrackers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record this tick's output for a session
    ///
    /// Changed output restarts the inactivity clock only; nudges already sent
    /// still count, since a nudge typed into the pane changes the output
    /// itself. A different story resets the ladder too. Restart counts survive
    /// until the session dies.
    pub fn observe(&mut self, session: &str, output: &str, story_id: Option<&str>, now: i64) -> &mut SessionTracker {
        let print = fingerprint(output);
        let tracker = self
            .trackers
            .entry(session.to_string())
            .or_insert_with(|| SessionTracker::new(print, story_id, now));

        if tracker.story_id.as_deref() != story_id {
            debug!(%session, "SessionTrackers::observe: story changed");
            tracker.story_id = story_id.map(str::to_string);
            tracker.fingerprint = print;
            tracker.last_change_at = now;
            tracker.ladder.reset();
        } else if tracker.fingerprint != print {
            tracker.fingerprint = print;
            tracker.last_change_at = now;
        }
        tracker
    }

    pub fn get(&self, session: &str) -> Option<&SessionTracker> {
        self.trackers.get(session)
    }

    pub fn get_mut(&mut self, session: &str) -> Option<&mut SessionTracker> {
        self.trackers.get_mut(session)
    }

    /// Drop trackers for sessions that are no longer live
    pub fn prune(&mut self, live: &HashSet<String>) -> usize {
        let before = self.trackers.len();
        self.trackers.retain(|session, _| live.contains(session));
        let pruned = before - self.trackers.len();
        if pruned > 0 {
            debug!(pruned, "SessionTrackers::prune: dropped dead sessions");
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

#[derive(Debug, Clone)]
struct StoryTracker {
    seen_updated_at: i64,
    ladder: Ladder,
}

/// Nudge counters for stories stuck in progress
#[derive(Debug, Default)]
pub struct StoryNudges {
    stories: HashMap<String, StoryTracker>,
}

impl StoryNudges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ladder for a story, reset whenever the story record changed
    pub fn ladder(&mut self, story_id: &str, updated_at: i64) -> &mut Ladder {
        let tracker = self.stories.entry(story_id.to_string()).or_insert_with(|| StoryTracker {
            seen_updated_at: updated_at,
            ladder: Ladder::default(),
        });
        if tracker.seen_updated_at != updated_at {
            tracker.seen_updated_at = updated_at;
            tracker.ladder.reset();
        }
        &mut tracker.ladder
    }

    /// Forget stories that are no longer in progress
    pub fn retain(&mut self, active: &HashSet<String>) {
        self.stories.retain(|id, _| active.contains(id));
    }
}

/// Type a nudge into a session and record it
pub async fn deliver_nudge(
    state: &StateManager,
    runtime: &dyn SessionRuntime,
    session: &str,
    text: &str,
    event: &str,
) -> eyre::Result<()> {
    debug!(%session, %event, "deliver_nudge: called");
    runtime.send_text(session, text).await?;

    let mut entry = AuditEntry::manager(event, format!("{}: {}", session, text));
    if let Some(agent) = state.find_agent_by_session(session).await? {
        entry = entry.agent(&agent.id);
        if let Some(ref story) = agent.current_story_id {
            entry = entry.story(story);
        }
    }
    state.audit(entry).await?;
    info!(%session, %event, "Nudged session");
    Ok(())
}
