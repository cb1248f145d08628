//! Health reconciler
//!
//! Compares agents in the store with the sessions that are actually alive.
//! Agents whose session is gone are terminated and their work returned to the
//! pool; the agent/story assignment links are repaired in both directions.
//!
//! Session listing happens outside the store transaction. If the runtime
//! cannot be listed the pass aborts without touching the store, since an
//! unreachable runtime says nothing about whether agents died. An agent
//! registered after the first listing may own a session that listing missed,
//! so suspects are confirmed against a second listing taken after they were
//! read; sessions are always spawned before their agent is stored.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{Agent, AgentRole, AgentStatus, AuditEntry, PrStatus, PullRequest, Story, StoryStatus, Tx};
use crate::session::SessionRuntime;
use crate::state::StateManager;

/// What a reconciler pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Agents terminated because their session is gone
    pub terminated: Vec<String>,
    /// in_progress stories returned to planned
    pub recovered_stories: Vec<String>,
    /// Stories in later statuses that only lost their assignee
    pub released_stories: Vec<String>,
    /// Agents cleared because their story did not point back
    pub idled_agents: Vec<String>,
    /// PRs returned to the queue after their reviewer died
    pub requeued_prs: Vec<String>,
}

impl HealthReport {
    pub fn is_empty(&self) -> bool {
        self.terminated.is_empty()
            && self.recovered_stories.is_empty()
            && self.released_stories.is_empty()
            && self.idled_agents.is_empty()
            && self.requeued_prs.is_empty()
    }
}

impl std::fmt::Display for HealthReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "terminated: {}, recovered: {}, released: {}, idled: {}, requeued: {}",
            self.terminated.len(),
            self.recovered_stories.len(),
            self.released_stories.len(),
            self.idled_agents.len(),
            self.requeued_prs.len()
        )
    }
}

pub struct HealthReconciler {
    state: StateManager,
    runtime: Arc<dyn SessionRuntime>,
}

impl HealthReconciler {
    pub fn new(state: StateManager, runtime: Arc<dyn SessionRuntime>) -> Self {
        Self { state, runtime }
    }

    /// One reconciliation pass; returns what it changed
    pub async fn run(&self) -> eyre::Result<HealthReport> {
        debug!("HealthReconciler::run: called");
        let live = self.list_live().await?;
        let suspects: Vec<Agent> = self
            .state
            .list_live_agents()
            .await?
            .into_iter()
            .filter(|a| session_is_dead(a, &live))
            .collect();

        let confirmed: HashSet<String> = if suspects.is_empty() {
            HashSet::new()
        } else {
            let relisted = self.list_live().await?;
            suspects
                .into_iter()
                .filter(|a| {
                    let dead = session_is_dead(a, &relisted);
                    if !dead {
                        debug!(agent = %a.id, "HealthReconciler::run: session appeared on relisting");
                    }
                    dead
                })
                .map(|a| a.id)
                .collect()
        };

        let report = self.state.transaction(move |tx| reconcile(tx, &confirmed)).await?;
        if !report.is_empty() {
            info!("Health reconciliation: {}", report);
        }
        Ok(report)
    }

    async fn list_live(&self) -> eyre::Result<HashSet<String>> {
        Ok(self
            .runtime
            .list_live_sessions()
            .await
            .map_err(|e| eyre::eyre!("cannot list sessions, skipping health check: {}", e))?
            .into_iter()
            .collect())
    }
}

fn session_is_dead(agent: &Agent, live: &HashSet<String>) -> bool {
    match agent.tmux_session {
        Some(ref session) => !live.contains(session),
        None => agent.status == AgentStatus::Working,
    }
}

/// Return a story to the pool; in_progress work goes back to planned
fn release_story(tx: &mut Tx<'_>, mut story: Story, reason: &str, report: &mut HealthReport) -> eyre::Result<()> {
    let story_id = story.id.clone();
    let previous = story.assigned_agent_id.clone().unwrap_or_default();
    if story.status == StoryStatus::InProgress {
        story.recover_to_planned();
        tx.update(story)?;
        tx.create(
            AuditEntry::manager("story-orphan-recovered", format!("{}; returned to planned", reason))
                .story(&story_id)
                .agent(&previous),
        )?;
        report.recovered_stories.push(story_id);
    } else {
        story.assigned_agent_id = None;
        story.touch();
        tx.update(story)?;
        tx.create(
            AuditEntry::manager("story-unassigned", format!("{}; assignment cleared", reason))
                .story(&story_id)
                .agent(&previous),
        )?;
        report.released_stories.push(story_id);
    }
    Ok(())
}

/// Apply one pass; `dead_agents` holds ids whose session was missing from both listings
fn reconcile(tx: &mut Tx<'_>, dead_agents: &HashSet<String>) -> eyre::Result<HealthReport> {
    let mut report = HealthReport::default();
    let mut agents: HashMap<String, Agent> = tx
        .list::<Agent>(&[])?
        .into_iter()
        .map(|a| (a.id.clone(), a))
        .collect();

    // Dead sessions
    let mut dead: Vec<Agent> = agents
        .values()
        .filter(|a| !a.is_terminated() && dead_agents.contains(&a.id))
        .cloned()
        .collect();
    dead.sort_by(|a, b| a.id.cmp(&b.id));
    for mut agent in dead {
        warn!(agent = %agent.id, session = ?agent.tmux_session, "Agent session is gone, terminating");
        agent.terminate();
        let agent_id = agent.id.clone();
        let session = agent.tmux_session.clone().unwrap_or_default();
        let role = agent.role;
        tx.update(agent.clone())?;
        tx.create(
            AuditEntry::manager("agent-session-lost", format!("session {} not live; agent terminated", session))
                .agent(&agent_id),
        )?;
        agents.insert(agent_id.clone(), agent);
        report.terminated.push(agent_id.clone());

        if role == AgentRole::Qa {
            for mut pr in tx.list::<PullRequest>(&[])? {
                if pr.status == PrStatus::Reviewing && pr.reviewed_by.as_deref() == Some(agent_id.as_str()) {
                    pr.return_to_queue();
                    let pr_id = pr.id.clone();
                    tx.update(pr)?;
                    tx.create(
                        AuditEntry::manager("pr-requeued", format!("reviewer {} died; PR {} back in queue", agent_id, pr_id))
                            .agent(&agent_id),
                    )?;
                    report.requeued_prs.push(pr_id);
                }
            }
        }
    }

    // Stories pointing at missing or terminated agents
    for story in tx.list::<Story>(&[])? {
        if story.status.is_terminal() {
            continue;
        }
        let Some(ref agent_id) = story.assigned_agent_id else {
            continue;
        };
        let orphaned = agents.get(agent_id).is_none_or(Agent::is_terminated);
        if orphaned {
            let reason = format!("assigned agent {} is gone", agent_id);
            release_story(tx, story, &reason, &mut report)?;
        }
    }

    // Agents pointing at stories that do not point back
    let stories: HashMap<String, Story> = tx
        .list::<Story>(&[])?
        .into_iter()
        .map(|s| (s.id.clone(), s))
        .collect();
    let mut ids: Vec<&String> = agents.keys().collect();
    ids.sort();
    for id in ids {
        let agent = &agents[id];
        if agent.is_terminated() || agent.role == AgentRole::Qa {
            continue;
        }
        let Some(ref story_id) = agent.current_story_id else {
            continue;
        };
        let points_back = stories
            .get(story_id)
            .is_some_and(|s| !s.status.is_terminal() && s.assigned_agent_id.as_deref() == Some(agent.id.as_str()));
        if !points_back {
            debug!(agent = %agent.id, story = %story_id, "Agent story link is one-sided");
            let mut agent = agent.clone();
            agent.release();
            let agent_id = agent.id.clone();
            tx.update(agent)?;
            tx.create(
                AuditEntry::manager(
                    "agent-released",
                    format!("story {} is not assigned to this agent", story_id),
                )
                .agent(&agent_id)
                .story(story_id),
            )?;
            report.idled_agents.push(agent_id);
        }
    }

    Ok(report)
}
