//! Assignment engine
//!
//! Offers planned stories, in dependency order, to idle developer agents of the
//! tier their complexity calls for. A story is only offered once every
//! dependency is merged or actively being worked on; a dependency still in
//! draft, estimated, planned or pr_submitted blocks it, as does a dependency
//! that does not exist.
//!
//! Each assignment is one store transaction (story, agent, audit entry). The
//! agent's session is told about the story only after the transaction commits.

use eyre::{bail, eyre};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{Config, ScalingConfig};
use crate::domain::{Agent, AgentRole, AuditEntry, Story, StoryStatus, Team};
use crate::session::SessionRuntime;
use crate::state::StateManager;

use super::graph::sort_stories;
use super::spawn::AgentSpawner;

/// One story matched to an agent (or, in a dry run, to a tier needing a spawn)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub story_id: String,
    pub team_id: String,
    pub tier: AgentRole,
    /// None in a dry run when the tier would need a new agent
    pub agent_id: Option<String>,
    pub session: Option<String>,
    pub spawned: bool,
}

/// A story left unassigned this pass, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedStory {
    pub story_id: String,
    pub reason: String,
}

/// A team whose planned batch contains a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamCycle {
    pub team_id: String,
    pub stories: Vec<String>,
}

/// Outcome of an assignment pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssignmentReport {
    pub dry_run: bool,
    pub assignments: Vec<Assignment>,
    /// Stories waiting on dependencies
    pub blocked: Vec<SkippedStory>,
    /// Stories with no eligible agent
    pub unassignable: Vec<SkippedStory>,
    pub cycles: Vec<TeamCycle>,
    /// Teams whose pass failed outright
    pub errors: Vec<String>,
}

impl AssignmentReport {
    pub fn assigned_ids(&self) -> Vec<&str> {
        self.assignments.iter().map(|a| a.story_id.as_str()).collect()
    }
}

impl std::fmt::Display for AssignmentReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "assigned: {}, blocked: {}, unassignable: {}, cycles: {}",
            self.assignments.len(),
            self.blocked.len(),
            self.unassignable.len(),
            self.cycles.len()
        )
    }
}

/// Tier for a complexity score; unscored stories go to a senior
pub fn route_tier(score: Option<u8>, scaling: &ScalingConfig) -> AgentRole {
    match score {
        Some(s) if s <= scaling.junior_max_complexity => AgentRole::Junior,
        Some(s) if s <= scaling.intermediate_max_complexity => AgentRole::Intermediate,
        _ => AgentRole::Senior,
    }
}

/// Idle agent of `role` with the fewest active stories, oldest first on ties
pub fn select_agent<'a>(agents: &'a [Agent], role: AgentRole, load: &HashMap<String, usize>) -> Option<&'a Agent> {
    agents
        .iter()
        .filter(|a| a.role == role && a.is_idle())
        .min_by(|a, b| {
            let la = load.get(&a.id).copied().unwrap_or(0);
            let lb = load.get(&b.id).copied().unwrap_or(0);
            la.cmp(&lb)
                .then(a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        })
}

/// Check a story's dependencies against known statuses
pub fn dependencies_satisfied(deps: &[String], statuses: &HashMap<String, StoryStatus>) -> Result<(), String> {
    for dep in deps {
        match statuses.get(dep) {
            None => return Err(format!("dependency {} does not exist", dep)),
            Some(status) if !status.satisfies_dependency() => {
                return Err(format!("dependency {} is {}", dep, status));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

enum Candidate {
    Existing(Agent),
    Spawned(Agent),
    WouldSpawn(AgentRole),
}

/// Matches planned stories to developer agents
pub struct AssignmentEngine {
    state: StateManager,
    runtime: Arc<dyn SessionRuntime>,
    spawner: AgentSpawner,
    config: Arc<Config>,
}

impl AssignmentEngine {
    pub fn new(state: StateManager, runtime: Arc<dyn SessionRuntime>, spawner: AgentSpawner, config: Arc<Config>) -> Self {
        Self {
            state,
            runtime,
            spawner,
            config,
        }
    }

    /// Run one pass over every team
    pub async fn run(&self, dry_run: bool) -> eyre::Result<AssignmentReport> {
        debug!(dry_run, "AssignmentEngine::run: called");
        let mut report = AssignmentReport {
            dry_run,
            ..Default::default()
        };

        for team in self.state.list_teams().await? {
            if let Err(e) = self.assign_team(&team, dry_run, &mut report).await {
                warn!(team = %team.id, error = %e, "Assignment pass failed for team");
                report.errors.push(format!("{}: {:#}", team.id, e));
            }
        }

        if !report.assignments.is_empty() || !report.cycles.is_empty() {
            info!("Assignment pass: {}", report);
        }
        Ok(report)
    }

    async fn assign_team(&self, team: &Team, dry_run: bool, report: &mut AssignmentReport) -> eyre::Result<()> {
        let planned: Vec<Story> = self
            .state
            .list_stories(Some(&team.id), Some(StoryStatus::Planned))
            .await?
            .into_iter()
            .filter(|s| !s.is_assigned())
            .collect();
        if planned.is_empty() {
            return Ok(());
        }
        debug!(team = %team.id, count = planned.len(), "assign_team: planned stories");

        let ids: Vec<String> = planned.iter().map(|s| s.id.clone()).collect();
        let deps: BTreeMap<String, Vec<String>> = self.state.dependencies_for(ids).await?;

        let ordered = match sort_stories(planned, &deps) {
            Ok(ordered) => ordered,
            Err(cycle) => {
                warn!(team = %team.id, error = %cycle, "Skipping team batch with dependency cycle");
                if !dry_run {
                    self.state
                        .audit(
                            AuditEntry::manager("assignment-cycle", cycle.to_string())
                                .metadata(serde_json::json!({ "team_id": team.id, "stories": cycle.stories })),
                        )
                        .await?;
                }
                report.cycles.push(TeamCycle {
                    team_id: team.id.clone(),
                    stories: cycle.stories,
                });
                return Ok(());
            }
        };

        let all_stories = self.state.list_stories(None, None).await?;
        let mut statuses: HashMap<String, StoryStatus> = all_stories.iter().map(|s| (s.id.clone(), s.status)).collect();
        let mut load: HashMap<String, usize> = HashMap::new();
        for story in all_stories.iter().filter(|s| s.status.is_active()) {
            if let Some(ref agent_id) = story.assigned_agent_id {
                *load.entry(agent_id.clone()).or_default() += 1;
            }
        }

        let mut agents: Vec<Agent> = self
            .state
            .list_agents(None, None, Some(&team.id))
            .await?
            .into_iter()
            .filter(|a| !a.is_terminated() && a.role.is_developer())
            .collect();
        let mut planned_spawns: HashMap<AgentRole, usize> = HashMap::new();

        for story in ordered {
            let story_deps = deps.get(&story.id).map(Vec::as_slice).unwrap_or_default();
            if let Err(reason) = dependencies_satisfied(story_deps, &statuses) {
                debug!(story = %story.id, %reason, "Story blocked");
                if reason.contains("does not exist") {
                    warn!(story = %story.id, %reason, "Story depends on a missing story");
                }
                report.blocked.push(SkippedStory {
                    story_id: story.id.clone(),
                    reason,
                });
                continue;
            }

            let tier = route_tier(story.complexity_score, &self.config.scaling);
            let candidate = self
                .find_candidate(team, tier, &mut agents, &load, &mut planned_spawns, dry_run)
                .await?;

            let Some(candidate) = candidate else {
                report.unassignable.push(SkippedStory {
                    story_id: story.id.clone(),
                    reason: format!("no {} or higher tier agent available", tier),
                });
                continue;
            };

            let (agent, spawned) = match candidate {
                Candidate::WouldSpawn(role) => {
                    statuses.insert(story.id.clone(), StoryStatus::InProgress);
                    report.assignments.push(Assignment {
                        story_id: story.id.clone(),
                        team_id: team.id.clone(),
                        tier: role,
                        agent_id: None,
                        session: None,
                        spawned: true,
                    });
                    continue;
                }
                Candidate::Existing(agent) => (agent, false),
                Candidate::Spawned(agent) => (agent, true),
            };

            if !dry_run && let Err(e) = self.commit(&story.id, &agent.id).await {
                warn!(story = %story.id, agent = %agent.id, error = %e, "Assignment not committed");
                report.unassignable.push(SkippedStory {
                    story_id: story.id.clone(),
                    reason: format!("{:#}", e),
                });
                continue;
            }

            // Reserve the agent for the rest of this pass
            if let Some(local) = agents.iter_mut().find(|a| a.id == agent.id) {
                local.assign(&story.id);
            }
            *load.entry(agent.id.clone()).or_default() += 1;
            statuses.insert(story.id.clone(), StoryStatus::InProgress);

            if !dry_run {
                self.notify(&agent, &story).await;
            }
            report.assignments.push(Assignment {
                story_id: story.id.clone(),
                team_id: team.id.clone(),
                tier: agent.role,
                agent_id: Some(agent.id.clone()),
                session: agent.tmux_session.clone(),
                spawned,
            });
        }
        Ok(())
    }

    /// Idle agent at `tier` or above, spawning one when allowed
    async fn find_candidate(
        &self,
        team: &Team,
        tier: AgentRole,
        agents: &mut Vec<Agent>,
        load: &HashMap<String, usize>,
        planned_spawns: &mut HashMap<AgentRole, usize>,
        dry_run: bool,
    ) -> eyre::Result<Option<Candidate>> {
        let mut next = Some(tier);
        while let Some(role) = next {
            if let Some(agent) = select_agent(agents, role, load) {
                return Ok(Some(Candidate::Existing(agent.clone())));
            }

            if dry_run {
                let pending = planned_spawns.get(&role).copied().unwrap_or(0);
                let live = self.spawner.count_live(&team.id, role).await?;
                let fits = self.config.scaling.max_for(role).is_none_or(|max| live + pending < max);
                if fits {
                    *planned_spawns.entry(role).or_default() += 1;
                    return Ok(Some(Candidate::WouldSpawn(role)));
                }
            } else {
                match self.spawner.spawn(team, role).await {
                    Ok(agent) => {
                        agents.push(agent.clone());
                        return Ok(Some(Candidate::Spawned(agent)));
                    }
                    Err(e) => warn!(team = %team.id, %role, error = %e, "Spawn failed, trying next tier"),
                }
            }
            next = role.fallback();
        }
        Ok(None)
    }

    async fn commit(&self, story_id: &str, agent_id: &str) -> eyre::Result<()> {
        let (log_story, log_agent) = (story_id.to_string(), agent_id.to_string());
        let story_id = story_id.to_string();
        let agent_id = agent_id.to_string();
        self.state
            .transaction(move |tx| {
                let mut story: Story = tx.get(&story_id)?.ok_or_else(|| eyre!("story {} not found", story_id))?;
                if story.status != StoryStatus::Planned || story.is_assigned() {
                    bail!("story {} changed to {} before assignment", story_id, story.status);
                }
                let mut agent: Agent = tx.get(&agent_id)?.ok_or_else(|| eyre!("agent {} not found", agent_id))?;
                if !agent.is_idle() {
                    bail!("agent {} is {}", agent_id, agent.status);
                }

                story.transition(StoryStatus::InProgress)?;
                story.assigned_agent_id = Some(agent_id.clone());
                agent.assign(&story_id);
                let role = agent.role;
                tx.update(story)?;
                tx.update(agent)?;
                tx.create(
                    AuditEntry::manager("story-assigned", format!("assigned {} to {} {}", story_id, role, agent_id))
                        .story(&story_id)
                        .agent(&agent_id),
                )?;
                Ok(())
            })
            .await?;
        info!(story = %log_story, agent = %log_agent, "Story assigned");
        Ok(())
    }

    async fn notify(&self, agent: &Agent, story: &Story) {
        let Some(ref session) = agent.tmux_session else {
            return;
        };
        if let Err(e) = self.runtime.send_text(session, &assignment_message(story)).await {
            warn!(%session, story = %story.id, error = %e, "Failed to notify agent of assignment");
        }
    }
}

/// Single-line text typed into the agent's session
pub fn assignment_message(story: &Story) -> String {
    let mut text = format!("[hive] You are assigned story {}: {}.", story.id, story.title);
    let description = story.description.split_whitespace().collect::<Vec<_>>().join(" ");
    if !description.is_empty() {
        text.push(' ');
        text.push_str(&description);
    }
    text.push_str(" Work on a branch, then submit a PR to the merge queue when done.");
    text
}
