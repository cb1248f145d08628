//! Senior pool scaling
//!
//! Sizes each team's senior pool to its outstanding story points. Scale-down
//! only happens when a team has no points left, and then keeps the oldest
//! senior.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{Agent, AgentRole, Team};
use crate::state::StateManager;

use super::spawn::AgentSpawner;

/// Seniors needed for `points` at `capacity` points each; never below one
pub fn recommended_seniors(points: u32, capacity: u32) -> usize {
    let capacity = capacity.max(1);
    (points.div_ceil(capacity) as usize).max(1)
}

/// What one scaling pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScalingReport {
    pub spawned: Vec<String>,
    pub terminated: Vec<String>,
    pub errors: Vec<String>,
}

pub struct ScalingController {
    state: StateManager,
    spawner: AgentSpawner,
    config: Arc<Config>,
}

impl ScalingController {
    pub fn new(state: StateManager, spawner: AgentSpawner, config: Arc<Config>) -> Self {
        Self { state, spawner, config }
    }

    pub async fn run(&self) -> eyre::Result<ScalingReport> {
        debug!("ScalingController::run: called");
        let mut report = ScalingReport::default();
        for team in self.state.list_teams().await? {
            if let Err(e) = self.scale_team(&team, &mut report).await {
                warn!(team = %team.id, error = %e, "Scaling failed for team");
                report.errors.push(format!("{}: {:#}", team.id, e));
            }
        }
        Ok(report)
    }

    async fn scale_team(&self, team: &Team, report: &mut ScalingReport) -> eyre::Result<()> {
        let points: u32 = self
            .state
            .list_stories(Some(&team.id), None)
            .await?
            .iter()
            .filter(|s| !s.status.is_terminal())
            .filter_map(|s| s.story_points)
            .sum();

        let agents: Vec<Agent> = self
            .state
            .list_agents(None, None, Some(&team.id))
            .await?
            .into_iter()
            .filter(|a| !a.is_terminated())
            .collect();
        let seniors = agents.iter().filter(|a| a.role == AgentRole::Senior).count();

        let scaling = &self.config.scaling;
        let recommended = recommended_seniors(points, scaling.senior_capacity).min(scaling.max_seniors);
        debug!(team = %team.id, points, seniors, recommended, "scale_team: computed");

        if recommended > seniors {
            info!(team = %team.id, points, seniors, recommended, "Scaling up seniors");
            for _ in seniors..recommended {
                let agent = self.spawner.spawn(team, AgentRole::Senior).await?;
                report.spawned.push(agent.id);
            }
        }

        if points == 0 {
            let keep = agents
                .iter()
                .filter(|a| a.role == AgentRole::Senior)
                .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
                .map(|a| a.id.clone());
            for agent in agents {
                if !agent.role.is_developer() || !agent.is_idle() || keep.as_deref() == Some(agent.id.as_str()) {
                    continue;
                }
                let id = agent.id.clone();
                self.spawner.terminate(agent, "scale-down: team has no outstanding points").await?;
                report.terminated.push(id);
            }
        }
        Ok(())
    }
}
