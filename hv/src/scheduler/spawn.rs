//! Agent spawning and termination

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{Agent, AgentRole, AuditEntry, CliTool, Team, short_hex};
use crate::session::{SessionError, SessionRuntime};
use crate::state::{StateError, StateManager};

/// Why a spawn did not produce an agent
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Team {team} already has {max} {role} agents")]
    AtCapacity { team: String, role: AgentRole, max: usize },

    #[error("Session spawn failed: {0}")]
    Session(#[from] SessionError),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Starts agent sessions and registers them in the store
#[derive(Clone)]
pub struct AgentSpawner {
    state: StateManager,
    runtime: Arc<dyn SessionRuntime>,
    config: Arc<Config>,
}

impl AgentSpawner {
    pub fn new(state: StateManager, runtime: Arc<dyn SessionRuntime>, config: Arc<Config>) -> Self {
        Self { state, runtime, config }
    }

    /// Session name for a new agent: `{prefix}-{role}-{8 hex}`
    pub fn session_name(&self, role: AgentRole) -> String {
        format!(
            "{}-{}-{}",
            self.config.sessions.prefix,
            role.as_str().replace('_', "-"),
            short_hex()
        )
    }

    /// Live agents of a role in a team
    pub async fn count_live(&self, team_id: &str, role: AgentRole) -> Result<usize, StateError> {
        let agents = self.state.list_agents(Some(role), None, Some(team_id)).await?;
        Ok(agents.iter().filter(|a| !a.is_terminated()).count())
    }

    /// Whether the team may get another agent of this role
    pub async fn has_capacity(&self, team_id: &str, role: AgentRole, limit: Option<usize>) -> Result<bool, StateError> {
        match limit.or(self.config.scaling.max_for(role)) {
            Some(max) => Ok(self.count_live(team_id, role).await? < max),
            None => Ok(true),
        }
    }

    /// Spawn an agent of `role` for `team`, honouring the configured per-team cap
    pub async fn spawn(&self, team: &Team, role: AgentRole) -> Result<Agent, SpawnError> {
        self.spawn_with_limit(team, role, None).await
    }

    /// Spawn with an explicit cap instead of the scaling config
    pub async fn spawn_with_limit(&self, team: &Team, role: AgentRole, limit: Option<usize>) -> Result<Agent, SpawnError> {
        debug!(team = %team.id, %role, "AgentSpawner::spawn: called");
        if let Some(max) = limit.or(self.config.scaling.max_for(role))
            && self.count_live(&team.id, role).await? >= max
        {
            return Err(SpawnError::AtCapacity {
                team: team.id.clone(),
                role,
                max,
            });
        }

        let tool: CliTool = self.config.sessions.default_tool;
        let name = self.session_name(role);
        let command = self.config.sessions.command_for(tool);
        self.runtime.spawn(&name, Path::new(&team.repo_path), &command).await?;

        let mut agent = Agent::new(role, Some(&team.id), tool);
        agent.tmux_session = Some(name.clone());
        if let Err(e) = self.state.create(agent.clone()).await {
            warn!(session = %name, error = %e, "Agent record not created, killing session");
            if let Err(kill_err) = self.runtime.kill(&name).await {
                warn!(session = %name, error = %kill_err, "Failed to kill orphan session");
            }
            return Err(e.into());
        }

        self.state
            .audit(
                AuditEntry::manager("agent-spawned", format!("spawned {} in session {}", role, name))
                    .agent(&agent.id)
                    .metadata(serde_json::json!({ "team_id": team.id, "cli_tool": tool.to_string() })),
            )
            .await?;
        info!(agent = %agent.id, session = %name, %role, team = %team.id, "Agent spawned");
        Ok(agent)
    }

    /// Kill the agent's session and mark it terminated
    pub async fn terminate(&self, mut agent: Agent, reason: &str) -> eyre::Result<()> {
        debug!(agent = %agent.id, %reason, "AgentSpawner::terminate: called");
        if let Some(ref session) = agent.tmux_session
            && let Err(e) = self.runtime.kill(session).await
        {
            warn!(%session, error = %e, "Failed to kill session");
        }
        agent.terminate();
        let agent_id = agent.id.clone();
        self.state.update(agent).await?;
        self.state
            .audit(AuditEntry::manager("agent-terminated", reason).agent(&agent_id))
            .await?;
        info!(agent = %agent_id, %reason, "Agent terminated");
        Ok(())
    }
}
