//! Agent domain type
//!
//! An agent is one long-lived terminal session driving a coding assistant.

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::id::generate_id;

/// Agent role; the developer roles double as routing tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    TechLead,
    Senior,
    Intermediate,
    Junior,
    Qa,
}

impl AgentRole {
    /// Next tier up when a spawn at this tier fails
    pub fn fallback(self) -> Option<AgentRole> {
        match self {
            Self::Junior => Some(Self::Intermediate),
            Self::Intermediate => Some(Self::Senior),
            Self::Senior | Self::TechLead | Self::Qa => None,
        }
    }

    /// Roles that implement stories
    pub fn is_developer(self) -> bool {
        matches!(self, Self::Senior | Self::Intermediate | Self::Junior)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TechLead => "tech_lead",
            Self::Senior => "senior",
            Self::Intermediate => "intermediate",
            Self::Junior => "junior",
            Self::Qa => "qa",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Agent status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Working,
    Blocked,
    Terminated,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Working => write!(f, "working"),
            Self::Blocked => write!(f, "blocked"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Coding assistant CLI driven by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CliTool {
    #[default]
    Claude,
    Codex,
    Gemini,
}

impl std::fmt::Display for CliTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claude => write!(f, "claude"),
            Self::Codex => write!(f, "codex"),
            Self::Gemini => write!(f, "gemini"),
        }
    }
}

/// A coding agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,

    pub role: AgentRole,

    /// Team the agent works for (None for fleet-wide agents)
    #[serde(default)]
    pub team_id: Option<String>,

    pub status: AgentStatus,

    #[serde(default)]
    pub current_story_id: Option<String>,

    /// Terminal session handle
    #[serde(default)]
    pub tmux_session: Option<String>,

    #[serde(default)]
    pub cli_tool: CliTool,

    /// Opaque checkpoint blob owned by the agent
    #[serde(default)]
    pub memory: Value,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Agent {
    pub fn new(role: AgentRole, team_id: Option<&str>, cli_tool: CliTool) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("agent", role.as_str()),
            role,
            team_id: team_id.map(str::to_string),
            status: AgentStatus::Idle,
            current_story_id: None,
            tmux_session: None,
            cli_tool,
            memory: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(id: &str, role: AgentRole, team_id: Option<&str>) -> Self {
        let mut agent = Self::new(role, team_id, CliTool::default());
        agent.id = id.to_string();
        agent
    }

    /// Bind the agent to a story
    pub fn assign(&mut self, story_id: &str) {
        self.status = AgentStatus::Working;
        self.current_story_id = Some(story_id.to_string());
        self.updated_at = now_ms();
    }

    /// Drop the current story and go idle
    pub fn release(&mut self) {
        self.status = AgentStatus::Idle;
        self.current_story_id = None;
        self.updated_at = now_ms();
    }

    pub fn terminate(&mut self) {
        self.status = AgentStatus::Terminated;
        self.current_story_id = None;
        self.updated_at = now_ms();
    }

    pub fn is_terminated(&self) -> bool {
        self.status == AgentStatus::Terminated
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }

    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

impl Record for Agent {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "agents"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("role".to_string(), IndexValue::String(self.role.to_string()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        if let Some(ref team) = self.team_id {
            fields.insert("team_id".to_string(), IndexValue::String(team.clone()));
        }
        if let Some(ref session) = self.tmux_session {
            fields.insert("tmux_session".to_string(), IndexValue::String(session.clone()));
        }
        fields
    }
}
