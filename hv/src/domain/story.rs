//! Story domain type and its status machine

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::TransitionError;
use super::id::generate_id;

/// Story lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    /// Written but not yet sized
    #[default]
    Draft,
    /// Sized by the tech lead
    Estimated,
    /// Ready to be assigned
    Planned,
    /// Being implemented by an agent
    InProgress,
    /// PR submitted, waiting for a QA reviewer
    Review,
    /// QA reviewer is validating the PR
    Qa,
    /// QA rejected the work
    QaFailed,
    /// QA approved, PR waiting to merge
    PrSubmitted,
    /// Merged (terminal)
    Merged,
}

/// Allowed workflow transitions
const TRANSITIONS: &[(StoryStatus, StoryStatus)] = &[
    (StoryStatus::Draft, StoryStatus::Estimated),
    (StoryStatus::Estimated, StoryStatus::Planned),
    (StoryStatus::Planned, StoryStatus::InProgress),
    (StoryStatus::InProgress, StoryStatus::Review),
    (StoryStatus::InProgress, StoryStatus::QaFailed),
    (StoryStatus::Review, StoryStatus::InProgress),
    (StoryStatus::Review, StoryStatus::Qa),
    (StoryStatus::Qa, StoryStatus::QaFailed),
    (StoryStatus::Qa, StoryStatus::PrSubmitted),
    (StoryStatus::QaFailed, StoryStatus::InProgress),
    (StoryStatus::PrSubmitted, StoryStatus::Merged),
];

impl StoryStatus {
    pub const ALL: [StoryStatus; 9] = [
        Self::Draft,
        Self::Estimated,
        Self::Planned,
        Self::InProgress,
        Self::Review,
        Self::Qa,
        Self::QaFailed,
        Self::PrSubmitted,
        Self::Merged,
    ];

    /// Whether the workflow table allows `self -> to`
    pub fn can_transition(self, to: StoryStatus) -> bool {
        TRANSITIONS.contains(&(self, to))
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Merged
    }

    /// Statuses that count toward an agent's workload
    pub fn is_active(self) -> bool {
        matches!(self, Self::InProgress | Self::Review | Self::Qa | Self::QaFailed)
    }

    /// Whether a story in this status unblocks its dependents
    ///
    /// Active work counts as satisfied so dependents are not serialized behind
    /// the merge.
    pub fn satisfies_dependency(self) -> bool {
        self == Self::Merged || self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Estimated => "estimated",
            Self::Planned => "planned",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Qa => "qa",
            Self::QaFailed => "qa_failed",
            Self::PrSubmitted => "pr_submitted",
            Self::Merged => "merged",
        }
    }
}

impl std::fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Atomic unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    /// Unique identifier
    pub id: String,

    /// Owning team
    pub team_id: String,

    pub title: String,

    #[serde(default)]
    pub description: String,

    /// Complexity estimate (1-13); None routes to a senior
    #[serde(default)]
    pub complexity_score: Option<u8>,

    /// Workload estimate used for scaling
    #[serde(default)]
    pub story_points: Option<u32>,

    pub status: StoryStatus,

    /// Agent currently responsible for the story
    #[serde(default)]
    pub assigned_agent_id: Option<String>,

    #[serde(default)]
    pub branch_name: Option<String>,

    #[serde(default)]
    pub pr_url: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Story {
    /// Create a new draft story
    pub fn new(team_id: &str, title: &str) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("story", title),
            team_id: team_id.to_string(),
            title: title.to_string(),
            description: String::new(),
            complexity_score: None,
            story_points: None,
            status: StoryStatus::Draft,
            assigned_agent_id: None,
            branch_name: None,
            pr_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a story with a fixed id
    pub fn with_id(id: &str, team_id: &str, title: &str) -> Self {
        let mut story = Self::new(team_id, title);
        story.id = id.to_string();
        story
    }

    /// Apply a workflow transition, rejecting anything outside the table
    pub fn transition(&mut self, to: StoryStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition(to) {
            return Err(TransitionError::new("story", &self.id, self.status, to));
        }
        self.status = to;
        self.updated_at = now_ms();
        Ok(())
    }

    /// Orphan recovery: return to the schedulable pool with no assignee
    pub fn recover_to_planned(&mut self) {
        self.status = StoryStatus::Planned;
        self.assigned_agent_id = None;
        self.updated_at = now_ms();
    }

    /// The hosting service reports the story's PR as merged
    pub fn sync_merged(&mut self) {
        self.status = StoryStatus::Merged;
        self.updated_at = now_ms();
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned_agent_id.is_some()
    }

    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

impl Record for Story {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "stories"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("team_id".to_string(), IndexValue::String(self.team_id.clone()));
        if let Some(ref agent) = self.assigned_agent_id {
            fields.insert("assigned_agent_id".to_string(), IndexValue::String(agent.clone()));
        }
        fields
    }
}

/// Directed edge: `story_id` depends on `depends_on_story_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryDependency {
    pub id: String,
    pub story_id: String,
    pub depends_on_story_id: String,
    pub created_at: i64,
}

impl StoryDependency {
    pub fn new(story_id: &str, depends_on_story_id: &str) -> Self {
        Self {
            id: format!("{}->{}", story_id, depends_on_story_id),
            story_id: story_id.to_string(),
            depends_on_story_id: depends_on_story_id.to_string(),
            created_at: now_ms(),
        }
    }
}

impl Record for StoryDependency {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.created_at
    }

    fn collection_name() -> &'static str {
        "story_dependencies"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("story_id".to_string(), IndexValue::String(self.story_id.clone()));
        fields.insert(
            "depends_on_story_id".to_string(),
            IndexValue::String(self.depends_on_story_id.clone()),
        );
        fields
    }
}
