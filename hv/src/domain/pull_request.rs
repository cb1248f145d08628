//! Pull request domain type and its status pipeline

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::TransitionError;
use super::id::generate_id;

/// Merge queue status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    #[default]
    Queued,
    Reviewing,
    Approved,
    Merged,
    Rejected,
    Closed,
}

const TRANSITIONS: &[(PrStatus, PrStatus)] = &[
    (PrStatus::Queued, PrStatus::Reviewing),
    (PrStatus::Reviewing, PrStatus::Approved),
    (PrStatus::Reviewing, PrStatus::Rejected),
    (PrStatus::Approved, PrStatus::Merged),
];

impl PrStatus {
    pub const ALL: [PrStatus; 6] = [
        Self::Queued,
        Self::Reviewing,
        Self::Approved,
        Self::Merged,
        Self::Rejected,
        Self::Closed,
    ];

    /// Pipeline table plus administrative close from any open status
    pub fn can_transition(self, to: PrStatus) -> bool {
        if to == Self::Closed {
            return self.is_open() || self == Self::Rejected;
        }
        TRANSITIONS.contains(&(self, to))
    }

    /// Still moving through the queue
    pub fn is_open(self) -> bool {
        matches!(self, Self::Queued | Self::Reviewing | Self::Approved)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Reviewing => "reviewing",
            Self::Approved => "approved",
            Self::Merged => "merged",
            Self::Rejected => "rejected",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for PrStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A pull request tracked by the merge queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: String,

    #[serde(default)]
    pub story_id: Option<String>,

    #[serde(default)]
    pub team_id: Option<String>,

    pub branch_name: String,

    #[serde(default)]
    pub github_pr_number: Option<u64>,

    #[serde(default)]
    pub github_pr_url: Option<String>,

    /// Developer agent that opened the PR
    #[serde(default)]
    pub submitted_by: Option<String>,

    pub status: PrStatus,

    /// QA agent assigned to review
    #[serde(default)]
    pub reviewed_by: Option<String>,

    #[serde(default)]
    pub review_notes: Option<String>,

    /// When the PR entered `reviewing` (unix ms)
    #[serde(default)]
    pub review_started_at: Option<i64>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl PullRequest {
    pub fn new(branch_name: &str) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("pr", branch_name),
            story_id: None,
            team_id: None,
            branch_name: branch_name.to_string(),
            github_pr_number: None,
            github_pr_url: None,
            submitted_by: None,
            status: PrStatus::Queued,
            reviewed_by: None,
            review_notes: None,
            review_started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(id: &str, branch_name: &str) -> Self {
        let mut pr = Self::new(branch_name);
        pr.id = id.to_string();
        pr
    }

    pub fn transition(&mut self, to: PrStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition(to) {
            return Err(TransitionError::new("pull request", &self.id, self.status, to));
        }
        if to == PrStatus::Reviewing {
            self.review_started_at = Some(now_ms());
        }
        self.status = to;
        self.updated_at = now_ms();
        Ok(())
    }

    /// Start review by the given QA agent
    pub fn start_review(&mut self, reviewer_id: &str) -> Result<(), TransitionError> {
        self.transition(PrStatus::Reviewing)?;
        self.reviewed_by = Some(reviewer_id.to_string());
        Ok(())
    }

    /// Close with a note, keeping earlier review notes
    pub fn close(&mut self, note: &str) -> Result<(), TransitionError> {
        self.transition(PrStatus::Closed)?;
        self.append_note(note);
        Ok(())
    }

    /// The hosting service reports this PR as merged
    pub fn sync_merged(&mut self) {
        self.status = PrStatus::Merged;
        self.updated_at = now_ms();
    }

    /// Put a PR whose reviewer disappeared back in the queue
    pub fn return_to_queue(&mut self) {
        self.status = PrStatus::Queued;
        self.reviewed_by = None;
        self.review_started_at = None;
        self.updated_at = now_ms();
    }

    pub fn append_note(&mut self, note: &str) {
        self.review_notes = Some(match self.review_notes.take() {
            Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, note),
            _ => note.to_string(),
        });
        self.updated_at = now_ms();
    }

    /// Age of the current review in milliseconds
    pub fn review_age_ms(&self, now: i64) -> Option<i64> {
        self.review_started_at.map(|started| now - started)
    }
}

impl Record for PullRequest {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "pull_requests"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        if let Some(ref story) = self.story_id {
            fields.insert("story_id".to_string(), IndexValue::String(story.clone()));
        }
        if let Some(ref team) = self.team_id {
            fields.insert("team_id".to_string(), IndexValue::String(team.clone()));
        }
        if let Some(ref reviewer) = self.reviewed_by {
            fields.insert("reviewed_by".to_string(), IndexValue::String(reviewer.clone()));
        }
        fields
    }
}
