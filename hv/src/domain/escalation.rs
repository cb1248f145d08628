//! Escalation domain type

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::StoryStatus;
use super::id::generate_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    #[default]
    Pending,
    Acknowledged,
    Resolved,
}

impl std::fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Acknowledged => write!(f, "acknowledged"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// A request for help, addressed to an agent or (when `to_agent_id` is None) a human
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,

    #[serde(default)]
    pub story_id: Option<String>,

    #[serde(default)]
    pub from_agent_id: Option<String>,

    #[serde(default)]
    pub to_agent_id: Option<String>,

    /// Session the condition was observed in
    #[serde(default)]
    pub session: Option<String>,

    pub reason: String,
    pub status: EscalationStatus,

    /// Story status at the time the escalation was raised
    #[serde(default)]
    pub trigger_status: Option<StoryStatus>,

    #[serde(default)]
    pub resolution: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Escalation {
    pub fn new(reason: &str) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("esc", ""),
            story_id: None,
            from_agent_id: None,
            to_agent_id: None,
            session: None,
            reason: reason.to_string(),
            status: EscalationStatus::Pending,
            trigger_status: None,
            resolution: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status != EscalationStatus::Resolved
    }

    pub fn is_for_human(&self) -> bool {
        self.to_agent_id.is_none()
    }

    pub fn acknowledge(&mut self) {
        if self.status == EscalationStatus::Pending {
            self.status = EscalationStatus::Acknowledged;
            self.updated_at = now_ms();
        }
    }

    pub fn resolve(&mut self, resolution: &str) {
        self.status = EscalationStatus::Resolved;
        self.resolution = Some(resolution.to_string());
        self.updated_at = now_ms();
    }
}

impl Record for Escalation {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "escalations"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        if let Some(ref story) = self.story_id {
            fields.insert("story_id".to_string(), IndexValue::String(story.clone()));
        }
        if let Some(ref session) = self.session {
            fields.insert("session".to_string(), IndexValue::String(session.clone()));
        }
        fields
    }
}
