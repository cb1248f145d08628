//! Append-only audit log

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::id::generate_id;

/// Actor name used for every side effect of the control plane
pub const MANAGER_ACTOR: &str = "manager";

/// One attributed side effect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub actor: String,

    /// Kebab-case event name, e.g. `story-assigned`
    pub event: String,

    #[serde(default)]
    pub agent_id: Option<String>,

    #[serde(default)]
    pub story_id: Option<String>,

    pub message: String,

    #[serde(default)]
    pub metadata: Value,

    pub created_at: i64,
}

impl AuditEntry {
    /// Entry attributed to the manager pseudo-actor
    pub fn manager(event: &str, message: impl Into<String>) -> Self {
        Self {
            id: generate_id("audit", event),
            actor: MANAGER_ACTOR.to_string(),
            event: event.to_string(),
            agent_id: None,
            story_id: None,
            message: message.into(),
            metadata: Value::Null,
            created_at: now_ms(),
        }
    }

    pub fn agent(mut self, agent_id: &str) -> Self {
        self.agent_id = Some(agent_id.to_string());
        self
    }

    pub fn story(mut self, story_id: &str) -> Self {
        self.story_id = Some(story_id.to_string());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

impl Record for AuditEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.created_at
    }

    fn collection_name() -> &'static str {
        "audit_log"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("actor".to_string(), IndexValue::String(self.actor.clone()));
        fields.insert("event".to_string(), IndexValue::String(self.event.clone()));
        if let Some(ref story) = self.story_id {
            fields.insert("story_id".to_string(), IndexValue::String(story.clone()));
        }
        fields
    }
}
