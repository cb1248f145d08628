//! Inter-agent mailbox messages

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::id::generate_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Pending,
    Read,
    Replied,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Read => write!(f, "read"),
            Self::Replied => write!(f, "replied"),
        }
    }
}

/// A message between two sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from_session: String,
    pub to_session: String,

    #[serde(default)]
    pub subject: Option<String>,

    pub body: String,
    pub status: MessageStatus,

    #[serde(default)]
    pub reply: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Message {
    pub fn new(from_session: &str, to_session: &str, body: &str) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("msg", ""),
            from_session: from_session.to_string(),
            to_session: to_session.to_string(),
            subject: None,
            body: body.to_string(),
            status: MessageStatus::Pending,
            reply: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_read(&mut self) {
        self.status = MessageStatus::Read;
        self.updated_at = now_ms();
    }

    /// Text delivered into the recipient's terminal
    pub fn render(&self) -> String {
        match self.subject {
            Some(ref subject) => format!("[message from {}] {}: {}", self.from_session, subject, self.body),
            None => format!("[message from {}] {}", self.from_session, self.body),
        }
    }
}

impl Record for Message {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "messages"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("to_session".to_string(), IndexValue::String(self.to_session.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields
    }
}
