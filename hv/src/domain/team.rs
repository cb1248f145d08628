//! Team domain type

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::id::generate_id;

/// A unit of work bound to one repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,

    /// Local checkout the team's agents work in
    pub repo_path: String,

    /// Remote used for code-hosting queries (`owner/repo` or URL)
    #[serde(default)]
    pub repo_url: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Team {
    pub fn new(name: &str, repo_path: &str) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("team", name),
            name: name.to_string(),
            repo_path: repo_path.to_string(),
            repo_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(id: &str, name: &str, repo_path: &str) -> Self {
        let mut team = Self::new(name, repo_path);
        team.id = id.to_string();
        team
    }

    /// Repository argument for the hosting CLI
    pub fn hosting_repo(&self) -> &str {
        self.repo_url.as_deref().unwrap_or(&self.repo_path)
    }
}

impl Record for Team {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "teams"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("name".to_string(), IndexValue::String(self.name.clone()));
        fields
    }
}
