//! Human escalations raised by the manager
//!
//! At most one open escalation exists per session. An escalation goes stale
//! when its session is gone or its story has left the status it was raised in;
//! stale escalations are resolved automatically.

use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::domain::{Agent, AuditEntry, Escalation, Story};
use crate::state::StateManager;

pub struct EscalationDesk {
    state: StateManager,
}

impl EscalationDesk {
    pub fn new(state: StateManager) -> Self {
        Self { state }
    }

    /// Sessions with an open escalation
    pub async fn open_sessions(&self) -> eyre::Result<HashSet<String>> {
        Ok(self
            .state
            .list_open_escalations()
            .await?
            .into_iter()
            .filter_map(|e| e.session)
            .collect())
    }

    /// Raise a human escalation for a session unless one is already open
    ///
    /// Returns the new escalation, or None when deduplicated.
    pub async fn raise(
        &self,
        agent: &Agent,
        session: &str,
        story: Option<&Story>,
        reason: &str,
    ) -> eyre::Result<Option<Escalation>> {
        debug!(%session, %reason, "EscalationDesk::raise: called");
        if self
            .state
            .list_open_escalations()
            .await?
            .iter()
            .any(|e| e.session.as_deref() == Some(session))
        {
            debug!(%session, "EscalationDesk::raise: already open");
            return Ok(None);
        }

        let mut escalation = Escalation::new(reason);
        escalation.from_agent_id = Some(agent.id.clone());
        escalation.session = Some(session.to_string());
        if let Some(story) = story {
            escalation.story_id = Some(story.id.clone());
            escalation.trigger_status = Some(story.status);
        }

        let mut entry = AuditEntry::manager("escalation-created", format!("{}: {}", session, reason)).agent(&agent.id);
        if let Some(story) = story {
            entry = entry.story(&story.id);
        }
        let created = escalation.clone();
        self.state
            .transaction(move |tx| {
                tx.create(escalation)?;
                tx.create(entry)?;
                Ok(())
            })
            .await?;

        warn!(%session, agent = %agent.id, %reason, "Escalated to human");
        Ok(Some(created))
    }

    /// Resolve escalations whose condition no longer holds
    ///
    /// `live` is None when the session list could not be read; only the story
    /// check runs then.
    pub async fn cleanup_stale(&self, live: Option<&HashSet<String>>) -> eyre::Result<Vec<String>> {
        debug!("EscalationDesk::cleanup_stale: called");
        let mut resolved = Vec::new();

        for mut escalation in self.state.list_open_escalations().await? {
            let resolution = match self.stale_reason(&escalation, live).await? {
                Some(reason) => reason,
                None => continue,
            };
            escalation.resolve(&resolution);
            let id = escalation.id.clone();
            let mut entry = AuditEntry::manager("escalation-auto-resolved", format!("{}: {}", id, resolution));
            if let Some(ref story) = escalation.story_id {
                entry = entry.story(story);
            }
            self.state
                .transaction(move |tx| {
                    tx.update(escalation)?;
                    tx.create(entry)?;
                    Ok(())
                })
                .await?;
            info!(escalation = %id, %resolution, "Resolved stale escalation");
            resolved.push(id);
        }
        Ok(resolved)
    }

    async fn stale_reason(&self, escalation: &Escalation, live: Option<&HashSet<String>>) -> eyre::Result<Option<String>> {
        if let (Some(session), Some(live)) = (escalation.session.as_ref(), live)
            && !live.contains(session)
        {
            return Ok(Some(format!("session {} ended", session)));
        }

        let Some(ref story_id) = escalation.story_id else {
            return Ok(None);
        };
        match self.state.get::<Story>(story_id).await? {
            None => Ok(Some(format!("story {} no longer exists", story_id))),
            Some(story) => match escalation.trigger_status {
                Some(trigger) if trigger != story.status => {
                    Ok(Some(format!("story {} moved from {} to {}", story_id, trigger, story.status)))
                }
                _ => Ok(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentRole, EscalationStatus, StoryStatus};

    async fn setup() -> (StateManager, EscalationDesk, Agent, Story) {
        let state = StateManager::in_memory().unwrap();
        let agent = Agent::with_id("a1", AgentRole::Junior, Some("t1"));
        state.create(agent.clone()).await.unwrap();
        let mut story = Story::with_id("s1", "t1", "x");
        story.status = StoryStatus::InProgress;
        state.create(story.clone()).await.unwrap();
        (state.clone(), EscalationDesk::new(state), agent, story)
    }

    #[tokio::test]
    async fn test_raise_deduplicates_per_session() {
        let (state, desk, agent, story) = setup().await;

        let first = desk.raise(&agent, "hive-junior-1", Some(&story), "asking a question").await.unwrap();
        assert!(first.is_some());
        let second = desk.raise(&agent, "hive-junior-1", Some(&story), "still asking").await.unwrap();
        assert!(second.is_none());

        let open = state.list_open_escalations().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].trigger_status, Some(StoryStatus::InProgress));
        assert!(open[0].is_for_human());
    }

    #[tokio::test]
    async fn test_dead_session_resolves() {
        let (state, desk, agent, story) = setup().await;
        desk.raise(&agent, "hive-junior-1", Some(&story), "stuck").await.unwrap();

        let live = HashSet::new();
        let resolved = desk.cleanup_stale(Some(&live)).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(state.list_open_escalations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_story_status_change_resolves() {
        let (state, desk, agent, mut story) = setup().await;
        desk.raise(&agent, "hive-junior-1", Some(&story), "stuck").await.unwrap();
        let live: HashSet<String> = ["hive-junior-1".to_string()].into_iter().collect();

        assert!(desk.cleanup_stale(Some(&live)).await.unwrap().is_empty());

        story.transition(StoryStatus::Review).unwrap();
        state.update(story).await.unwrap();
        assert_eq!(desk.cleanup_stale(Some(&live)).await.unwrap().len(), 1);

        let all: Vec<Escalation> = state.list(Vec::new()).await.unwrap();
        assert_eq!(all[0].status, EscalationStatus::Resolved);
        assert!(all[0].resolution.as_ref().unwrap().contains("review"));
    }

    #[tokio::test]
    async fn test_unknown_liveness_keeps_session_escalations() {
        let (_state, desk, agent, _story) = setup().await;
        desk.raise(&agent, "hive-junior-1", None, "permission").await.unwrap();

        assert!(desk.cleanup_stale(None).await.unwrap().is_empty());
        assert!(desk.open_sessions().await.unwrap().contains("hive-junior-1"));
    }
}
