//! Backfill of data inconsistencies
//!
//! Repairs records left half-updated by older writers or by agents editing the
//! store directly. Liveness problems (dead sessions) belong to the health
//! reconciler; this pass only looks at the records themselves.

use std::collections::HashMap;
use tracing::{debug, info};

use crate::domain::{Agent, AgentRole, AgentStatus, AuditEntry, PrStatus, PullRequest, Story, StoryStatus, Tx};

use super::StateManager;

/// What the backfill pass changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    /// PRs that gained a team link from their story
    pub pr_links: usize,
    /// Stories whose status or assignment was repaired
    pub stories_fixed: usize,
    /// Agents whose status or story pointer was repaired
    pub agents_fixed: usize,
}

impl BackfillReport {
    pub fn total(&self) -> usize {
        self.pr_links + self.stories_fixed + self.agents_fixed
    }
}

impl std::fmt::Display for BackfillReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pr links: {}, stories: {}, agents: {}",
            self.pr_links, self.stories_fixed, self.agents_fixed
        )
    }
}

/// Run the backfill pass in one transaction
pub async fn backfill(state: &StateManager) -> eyre::Result<BackfillReport> {
    debug!("backfill: called");
    let report = state.transaction(backfill_tx).await?;
    if report.total() > 0 {
        info!("Backfill repaired records: {}", report);
    }
    Ok(report)
}

fn backfill_tx(tx: &mut Tx<'_>) -> eyre::Result<BackfillReport> {
    let mut report = BackfillReport::default();
    let stories: HashMap<String, Story> = tx
        .list::<Story>(&[])?
        .into_iter()
        .map(|s| (s.id.clone(), s))
        .collect();

    for mut pr in tx.list::<PullRequest>(&[])? {
        let Some(story) = pr.story_id.as_ref().and_then(|id| stories.get(id)) else {
            continue;
        };
        if pr.team_id.is_none() {
            pr.team_id = Some(story.team_id.clone());
            pr.updated_at = crate::domain::now_ms();
            let story_id = story.id.clone();
            tx.update(pr)?;
            tx.create(AuditEntry::manager("backfill-pr-team", "linked PR to its story's team").story(&story_id))?;
            report.pr_links += 1;
        } else if pr.status == PrStatus::Merged && !story.status.is_terminal() {
            let mut story = story.clone();
            story.sync_merged();
            let story_id = story.id.clone();
            tx.update(story)?;
            tx.create(AuditEntry::manager("backfill-story-merged", "story synced to its merged PR").story(&story_id))?;
            report.stories_fixed += 1;
        }
    }

    // Re-read: the PR pass may have moved stories to merged
    let stories: HashMap<String, Story> = tx
        .list::<Story>(&[])?
        .into_iter()
        .map(|s| (s.id.clone(), s))
        .collect();

    for story in stories.values() {
        let schedulable = matches!(
            story.status,
            StoryStatus::Draft | StoryStatus::Estimated | StoryStatus::Planned
        );
        if schedulable && story.assigned_agent_id.is_some() {
            let mut story = story.clone();
            story.assigned_agent_id = None;
            story.touch();
            let story_id = story.id.clone();
            tx.update(story)?;
            tx.create(
                AuditEntry::manager("backfill-story-unassigned", "cleared assignment on unstarted story")
                    .story(&story_id),
            )?;
            report.stories_fixed += 1;
        }
    }

    for mut agent in tx.list::<Agent>(&[])? {
        if agent.is_terminated() {
            continue;
        }
        let story = agent.current_story_id.as_ref().and_then(|id| stories.get(id));
        let fix = match (agent.status, story) {
            (_, Some(story)) if story.status.is_terminal() => Some((false, "released agent from merged story")),
            (AgentStatus::Working, None) if agent.role != AgentRole::Qa => Some((false, "working agent had no story")),
            (AgentStatus::Idle, Some(story))
                if story.status.is_active() && story.assigned_agent_id.as_deref() == Some(agent.id.as_str()) =>
            {
                Some((true, "idle agent still owned an active story"))
            }
            _ => None,
        };
        let Some((working, message)) = fix else {
            continue;
        };

        if working {
            agent.status = AgentStatus::Working;
            agent.touch();
        } else {
            agent.release();
        }
        let agent_id = agent.id.clone();
        tx.update(agent)?;
        tx.create(AuditEntry::manager("backfill-agent", message).agent(&agent_id))?;
        report.agents_fixed += 1;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backfill_links_pr_team() {
        let state = StateManager::in_memory().unwrap();
        state.create(Story::with_id("s1", "team-1", "x")).await.unwrap();
        let mut pr = PullRequest::with_id("pr1", "b");
        pr.story_id = Some("s1".to_string());
        state.create(pr).await.unwrap();

        let report = backfill(&state).await.unwrap();
        assert_eq!(report.pr_links, 1);
        let pr: PullRequest = state.get_required("pr1").await.unwrap();
        assert_eq!(pr.team_id.as_deref(), Some("team-1"));
    }

    #[tokio::test]
    async fn test_backfill_releases_agent_on_merged_story() {
        let state = StateManager::in_memory().unwrap();
        let mut story = Story::with_id("s1", "t", "x");
        story.status = StoryStatus::Merged;
        story.assigned_agent_id = Some("a1".to_string());
        state.create(story).await.unwrap();
        let mut agent = Agent::with_id("a1", AgentRole::Junior, Some("t"));
        agent.assign("s1");
        state.create(agent).await.unwrap();

        let report = backfill(&state).await.unwrap();
        assert_eq!(report.agents_fixed, 1);
        let agent: Agent = state.get_required("a1").await.unwrap();
        assert!(agent.is_idle());
        assert!(agent.current_story_id.is_none());
    }

    #[tokio::test]
    async fn test_backfill_clears_assignment_on_planned_story() {
        let state = StateManager::in_memory().unwrap();
        let mut story = Story::with_id("s1", "t", "x");
        story.status = StoryStatus::Planned;
        story.assigned_agent_id = Some("ghost".to_string());
        state.create(story).await.unwrap();

        let report = backfill(&state).await.unwrap();
        assert_eq!(report.stories_fixed, 1);
        let story: Story = state.get_required("s1").await.unwrap();
        assert!(story.assigned_agent_id.is_none());
    }

    #[tokio::test]
    async fn test_backfill_marks_idle_owner_working() {
        let state = StateManager::in_memory().unwrap();
        let mut story = Story::with_id("s1", "t", "x");
        story.status = StoryStatus::InProgress;
        story.assigned_agent_id = Some("a1".to_string());
        state.create(story).await.unwrap();
        let mut agent = Agent::with_id("a1", AgentRole::Senior, Some("t"));
        agent.current_story_id = Some("s1".to_string());
        state.create(agent).await.unwrap();

        backfill(&state).await.unwrap();
        let agent: Agent = state.get_required("a1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Working);
    }

    #[tokio::test]
    async fn test_backfill_is_idempotent() {
        let state = StateManager::in_memory().unwrap();
        let mut agent = Agent::with_id("a1", AgentRole::Junior, Some("t"));
        agent.status = AgentStatus::Working;
        state.create(agent).await.unwrap();

        assert_eq!(backfill(&state).await.unwrap().agents_fixed, 1);
        assert_eq!(backfill(&state).await.unwrap(), BackfillReport::default());
    }
}
