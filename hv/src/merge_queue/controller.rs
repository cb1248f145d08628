//! Merge queue controller
//!
//! Moves PRs through review and merge, keeps QA agents busy, and reconciles
//! local PR records with the hosting service. Hosting calls are made outside
//! store transactions; a failed call leaves the record as it was for the next
//! tick.

use eyre::eyre;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{
    Agent, AgentRole, AgentStatus, AuditEntry, PrStatus, PullRequest, Story, StoryStatus, Team, Tx, now_ms,
};
use crate::scheduler::AgentSpawner;
use crate::session::SessionRuntime;
use crate::state::StateManager;

use super::hosting::{CodeHost, RemotePrState};

/// Counters for one merge queue phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeQueueReport {
    pub qa_spawned: Vec<String>,
    pub dispatched: Vec<String>,
    pub merged: Vec<String>,
    pub rejected: Vec<String>,
    pub closed: Vec<String>,
    pub reviewers_released: Vec<String>,
    pub recovered_stories: Vec<String>,
    pub linked: Vec<String>,
    pub errors: Vec<String>,
}

impl MergeQueueReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fold another phase's report into this one
    pub fn absorb(&mut self, other: MergeQueueReport) {
        self.qa_spawned.extend(other.qa_spawned);
        self.dispatched.extend(other.dispatched);
        self.merged.extend(other.merged);
        self.rejected.extend(other.rejected);
        self.closed.extend(other.closed);
        self.reviewers_released.extend(other.reviewers_released);
        self.recovered_stories.extend(other.recovered_stories);
        self.linked.extend(other.linked);
        self.errors.extend(other.errors);
    }
}

impl std::fmt::Display for MergeQueueReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "qa spawned: {}, dispatched: {}, merged: {}, rejected: {}, closed: {}",
            self.qa_spawned.len(),
            self.dispatched.len(),
            self.merged.len(),
            self.rejected.len(),
            self.closed.len()
        )
    }
}

pub struct MergeQueueController {
    state: StateManager,
    runtime: Arc<dyn SessionRuntime>,
    host: Arc<dyn CodeHost>,
    spawner: AgentSpawner,
    config: Arc<Config>,
}

/// Mark a PR merged together with its story and developer, in one transaction
fn mark_merged_tx(tx: &mut Tx<'_>, pr_id: &str, how: &str) -> eyre::Result<bool> {
    let mut pr: PullRequest = tx.get(pr_id)?.ok_or_else(|| eyre!("pull request {} not found", pr_id))?;
    if pr.status == PrStatus::Merged {
        return Ok(false);
    }
    if pr.status == PrStatus::Approved {
        pr.transition(PrStatus::Merged)?;
    } else {
        pr.sync_merged();
    }

    let story_id = pr.story_id.clone();
    let submitter = pr.submitted_by.clone();
    tx.update(pr)?;

    if let Some(ref story_id) = story_id
        && let Some(mut story) = tx.get::<Story>(story_id)?
    {
        let developer = story.assigned_agent_id.clone().or(submitter);
        if !story.status.is_terminal() {
            story.sync_merged();
            tx.update(story)?;
        }
        if let Some(agent_id) = developer
            && let Some(mut agent) = tx.get::<Agent>(&agent_id)?
            && agent.current_story_id.as_deref() == Some(story_id.as_str())
        {
            agent.release();
            tx.update(agent)?;
        }
    }

    let mut entry = AuditEntry::manager("pr-merged", format!("PR {} merged ({})", pr_id, how));
    if let Some(ref story_id) = story_id {
        entry = entry.story(story_id);
    }
    tx.create(entry)?;
    Ok(true)
}

impl MergeQueueController {
    pub fn new(
        state: StateManager,
        runtime: Arc<dyn SessionRuntime>,
        host: Arc<dyn CodeHost>,
        spawner: AgentSpawner,
        config: Arc<Config>,
    ) -> Self {
        Self {
            state,
            runtime,
            host,
            spawner,
            config,
        }
    }

    async fn teams(&self) -> eyre::Result<HashMap<String, Team>> {
        Ok(self
            .state
            .list_teams()
            .await?
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect())
    }

    async fn notify(&self, session: &str, text: &str) {
        if let Err(e) = self.runtime.send_text(session, text).await {
            warn!(%session, error = %e, "Failed to notify session");
        }
    }

    async fn session_of(&self, agent_id: &str) -> eyre::Result<Option<String>> {
        Ok(self
            .state
            .get::<Agent>(agent_id)
            .await?
            .filter(|a| !a.is_terminated())
            .and_then(|a| a.tmux_session))
    }

    /// Merge queue check: close duplicates, then make sure every team with
    /// pending review work has a QA agent
    pub async fn check(&self) -> eyre::Result<MergeQueueReport> {
        debug!("MergeQueueController::check: called");
        let mut report = self.close_duplicates().await?;
        let spawned = self.ensure_qa_agents().await?;
        report.qa_spawned = spawned;
        Ok(report)
    }

    /// Spawn a QA agent for each team with queued or reviewing PRs and none live
    pub async fn ensure_qa_agents(&self) -> eyre::Result<Vec<String>> {
        debug!("ensure_qa_agents: called");
        let teams = self.teams().await?;
        let mut needing: Vec<String> = self
            .state
            .list_prs(None)
            .await?
            .into_iter()
            .filter(|pr| matches!(pr.status, PrStatus::Queued | PrStatus::Reviewing))
            .filter_map(|pr| pr.team_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        needing.sort();

        let mut spawned = Vec::new();
        for team_id in needing {
            let Some(team) = teams.get(&team_id) else {
                warn!(team = %team_id, "PR references unknown team");
                continue;
            };
            if self.spawner.count_live(&team_id, AgentRole::Qa).await? > 0 {
                continue;
            }
            match self
                .spawner
                .spawn_with_limit(team, AgentRole::Qa, Some(self.config.merge_queue.max_qa_per_team))
                .await
            {
                Ok(agent) => {
                    info!(team = %team_id, agent = %agent.id, "Spawned QA agent");
                    spawned.push(agent.id);
                }
                Err(e) => warn!(team = %team_id, error = %e, "Failed to spawn QA agent"),
            }
        }
        Ok(spawned)
    }

    /// Keep the newest open PR per story and close the rest as superseded
    pub async fn close_duplicates(&self) -> eyre::Result<MergeQueueReport> {
        debug!("close_duplicates: called");
        let mut report = MergeQueueReport::default();
        let mut by_story: BTreeMap<String, Vec<PullRequest>> = BTreeMap::new();
        for pr in self.state.list_prs(None).await? {
            if let Some(ref story_id) = pr.story_id
                && pr.status.is_open()
            {
                by_story.entry(story_id.clone()).or_default().push(pr);
            }
        }

        let teams = self.teams().await?;
        for (story_id, mut prs) in by_story {
            if prs.len() < 2 {
                continue;
            }
            prs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
            let keep = prs[0].id.clone();
            for mut pr in prs.into_iter().skip(1) {
                let note = format!("superseded by {}", keep);
                if let (Some(number), Some(team)) = (pr.github_pr_number, pr.team_id.as_ref().and_then(|t| teams.get(t)))
                    && let Err(e) = self.host.close_pr(team.hosting_repo(), number, &note).await
                {
                    warn!(pr = %pr.id, error = %e, "Failed to close duplicate PR remotely");
                }
                pr.close(&note)?;
                let pr_id = pr.id.clone();
                self.state.update(pr).await?;
                self.state
                    .audit(AuditEntry::manager("pr-superseded", format!("PR {} {}", pr_id, note)).story(&story_id))
                    .await?;
                info!(pr = %pr_id, %keep, "Closed duplicate PR");
                report.closed.push(pr_id);
            }
        }
        Ok(report)
    }

    /// Merge approved PRs through the hosting service
    pub async fn auto_merge(&self) -> eyre::Result<MergeQueueReport> {
        debug!("auto_merge: called");
        let mut report = MergeQueueReport::default();
        if !self.config.merge_queue.auto_merge {
            return Ok(report);
        }
        let teams = self.teams().await?;

        for pr in self.state.list_prs(Some(PrStatus::Approved)).await? {
            if let Some(number) = pr.github_pr_number {
                let Some(team) = pr.team_id.as_ref().and_then(|t| teams.get(t)) else {
                    warn!(pr = %pr.id, "Approved PR has no team, cannot merge");
                    report.errors.push(format!("{}: no team", pr.id));
                    continue;
                };
                if let Err(e) = self.host.merge_pr(team.hosting_repo(), number).await {
                    warn!(pr = %pr.id, number, error = %e, "Merge failed, will retry next tick");
                    report.errors.push(format!("{}: {}", pr.id, e));
                    continue;
                }
            }

            let pr_id = pr.id.clone();
            let how = if pr.github_pr_number.is_some() {
                "auto-merge"
            } else {
                "auto-merge, no remote PR"
            };
            let changed = self
                .state
                .transaction({
                    let pr_id = pr_id.clone();
                    move |tx| mark_merged_tx(tx, &pr_id, how)
                })
                .await?;
            if changed {
                info!(pr = %pr_id, "PR merged");
                report.merged.push(pr_id);
            }
        }
        Ok(report)
    }

    /// Reconcile local PRs with the hosting service
    pub async fn sync_with_host(&self) -> eyre::Result<MergeQueueReport> {
        debug!("sync_with_host: called");
        let mut report = MergeQueueReport::default();
        let teams = self.teams().await?;
        let prs = self.state.list_prs(None).await?;
        let min_age = self.config.merge_queue.min_validation_age_ms();

        let mut team_ids: Vec<&String> = teams.keys().collect();
        team_ids.sort();
        for team_id in team_ids {
            let team = &teams[team_id];
            let local: Vec<&PullRequest> = prs
                .iter()
                .filter(|pr| pr.team_id.as_deref() == Some(team_id.as_str()))
                .filter(|pr| !matches!(pr.status, PrStatus::Merged | PrStatus::Closed))
                .collect();
            if local.is_empty() {
                continue;
            }

            let repo = team.hosting_repo();
            let (merged, open) = match (self.host.list_merged_prs(repo).await, self.host.list_open_prs(repo).await) {
                (Ok(merged), Ok(open)) => (merged, open),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(team = %team_id, error = %e, "Hosting sync failed, will retry");
                    report.errors.push(format!("{}: {}", team_id, e));
                    continue;
                }
            };
            let merged_numbers: HashSet<u64> = merged.iter().map(|p| p.number).collect();
            let open_numbers: HashSet<u64> = open.iter().map(|p| p.number).collect();

            for pr in local {
                let mut number = pr.github_pr_number;

                // Link local records to the remote PR for their branch
                if number.is_none()
                    && let Some(remote) = merged
                        .iter()
                        .chain(open.iter())
                        .find(|r| !r.head_ref.is_empty() && r.head_ref == pr.branch_name)
                {
                    let mut linked = pr.clone();
                    linked.github_pr_number = Some(remote.number);
                    linked.github_pr_url = Some(remote.url.clone()).filter(|u| !u.is_empty());
                    linked.updated_at = now_ms();
                    self.state.update(linked).await?;
                    report.linked.push(pr.id.clone());
                    number = Some(remote.number);
                }
                let Some(number) = number else {
                    continue;
                };

                if merged_numbers.contains(&number) {
                    let pr_id = pr.id.clone();
                    let changed = self
                        .state
                        .transaction(move |tx| mark_merged_tx(tx, &pr_id, "merged on hosting service"))
                        .await?;
                    if changed {
                        info!(pr = %pr.id, number, "PR merged remotely");
                        report.merged.push(pr.id.clone());
                    }
                    continue;
                }

                let stale = pr.status == PrStatus::Reviewing
                    && pr.review_age_ms(now_ms()).is_some_and(|age| age > min_age)
                    && !open_numbers.contains(&number);
                if !stale {
                    continue;
                }
                match self.host.pr_state(repo, number).await {
                    Ok(RemotePrState::Merged) => {
                        let pr_id = pr.id.clone();
                        let changed = self
                            .state
                            .transaction(move |tx| mark_merged_tx(tx, &pr_id, "stale review, merged remotely"))
                            .await?;
                        if changed {
                            info!(pr = %pr.id, number, "Stale review merged remotely");
                            report.merged.push(pr.id.clone());
                        }
                    }
                    Ok(RemotePrState::Open) => {}
                    Ok(RemotePrState::Closed) => {
                        let mut rejected = pr.clone();
                        rejected.transition(PrStatus::Rejected)?;
                        rejected.append_note("closed on the hosting service without merging during review");
                        let pr_id = rejected.id.clone();
                        self.state.update(rejected).await?;
                        self.state
                            .audit(AuditEntry::manager(
                                "pr-rejected-remote",
                                format!("PR {} closed remotely while under review", pr_id),
                            ))
                            .await?;
                        report.rejected.push(pr_id);
                    }
                    Err(e) => {
                        warn!(pr = %pr.id, number, error = %e, "Could not read remote PR state");
                        report.errors.push(format!("{}: {}", pr.id, e));
                    }
                }
            }
        }
        Ok(report)
    }

    /// Release QA agents left working with nothing under review
    pub async fn release_reviewers(&self) -> eyre::Result<Vec<String>> {
        debug!("release_reviewers: called");
        let reviewing: HashSet<String> = self
            .state
            .list_prs(Some(PrStatus::Reviewing))
            .await?
            .into_iter()
            .filter_map(|pr| pr.reviewed_by)
            .collect();

        let mut released = Vec::new();
        for mut agent in self
            .state
            .list_agents(Some(AgentRole::Qa), Some(AgentStatus::Working), None)
            .await?
        {
            if reviewing.contains(&agent.id) {
                continue;
            }
            agent.release();
            let agent_id = agent.id.clone();
            self.state.update(agent).await?;
            self.state
                .audit(AuditEntry::manager("qa-released", "no PR under review").agent(&agent_id))
                .await?;
            released.push(agent_id);
        }
        Ok(released)
    }

    /// Give each idle QA agent exactly one queued PR, oldest first
    pub async fn dispatch_qa(&self) -> eyre::Result<MergeQueueReport> {
        debug!("dispatch_qa: called");
        let mut report = MergeQueueReport {
            reviewers_released: self.release_reviewers().await?,
            ..Default::default()
        };

        let mut queued = self.state.list_prs(Some(PrStatus::Queued)).await?;
        queued.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let mut qa_agents = self
            .state
            .list_agents(Some(AgentRole::Qa), Some(AgentStatus::Idle), None)
            .await?;
        qa_agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        for qa in qa_agents {
            let Some(position) = queued
                .iter()
                .position(|pr| qa.team_id.is_none() || pr.team_id == qa.team_id)
            else {
                continue;
            };
            let pr = queued.remove(position);
            let pr_id = pr.id.clone();
            let qa_id = qa.id.clone();

            let started = self
                .state
                .transaction({
                    let pr_id = pr_id.clone();
                    let qa_id = qa_id.clone();
                    move |tx| {
                        let mut pr: PullRequest =
                            tx.get(&pr_id)?.ok_or_else(|| eyre!("pull request {} not found", pr_id))?;
                        let mut qa: Agent = tx.get(&qa_id)?.ok_or_else(|| eyre!("agent {} not found", qa_id))?;
                        if pr.status != PrStatus::Queued || !qa.is_idle() {
                            return Ok(false);
                        }
                        pr.start_review(&qa_id)?;
                        if let Some(ref story_id) = pr.story_id
                            && let Some(mut story) = tx.get::<Story>(story_id)?
                            && story.status == StoryStatus::Review
                        {
                            story.transition(StoryStatus::Qa)?;
                            tx.update(story)?;
                        }
                        qa.status = AgentStatus::Working;
                        qa.touch();
                        let mut entry = AuditEntry::manager("pr-review-started", format!("PR {} to {}", pr_id, qa_id))
                            .agent(&qa_id);
                        if let Some(ref story_id) = pr.story_id {
                            entry = entry.story(story_id);
                        }
                        tx.update(pr)?;
                        tx.update(qa)?;
                        tx.create(entry)?;
                        Ok(true)
                    }
                })
                .await;

            match started {
                Ok(true) => {
                    info!(pr = %pr_id, qa = %qa_id, "PR dispatched to QA");
                    if let Some(ref session) = qa.tmux_session {
                        self.notify(session, &review_message(&pr)).await;
                    }
                    report.dispatched.push(pr_id);
                }
                Ok(false) => debug!(pr = %pr_id, "PR or QA agent changed, skipping dispatch"),
                Err(e) => {
                    warn!(pr = %pr_id, error = %e, "Dispatch failed");
                    report.errors.push(format!("{}: {}", pr_id, e));
                }
            }
        }
        Ok(report)
    }

    /// Send rejected work back to its developer and close the PR
    pub async fn notify_rejections(&self) -> eyre::Result<MergeQueueReport> {
        debug!("notify_rejections: called");
        let mut report = MergeQueueReport::default();

        for pr in self.state.list_prs(Some(PrStatus::Rejected)).await? {
            let pr_id = pr.id.clone();
            let notes = pr.review_notes.clone().unwrap_or_else(|| "no review notes".to_string());
            let developer = self
                .state
                .transaction({
                    let pr_id = pr_id.clone();
                    move |tx| {
                        let mut pr: PullRequest =
                            tx.get(&pr_id)?.ok_or_else(|| eyre!("pull request {} not found", pr_id))?;
                        let mut developer = pr.submitted_by.clone();
                        if let Some(ref story_id) = pr.story_id
                            && let Some(mut story) = tx.get::<Story>(story_id)?
                        {
                            developer = developer.or(story.assigned_agent_id.clone());
                            if story.status.can_transition(StoryStatus::QaFailed) {
                                story.transition(StoryStatus::QaFailed)?;
                                tx.update(story)?;
                            } else {
                                warn!(story = %story_id, status = %story.status, "Rejected PR's story cannot move to qa_failed");
                            }
                        }
                        pr.close("rejected by QA")?;
                        let mut entry =
                            AuditEntry::manager("pr-rejected", format!("PR {} rejected and closed", pr_id));
                        if let Some(ref story_id) = pr.story_id {
                            entry = entry.story(story_id);
                        }
                        tx.update(pr)?;
                        tx.create(entry)?;
                        Ok(developer)
                    }
                })
                .await?;

            if let Some(agent_id) = developer
                && let Some(session) = self.session_of(&agent_id).await?
            {
                let story = pr.story_id.as_deref().unwrap_or("unknown story");
                let text = format!(
                    "[hive] QA rejected your PR {} for story {}. Review notes: {}. Fix the issues and resubmit.",
                    pr_id,
                    story,
                    notes.split_whitespace().collect::<Vec<_>>().join(" ")
                );
                self.notify(&session, &text).await;
            }
            info!(pr = %pr_id, "Rejection delivered");
            report.rejected.push(pr_id);
        }
        Ok(report)
    }

    /// qa_failed stories nobody owns go back to planned
    pub async fn recover_qa_failed(&self) -> eyre::Result<Vec<String>> {
        debug!("recover_qa_failed: called");
        let mut recovered = Vec::new();
        for mut story in self.state.list_stories(None, Some(StoryStatus::QaFailed)).await? {
            if story.is_assigned() {
                continue;
            }
            story.recover_to_planned();
            let story_id = story.id.clone();
            self.state.update(story).await?;
            self.state
                .audit(AuditEntry::manager("story-qa-failed-recovered", "unowned qa_failed story returned to planned").story(&story_id))
                .await?;
            info!(story = %story_id, "Recovered orphaned qa_failed story");
            recovered.push(story_id);
        }
        Ok(recovered)
    }
}

/// Single-line review request typed into a QA session
pub fn review_message(pr: &PullRequest) -> String {
    let mut text = format!("[hive] Review PR {} (branch {})", pr.id, pr.branch_name);
    if let Some(number) = pr.github_pr_number {
        text.push_str(&format!(", hosting PR #{}", number));
    }
    if let Some(ref story) = pr.story_id {
        text.push_str(&format!(" for story {}", story));
    }
    text.push_str(". Approve or reject it in the merge queue with notes.");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge_queue::{HostError, MemoryHost, RemotePr};
    use crate::session::MemoryRuntime;

    /// A host whose merged listing is truncated, so only `pr_state` sees the merge.
    /// With `merged_elsewhere` set, another process records the merge locally first.
    struct UnlistedMergeHost {
        state: StateManager,
        merged_elsewhere: bool,
    }

    #[async_trait::async_trait]
    impl CodeHost for UnlistedMergeHost {
        async fn list_merged_prs(&self, _repo: &str) -> Result<Vec<RemotePr>, HostError> {
            Ok(Vec::new())
        }

        async fn list_open_prs(&self, _repo: &str) -> Result<Vec<RemotePr>, HostError> {
            Ok(Vec::new())
        }

        async fn pr_state(&self, _repo: &str, _number: u64) -> Result<RemotePrState, HostError> {
            if self.merged_elsewhere {
                self.state
                    .transaction(|tx| mark_merged_tx(tx, "pr1", "merged by another command"))
                    .await
                    .unwrap();
            }
            Ok(RemotePrState::Merged)
        }

        async fn merge_pr(&self, _repo: &str, _number: u64) -> Result<(), HostError> {
            Ok(())
        }

        async fn close_pr(&self, _repo: &str, _number: u64, _comment: &str) -> Result<(), HostError> {
            Ok(())
        }
    }

    async fn stale_review_with_unlisted_host(merged_elsewhere: bool) -> (StateManager, MergeQueueReport) {
        let f = fixture().await;
        story_with_dev(&f, "s1", StoryStatus::Qa).await;
        let mut reviewing = pr("pr1", "s1", PrStatus::Reviewing);
        reviewing.github_pr_number = Some(7);
        reviewing.reviewed_by = Some("qa".to_string());
        reviewing.review_started_at = Some(now_ms() - 3_600_000);
        f.state.create(reviewing).await.unwrap();

        let config = Arc::new(Config::default());
        let host = Arc::new(UnlistedMergeHost {
            state: f.state.clone(),
            merged_elsewhere,
        });
        let spawner = AgentSpawner::new(f.state.clone(), f.runtime.clone(), config.clone());
        let controller = MergeQueueController::new(f.state.clone(), f.runtime.clone(), host, spawner, config);
        let report = controller.sync_with_host().await.unwrap();
        (f.state, report)
    }

    struct Fixture {
        state: StateManager,
        runtime: Arc<MemoryRuntime>,
        host: Arc<MemoryHost>,
        controller: MergeQueueController,
    }

    async fn fixture() -> Fixture {
        let state = StateManager::in_memory().unwrap();
        let runtime = Arc::new(MemoryRuntime::new());
        let host = Arc::new(MemoryHost::new());
        let config = Arc::new(Config::default());
        let spawner = AgentSpawner::new(state.clone(), runtime.clone(), config.clone());
        let controller = MergeQueueController::new(state.clone(), runtime.clone(), host.clone(), spawner, config);
        let mut team = Team::with_id("t1", "core", "/repo");
        team.repo_url = Some("o/r".to_string());
        state.create(team).await.unwrap();
        Fixture {
            state,
            runtime,
            host,
            controller,
        }
    }

    async fn story_with_dev(f: &Fixture, story_id: &str, status: StoryStatus) {
        let mut dev = Agent::with_id("dev", AgentRole::Junior, Some("t1"));
        dev.tmux_session = Some("hive-junior-dev".to_string());
        f.runtime.add_session("hive-junior-dev");
        dev.assign(story_id);
        f.state.create(dev).await.unwrap();
        let mut story = Story::with_id(story_id, "t1", story_id);
        story.status = status;
        story.assigned_agent_id = Some("dev".to_string());
        f.state.create(story).await.unwrap();
    }

    fn pr(id: &str, story: &str, status: PrStatus) -> PullRequest {
        let mut pr = PullRequest::with_id(id, &format!("branch-{}", id));
        pr.story_id = Some(story.to_string());
        pr.team_id = Some("t1".to_string());
        pr.submitted_by = Some("dev".to_string());
        pr.status = status;
        pr
    }

    #[tokio::test]
    async fn test_qa_spawned_for_team_with_queue() {
        let f = fixture().await;
        f.state.create(pr("pr1", "s1", PrStatus::Queued)).await.unwrap();

        let spawned = f.controller.ensure_qa_agents().await.unwrap();
        assert_eq!(spawned.len(), 1);
        assert!(f.controller.ensure_qa_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_one_pr_per_idle_qa() {
        let f = fixture().await;
        story_with_dev(&f, "s1", StoryStatus::Review).await;
        let mut first = pr("pr1", "s1", PrStatus::Queued);
        first.created_at = 1;
        f.state.create(first).await.unwrap();
        let mut second = pr("pr2", "s2", PrStatus::Queued);
        second.created_at = 2;
        f.state.create(second).await.unwrap();
        let mut qa = Agent::with_id("qa", AgentRole::Qa, Some("t1"));
        qa.tmux_session = Some("hive-qa-1".to_string());
        f.runtime.add_session("hive-qa-1");
        f.state.create(qa).await.unwrap();

        let report = f.controller.dispatch_qa().await.unwrap();
        assert_eq!(report.dispatched, vec!["pr1".to_string()]);

        let pr1: PullRequest = f.state.get_required("pr1").await.unwrap();
        assert_eq!(pr1.status, PrStatus::Reviewing);
        assert_eq!(pr1.reviewed_by.as_deref(), Some("qa"));
        let pr2: PullRequest = f.state.get_required("pr2").await.unwrap();
        assert_eq!(pr2.status, PrStatus::Queued);
        let story: Story = f.state.get_required("s1").await.unwrap();
        assert_eq!(story.status, StoryStatus::Qa);
        let qa: Agent = f.state.get_required("qa").await.unwrap();
        assert_eq!(qa.status, AgentStatus::Working);
        assert!(f.runtime.sent_to("hive-qa-1")[0].contains("pr1"));

        // Busy reviewer keeps its PR; nothing else dispatched
        let report = f.controller.dispatch_qa().await.unwrap();
        assert!(report.dispatched.is_empty());
        assert!(report.reviewers_released.is_empty());
    }

    #[tokio::test]
    async fn test_reviewer_without_pr_released() {
        let f = fixture().await;
        let mut qa = Agent::with_id("qa", AgentRole::Qa, Some("t1"));
        qa.status = AgentStatus::Working;
        f.state.create(qa).await.unwrap();

        assert_eq!(f.controller.release_reviewers().await.unwrap(), vec!["qa".to_string()]);
        let qa: Agent = f.state.get_required("qa").await.unwrap();
        assert!(qa.is_idle());
    }

    #[tokio::test]
    async fn test_auto_merge_success() {
        let f = fixture().await;
        story_with_dev(&f, "s1", StoryStatus::PrSubmitted).await;
        let mut approved = pr("pr1", "s1", PrStatus::Approved);
        approved.github_pr_number = Some(41);
        f.state.create(approved).await.unwrap();
        f.host.insert("o/r", 41, "branch-pr1", RemotePrState::Open);

        let report = f.controller.auto_merge().await.unwrap();
        assert_eq!(report.merged, vec!["pr1".to_string()]);
        assert_eq!(f.host.state_of("o/r", 41), Some(RemotePrState::Merged));

        let pr: PullRequest = f.state.get_required("pr1").await.unwrap();
        assert_eq!(pr.status, PrStatus::Merged);
        let story: Story = f.state.get_required("s1").await.unwrap();
        assert_eq!(story.status, StoryStatus::Merged);
        let dev: Agent = f.state.get_required("dev").await.unwrap();
        assert!(dev.is_idle());
        assert!(dev.current_story_id.is_none());
    }

    #[tokio::test]
    async fn test_auto_merge_transient_failure_leaves_approved() {
        let f = fixture().await;
        let mut approved = pr("pr1", "s1", PrStatus::Approved);
        approved.github_pr_number = Some(41);
        f.state.create(approved).await.unwrap();
        f.host.set_fail_merge(true);

        let report = f.controller.auto_merge().await.unwrap();
        assert!(report.merged.is_empty());
        assert_eq!(report.errors.len(), 1);
        let pr: PullRequest = f.state.get_required("pr1").await.unwrap();
        assert_eq!(pr.status, PrStatus::Approved);
    }

    #[tokio::test]
    async fn test_rejection_notifies_once_and_closes() {
        let f = fixture().await;
        story_with_dev(&f, "s1", StoryStatus::Qa).await;
        let mut rejected = pr("pr1", "s1", PrStatus::Rejected);
        rejected.review_notes = Some("tests fail".to_string());
        f.state.create(rejected).await.unwrap();

        let report = f.controller.notify_rejections().await.unwrap();
        assert_eq!(report.rejected, vec!["pr1".to_string()]);
        let story: Story = f.state.get_required("s1").await.unwrap();
        assert_eq!(story.status, StoryStatus::QaFailed);
        let pr: PullRequest = f.state.get_required("pr1").await.unwrap();
        assert_eq!(pr.status, PrStatus::Closed);
        assert!(pr.review_notes.unwrap().contains("tests fail"));
        let sent = f.runtime.sent_to("hive-junior-dev");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("tests fail"));

        let report = f.controller.notify_rejections().await.unwrap();
        assert!(report.rejected.is_empty());
        assert_eq!(f.runtime.sent_to("hive-junior-dev").len(), 1);
    }

    #[tokio::test]
    async fn test_sync_stale_review_merged_remotely() {
        let f = fixture().await;
        story_with_dev(&f, "s1", StoryStatus::Qa).await;
        let mut reviewing = pr("pr1", "s1", PrStatus::Reviewing);
        reviewing.github_pr_number = Some(7);
        reviewing.reviewed_by = Some("qa".to_string());
        reviewing.review_started_at = Some(now_ms() - 3_600_000);
        f.state.create(reviewing).await.unwrap();
        f.host.insert("o/r", 7, "branch-pr1", RemotePrState::Merged);

        let report = f.controller.sync_with_host().await.unwrap();
        assert_eq!(report.merged, vec!["pr1".to_string()]);
        let pr: PullRequest = f.state.get_required("pr1").await.unwrap();
        assert_eq!(pr.status, PrStatus::Merged);
        let story: Story = f.state.get_required("s1").await.unwrap();
        assert_eq!(story.status, StoryStatus::Merged);
        let dev: Agent = f.state.get_required("dev").await.unwrap();
        assert!(dev.current_story_id.is_none());
    }

    #[tokio::test]
    async fn test_sync_stale_review_checked_individually() {
        let (state, report) = stale_review_with_unlisted_host(false).await;
        assert_eq!(report.merged, vec!["pr1".to_string()]);
        let story: Story = state.get_required("s1").await.unwrap();
        assert_eq!(story.status, StoryStatus::Merged);
    }

    #[tokio::test]
    async fn test_sync_stale_review_already_merged_not_reported() {
        let (state, report) = stale_review_with_unlisted_host(true).await;
        assert!(report.merged.is_empty(), "{:?}", report.merged);
        let pr: PullRequest = state.get_required("pr1").await.unwrap();
        assert_eq!(pr.status, PrStatus::Merged);
        let merges = state
            .recent_audit(100)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event == "pr-merged")
            .count();
        assert_eq!(merges, 1);
    }

    #[tokio::test]
    async fn test_sync_stale_review_closed_remotely_rejects() {
        let f = fixture().await;
        let mut reviewing = pr("pr1", "s1", PrStatus::Reviewing);
        reviewing.github_pr_number = Some(8);
        reviewing.review_started_at = Some(now_ms() - 3_600_000);
        f.state.create(reviewing).await.unwrap();
        f.host.insert("o/r", 8, "branch-pr1", RemotePrState::Closed);

        let report = f.controller.sync_with_host().await.unwrap();
        assert_eq!(report.rejected, vec!["pr1".to_string()]);
        let pr: PullRequest = f.state.get_required("pr1").await.unwrap();
        assert_eq!(pr.status, PrStatus::Rejected);
        assert!(pr.review_notes.unwrap().contains("without merging"));
    }

    #[tokio::test]
    async fn test_sync_young_review_untouched() {
        let f = fixture().await;
        let mut reviewing = pr("pr1", "s1", PrStatus::Reviewing);
        reviewing.github_pr_number = Some(9);
        reviewing.review_started_at = Some(now_ms());
        f.state.create(reviewing).await.unwrap();
        f.host.insert("o/r", 9, "branch-pr1", RemotePrState::Closed);

        let report = f.controller.sync_with_host().await.unwrap();
        assert!(report.rejected.is_empty());
    }

    #[tokio::test]
    async fn test_sync_links_branch_and_tolerates_outage() {
        let f = fixture().await;
        f.state.create(pr("pr1", "s1", PrStatus::Queued)).await.unwrap();
        f.host.insert("o/r", 3, "branch-pr1", RemotePrState::Open);

        let report = f.controller.sync_with_host().await.unwrap();
        assert_eq!(report.linked, vec!["pr1".to_string()]);
        let linked: PullRequest = f.state.get_required("pr1").await.unwrap();
        assert_eq!(linked.github_pr_number, Some(3));

        f.host.set_fail_all(true);
        let report = f.controller.sync_with_host().await.unwrap();
        assert_eq!(report.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicates_superseded() {
        let f = fixture().await;
        let mut old = pr("old", "s1", PrStatus::Queued);
        old.created_at = 1;
        old.github_pr_number = Some(1);
        f.state.create(old).await.unwrap();
        let mut new = pr("new", "s1", PrStatus::Queued);
        new.created_at = 2;
        f.state.create(new).await.unwrap();

        let report = f.controller.close_duplicates().await.unwrap();
        assert_eq!(report.closed, vec!["old".to_string()]);
        let old: PullRequest = f.state.get_required("old").await.unwrap();
        assert_eq!(old.status, PrStatus::Closed);
        assert!(old.review_notes.unwrap().contains("superseded"));
        assert_eq!(f.host.close_comments()[0].0, 1);
    }

    #[tokio::test]
    async fn test_recover_unowned_qa_failed() {
        let f = fixture().await;
        let mut orphan = Story::with_id("s1", "t1", "x");
        orphan.status = StoryStatus::QaFailed;
        f.state.create(orphan).await.unwrap();
        story_with_dev(&f, "s2", StoryStatus::QaFailed).await;

        let recovered = f.controller.recover_qa_failed().await.unwrap();
        assert_eq!(recovered, vec!["s1".to_string()]);
        let s1: Story = f.state.get_required("s1").await.unwrap();
        assert_eq!(s1.status, StoryStatus::Planned);
        let s2: Story = f.state.get_required("s2").await.unwrap();
        assert_eq!(s2.status, StoryStatus::QaFailed);
    }
}
