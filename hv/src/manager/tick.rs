//! One pass of the manager loop
//!
//! `Manager::tick` runs every phase in a fixed order. A failing phase is
//! logged and recorded in the summary; the remaining phases still run.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{Config, SafetyMode};
use crate::domain::{Agent, AgentRole, AgentStatus, AuditEntry, CliTool, Story, StoryStatus, now_ms};
use crate::health::{HealthReconciler, HealthReport};
use crate::merge_queue::{CodeHost, MergeQueueController, MergeQueueReport};
use crate::scheduler::{AgentSpawner, AssignmentEngine};
use crate::session::{AgentState, SessionRuntime, StateDetection, StateDetector, StuckClassifier, StuckVerdict};
use crate::state::{StateManager, backfill};

use super::escalation::EscalationDesk;
use super::nudge::{AUTO_PROGRESS_TEXT, NUDGE_TEXT, NudgeDecision, SessionTrackers, StoryNudges, deliver_nudge};

/// A phase that failed during a tick
#[derive(Debug, Clone, Serialize)]
pub struct PhaseError {
    pub phase: String,
    pub message: String,
}

/// Everything one tick did
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickSummary {
    pub tick: u64,
    /// Not the leader; nothing ran
    pub skipped: bool,
    pub backfilled: usize,
    pub health: HealthReport,
    pub assigned: Vec<String>,
    pub merge_queue: MergeQueueReport,
    pub synced: bool,
    pub escalations_resolved: Vec<String>,
    pub escalations_raised: Vec<String>,
    pub sessions: usize,
    pub trackers_pruned: usize,
    pub messages_delivered: usize,
    pub permissions_approved: Vec<String>,
    pub plans_approved: Vec<String>,
    pub restarts: Vec<String>,
    pub nudges: Vec<String>,
    pub story_nudges: Vec<String>,
    pub seniors_notified: Vec<String>,
    pub errors: Vec<PhaseError>,
    pub duration_ms: u64,
}

impl std::fmt::Display for TickSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.skipped {
            return write!(f, "tick {} skipped (not leader)", self.tick);
        }
        writeln!(f, "tick {} ({}ms)", self.tick, self.duration_ms)?;
        writeln!(f, "  backfilled:   {}", self.backfilled)?;
        writeln!(f, "  health:       {}", self.health)?;
        writeln!(f, "  assigned:     {}", self.assigned.len())?;
        writeln!(f, "  merge queue:  {}", self.merge_queue)?;
        writeln!(
            f,
            "  escalations:  {} raised, {} resolved",
            self.escalations_raised.len(),
            self.escalations_resolved.len()
        )?;
        writeln!(
            f,
            "  sessions:     {} seen, {} messages, {} approvals, {} restarts, {} nudges",
            self.sessions,
            self.messages_delivered,
            self.permissions_approved.len() + self.plans_approved.len(),
            self.restarts.len(),
            self.nudges.len() + self.story_nudges.len()
        )?;
        write!(f, "  errors:       {}", self.errors.len())?;
        for e in &self.errors {
            write!(f, "\n    {}: {}", e.phase, e.message)?;
        }
        Ok(())
    }
}

fn record<T>(summary: &mut TickSummary, phase: &str, result: eyre::Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            error!(%phase, error = %format!("{:#}", e), "Tick phase failed");
            summary.errors.push(PhaseError {
                phase: phase.to_string(),
                message: format!("{:#}", e),
            });
            None
        }
    }
}

/// Keys that accept the first option of an approval prompt
fn approval_keys(tool: CliTool) -> &'static str {
    match tool {
        CliTool::Claude => "1",
        CliTool::Codex | CliTool::Gemini => "y",
    }
}

/// The manager loop state carried across ticks
pub struct Manager {
    state: StateManager,
    runtime: Arc<dyn SessionRuntime>,
    config: Arc<Config>,
    detector: StateDetector,
    classifier: Arc<dyn StuckClassifier>,
    health: HealthReconciler,
    assigner: AssignmentEngine,
    merge_queue: MergeQueueController,
    escalations: EscalationDesk,
    trackers: SessionTrackers,
    story_nudges: StoryNudges,
    seniors_notified_at: HashMap<String, i64>,
    ticks: u64,
}

impl Manager {
    pub fn new(
        state: StateManager,
        runtime: Arc<dyn SessionRuntime>,
        host: Arc<dyn CodeHost>,
        classifier: Arc<dyn StuckClassifier>,
        config: Arc<Config>,
    ) -> eyre::Result<Self> {
        debug!(classifier = classifier.name(), "Manager::new: called");
        let spawner = AgentSpawner::new(state.clone(), runtime.clone(), config.clone());
        Ok(Self {
            detector: StateDetector::new()?,
            health: HealthReconciler::new(state.clone(), runtime.clone()),
            assigner: AssignmentEngine::new(state.clone(), runtime.clone(), spawner.clone(), config.clone()),
            merge_queue: MergeQueueController::new(state.clone(), runtime.clone(), host, spawner, config.clone()),
            escalations: EscalationDesk::new(state.clone()),
            trackers: SessionTrackers::new(),
            story_nudges: StoryNudges::new(),
            seniors_notified_at: HashMap::new(),
            ticks: 0,
            state,
            runtime,
            config,
            classifier,
        })
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn trackers(&self) -> &SessionTrackers {
        &self.trackers
    }

    /// Run every phase once
    pub async fn tick(&mut self) -> TickSummary {
        let started = Instant::now();
        self.ticks += 1;
        let mut summary = TickSummary {
            tick: self.ticks,
            ..Default::default()
        };
        if !self.config.manager.is_leader {
            debug!(tick = self.ticks, "tick: not leader, skipping");
            summary.skipped = true;
            return summary;
        }
        debug!(tick = self.ticks, "tick: called");

        // 1. backfill
        if let Some(report) = record(&mut summary, "backfill", backfill(&self.state).await) {
            summary.backfilled = report.total();
        }

        // 2. health, with re-assignment of recovered work
        if let Some(report) = record(&mut summary, "health", self.health.run().await) {
            let recovered = !report.recovered_stories.is_empty() || !report.released_stories.is_empty();
            summary.health = report;
            if recovered {
                self.reassign(&mut summary, "health-reassign").await;
            }
        }

        // 3. merge queue check
        if let Some(report) = record(&mut summary, "merge-queue-check", self.merge_queue.check().await) {
            summary.merge_queue.absorb(report);
        }

        // 4. auto-merge
        if let Some(report) = record(&mut summary, "auto-merge", self.merge_queue.auto_merge().await) {
            summary.merge_queue.absorb(report);
        }

        // 5. hosting sync
        let every = self.config.merge_queue.sync_every_ticks.max(1);
        if (self.ticks - 1) % every == 0 {
            summary.synced = true;
            if let Some(report) = record(&mut summary, "hosting-sync", self.merge_queue.sync_with_host().await) {
                summary.merge_queue.absorb(report);
            }
        }

        // 6. stale escalations
        let live = self.live_sessions().await;
        if let Some(resolved) = record(
            &mut summary,
            "escalation-cleanup",
            self.escalations.cleanup_stale(live.as_ref()).await,
        ) {
            summary.escalations_resolved = resolved;
        }

        // 7. discover sessions
        let live = self.live_sessions().await;
        match live {
            Some(ref sessions) => {
                summary.sessions = sessions.len();
                summary.trackers_pruned = self.trackers.prune(sessions);
            }
            None => summary.errors.push(PhaseError {
                phase: "discover".to_string(),
                message: "session runtime unavailable".to_string(),
            }),
        }

        // 8. per-session handling
        if let Some(sessions) = live {
            let open = record(&mut summary, "escalations", self.escalations.open_sessions().await).unwrap_or_default();
            let mut sessions: Vec<String> = sessions.into_iter().collect();
            sessions.sort();
            for session in sessions {
                let agent = match self.state.find_agent_by_session(&session).await {
                    Ok(Some(agent)) => agent,
                    Ok(None) => continue,
                    Err(e) => {
                        record::<()>(&mut summary, "session", Err(e.into()));
                        continue;
                    }
                };
                let result = self.process_session(&session, &agent, &open, &mut summary).await;
                if let Err(e) = result {
                    warn!(%session, error = %format!("{:#}", e), "Session handling failed");
                    summary.errors.push(PhaseError {
                        phase: "session".to_string(),
                        message: format!("{}: {:#}", session, e),
                    });
                }
            }
        }

        // 9. dispatch idle QA
        if let Some(report) = record(&mut summary, "qa-dispatch", self.merge_queue.dispatch_qa().await) {
            summary.merge_queue.absorb(report);
        }

        // 10. rejections
        if let Some(report) = record(&mut summary, "rejections", self.merge_queue.notify_rejections().await) {
            summary.merge_queue.absorb(report);
        }

        // 11. orphaned qa_failed stories
        if let Some(recovered) = record(&mut summary, "qa-failed-recovery", self.merge_queue.recover_qa_failed().await)
            && !recovered.is_empty()
        {
            summary.merge_queue.recovered_stories.extend(recovered);
            self.reassign(&mut summary, "qa-failed-reassign").await;
        }

        // 12. stuck stories
        let result = self.nudge_stuck_stories(&mut summary).await;
        record(&mut summary, "stuck-stories", result);

        // 13. seniors
        let result = self.notify_seniors(&mut summary).await;
        record(&mut summary, "senior-notify", result);

        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            tick = summary.tick,
            duration_ms = summary.duration_ms,
            errors = summary.errors.len(),
            "Tick finished"
        );
        summary
    }

    async fn live_sessions(&self) -> Option<HashSet<String>> {
        match self.runtime.list_live_sessions().await {
            Ok(sessions) => Some(sessions.into_iter().collect()),
            Err(e) => {
                warn!(error = %e, "Could not list live sessions");
                None
            }
        }
    }

    async fn reassign(&self, summary: &mut TickSummary, phase: &str) {
        if let Some(report) = record(summary, phase, self.assigner.run(false).await) {
            summary.assigned.extend(report.assigned_ids().into_iter().map(str::to_string));
        }
    }

    /// Deliver pending mailbox messages into a session
    async fn forward_messages(&self, session: &str) -> eyre::Result<usize> {
        let mut delivered = 0;
        for mut message in self.state.pending_messages(session).await? {
            self.runtime.send_text(session, &message.render()).await?;
            message.mark_read();
            let id = message.id.clone();
            let entry = AuditEntry::manager("message-delivered", format!("{} to {}", id, session));
            self.state
                .transaction(move |tx| {
                    tx.update(message)?;
                    tx.create(entry)?;
                    Ok(())
                })
                .await?;
            delivered += 1;
        }
        if delivered > 0 {
            info!(%session, delivered, "Forwarded messages");
        }
        Ok(delivered)
    }

    async fn escalate(
        &mut self,
        agent: &Agent,
        session: &str,
        story: Option<&Story>,
        reason: &str,
        summary: &mut TickSummary,
    ) -> eyre::Result<()> {
        if let Some(escalation) = self.escalations.raise(agent, session, story, reason).await? {
            summary.escalations_raised.push(escalation.id);
        }
        if let Some(tracker) = self.trackers.get_mut(session) {
            tracker.ladder.escalated = true;
        }
        Ok(())
    }

    async fn answer_prompt(&self, agent: &Agent, session: &str, event: &str, detail: &str) -> eyre::Result<()> {
        self.runtime.send_text(session, approval_keys(agent.cli_tool)).await?;
        let mut entry = AuditEntry::manager(event, format!("{}: {}", session, detail)).agent(&agent.id);
        if let Some(ref story) = agent.current_story_id {
            entry = entry.story(story);
        }
        self.state.audit(entry).await?;
        info!(%session, %event, "Answered prompt");
        Ok(())
    }

    /// Mailbox, capture, classify and react for one session
    async fn process_session(
        &mut self,
        session: &str,
        agent: &Agent,
        open_escalations: &HashSet<String>,
        summary: &mut TickSummary,
    ) -> eyre::Result<()> {
        debug!(%session, agent = %agent.id, "process_session: called");
        summary.messages_delivered += self.forward_messages(session).await?;

        let output = self
            .runtime
            .capture_output(session, self.config.manager.capture_lines)
            .await?;
        let detection = self.detector.detect(&output, agent.cli_tool);
        let story = match agent.current_story_id {
            Some(ref id) => self.state.get::<Story>(id).await?,
            None => None,
        };

        let now = now_ms();
        let manager_config = &self.config.manager;
        let tracker = self
            .trackers
            .observe(session, &output, agent.current_story_id.as_deref(), now);
        // An open escalation parks the ladder until someone resolves it
        let escalated = open_escalations.contains(session);
        if tracker.ladder.escalated && !escalated {
            debug!(%session, "process_session: escalation resolved, resetting ladder");
            tracker.ladder.reset();
        }
        tracker.ladder.escalated = escalated;
        let restarts = tracker.restarts;
        let idle_ms = tracker.idle_ms(now);
        let decision = tracker
            .ladder
            .decide(idle_ms, manager_config.inactivity_threshold_ms(), now, manager_config);
        debug!(%session, state = %detection.state, idle_ms, ?decision, "process_session: classified");

        match detection.state {
            AgentState::Thinking => {}
            AgentState::PermissionRequired => {
                let auto = self.config.sessions.safety_for(agent.role) == SafetyMode::Auto;
                if auto && self.detector.permission_is_safe(&output) {
                    self.answer_prompt(agent, session, "permission-approved", &detection.reason)
                        .await?;
                    summary.permissions_approved.push(session.to_string());
                } else {
                    self.escalate(agent, session, story.as_ref(), &detection.reason, summary)
                        .await?;
                }
            }
            AgentState::PlanApproval => {
                self.answer_prompt(agent, session, "plan-approved", &detection.reason)
                    .await?;
                summary.plans_approved.push(session.to_string());
            }
            AgentState::ToolExited => {
                if restarts < self.config.manager.max_restarts {
                    let command = self.config.sessions.command_for(agent.cli_tool);
                    self.runtime.send_text(session, &command).await?;
                    if let Some(tracker) = self.trackers.get_mut(session) {
                        tracker.restarts += 1;
                        tracker.ladder.reset();
                    }
                    self.state
                        .audit(
                            AuditEntry::manager(
                                "assistant-restarted",
                                format!("{}: restart {} of {}", session, restarts + 1, self.config.manager.max_restarts),
                            )
                            .agent(&agent.id),
                        )
                        .await?;
                    info!(%session, restart = restarts + 1, "Restarted assistant");
                    summary.restarts.push(session.to_string());
                } else {
                    let reason = format!("assistant exited {} times, restart limit reached", restarts + 1);
                    self.escalate(agent, session, story.as_ref(), &reason, summary).await?;
                }
            }
            _ if detection.needs_human => {
                self.escalate(agent, session, story.as_ref(), &detection.reason, summary)
                    .await?;
            }
            _ => {
                if agent.status == AgentStatus::Working {
                    self.handle_inactivity(session, agent, story.as_ref(), &output, &detection, decision, summary)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Nudge ladder for a working agent whose screen is waiting or unreadable
    #[allow(clippy::too_many_arguments)]
    async fn handle_inactivity(
        &mut self,
        session: &str,
        agent: &Agent,
        story: Option<&Story>,
        output: &str,
        detection: &StateDetection,
        decision: NudgeDecision,
        summary: &mut TickSummary,
    ) -> eyre::Result<()> {
        match decision {
            NudgeDecision::Wait | NudgeDecision::Exhausted => Ok(()),
            NudgeDecision::Escalate => {
                let reason = format!(
                    "no progress after {} nudges ({})",
                    self.config.manager.max_nudges, detection.reason
                );
                self.escalate(agent, session, story, &reason, summary).await
            }
            NudgeDecision::Nudge => {
                let verdict = if detection.state == AgentState::WorkComplete {
                    Ok(StuckVerdict::Done)
                } else if detection.is_ambiguous() {
                    self.classifier.classify(output).await
                } else {
                    Ok(StuckVerdict::Stuck)
                };
                let (text, event) = match verdict {
                    Ok(StuckVerdict::Done) => (AUTO_PROGRESS_TEXT, "auto-progress"),
                    Ok(StuckVerdict::Stuck) => (NUDGE_TEXT, "nudge"),
                    Err(e) => {
                        warn!(%session, error = %e, "Stuck classifier failed");
                        let reason = format!("could not assess inactive session: {}", e);
                        return self.escalate(agent, session, story, &reason, summary).await;
                    }
                };
                if let Some(tracker) = self.trackers.get_mut(session) {
                    tracker.ladder.record_nudge(now_ms());
                }
                deliver_nudge(&self.state, self.runtime.as_ref(), session, text, event).await?;
                summary.nudges.push(session.to_string());
                Ok(())
            }
        }
    }

    /// Nudge owners of in-progress stories with no recorded progress
    async fn nudge_stuck_stories(&mut self, summary: &mut TickSummary) -> eyre::Result<()> {
        debug!("nudge_stuck_stories: called");
        let now = now_ms();
        let threshold = self.config.manager.stuck_threshold_ms();
        let stories = self.state.list_stories(None, Some(StoryStatus::InProgress)).await?;
        let active: HashSet<String> = stories.iter().map(|s| s.id.clone()).collect();
        self.story_nudges.retain(&active);

        for story in stories {
            let Some(ref agent_id) = story.assigned_agent_id else {
                continue;
            };
            let Some(agent) = self.state.get::<Agent>(agent_id).await?.filter(|a| !a.is_terminated()) else {
                continue;
            };
            let Some(session) = agent.tmux_session.clone() else {
                continue;
            };
            let idle_ms = now - story.updated_at;
            let decision = self
                .story_nudges
                .ladder(&story.id, story.updated_at)
                .decide(idle_ms, threshold, now, &self.config.manager);

            match decision {
                NudgeDecision::Nudge => {
                    self.story_nudges.ladder(&story.id, story.updated_at).record_nudge(now);
                    let text = format!(
                        "[hive] Story {} has had no recorded progress for {} minutes. Update its status, submit your PR, or say what is blocking you.",
                        story.id,
                        idle_ms / 60_000
                    );
                    deliver_nudge(&self.state, self.runtime.as_ref(), &session, &text, "story-nudge").await?;
                    summary.story_nudges.push(story.id.clone());
                }
                NudgeDecision::Escalate => {
                    self.story_nudges.ladder(&story.id, story.updated_at).escalated = true;
                    let reason = format!(
                        "story {} stalled for {} minutes after {} nudges",
                        story.id,
                        idle_ms / 60_000,
                        self.config.manager.max_nudges
                    );
                    self.escalate(&agent, &session, Some(&story), &reason, summary).await?;
                }
                NudgeDecision::Wait | NudgeDecision::Exhausted => {}
            }
        }
        Ok(())
    }

    /// Tell live seniors about planned work nobody picked up
    async fn notify_seniors(&mut self, summary: &mut TickSummary) -> eyre::Result<()> {
        debug!("notify_seniors: called");
        let now = now_ms();
        let cooldown = self.config.manager.senior_notify_cooldown_ms();

        let mut waiting: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for story in self.state.list_stories(None, Some(StoryStatus::Planned)).await? {
            if !story.is_assigned() {
                waiting.entry(story.team_id.clone()).or_default().push(story.id);
            }
        }

        for (team_id, story_ids) in waiting {
            if let Some(at) = self.seniors_notified_at.get(&team_id)
                && now - at < cooldown
            {
                continue;
            }
            let seniors: Vec<String> = self
                .state
                .list_agents(Some(AgentRole::Senior), None, Some(&team_id))
                .await?
                .into_iter()
                .filter(|a| !a.is_terminated())
                .filter_map(|a| a.tmux_session)
                .collect();
            if seniors.is_empty() {
                continue;
            }

            let text = format!(
                "[hive] {} planned stories in team {} are waiting for an agent: {}",
                story_ids.len(),
                team_id,
                story_ids.join(", ")
            );
            for session in &seniors {
                if let Err(e) = self.runtime.send_text(session, &text).await {
                    warn!(%session, error = %e, "Failed to notify senior");
                }
            }
            self.state
                .audit(AuditEntry::manager(
                    "seniors-notified",
                    format!("team {}: {} waiting stories", team_id, story_ids.len()),
                ))
                .await?;
            info!(team = %team_id, waiting = story_ids.len(), "Notified seniors");
            self.seniors_notified_at.insert(team_id.clone(), now);
            summary.seniors_notified.push(team_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::domain::{Escalation, Message, PrStatus, PullRequest, Team};
    use crate::merge_queue::MemoryHost;
    use crate::session::{ClassifierError, HeuristicClassifier, MemoryRuntime};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Always answers "stuck" and counts how often it was asked
    #[derive(Default)]
    struct CountingClassifier {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl StuckClassifier for CountingClassifier {
        async fn classify(&self, _output: &str) -> Result<StuckVerdict, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StuckVerdict::Stuck)
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct Fixture {
        state: StateManager,
        runtime: Arc<MemoryRuntime>,
        manager: Manager,
    }

    async fn fixture_with(config: Config) -> Fixture {
        fixture_with_classifier(config, Arc::new(HeuristicClassifier)).await
    }

    async fn fixture_with_classifier(config: Config, classifier: Arc<dyn StuckClassifier>) -> Fixture {
        let state = StateManager::in_memory().unwrap();
        let runtime = Arc::new(MemoryRuntime::new());
        let host = Arc::new(MemoryHost::new());
        let manager = Manager::new(state.clone(), runtime.clone(), host, classifier, Arc::new(config)).unwrap();
        state.create(Team::with_id("t1", "core", "/repo")).await.unwrap();
        Fixture {
            state,
            runtime,
            manager,
        }
    }

    fn eager_config() -> Config {
        Config {
            manager: ManagerConfig {
                inactivity_threshold_secs: 0,
                nudge_cooldown_secs: 0,
                max_nudges: 2,
                max_restarts: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// A working junior in a live session on an in-progress story
    async fn working_agent(f: &Fixture, session: &str, output: &str) {
        let mut agent = Agent::with_id("a1", AgentRole::Junior, Some("t1"));
        agent.tmux_session = Some(session.to_string());
        agent.assign("s1");
        f.state.create(agent).await.unwrap();
        let mut story = Story::with_id("s1", "t1", "story");
        story.status = StoryStatus::InProgress;
        story.assigned_agent_id = Some("a1".to_string());
        f.state.create(story).await.unwrap();
        f.runtime.add_session(session);
        f.runtime.set_output(session, output);
    }

    #[tokio::test]
    async fn test_not_leader_skips() {
        let mut config = Config::default();
        config.manager.is_leader = false;
        let mut f = fixture_with(config).await;
        let summary = f.manager.tick().await;
        assert!(summary.skipped);
        assert_eq!(f.manager.ticks(), 1);
    }

    #[tokio::test]
    async fn test_empty_tick_is_clean() {
        let mut f = fixture_with(Config::default()).await;
        let summary = f.manager.tick().await;
        assert!(!summary.skipped);
        assert!(summary.errors.is_empty(), "{:?}", summary.errors);
        assert!(summary.synced);
    }

    #[tokio::test]
    async fn test_runtime_outage_recorded_and_tick_continues() {
        let mut f = fixture_with(Config::default()).await;
        f.runtime.set_fail_listing(true);
        let summary = f.manager.tick().await;
        assert!(summary.errors.iter().any(|e| e.phase == "health"));
        assert!(summary.errors.iter().any(|e| e.phase == "discover"));
        assert!(summary.synced);
    }

    #[tokio::test]
    async fn test_safe_permission_auto_approved() {
        let mut f = fixture_with(Config::default()).await;
        working_agent(&f, "hive-junior-1", "Bash command\n  cargo fmt\nDo you want to proceed?\n❯ 1. Yes\n  2. No").await;

        let summary = f.manager.tick().await;
        assert_eq!(summary.permissions_approved, vec!["hive-junior-1".to_string()]);
        assert_eq!(f.runtime.sent_to("hive-junior-1"), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn test_dangerous_permission_escalates_once() {
        let mut f = fixture_with(Config::default()).await;
        working_agent(&f, "hive-junior-1", "Bash command\n  rm -rf /tmp/build\nDo you want to proceed?\n❯ 1. Yes").await;

        let summary = f.manager.tick().await;
        assert!(summary.permissions_approved.is_empty());
        assert_eq!(summary.escalations_raised.len(), 1);
        assert!(f.runtime.sent_to("hive-junior-1").is_empty());

        let summary = f.manager.tick().await;
        assert!(summary.escalations_raised.is_empty());
        assert_eq!(f.state.list_open_escalations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_question_escalates_to_human() {
        let mut f = fixture_with(Config::default()).await;
        working_agent(&f, "hive-junior-1", "Should I use postgres or sqlite?\n> ").await;

        f.manager.tick().await;
        let open = f.state.list_open_escalations().await.unwrap();
        assert_eq!(open.len(), 1);
        assert!(open[0].is_for_human());
        assert_eq!(open[0].story_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_exited_tool_restarted_then_escalated() {
        let mut f = fixture_with(eager_config()).await;
        working_agent(&f, "hive-junior-1", "bye\nuser@host:~/repo$ ").await;

        let summary = f.manager.tick().await;
        assert_eq!(summary.restarts, vec!["hive-junior-1".to_string()]);
        assert_eq!(f.runtime.sent_to("hive-junior-1"), vec!["claude".to_string()]);

        let summary = f.manager.tick().await;
        assert!(summary.restarts.is_empty());
        assert_eq!(summary.escalations_raised.len(), 1);
    }

    #[tokio::test]
    async fn test_nudge_ladder_bounded_then_escalates() {
        let mut f = fixture_with(eager_config()).await;
        working_agent(&f, "hive-junior-1", "Looked at the parser.\n> ").await;

        assert_eq!(f.manager.tick().await.nudges.len(), 1);
        assert_eq!(f.manager.tick().await.nudges.len(), 1);
        let third = f.manager.tick().await;
        assert!(third.nudges.is_empty());
        assert_eq!(third.escalations_raised.len(), 1);
        let fourth = f.manager.tick().await;
        assert!(fourth.nudges.is_empty());
        assert!(fourth.escalations_raised.is_empty());

        let nudges = f
            .runtime
            .sent_to("hive-junior-1")
            .into_iter()
            .filter(|t| t == NUDGE_TEXT)
            .count();
        assert_eq!(nudges, 2);
    }

    #[tokio::test]
    async fn test_echoed_nudges_still_bounded() {
        let mut f = fixture_with(eager_config()).await;
        working_agent(&f, "hive-junior-1", "Looked at the parser.\n> ").await;

        let mut nudges = 0;
        let mut raised = 0;
        for i in 0..8 {
            let summary = f.manager.tick().await;
            nudges += summary.nudges.len();
            raised += summary.escalations_raised.len();
            // tmux echoes whatever was typed, so the pane never looks the same twice
            let echoed = format!("Looked at the parser.\n{}\nturn {}\n> ", NUDGE_TEXT, i);
            f.runtime.set_output("hive-junior-1", &echoed);
        }

        assert_eq!(nudges, 2);
        assert_eq!(raised, 1);
        assert_eq!(f.state.list_open_escalations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_escalation_parks_session_despite_new_output() {
        let mut f = fixture_with(eager_config()).await;
        working_agent(&f, "hive-junior-1", "Looked at the parser.\n> ").await;
        for _ in 0..3 {
            f.manager.tick().await;
        }
        assert_eq!(f.state.list_open_escalations().await.unwrap().len(), 1);

        f.runtime.set_output("hive-junior-1", "Looked at the lexer instead.\n> ");
        let summary = f.manager.tick().await;
        assert!(summary.nudges.is_empty());
        assert!(summary.escalations_raised.is_empty());
    }

    #[tokio::test]
    async fn test_classifier_only_for_ambiguous_screens() {
        let classifier = Arc::new(CountingClassifier::default());
        let mut f = fixture_with_classifier(eager_config(), classifier.clone()).await;
        working_agent(&f, "hive-junior-1", "Task complete.\n> ").await;

        f.manager.tick().await;
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.runtime.sent_to("hive-junior-1"), vec![AUTO_PROGRESS_TEXT.to_string()]);

        f.runtime.set_output("hive-junior-1", "Looked at the parser.\n> ");
        f.manager.tick().await;
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolved_escalation_restarts_ladder() {
        let mut f = fixture_with(eager_config()).await;
        working_agent(&f, "hive-junior-1", "Looked at the parser.\n> ").await;
        for _ in 0..3 {
            f.manager.tick().await;
        }
        let mut open: Vec<Escalation> = f.state.list_open_escalations().await.unwrap();
        let mut esc = open.remove(0);
        esc.resolve("told it what to do");
        f.state.update(esc).await.unwrap();

        let summary = f.manager.tick().await;
        assert_eq!(summary.nudges.len(), 1);
    }

    #[tokio::test]
    async fn test_done_verdict_auto_progresses() {
        let mut f = fixture_with(eager_config()).await;
        working_agent(&f, "hive-junior-1", "All tests pass and it is ready for review.\n> ").await;

        f.manager.tick().await;
        assert_eq!(f.runtime.sent_to("hive-junior-1"), vec![AUTO_PROGRESS_TEXT.to_string()]);
    }

    #[tokio::test]
    async fn test_idle_agent_not_nudged() {
        let mut f = fixture_with(eager_config()).await;
        let mut agent = Agent::with_id("a1", AgentRole::Junior, Some("t1"));
        agent.tmux_session = Some("hive-junior-1".to_string());
        f.state.create(agent).await.unwrap();
        f.runtime.add_session("hive-junior-1");
        f.runtime.set_output("hive-junior-1", "> ");

        let summary = f.manager.tick().await;
        assert!(summary.nudges.is_empty());
        assert!(f.runtime.sent_to("hive-junior-1").is_empty());
    }

    #[tokio::test]
    async fn test_messages_forwarded_once() {
        let mut f = fixture_with(Config::default()).await;
        working_agent(&f, "hive-junior-1", "✻ Thinking… (esc to interrupt)").await;
        f.state
            .create(Message::new("hive-senior-1", "hive-junior-1", "rebase on main"))
            .await
            .unwrap();

        let summary = f.manager.tick().await;
        assert_eq!(summary.messages_delivered, 1);
        f.manager.tick().await;
        assert_eq!(
            f.runtime.sent_to("hive-junior-1"),
            vec!["[message from hive-senior-1] rebase on main".to_string()]
        );
    }

    #[tokio::test]
    async fn test_dead_session_recovered_and_reassigned() {
        let mut f = fixture_with(Config::default()).await;
        let mut agent = Agent::with_id("a1", AgentRole::Senior, Some("t1"));
        agent.tmux_session = Some("hive-senior-gone".to_string());
        agent.assign("s1");
        f.state.create(agent).await.unwrap();
        let mut story = Story::with_id("s1", "t1", "story");
        story.status = StoryStatus::InProgress;
        story.complexity_score = Some(9);
        story.assigned_agent_id = Some("a1".to_string());
        f.state.create(story).await.unwrap();

        let summary = f.manager.tick().await;
        assert_eq!(summary.health.terminated, vec!["a1".to_string()]);
        assert_eq!(summary.assigned, vec!["s1".to_string()]);

        let story: Story = f.state.get_required("s1").await.unwrap();
        assert_eq!(story.status, StoryStatus::InProgress);
        assert_ne!(story.assigned_agent_id.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_qa_pipeline_through_ticks() {
        let mut f = fixture_with(Config::default()).await;
        let mut story = Story::with_id("s1", "t1", "story");
        story.status = StoryStatus::Review;
        f.state.create(story).await.unwrap();
        let mut pr = PullRequest::with_id("pr1", "feature/s1");
        pr.story_id = Some("s1".to_string());
        pr.team_id = Some("t1".to_string());
        f.state.create(pr).await.unwrap();

        let summary = f.manager.tick().await;
        assert_eq!(summary.merge_queue.qa_spawned.len(), 1);
        assert_eq!(summary.merge_queue.dispatched, vec!["pr1".to_string()]);

        let pr: PullRequest = f.state.get_required("pr1").await.unwrap();
        assert_eq!(pr.status, PrStatus::Reviewing);
        let story: Story = f.state.get_required("s1").await.unwrap();
        assert_eq!(story.status, StoryStatus::Qa);
    }

    #[tokio::test]
    async fn test_seniors_notified_with_cooldown() {
        let mut f = fixture_with(Config::default()).await;
        let mut senior = Agent::with_id("sen", AgentRole::Senior, Some("t1"));
        senior.tmux_session = Some("hive-senior-1".to_string());
        senior.assign("busy");
        f.state.create(senior).await.unwrap();
        f.runtime.add_session("hive-senior-1");
        f.runtime.set_output("hive-senior-1", "✻ Working… (esc to interrupt)");
        let mut busy = Story::with_id("busy", "t1", "busy");
        busy.status = StoryStatus::InProgress;
        busy.assigned_agent_id = Some("sen".to_string());
        f.state.create(busy).await.unwrap();

        // Blocked on a draft dependency, so assignment leaves it planned
        let mut waiting = Story::with_id("w1", "t1", "waiting");
        waiting.status = StoryStatus::Planned;
        f.state.create(waiting).await.unwrap();
        f.state.create(Story::with_id("dep", "t1", "draft")).await.unwrap();
        f.state.add_dependency("w1", "dep").await.unwrap();

        let summary = f.manager.tick().await;
        assert_eq!(summary.seniors_notified, vec!["t1".to_string()]);
        assert!(f.runtime.sent_to("hive-senior-1")[0].contains("w1"));

        let summary = f.manager.tick().await;
        assert!(summary.seniors_notified.is_empty());
    }
}
