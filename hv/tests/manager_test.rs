//! End-to-end ticks against a persistent store
//!
//! Sessions and the hosting service are in-memory; the store is a real
//! SQLite database in a temp directory.

use std::sync::Arc;

use hive::config::Config;
use hive::domain::{Agent, AgentRole, AgentStatus, PrStatus, PullRequest, Story, StoryStatus, Team, now_ms};
use hive::manager::{Manager, ManagerRunner};
use hive::merge_queue::{MemoryHost, RemotePrState};
use hive::session::{HeuristicClassifier, MemoryRuntime};
use hive::state::StateManager;
use tempfile::TempDir;

const REPO: &str = "/work/repo";

struct Harness {
    _dir: TempDir,
    state: StateManager,
    runtime: Arc<MemoryRuntime>,
    host: Arc<MemoryHost>,
    manager: Manager,
}

async fn harness() -> Harness {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let state = StateManager::spawn(dir.path()).expect("Failed to open store");
    let runtime = Arc::new(MemoryRuntime::new());
    let host = Arc::new(MemoryHost::new());
    let manager = Manager::new(
        state.clone(),
        runtime.clone(),
        host.clone(),
        Arc::new(HeuristicClassifier),
        Arc::new(Config::default()),
    )
    .expect("Failed to build manager");
    state.create(Team::with_id("t1", "core", REPO)).await.unwrap();
    Harness {
        _dir: dir,
        state,
        runtime,
        host,
        manager,
    }
}

#[tokio::test]
async fn test_dead_session_story_reassigned_and_persisted() {
    let mut h = harness().await;
    let mut agent = Agent::with_id("a1", AgentRole::Intermediate, Some("t1"));
    agent.tmux_session = Some("hive-intermediate-9".to_string());
    agent.assign("s1");
    h.state.create(agent).await.unwrap();
    let mut story = Story::with_id("s1", "t1", "parser");
    story.status = StoryStatus::InProgress;
    story.complexity_score = Some(5);
    story.assigned_agent_id = Some("a1".to_string());
    h.state.create(story).await.unwrap();

    let summary = h.manager.tick().await;
    assert!(summary.errors.is_empty(), "{:?}", summary.errors);
    assert_eq!(summary.health.terminated, vec!["a1".to_string()]);
    assert_eq!(summary.assigned, vec!["s1".to_string()]);

    let dead: Agent = h.state.get_required("a1").await.unwrap();
    assert_eq!(dead.status, AgentStatus::Terminated);
    assert!(dead.current_story_id.is_none());

    let story: Story = h.state.get_required("s1").await.unwrap();
    let new_owner = story.assigned_agent_id.clone().expect("story should be reassigned");
    let owner: Agent = h.state.get_required(&new_owner).await.unwrap();
    assert_eq!(owner.role, AgentRole::Intermediate);
    assert_eq!(owner.current_story_id.as_deref(), Some("s1"));
    let session = owner.tmux_session.clone().unwrap();
    assert!(h.runtime.is_live(&session));
    assert!(h.runtime.sent_to(&session).iter().any(|t| t.contains("s1")));

    let audit = h.state.recent_audit(50).await.unwrap();
    assert!(audit.iter().any(|e| e.event == "story-assigned"));
}

#[tokio::test]
async fn test_qa_pipeline_through_merge() {
    let mut h = harness().await;
    let mut dev = Agent::with_id("dev", AgentRole::Junior, Some("t1"));
    dev.tmux_session = Some("hive-junior-1".to_string());
    dev.assign("s1");
    h.state.create(dev).await.unwrap();
    h.runtime.add_session("hive-junior-1");
    h.runtime.set_output("hive-junior-1", "✻ Waiting for review… (esc to interrupt)");

    let mut story = Story::with_id("s1", "t1", "parser");
    story.status = StoryStatus::Review;
    story.assigned_agent_id = Some("dev".to_string());
    h.state.create(story).await.unwrap();
    let mut pr = PullRequest::with_id("pr1", "feature/s1");
    pr.story_id = Some("s1".to_string());
    pr.team_id = Some("t1".to_string());
    pr.submitted_by = Some("dev".to_string());
    pr.github_pr_number = Some(7);
    h.state.create(pr).await.unwrap();
    h.host.insert(REPO, 7, "feature/s1", RemotePrState::Open);

    // First tick spawns a QA agent and hands it the PR
    let summary = h.manager.tick().await;
    assert_eq!(summary.merge_queue.qa_spawned.len(), 1);
    assert_eq!(summary.merge_queue.dispatched, vec!["pr1".to_string()]);
    let mut pr: PullRequest = h.state.get_required("pr1").await.unwrap();
    assert_eq!(pr.status, PrStatus::Reviewing);
    let qa_id = pr.reviewed_by.clone().unwrap();
    let qa: Agent = h.state.get_required(&qa_id).await.unwrap();
    assert_eq!(qa.role, AgentRole::Qa);
    assert!(
        h.runtime
            .sent_to(qa.tmux_session.as_deref().unwrap())
            .iter()
            .any(|t| t.contains("feature/s1"))
    );

    // QA approves; the next tick merges and frees everyone
    pr.transition(PrStatus::Approved).unwrap();
    h.state.update(pr).await.unwrap();
    let summary = h.manager.tick().await;
    assert!(summary.errors.is_empty(), "{:?}", summary.errors);

    let pr: PullRequest = h.state.get_required("pr1").await.unwrap();
    assert_eq!(pr.status, PrStatus::Merged);
    assert_eq!(h.host.state_of(REPO, 7), Some(RemotePrState::Merged));
    let story: Story = h.state.get_required("s1").await.unwrap();
    assert_eq!(story.status, StoryStatus::Merged);
    let dev: Agent = h.state.get_required("dev").await.unwrap();
    assert_eq!(dev.status, AgentStatus::Idle);
    assert!(dev.current_story_id.is_none());
    let qa: Agent = h.state.get_required(&qa_id).await.unwrap();
    assert_eq!(qa.status, AgentStatus::Idle);
}

#[tokio::test]
async fn test_stale_review_synced_from_host() {
    let mut h = harness().await;
    let mut qa = Agent::with_id("qa1", AgentRole::Qa, Some("t1"));
    qa.tmux_session = Some("hive-qa-1".to_string());
    qa.status = AgentStatus::Working;
    h.state.create(qa).await.unwrap();
    h.runtime.add_session("hive-qa-1");
    h.runtime.set_output("hive-qa-1", "✻ Reviewing… (esc to interrupt)");

    let mut dev = Agent::with_id("dev", AgentRole::Senior, Some("t1"));
    dev.tmux_session = Some("hive-senior-1".to_string());
    dev.assign("s1");
    h.state.create(dev).await.unwrap();
    h.runtime.add_session("hive-senior-1");
    h.runtime.set_output("hive-senior-1", "✻ Waiting… (esc to interrupt)");

    let mut story = Story::with_id("s1", "t1", "parser");
    story.status = StoryStatus::Qa;
    story.assigned_agent_id = Some("dev".to_string());
    h.state.create(story).await.unwrap();
    let mut pr = PullRequest::with_id("pr1", "feature/s1");
    pr.story_id = Some("s1".to_string());
    pr.team_id = Some("t1".to_string());
    pr.github_pr_number = Some(11);
    pr.status = PrStatus::Reviewing;
    pr.reviewed_by = Some("qa1".to_string());
    pr.review_started_at = Some(now_ms() - 3_600_000);
    h.state.create(pr).await.unwrap();
    h.host.insert(REPO, 11, "feature/s1", RemotePrState::Merged);

    let summary = h.manager.tick().await;
    assert!(summary.synced);

    let pr: PullRequest = h.state.get_required("pr1").await.unwrap();
    assert_eq!(pr.status, PrStatus::Merged);
    let story: Story = h.state.get_required("s1").await.unwrap();
    assert_eq!(story.status, StoryStatus::Merged);
    let dev: Agent = h.state.get_required("dev").await.unwrap();
    assert!(dev.current_story_id.is_none());
    assert_eq!(dev.status, AgentStatus::Idle);
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let state = StateManager::spawn(dir.path()).unwrap();
        let runtime = Arc::new(MemoryRuntime::new());
        let manager = Manager::new(
            state.clone(),
            runtime,
            Arc::new(MemoryHost::new()),
            Arc::new(HeuristicClassifier),
            Arc::new(Config::default()),
        )
        .unwrap();
        state.create(Team::with_id("t1", "core", REPO)).await.unwrap();
        let runner = ManagerRunner::new(manager, None);
        assert!(runner.request_tick().await.is_some());
        runner.shutdown().await.unwrap();
        state.shutdown().await.unwrap();
    }

    let state = StateManager::spawn(dir.path()).unwrap();
    let teams = state.list_teams().await.unwrap();
    assert_eq!(teams.len(), 1);
    assert_eq!(teams[0].repo_path, REPO);
}
