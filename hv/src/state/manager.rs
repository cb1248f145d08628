//! StateManager - actor that owns the HiveStore
//!
//! Every operation is one message to the actor: a short-lived section against
//! the store that is released as soon as the reply is sent. Nothing holds the
//! store across an await on an external system.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::domain::{
    Agent, AgentRole, AgentStatus, AuditEntry, Escalation, EscalationStatus, Filter, Message, MessageStatus, PrStatus,
    PullRequest, Record, Store, Story, StoryDependency, StoryStatus, Team, Tx,
};

use super::messages::{StateCommand, StateError, StateResponse, StoreJob};

/// Counts shown by `hive manager status`
#[derive(Debug, Default, Serialize)]
pub struct StatusSummary {
    pub teams: usize,
    pub agents: BTreeMap<String, usize>,
    pub stories: BTreeMap<String, usize>,
    pub pull_requests: BTreeMap<String, usize>,
    pub open_escalations: usize,
    pub pending_messages: usize,
}

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Spawn a new StateManager actor over a store directory
    pub fn spawn(store_dir: impl AsRef<Path>) -> eyre::Result<Self> {
        debug!(store_dir = %store_dir.as_ref().display(), "spawn: called");
        let mut store = Store::open(store_dir.as_ref())?;

        let stories = store.rebuild_indexes::<Story>()?;
        let agents = store.rebuild_indexes::<Agent>()?;
        let prs = store.rebuild_indexes::<PullRequest>()?;
        info!(stories, agents, prs, "Rebuilt indexes");

        Ok(Self::start(store))
    }

    /// Spawn a StateManager over an in-memory store
    pub fn in_memory() -> eyre::Result<Self> {
        debug!("in_memory: called");
        Ok(Self::start(Store::open_in_memory()?))
    }

    fn start(store: Store) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("StateManager spawned");
        Self { tx }
    }

    /// Run a closure against the store on the actor task
    pub async fn with_store<F, R>(&self, f: F) -> StateResponse<R>
    where
        F: FnOnce(&mut Store) -> eyre::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: StoreJob = Box::new(move |store| {
            let result = f(store).map_err(|e| StateError::StoreError(format!("{:#}", e)));
            let _ = reply_tx.send(result);
        });
        self.tx
            .send(StateCommand::Run(job))
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Run a closure inside one store transaction
    pub async fn transaction<F, R>(&self, f: F) -> StateResponse<R>
    where
        F: FnOnce(&mut Tx<'_>) -> eyre::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.with_store(move |store| store.transaction(f)).await
    }

    // === Generic record operations ===

    pub async fn create<T: Record>(&self, record: T) -> StateResponse<String> {
        debug!(collection = T::collection_name(), id = record.id(), "create: called");
        self.with_store(move |store| store.create(record)).await
    }

    pub async fn get<T: Record>(&self, id: &str) -> StateResponse<Option<T>> {
        let id = id.to_string();
        self.with_store(move |store| store.get(&id)).await
    }

    pub async fn get_required<T: Record>(&self, id: &str) -> StateResponse<T> {
        self.get(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("{} {}", T::collection_name(), id)))
    }

    pub async fn update<T: Record>(&self, record: T) -> StateResponse<()> {
        debug!(collection = T::collection_name(), id = record.id(), "update: called");
        self.with_store(move |store| store.update(record)).await
    }

    pub async fn list<T: Record>(&self, filters: Vec<Filter>) -> StateResponse<Vec<T>> {
        self.with_store(move |store| store.list(&filters)).await
    }

    // === Teams ===

    pub async fn list_teams(&self) -> StateResponse<Vec<Team>> {
        debug!("list_teams: called");
        self.list(Vec::new()).await
    }

    // === Agents ===

    /// List agents, optionally filtered by role, status and team
    pub async fn list_agents(
        &self,
        role: Option<AgentRole>,
        status: Option<AgentStatus>,
        team_id: Option<&str>,
    ) -> StateResponse<Vec<Agent>> {
        debug!(?role, ?status, ?team_id, "list_agents: called");
        let mut filters = Vec::new();
        if let Some(role) = role {
            filters.push(Filter::eq("role", role.to_string()));
        }
        if let Some(status) = status {
            filters.push(Filter::eq("status", status.to_string()));
        }
        if let Some(team) = team_id {
            filters.push(Filter::eq("team_id", team));
        }
        self.list(filters).await
    }

    /// Agents that are not terminated
    pub async fn list_live_agents(&self) -> StateResponse<Vec<Agent>> {
        debug!("list_live_agents: called");
        self.list(vec![Filter::ne("status", AgentStatus::Terminated.to_string())])
            .await
    }

    pub async fn find_agent_by_session(&self, session: &str) -> StateResponse<Option<Agent>> {
        debug!(%session, "find_agent_by_session: called");
        let agents: Vec<Agent> = self.list(vec![Filter::eq("tmux_session", session)]).await?;
        Ok(agents.into_iter().rev().find(|a| !a.is_terminated()))
    }

    // === Stories ===

    /// List stories, optionally filtered by team and status
    pub async fn list_stories(&self, team_id: Option<&str>, status: Option<StoryStatus>) -> StateResponse<Vec<Story>> {
        debug!(?team_id, ?status, "list_stories: called");
        let mut filters = Vec::new();
        if let Some(team) = team_id {
            filters.push(Filter::eq("team_id", team));
        }
        if let Some(status) = status {
            filters.push(Filter::eq("status", status.to_string()));
        }
        self.list(filters).await
    }

    /// Dependencies of the given stories, keyed by dependent story
    pub async fn dependencies_for(&self, story_ids: Vec<String>) -> StateResponse<BTreeMap<String, Vec<String>>> {
        debug!(count = story_ids.len(), "dependencies_for: called");
        self.with_store(move |store| {
            let mut deps = BTreeMap::new();
            for id in story_ids {
                let edges: Vec<StoryDependency> = store.list(&[Filter::eq("story_id", id.as_str())])?;
                deps.insert(id, edges.into_iter().map(|e| e.depends_on_story_id).collect());
            }
            Ok(deps)
        })
        .await
    }

    pub async fn add_dependency(&self, story_id: &str, depends_on: &str) -> StateResponse<()> {
        debug!(%story_id, %depends_on, "add_dependency: called");
        let dep = StoryDependency::new(story_id, depends_on);
        self.with_store(move |store| store.upsert(dep)).await
    }

    // === Pull requests ===

    pub async fn list_prs(&self, status: Option<PrStatus>) -> StateResponse<Vec<PullRequest>> {
        debug!(?status, "list_prs: called");
        let filters = status
            .map(|s| vec![Filter::eq("status", s.to_string())])
            .unwrap_or_default();
        self.list(filters).await
    }

    // === Escalations ===

    pub async fn list_open_escalations(&self) -> StateResponse<Vec<Escalation>> {
        debug!("list_open_escalations: called");
        self.list(vec![Filter::ne("status", EscalationStatus::Resolved.to_string())])
            .await
    }

    // === Messages ===

    /// Pending messages for a session, oldest first
    pub async fn pending_messages(&self, to_session: &str) -> StateResponse<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .list(vec![
                Filter::eq("to_session", to_session),
                Filter::eq("status", MessageStatus::Pending.to_string()),
            ])
            .await?;
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    // === Audit ===

    pub async fn audit(&self, entry: AuditEntry) -> StateResponse<()> {
        debug!(event = %entry.event, "audit: called");
        self.with_store(move |store| store.create(entry).map(|_| ())).await
    }

    /// Most recent audit entries, newest first
    pub async fn recent_audit(&self, limit: usize) -> StateResponse<Vec<AuditEntry>> {
        let mut entries: Vec<AuditEntry> = self.list(Vec::new()).await?;
        entries.sort_by_key(|e| std::cmp::Reverse(e.created_at));
        entries.truncate(limit);
        Ok(entries)
    }

    // === Lifecycle ===

    /// Checkpoint the store to durable storage
    pub async fn flush(&self) -> StateResponse<()> {
        debug!("flush: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::Flush { reply: reply_tx })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Flush and stop the actor
    pub async fn shutdown(&self) -> StateResponse<()> {
        debug!("shutdown: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::Shutdown { reply: reply_tx })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Aggregate counts for status output
    pub async fn summary(&self) -> eyre::Result<StatusSummary> {
        debug!("summary: called");
        let summary = self
            .with_store(|store| {
                let mut summary = StatusSummary {
                    teams: store.list::<Team>(&[])?.len(),
                    ..Default::default()
                };
                for agent in store.list::<Agent>(&[])? {
                    *summary.agents.entry(agent.status.to_string()).or_default() += 1;
                }
                for story in store.list::<Story>(&[])? {
                    *summary.stories.entry(story.status.to_string()).or_default() += 1;
                }
                for pr in store.list::<PullRequest>(&[])? {
                    *summary.pull_requests.entry(pr.status.to_string()).or_default() += 1;
                }
                summary.open_escalations = store
                    .list::<Escalation>(&[Filter::ne("status", EscalationStatus::Resolved.to_string())])?
                    .len();
                summary.pending_messages = store
                    .list::<Message>(&[Filter::eq("status", MessageStatus::Pending.to_string())])?
                    .len();
                Ok(summary)
            })
            .await?;
        Ok(summary)
    }
}

/// The actor loop that processes commands
async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("StateManager actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::Run(job) => job(&mut store),

            StateCommand::Flush { reply } => {
                debug!("actor_loop: Flush command");
                let result = store.flush().map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            StateCommand::Shutdown { reply } => {
                info!("StateManager shutting down");
                let result = store.flush().map_err(|e| StateError::StoreError(e.to_string()));
                if let Err(ref e) = result {
                    warn!(error = %e, "Flush on shutdown failed");
                }
                let _ = reply.send(result);
                break;
            }
        }
    }

    debug!("StateManager actor stopped");
}
