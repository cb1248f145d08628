//! Hive - coding agent control plane
//!
//! CLI entry point for running and inspecting the manager loop.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, FromArgMatches};
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info};

use hive::cli::{Cli, Command, ManagerCommand, OutputFormat, generate_after_help, get_log_path};
use hive::config::{Config, WORKSPACE_DIR, find_workspace_root};
use hive::daemon::{DaemonManager, VERSION};
use hive::health::HealthReconciler;
use hive::lock::ManagerLock;
use hive::manager::{Manager, ManagerRunner, NUDGE_TEXT, deliver_nudge};
use hive::merge_queue::GhCli;
use hive::scheduler::{AgentSpawner, AssignmentEngine, AssignmentReport, ScalingController, ScalingReport};
use hive::session::{SessionRuntime, TmuxRuntime, classifier_from_config};
use hive::state::StateManager;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level).map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

/// Everything a command needs about the workspace
struct Workspace {
    root: PathBuf,
    config: Arc<Config>,
    config_path: Option<PathBuf>,
}

impl Workspace {
    fn hive_dir(&self) -> PathBuf {
        self.root.join(WORKSPACE_DIR)
    }

    fn daemon(&self) -> DaemonManager {
        DaemonManager::new(self.hive_dir())
    }

    fn open_state(&self) -> Result<StateManager> {
        StateManager::spawn(self.hive_dir()).context("Failed to open the Hive store")
    }

    fn runtime(&self) -> Arc<dyn SessionRuntime> {
        Arc::new(TmuxRuntime::new(self.config.sessions.command_timeout()))
    }

    fn acquire_lock(&self) -> Result<ManagerLock> {
        let stale_after = Duration::from_secs(self.config.lock.stale_after_secs);
        ManagerLock::acquire(&self.hive_dir(), stale_after).context("Failed to acquire the manager lock")
    }

    fn build_manager(&self, state: StateManager) -> Result<Manager> {
        let host = Arc::new(GhCli::new(
            self.config.github.binary.clone(),
            Duration::from_millis(self.config.github.command_timeout_ms),
        ));
        let classifier = classifier_from_config(&self.config.classifier);
        info!(classifier = classifier.name(), "Stuck classifier selected");
        Manager::new(state, self.runtime(), host, classifier, self.config.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let root = find_workspace_root(&cwd);
    let config = Config::load(cli.config.as_ref(), root.as_deref()).context("Failed to load configuration")?;

    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;
    info!(version = VERSION, "Hive starting");

    let root = root.ok_or_else(|| {
        eyre::eyre!(
            "No {} workspace found in {} or any parent directory",
            WORKSPACE_DIR,
            cwd.display()
        )
    })?;
    let workspace = Workspace {
        root,
        config: Arc::new(config),
        config_path: cli.config.clone(),
    };

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Manager { command } => match command {
            ManagerCommand::Start { interval, foreground } => cmd_start(&workspace, interval, foreground).await,
            ManagerCommand::RunDaemon { interval } => cmd_run(&workspace, interval).await,
            ManagerCommand::Check { format } => cmd_check(&workspace, format).await,
            ManagerCommand::Health { format } => cmd_health(&workspace, format).await,
            ManagerCommand::Status { format } => cmd_status(&workspace, format).await,
            ManagerCommand::Stop => cmd_stop(&workspace),
            ManagerCommand::Nudge { session, message } => cmd_nudge(&workspace, &session, message.as_deref()).await,
        },
        Command::Assign { dry_run, format } => cmd_assign(&workspace, dry_run, format).await,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Start the manager, detached unless `--foreground`
async fn cmd_start(workspace: &Workspace, interval: Option<u64>, foreground: bool) -> Result<()> {
    debug!(?interval, foreground, "cmd_start: called");
    let daemon = workspace.daemon();
    if let Some(pid) = daemon.running_pid() {
        println!("Hive manager is already running (PID: {})", pid);
        return Ok(());
    }

    if foreground {
        println!("Starting Hive manager in foreground mode...");
        cmd_run(workspace, interval).await
    } else {
        let pid = daemon.start(&workspace.root, interval, workspace.config_path.as_deref())?;
        println!("Hive manager started (PID: {})", pid);
        Ok(())
    }
}

/// Run the manager loop in this process until signalled
async fn cmd_run(workspace: &Workspace, interval: Option<u64>) -> Result<()> {
    let lock = workspace.acquire_lock()?;
    let state = workspace.open_state()?;
    let manager = workspace.build_manager(state)?;
    let interval = interval
        .map(|secs| Duration::from_secs(secs.max(1)))
        .unwrap_or_else(|| workspace.config.manager.poll_interval());

    let runner = ManagerRunner::new(manager, Some(lock));
    runner.run(interval).await
}

/// Signal the running manager, or run one tick here under the lock
async fn cmd_check(workspace: &Workspace, format: OutputFormat) -> Result<()> {
    debug!(%format, "cmd_check: called");
    let daemon = workspace.daemon();
    if daemon.trigger_tick()? {
        println!("Tick requested from running manager (PID: {})", daemon.running_pid().unwrap_or_default());
        return Ok(());
    }

    let lock = workspace.acquire_lock()?;
    let state = workspace.open_state()?;
    let manager = workspace.build_manager(state.clone())?;
    let runner = ManagerRunner::new(manager, Some(lock));
    let summary = runner.request_tick().await;
    runner.shutdown().await?;
    state.shutdown().await?;

    let summary = summary.ok_or_else(|| eyre::eyre!("Tick did not run"))?;
    match format {
        OutputFormat::Json => print_json(&summary),
        OutputFormat::Text => {
            println!("{}", summary);
            Ok(())
        }
    }
}

/// Run the health reconciler once
async fn cmd_health(workspace: &Workspace, format: OutputFormat) -> Result<()> {
    debug!(%format, "cmd_health: called");
    let state = workspace.open_state()?;
    let report = HealthReconciler::new(state.clone(), workspace.runtime()).run().await;
    state.shutdown().await?;
    let report = report?;

    match format {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Text => {
            if report.is_empty() {
                println!("{}", "Healthy: nothing to repair".green());
            } else {
                println!("{} {}", "Repaired:".yellow(), report);
                for id in &report.terminated {
                    println!("  terminated agent {}", id);
                }
                for id in &report.recovered_stories {
                    println!("  story {} back to planned", id);
                }
            }
            Ok(())
        }
    }
}

/// Show manager state and workload counts
async fn cmd_status(workspace: &Workspace, format: OutputFormat) -> Result<()> {
    debug!(%format, "cmd_status: called");
    let status = workspace.daemon().status();
    let state = workspace.open_state()?;
    let summary = state.summary().await;
    let audit = state.recent_audit(10).await;
    state.shutdown().await?;
    let (summary, audit) = (summary?, audit?);

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "version": VERSION,
            "workspace": workspace.root,
            "manager": status,
            "summary": summary,
            "recent_audit": audit,
        })),
        OutputFormat::Text => {
            println!("{}", "Hive Status".bright_cyan().bold());
            println!("-----------");
            println!("Workspace: {}", workspace.root.display());
            match status.pid {
                Some(pid) => println!(
                    "Manager:   {} (PID {}, heartbeat {}s ago)",
                    "running".green(),
                    pid,
                    status.heartbeat_age_secs.unwrap_or_default()
                ),
                None => println!("Manager:   {}", "stopped".red()),
            }
            println!("Teams:     {}", summary.teams);
            for (title, counts) in [
                ("Agents", &summary.agents),
                ("Stories", &summary.stories),
                ("PRs", &summary.pull_requests),
            ] {
                let line: Vec<String> = counts.iter().map(|(k, v)| format!("{} {}", v, k)).collect();
                println!("{:<10} {}", format!("{}:", title), if line.is_empty() { "-".to_string() } else { line.join(", ") });
            }
            let escalations = format!("{}", summary.open_escalations);
            println!(
                "Escalations: {}   Pending messages: {}",
                if summary.open_escalations > 0 { escalations.yellow() } else { escalations.normal() },
                summary.pending_messages
            );
            if !audit.is_empty() {
                println!();
                println!("{}", "Recent activity".bold());
                for entry in audit {
                    let when = chrono::DateTime::from_timestamp_millis(entry.created_at)
                        .map(|t| t.with_timezone(&chrono::Local).format("%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default();
                    println!("  {} {:<24} {}", when.dimmed(), entry.event.bright_cyan(), entry.message);
                }
            }
            Ok(())
        }
    }
}

fn cmd_stop(workspace: &Workspace) -> Result<()> {
    let daemon = workspace.daemon();
    if !daemon.is_running() {
        println!("Hive manager is not running");
        return Ok(());
    }
    let pid = daemon.stop()?;
    println!("Hive manager stopped (was PID: {})", pid);
    Ok(())
}

async fn cmd_nudge(workspace: &Workspace, session: &str, message: Option<&str>) -> Result<()> {
    debug!(%session, "cmd_nudge: called");
    let state = workspace.open_state()?;
    let runtime = workspace.runtime();
    let result = deliver_nudge(&state, runtime.as_ref(), session, message.unwrap_or(NUDGE_TEXT), "manual-nudge").await;
    state.shutdown().await?;
    result?;
    println!("Nudged {}", session);
    Ok(())
}

/// Scale the senior pool, then assign planned stories
async fn cmd_assign(workspace: &Workspace, dry_run: bool, format: OutputFormat) -> Result<()> {
    debug!(dry_run, %format, "cmd_assign: called");
    let state = workspace.open_state()?;
    let result = run_assignment(workspace, &state, dry_run).await;
    state.shutdown().await?;
    let (scaling, report) = result?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "scaling": scaling, "assignment": report })),
        OutputFormat::Text => {
            if let Some(scaling) = scaling {
                println!(
                    "Scaling: spawned {}, terminated {}",
                    scaling.spawned.len(),
                    scaling.terminated.len()
                );
            }
            let heading = if dry_run { "Would assign" } else { "Assigned" };
            println!("{}: {}", heading.bold(), report);
            for a in &report.assignments {
                let agent = a.agent_id.as_deref().unwrap_or("(new agent)");
                println!("  {} -> {} [{}]", a.story_id, agent, a.tier);
            }
            for s in report.blocked.iter().chain(report.unassignable.iter()) {
                println!("  {} skipped: {}", s.story_id.yellow(), s.reason);
            }
            for c in &report.cycles {
                println!("  {} team {}: {}", "cycle".red(), c.team_id, c.stories.join(", "));
            }
            Ok(())
        }
    }
}

async fn run_assignment(
    workspace: &Workspace,
    state: &StateManager,
    dry_run: bool,
) -> Result<(Option<ScalingReport>, AssignmentReport)> {
    let runtime = workspace.runtime();
    let spawner = AgentSpawner::new(state.clone(), runtime.clone(), workspace.config.clone());
    let scaling = if dry_run {
        None
    } else {
        Some(
            ScalingController::new(state.clone(), spawner.clone(), workspace.config.clone())
                .run()
                .await?,
        )
    };
    let report = AssignmentEngine::new(state.clone(), runtime, spawner, workspace.config.clone())
        .run(dry_run)
        .await?;
    Ok((scaling, report))
}
