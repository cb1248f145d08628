//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::config::{WORKSPACE_DIR, find_workspace_root};
use crate::lock;

/// Hive - control plane for a fleet of coding agents
#[derive(Parser)]
#[command(
    name = "hive",
    about = "Control plane for a fleet of coding agents running in terminal sessions",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run and control the manager loop
    Manager {
        #[command(subcommand)]
        command: ManagerCommand,
    },

    /// Scale the senior pool and assign planned stories
    Assign {
        /// Report what would be assigned without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Debug, Subcommand)]
pub enum ManagerCommand {
    /// Start the manager
    Start {
        /// Seconds between ticks (overrides poll-interval-secs)
        #[arg(short, long)]
        interval: Option<u64>,

        /// Don't fork to background (run in foreground)
        #[arg(long)]
        foreground: bool,
    },

    /// Run one tick now (or signal the running manager to)
    Check {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Run the health reconciler once
    Health {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show manager and workload status
    Status {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Stop the running manager
    Stop,

    /// Send a nudge to one session
    Nudge {
        /// Session name
        session: String,

        /// Text to send instead of the default nudge
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Internal: run as daemon process (used by `manager start`)
    #[command(hide = true)]
    RunDaemon {
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

/// Result of checking a required tool
pub struct ToolCheck {
    pub name: &'static str,
    pub available: bool,
    pub version: Option<String>,
}

impl ToolCheck {
    /// Check if a tool is available and get its version
    pub fn check(name: &'static str, version_args: &[&str]) -> Self {
        debug!(name, ?version_args, "ToolCheck::check: called");
        match std::process::Command::new(name).args(version_args).output() {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout);
                Self {
                    name,
                    available: true,
                    version: Some(parse_version(&text)),
                }
            }
            _ => Self {
                name,
                available: false,
                version: None,
            },
        }
    }
}

/// First version-like word in command output
fn parse_version(output: &str) -> String {
    for word in output.split_whitespace() {
        let word = word.trim_start_matches('v');
        if word.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            let version: String = word.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
            if !version.is_empty() {
                return version;
            }
        }
    }
    "unknown".to_string()
}

/// Tools the manager shells out to
pub fn check_required_tools() -> Vec<ToolCheck> {
    vec![
        ToolCheck::check("tmux", &["-V"]),
        ToolCheck::check("gh", &["--version"]),
        ToolCheck::check("git", &["--version"]),
    ]
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hive")
        .join("logs")
        .join("hive.log")
}

/// The after_help text: tool checks, manager state and log location
pub fn generate_after_help() -> String {
    debug!("generate_after_help: called");
    let mut help = String::from("Required Tools:\n");
    for tool in check_required_tools() {
        let icon = if tool.available { "\u{2705}" } else { "\u{274C}" };
        let version = tool.version.as_deref().unwrap_or("not found");
        help.push_str(&format!("  {} {:<10} {}\n", icon, tool.name, version));
    }

    help.push_str("\nManager:\n");
    let root = std::env::current_dir().ok().and_then(|cwd| find_workspace_root(&cwd));
    match root {
        Some(root) => {
            let running = lock::read_lock(&root.join(WORKSPACE_DIR))
                .map(|info| info.pid)
                .filter(|&pid| lock::is_process_running(pid));
            match running {
                Some(pid) => help.push_str(&format!("  \u{2705} running (PID {})\n", pid)),
                None => help.push_str("  \u{274C} stopped\n"),
            }
            help.push_str(&format!("  workspace: {}\n", root.display()));
        }
        None => help.push_str(&format!("  no {} workspace in this directory tree\n", WORKSPACE_DIR)),
    }

    help.push_str(&format!("\nLogs are written to: {}\n", get_log_path().display()));
    help
}

/// Output format for reporting commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manager_start() {
        let cli = Cli::parse_from(["hive", "manager", "start"]);
        assert!(matches!(
            cli.command,
            Command::Manager {
                command: ManagerCommand::Start {
                    interval: None,
                    foreground: false
                }
            }
        ));
    }

    #[test]
    fn test_parse_manager_start_foreground_interval() {
        let cli = Cli::parse_from(["hive", "manager", "start", "--foreground", "--interval", "30"]);
        assert!(matches!(
            cli.command,
            Command::Manager {
                command: ManagerCommand::Start {
                    interval: Some(30),
                    foreground: true
                }
            }
        ));
    }

    #[test]
    fn test_parse_assign_dry_run_json() {
        let cli = Cli::parse_from(["hive", "assign", "--dry-run", "--format", "json"]);
        assert!(matches!(
            cli.command,
            Command::Assign {
                dry_run: true,
                format: OutputFormat::Json
            }
        ));
    }

    #[test]
    fn test_parse_nudge_with_message() {
        let cli = Cli::parse_from(["hive", "manager", "nudge", "hive-junior-1", "-m", "rebase please"]);
        match cli.command {
            Command::Manager {
                command: ManagerCommand::Nudge { session, message },
            } => {
                assert_eq!(session, "hive-junior-1");
                assert_eq!(message.as_deref(), Some("rebase please"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_options() {
        let cli = Cli::parse_from(["hive", "-l", "debug", "manager", "status", "--config", "/tmp/hive.yml"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/hive.yml")));
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["hive"]).is_err());
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("plain".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert!("table".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("tmux 3.4"), "3.4");
        assert_eq!(parse_version("gh version 2.45.0 (2024-03-04)"), "2.45.0");
        assert_eq!(parse_version("no digits"), "unknown");
    }
}
