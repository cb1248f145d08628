//! Hive configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::{AgentRole, CliTool};

/// Name of the workspace marker directory
pub const WORKSPACE_DIR: &str = ".hive";

/// Main Hive configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Manager loop timing and thresholds
    pub manager: ManagerConfig,

    /// Tier routing and pool sizes
    pub scaling: ScalingConfig,

    /// Merge queue behaviour
    #[serde(rename = "merge-queue")]
    pub merge_queue: MergeQueueConfig,

    /// Terminal sessions and assistant commands
    pub sessions: SessionsConfig,

    /// Code hosting CLI
    pub github: GithubConfig,

    /// Secondary stuck/done classifier
    pub classifier: ClassifierConfig,

    /// Singleton lock
    pub lock: LockConfig,

    /// Log level (overridden by --log-level)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// `--config PATH` > `.hive.yml` in the workspace root > `~/.config/hive/hive.yml` > defaults
    pub fn load(config_path: Option<&PathBuf>, workspace_root: Option<&Path>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        if let Some(root) = workspace_root {
            let local_config = root.join(".hive.yml");
            if local_config.exists() {
                match Self::load_from_file(&local_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                    }
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("hive").join("hive.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Find the workspace root: the nearest ancestor holding a `.hive/` directory
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(WORKSPACE_DIR).is_dir())
        .map(Path::to_path_buf)
}

/// Manager loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Seconds between ticks
    #[serde(rename = "poll-interval-secs")]
    pub poll_interval_secs: u64,

    /// Lines of terminal output inspected per session
    #[serde(rename = "capture-lines")]
    pub capture_lines: usize,

    /// Unchanged output for this long counts as a stall
    #[serde(rename = "inactivity-threshold-secs")]
    pub inactivity_threshold_secs: u64,

    /// Stories not updated for this long get their agent nudged
    #[serde(rename = "stuck-threshold-secs")]
    pub stuck_threshold_secs: u64,

    /// Nudges per story before a human escalation
    #[serde(rename = "max-nudges")]
    pub max_nudges: u32,

    /// Minimum spacing between nudges to one session
    #[serde(rename = "nudge-cooldown-secs")]
    pub nudge_cooldown_secs: u64,

    /// Assistant restarts per session before escalating
    #[serde(rename = "max-restarts")]
    pub max_restarts: u32,

    /// Minimum spacing between "unassigned work" notices to seniors
    #[serde(rename = "senior-notify-cooldown-secs")]
    pub senior_notify_cooldown_secs: u64,

    /// Whether this node drives ticks
    #[serde(rename = "is-leader")]
    pub is_leader: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            capture_lines: 50,
            inactivity_threshold_secs: 300,
            stuck_threshold_secs: 1800,
            max_nudges: 3,
            nudge_cooldown_secs: 300,
            max_restarts: 2,
            senior_notify_cooldown_secs: 900,
            is_leader: true,
        }
    }
}

impl ManagerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn inactivity_threshold_ms(&self) -> i64 {
        (self.inactivity_threshold_secs * 1000) as i64
    }

    pub fn stuck_threshold_ms(&self) -> i64 {
        (self.stuck_threshold_secs * 1000) as i64
    }

    pub fn nudge_cooldown_ms(&self) -> i64 {
        (self.nudge_cooldown_secs * 1000) as i64
    }

    pub fn senior_notify_cooldown_ms(&self) -> i64 {
        (self.senior_notify_cooldown_secs * 1000) as i64
    }
}

/// Tier routing thresholds and pool sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Highest complexity routed to a junior
    #[serde(rename = "junior-max-complexity")]
    pub junior_max_complexity: u8,

    /// Highest complexity routed to an intermediate
    #[serde(rename = "intermediate-max-complexity")]
    pub intermediate_max_complexity: u8,

    /// Story points one senior can carry
    #[serde(rename = "senior-capacity")]
    pub senior_capacity: u32,

    #[serde(rename = "max-seniors")]
    pub max_seniors: usize,

    #[serde(rename = "max-intermediates")]
    pub max_intermediates: usize,

    #[serde(rename = "max-juniors")]
    pub max_juniors: usize,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            junior_max_complexity: 3,
            intermediate_max_complexity: 7,
            senior_capacity: 20,
            max_seniors: 3,
            max_intermediates: 3,
            max_juniors: 3,
        }
    }
}

impl ScalingConfig {
    /// Per-team cap for a role (None = unbounded)
    pub fn max_for(&self, role: AgentRole) -> Option<usize> {
        match role {
            AgentRole::Senior => Some(self.max_seniors),
            AgentRole::Intermediate => Some(self.max_intermediates),
            AgentRole::Junior => Some(self.max_juniors),
            AgentRole::TechLead | AgentRole::Qa => None,
        }
    }
}

/// Merge queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeQueueConfig {
    /// Merge approved PRs automatically
    #[serde(rename = "auto-merge")]
    pub auto_merge: bool,

    /// A reviewing PR must be this old before remote state overrides it
    #[serde(rename = "min-validation-age-secs")]
    pub min_validation_age_secs: u64,

    /// Reconcile with the hosting service every N ticks
    #[serde(rename = "sync-every-ticks")]
    pub sync_every_ticks: u64,

    /// QA agents spawned per team
    #[serde(rename = "max-qa-per-team")]
    pub max_qa_per_team: usize,
}

impl Default for MergeQueueConfig {
    fn default() -> Self {
        Self {
            auto_merge: true,
            min_validation_age_secs: 600,
            sync_every_ticks: 5,
            max_qa_per_team: 1,
        }
    }
}

impl MergeQueueConfig {
    pub fn min_validation_age_ms(&self) -> i64 {
        (self.min_validation_age_secs * 1000) as i64
    }
}

/// How much the manager may answer prompts on an agent's behalf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SafetyMode {
    /// Never answer permission prompts
    #[default]
    Safe,
    /// Approve permission prompts judged safe
    Auto,
}

/// Terminal session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Prefix for every session the manager owns
    pub prefix: String,

    /// Timeout for each session runtime command
    #[serde(rename = "command-timeout-ms")]
    pub command_timeout_ms: u64,

    /// Assistant used for new agents
    #[serde(rename = "default-tool")]
    pub default_tool: CliTool,

    /// Launch command per assistant
    pub commands: HashMap<CliTool, String>,

    /// Safety mode per role
    pub safety: HashMap<AgentRole, SafetyMode>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        let commands = HashMap::from([
            (CliTool::Claude, "claude".to_string()),
            (CliTool::Codex, "codex".to_string()),
            (CliTool::Gemini, "gemini".to_string()),
        ]);
        let safety = HashMap::from([
            (AgentRole::Junior, SafetyMode::Auto),
            (AgentRole::Intermediate, SafetyMode::Auto),
            (AgentRole::Qa, SafetyMode::Auto),
        ]);
        Self {
            prefix: "hive".to_string(),
            command_timeout_ms: 10_000,
            default_tool: CliTool::Claude,
            commands,
            safety,
        }
    }
}

impl SessionsConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn command_for(&self, tool: CliTool) -> String {
        self.commands.get(&tool).cloned().unwrap_or_else(|| tool.to_string())
    }

    pub fn safety_for(&self, role: AgentRole) -> SafetyMode {
        self.safety.get(&role).copied().unwrap_or_default()
    }
}

/// Code hosting CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    /// Binary used for hosting operations
    pub binary: String,

    #[serde(rename = "command-timeout-ms")]
    pub command_timeout_ms: u64,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            binary: "gh".to_string(),
            command_timeout_ms: 30_000,
        }
    }
}

/// Secondary classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Use the LLM classifier when an API key is available
    pub enabled: bool,

    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    #[serde(rename = "base-url")]
    pub base_url: String,

    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "claude-haiku-4-5".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 256,
            timeout_ms: 30_000,
        }
    }
}

impl ClassifierConfig {
    /// API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

/// Singleton lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// A lock whose heartbeat is older than this is reclaimable
    #[serde(rename = "stale-after-secs")]
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { stale_after_secs: 300 }
    }
}
