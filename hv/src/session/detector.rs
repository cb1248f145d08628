//! Agent state detection from terminal output
//!
//! Classifies the visible tail of a session into a small state enum using
//! tool-specific prompt patterns. The result is advisory: the manager combines
//! it with output fingerprints over time and, for ambiguous cases, a secondary
//! classifier.

use eyre::Result;
use regex::Regex;
use serde::Serialize;

use crate::domain::CliTool;

/// Lines from the bottom of the capture that are considered "current"
const TAIL_LINES: usize = 15;

/// Lines from the bottom searched for busy indicators
const BUSY_LINES: usize = 6;

/// Classified state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentState {
    /// Assistant prompt is empty and waiting for input
    IdleAtPrompt,
    /// Assistant is working
    Thinking,
    /// Assistant asked the operator a question
    AskingQuestion,
    /// A numbered choice is on screen
    AwaitingSelection,
    /// Assistant finished planning and wants approval to execute
    PlanApproval,
    /// Assistant wants permission to run a tool
    PermissionRequired,
    /// Assistant reported the task as done
    WorkComplete,
    /// A tool call was declined or interrupted
    UserDeclined,
    /// The assistant exited back to a shell
    ToolExited,
    /// Nothing recognizable
    Unknown,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::IdleAtPrompt => "idle-at-prompt",
            Self::Thinking => "thinking",
            Self::AskingQuestion => "asking-question",
            Self::AwaitingSelection => "awaiting-selection",
            Self::PlanApproval => "plan-approval",
            Self::PermissionRequired => "permission-required",
            Self::WorkComplete => "work-complete",
            Self::UserDeclined => "user-declined",
            Self::ToolExited => "tool-exited",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Result of classifying one capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateDetection {
    pub state: AgentState,
    pub is_waiting: bool,
    pub needs_human: bool,
    pub reason: String,
}

impl StateDetection {
    fn new(state: AgentState, reason: impl Into<String>) -> Self {
        let (is_waiting, needs_human) = match state {
            AgentState::IdleAtPrompt => (true, false),
            AgentState::Thinking => (false, false),
            AgentState::AskingQuestion => (true, true),
            AgentState::AwaitingSelection => (true, true),
            AgentState::PlanApproval => (true, false),
            AgentState::PermissionRequired => (true, true),
            AgentState::WorkComplete => (true, false),
            AgentState::UserDeclined => (true, true),
            AgentState::ToolExited => (true, false),
            AgentState::Unknown => (false, false),
        };
        Self {
            state,
            is_waiting,
            needs_human,
            reason: reason.into(),
        }
    }

    /// Pattern matching cannot tell "done" from "stuck" for these states
    pub fn is_ambiguous(&self) -> bool {
        matches!(self.state, AgentState::IdleAtPrompt | AgentState::Unknown)
    }
}

struct ToolPatterns {
    busy: Vec<Regex>,
    permission: Vec<Regex>,
    plan: Vec<Regex>,
    idle: Vec<Regex>,
    declined: Vec<Regex>,
}

/// Compiled prompt patterns for every supported assistant
pub struct StateDetector {
    claude: ToolPatterns,
    codex: ToolPatterns,
    gemini: ToolPatterns,
    selection: Regex,
    complete: Regex,
    shell_prompt: Regex,
    dangerous: Vec<Regex>,
}

fn compile(patterns: &[&str]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| eyre::eyre!("Invalid pattern {}: {}", p, e)))
        .collect()
}

impl StateDetector {
    pub fn new() -> Result<Self> {
        let claude = ToolPatterns {
            busy: compile(&[
                r"(?i)esc to interrupt",
                r"^\s*[✻✶✳✢✽·*]\s+\w+(ing|ed)?…",
                r"(?i)\(\d+s\s*·.*tokens",
            ])?,
            permission: compile(&[
                r"Do you want to (proceed|make this edit|create|run|allow)",
                r"(?i)^\s*│?\s*Allow .+\?",
                r"(?i)don't ask again",
            ])?,
            plan: compile(&[
                r"(?i)Would you like to proceed\?",
                r"(?i)ready to code\?",
                r"(?i)auto-accept edits",
            ])?,
            idle: compile(&[r"^\s*│?\s*>\s*│?\s*$", r"\? for shortcuts", r"^\s*>\s*$"])?,
            declined: compile(&[
                r"(?i)user declined",
                r"(?i)interrupted by user",
                r"(?i)user rejected",
                r"(?i)tool use was rejected",
            ])?,
        };
        let codex = ToolPatterns {
            busy: compile(&[r"(?i)esc to interrupt", r"(?i)^\s*[•◦]?\s*working\s*\(", r"(?i)thinking…"])?,
            permission: compile(&[
                r"(?i)would you like to run the following command",
                r"(?i)allow command\?",
                r"(?i)approve .*\?",
                r"(?i)\(y\)es.*\(n\)o",
            ])?,
            plan: compile(&[r"(?i)proceed with (this|the) plan\?"])?,
            idle: compile(&[r"⏎ send", r"^\s*▌\s*$", r"(?i)send a message", r"^\s*›\s*$"])?,
            declined: compile(&[r"(?i)request denied", r"(?i)you canceled", r"(?i)aborted by user"])?,
        };
        let gemini = ToolPatterns {
            busy: compile(&[r"(?i)esc to cancel", r"[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]"])?,
            permission: compile(&[
                r"(?i)allow execution",
                r"(?i)apply this change\?",
                r"(?i)do you want to proceed\?",
            ])?,
            plan: compile(&[r"(?i)approve (this|the) plan\?"])?,
            idle: compile(&[r"(?i)type your message", r"^\s*│?\s*>\s*│?\s*$"])?,
            declined: compile(&[r"(?i)cancelled by user", r"(?i)user cancelled", r"(?i)request cancelled"])?,
        };

        Ok(Self {
            claude,
            codex,
            gemini,
            selection: Regex::new(r"^\s*│?\s*[❯>›]\s*\d+[.)]\s+\S")?,
            complete: Regex::new(
                r"(?i)\b(task complete|work complete|all tasks (are )?complete|implementation complete|pr (has been )?(created|submitted)|submitted pr)\b",
            )?,
            shell_prompt: Regex::new(r"^[\w.@:~/\-\[\] ]*[$%#]\s*$")?,
            dangerous: compile(&[
                r"rm\s+-[a-z]*r[a-z]*f|rm\s+-[a-z]*f[a-z]*r",
                r"(?i)\bsudo\b",
                r"git\s+push\s+.*(--force|-f\b)",
                r"git\s+reset\s+--hard",
                r"(?i)curl[^|]*\|\s*(ba|z)?sh",
                r"(?i)\bdrop\s+(table|database)\b",
                r"\bmkfs\b|\bdd\s+if=",
                r"chmod\s+-R\s+777",
            ])?,
        })
    }

    fn patterns(&self, tool: CliTool) -> &ToolPatterns {
        match tool {
            CliTool::Claude => &self.claude,
            CliTool::Codex => &self.codex,
            CliTool::Gemini => &self.gemini,
        }
    }

    /// Classify the visible tail of a session
    pub fn detect(&self, output: &str, tool: CliTool) -> StateDetection {
        let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.is_empty() {
            return StateDetection::new(AgentState::Unknown, "no output");
        }
        let tail = &lines[lines.len().saturating_sub(TAIL_LINES)..];
        let busy_tail = &lines[lines.len().saturating_sub(BUSY_LINES)..];
        let patterns = self.patterns(tool);

        if let Some(line) = find(busy_tail, &patterns.busy) {
            return StateDetection::new(AgentState::Thinking, format!("busy indicator: {}", line.trim()));
        }
        if let Some(line) = find(tail, &patterns.permission) {
            return StateDetection::new(AgentState::PermissionRequired, format!("permission prompt: {}", line.trim()));
        }
        if let Some(line) = find(tail, &patterns.plan) {
            return StateDetection::new(AgentState::PlanApproval, format!("plan approval: {}", line.trim()));
        }
        if let Some(line) = tail.iter().find(|l| self.selection.is_match(l)) {
            return StateDetection::new(AgentState::AwaitingSelection, format!("selection: {}", line.trim()));
        }

        let idle = find(tail, &patterns.idle).is_some();
        let last = lines[lines.len() - 1];
        if !idle && self.shell_prompt.is_match(last) {
            return StateDetection::new(AgentState::ToolExited, format!("shell prompt: {}", last.trim()));
        }
        if let Some(line) = find(tail, &patterns.declined) {
            return StateDetection::new(AgentState::UserDeclined, format!("declined: {}", line.trim()));
        }
        if let Some(line) = tail.iter().find(|l| self.complete.is_match(l)) {
            return StateDetection::new(AgentState::WorkComplete, format!("completion: {}", line.trim()));
        }
        if idle {
            if let Some(question) = last_assistant_line(tail, &patterns.idle).filter(|l| l.trim_end().ends_with('?')) {
                return StateDetection::new(AgentState::AskingQuestion, format!("question: {}", question.trim()));
            }
            return StateDetection::new(AgentState::IdleAtPrompt, "assistant prompt is empty");
        }
        StateDetection::new(AgentState::Unknown, "no known pattern")
    }

    /// Whether a permission prompt on screen only covers harmless operations
    pub fn permission_is_safe(&self, output: &str) -> bool {
        let lines: Vec<&str> = output.lines().collect();
        let tail = &lines[lines.len().saturating_sub(TAIL_LINES)..];
        !tail.iter().any(|l| self.dangerous.iter().any(|re| re.is_match(l)))
    }
}

fn find<'a>(lines: &[&'a str], patterns: &[Regex]) -> Option<&'a str> {
    lines
        .iter()
        .rev()
        .find(|l| patterns.iter().any(|re| re.is_match(l)))
        .copied()
}

/// Last line of assistant text above the input box
fn last_assistant_line<'a>(tail: &[&'a str], idle: &[Regex]) -> Option<&'a str> {
    tail.iter()
        .rev()
        .filter(|l| !idle.iter().any(|re| re.is_match(l)))
        .find(|l| {
            let t = l.trim();
            !t.chars().all(|c| "─│╭╮╰╯┌┐└┘━ ".contains(c))
        })
        .copied()
}
