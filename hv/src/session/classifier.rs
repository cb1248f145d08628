//! Secondary stuck/done classifier
//!
//! Consulted only when a session's output has been unchanged past the
//! inactivity threshold and pattern detection is ambiguous. An error from the
//! classifier is treated by the manager as "needs a human"; there is no retry
//! loop here.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ClassifierConfig;

/// Verdict on a stalled session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckVerdict {
    /// The agent finished and can be moved along
    Done,
    /// The agent cannot make progress on its own
    Stuck,
}

impl std::fmt::Display for StuckVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::Stuck => write!(f, "stuck"),
        }
    }
}

/// Errors from a classifier
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Classifier timed out after {0:?}")]
    Timeout(Duration),

    #[error("Classifier API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Classifier network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unrecognized classifier answer: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait StuckClassifier: Send + Sync {
    /// Decide whether a stalled session is done or stuck
    async fn classify(&self, output: &str) -> Result<StuckVerdict, ClassifierError>;

    fn name(&self) -> &'static str;
}

/// Pick the classifier the configuration allows
pub fn classifier_from_config(config: &ClassifierConfig) -> Arc<dyn StuckClassifier> {
    debug!(enabled = config.enabled, "classifier_from_config: called");
    if config.enabled
        && let Some(api_key) = config.api_key()
    {
        match LlmClassifier::new(config, api_key) {
            Ok(classifier) => {
                info!(model = %config.model, "Using LLM stuck classifier");
                return Arc::new(classifier);
            }
            Err(e) => warn!(error = %e, "Failed to build LLM classifier, using heuristics"),
        }
    }
    info!("Using heuristic stuck classifier");
    Arc::new(HeuristicClassifier)
}

const SYSTEM_PROMPT: &str = "You watch the terminal of an autonomous coding agent that has produced no new \
output for several minutes. Decide whether it has finished its task (DONE) or cannot continue without help \
(STUCK). Answer with exactly one word: DONE or STUCK.";

/// Classifier backed by the Anthropic Messages API
pub struct LlmClassifier {
    model: String,
    api_key: String,
    base_url: String,
    http: Client,
    max_tokens: u32,
    timeout: Duration,
}

impl LlmClassifier {
    pub fn new(config: &ClassifierConfig, api_key: String) -> Result<Self, ClassifierError> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            model: config.model.clone(),
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
            max_tokens: config.max_tokens,
            timeout,
        })
    }

    fn build_request_body(&self, output: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": SYSTEM_PROMPT,
            "messages": [{
                "role": "user",
                "content": format!("Terminal output:\n```\n{}\n```", output),
            }],
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

fn parse_verdict(text: &str) -> Result<StuckVerdict, ClassifierError> {
    let upper = text.trim().to_uppercase();
    match (upper.contains("DONE"), upper.contains("STUCK")) {
        (true, false) => Ok(StuckVerdict::Done),
        (false, true) => Ok(StuckVerdict::Stuck),
        _ => Err(ClassifierError::InvalidResponse(text.trim().to_string())),
    }
}

#[async_trait]
impl StuckClassifier for LlmClassifier {
    async fn classify(&self, output: &str) -> Result<StuckVerdict, ClassifierError> {
        debug!(model = %self.model, len = output.len(), "LlmClassifier::classify: called");
        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .http
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&self.build_request_body(output))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifierError::Timeout(self.timeout)
                } else {
                    ClassifierError::Network(e)
                }
            })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClassifierError::ApiError { status, message });
        }

        let body: MessagesResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ClassifierError::Timeout(self.timeout)
            } else {
                ClassifierError::Network(e)
            }
        })?;
        let text: String = body
            .content
            .into_iter()
            .filter_map(|b| match b {
                ResponseBlock::Text { text } => Some(text),
                ResponseBlock::Other => None,
            })
            .collect();
        parse_verdict(&text)
    }

    fn name(&self) -> &'static str {
        "llm"
    }
}

/// Keyword classifier used without an API key
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

const DONE_MARKERS: &[&str] = &[
    "task complete",
    "work complete",
    "all tests pass",
    "pr submitted",
    "pull request created",
    "ready for review",
    "implementation is complete",
    "successfully completed",
];

#[async_trait]
impl StuckClassifier for HeuristicClassifier {
    async fn classify(&self, output: &str) -> Result<StuckVerdict, ClassifierError> {
        let tail: String = output
            .lines()
            .rev()
            .take(20)
            .collect::<Vec<_>>()
            .join("\n")
            .to_lowercase();
        if DONE_MARKERS.iter().any(|m| tail.contains(m)) {
            Ok(StuckVerdict::Done)
        } else {
            Ok(StuckVerdict::Stuck)
        }
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}
