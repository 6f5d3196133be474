//! The single LLM touchpoint.
//!
//! `TurnExecutor` runs exactly one agent turn under a session identity and
//! returns the raw content plus usage accounting. The engine never talks to
//! an LLM any other way; production wires a CLI/API client here, tests wire
//! scripted fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Token accounting for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    /// Effective input includes what was served from and written to cache.
    pub fn effective_input(&self) -> u64 {
        self.input_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens
    }
}

/// Completion status reported by the agent alongside its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Complete,
    Blocked,
    Continue,
}

/// Result of one executed turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    /// Raw response content. Pure JSON when `status` is `Complete` and a
    /// schema was supplied.
    pub content: String,
    pub session_id: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub error_text: Option<String>,
    #[serde(default)]
    pub status: Option<TurnStatus>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl TurnResult {
    /// Partial response text worth checkpointing even when the turn errored.
    pub fn partial_text(&self) -> &str {
        &self.content
    }
}

/// Executes one LLM turn. Implementations must be cancel-safe: dropping the
/// future aborts the underlying request.
#[async_trait]
pub trait TurnExecutor: Send + Sync {
    async fn execute_turn(&self, prompt: &str) -> anyhow::Result<TurnResult>;

    /// Adopt an externally assigned session id for subsequent turns.
    fn update_session_id(&self, session_id: &str);
}
