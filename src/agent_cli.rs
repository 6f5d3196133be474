//! `TurnExecutor` over an agent CLI process.
//!
//! Spawns the configured agent command once per turn, writes the prompt to
//! stdin, and parses the JSON result envelope from stdout. Session identity
//! is passed with `--resume` so consecutive turns share one conversation.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::executor::{TokenUsage, TurnExecutor, TurnResult};

/// Result envelope printed by the agent CLI in `--output-format json` mode.
#[derive(Debug, Deserialize)]
struct ResultEnvelope {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    usage: EnvelopeUsage,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Default, Deserialize)]
struct EnvelopeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

/// Configuration for the CLI executor.
#[derive(Debug, Clone)]
pub struct AgentCliConfig {
    /// Binary to spawn, e.g. `claude`.
    pub command: String,
    /// Extra flags prepended before the output-format flags.
    pub flags: Vec<String>,
    /// Working directory for the agent (the task worktree).
    pub working_dir: PathBuf,
    /// Model passed with `--model` when set.
    pub model: Option<String>,
}

impl AgentCliConfig {
    pub fn new(command: &str, working_dir: &std::path::Path) -> Self {
        Self {
            command: command.to_string(),
            flags: vec!["--dangerously-skip-permissions".into()],
            working_dir: working_dir.to_path_buf(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    fn build_args(&self, session_id: Option<&str>) -> Vec<String> {
        let mut args = self.flags.clone();
        args.push("--print".into());
        args.push("--output-format".into());
        args.push("json".into());
        if let Some(model) = &self.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        if let Some(session) = session_id {
            args.push("--resume".into());
            args.push(session.to_string());
        }
        args
    }
}

/// Spawns the agent CLI for each turn.
pub struct AgentCliExecutor {
    config: AgentCliConfig,
    session_id: Mutex<Option<String>>,
}

impl AgentCliExecutor {
    pub fn new(config: AgentCliConfig) -> Self {
        Self {
            config,
            session_id: Mutex::new(None),
        }
    }

    fn parse_output(stdout: &str) -> Result<TurnResult> {
        let envelope: ResultEnvelope = serde_json::from_str(stdout.trim())
            .context("parsing agent CLI result envelope")?;
        Ok(TurnResult {
            content: envelope.result.unwrap_or_default(),
            session_id: envelope.session_id,
            usage: TokenUsage {
                input_tokens: envelope.usage.input_tokens,
                output_tokens: envelope.usage.output_tokens,
                cache_creation_input_tokens: envelope.usage.cache_creation_input_tokens,
                cache_read_input_tokens: envelope.usage.cache_read_input_tokens,
            },
            cost_usd: envelope.total_cost_usd,
            is_error: envelope.is_error,
            error_text: None,
            status: None,
            reason: None,
        })
    }
}

#[async_trait]
impl TurnExecutor for AgentCliExecutor {
    async fn execute_turn(&self, prompt: &str) -> Result<TurnResult> {
        let session = self.session_id.lock().unwrap().clone();
        let args = self.config.build_args(session.as_deref());
        debug!(command = %self.config.command, ?args, "spawning agent turn");

        let mut child = Command::new(&self.config.command)
            .args(&args)
            .current_dir(&self.config.working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", self.config.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("writing prompt to agent stdin")?;
            stdin.shutdown().await.context("closing agent stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("waiting for agent process")?;
        if !output.status.success() {
            bail!(
                "agent exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let result = Self::parse_output(&String::from_utf8_lossy(&output.stdout))?;
        if !result.session_id.is_empty() {
            *self.session_id.lock().unwrap() = Some(result.session_id.clone());
        }
        Ok(result)
    }

    fn update_session_id(&self, session_id: &str) {
        *self.session_id.lock().unwrap() = Some(session_id.to_string());
    }
}
