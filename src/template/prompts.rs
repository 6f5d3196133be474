//! Prompt template loading.
//!
//! Templates are addressed by logical path (`prompts/{phase}.md`) regardless
//! of where they physically live: compiled into the binary, inline on the
//! phase, a file on disk, or the backend. A template may open with a TOML
//! frontmatter block carrying execution overrides (model, thinking) that sit
//! between the phase's own overrides and the global defaults.

use std::sync::Arc;

use anyhow::{Context, Result};
use rust_embed::RustEmbed;
use serde::Deserialize;
use tracing::warn;

use crate::backend::Backend;
use crate::errors::DriverError;
use crate::task::{PhaseSpec, PromptSource};

/// Compiled-in phase prompt templates.
#[derive(RustEmbed)]
#[folder = "prompts/"]
struct EmbeddedPrompts;

/// Prompt sent on resumed or continued iterations instead of the full
/// template, so the agent is not re-fed context it already has.
pub const CONTINUATION_PROMPT: &str = "Continue working on the task.";

/// Sentinel token prepended to iteration-1 prompts when extended thinking is
/// enabled for the phase.
pub const EXTENDED_THINKING_SENTINEL: &str = "ultrathink";

/// Load the embedded template for a phase id, if one is compiled in.
pub fn embedded_template(phase_id: &str) -> Option<String> {
    EmbeddedPrompts::get(&format!("{phase_id}.md"))
        .map(|file| String::from_utf8_lossy(file.data.as_ref()).into_owned())
}

/// Execution overrides a template can declare in its frontmatter.
#[derive(Debug, Default, Deserialize)]
struct TemplateFrontmatter {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    thinking: Option<bool>,
}

/// A resolved prompt template: the renderable body plus the overrides the
/// template itself carries.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub body: String,
    pub model_override: Option<String>,
    pub thinking_override: Option<bool>,
}

impl PromptTemplate {
    /// Split an optional leading `---` TOML frontmatter block off the body.
    /// Malformed frontmatter is kept as literal body text.
    pub fn parse(text: &str) -> Self {
        let literal = || Self {
            body: text.to_string(),
            model_override: None,
            thinking_override: None,
        };

        let Some(rest) = text.strip_prefix("---\n") else {
            return literal();
        };
        let Some(end) = rest.find("\n---\n") else {
            return literal();
        };
        let header = &rest[..end];
        let body = rest[end + 5..].trim_start_matches('\n');

        match toml::from_str::<TemplateFrontmatter>(header) {
            Ok(frontmatter) => Self {
                body: body.to_string(),
                model_override: frontmatter.model,
                thinking_override: frontmatter.thinking,
            },
            Err(err) => {
                warn!(error = %err, "malformed template frontmatter; treating as body");
                literal()
            }
        }
    }
}

/// Resolves a phase's template from its configured source.
pub struct PromptResolver {
    backend: Arc<dyn Backend>,
}

impl PromptResolver {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub async fn resolve(&self, phase: &PhaseSpec) -> Result<PromptTemplate, DriverError> {
        let text = match &phase.prompt_source {
            PromptSource::Inline { text } => text.clone(),
            PromptSource::Embedded => {
                embedded_template(&phase.id).ok_or_else(|| DriverError::UnknownPromptSource {
                    phase: phase.id.clone(),
                })?
            }
            PromptSource::File { path } => std::fs::read_to_string(path)
                .with_context(|| format!("reading prompt template {path}"))
                .map_err(DriverError::Other)?,
            PromptSource::Database => self
                .backend
                .load_prompt_template(&phase.id)
                .await
                .map_err(DriverError::Other)?
                .ok_or_else(|| DriverError::UnknownPromptSource {
                    phase: phase.id.clone(),
                })?,
        };
        Ok(PromptTemplate::parse(&text))
    }
}
