//! Typed error hierarchy for the orc engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `CodecError` — structured-response parsing and validation failures
//! - `PhaseError` — per-phase execution failures
//! - `DriverError` — task-level driver failures
//!
//! `ErrorKind::classify` implements the lexical retry classification: a small
//! set of case-insensitive substrings decides whether an error is worth
//! retrying with backoff, and `RetryPolicy` owns the backoff schedule.

use std::time::Duration;
use thiserror::Error;

/// Errors from the response codec (parsing and artifact validation).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("response is not valid JSON: {message} (preview: {preview})")]
    InvalidJson { message: String, preview: String },

    #[error("response is missing required field '{field}' for the {schema} schema")]
    MissingField { field: String, schema: String },

    #[error("verification gate failed: {}", failures.join("; "))]
    VerificationFailed { failures: Vec<String> },

    #[error("spec quality checklist failed: {}", failures.join("; "))]
    QualityChecklistFailed { failures: Vec<String> },

    #[error(transparent)]
    SpecExtraction(#[from] SpecExtractionError),
}

impl CodecError {
    /// Feedback text to inject as the next iteration's prompt when the loop
    /// recovers from this error locally.
    pub fn retry_feedback(&self) -> String {
        match self {
            Self::InvalidJson { message, .. } => format!(
                "Your previous response was not valid JSON ({message}). Respond again with \
                 pure JSON matching the required schema - no markdown fences, no prose."
            ),
            Self::MissingField { field, schema } => format!(
                "Your previous response was missing the required '{field}' field for the \
                 {schema} schema. Respond again with the complete JSON structure."
            ),
            Self::VerificationFailed { failures } => format!(
                "Completion rejected - verification reported failures:\n- {}\nFix the failures, \
                 re-run verification, and report complete only when everything passes.",
                failures.join("\n- ")
            ),
            Self::QualityChecklistFailed { failures } => format!(
                "Completion rejected - the spec quality checklist has failing checks:\n- {}\n\
                 Revise the spec so every required check passes.",
                failures.join("\n- ")
            ),
            Self::SpecExtraction(err) => format!(
                "Completion rejected - {err}. Provide the full spec content in the 'content' \
                 field of your JSON response."
            ),
        }
    }
}

/// Structured failure produced when spec content fails validation.
///
/// Carried whole so the loop can feed every detail back to the agent as
/// retry context instead of a bare message.
#[derive(Debug, Clone, Error)]
#[error("spec content rejected: {reason} (length {length}, failed check: {validation_failure})")]
pub struct SpecExtractionError {
    pub reason: String,
    pub length: usize,
    pub preview: String,
    pub validation_failure: String,
}

/// Errors from a single phase execution.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("phase '{phase}' timed out after {timeout:?} (task {task_id}); task is resumable")]
    PhaseTimeout {
        phase: String,
        timeout: Duration,
        task_id: String,
    },

    #[error("max iterations reached after {iterations} iterations")]
    MaxIterations { iterations: u32 },

    #[error("progress validation stopped the phase: {reason}")]
    ProgressStop { reason: String },

    #[error("progress validator API error: {0}")]
    ValidatorApi(#[source] anyhow::Error),

    #[error("turn {iteration} failed: {source}")]
    TurnFailed {
        iteration: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to persist artifact for phase '{phase}': {source}")]
    ArtifactSave {
        phase: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("checkpoint error: {0}")]
    Checkpoint(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PhaseError {
    /// A phase timeout leaves the task resumable; it is terminal for this
    /// run but must not be retried in place.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::PhaseTimeout { .. })
    }
}

/// Errors from the task driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("task '{task_id}' has weight {weight} and requires a spec, but none exists")]
    MissingSpec { task_id: String, weight: String },

    #[error("phase dependency cycle involving: {phases:?}")]
    DependencyCycle { phases: Vec<String> },

    #[error("phase '{phase}' has malformed depends_on JSON: {source}")]
    MalformedDependsOn {
        phase: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown prompt source for phase '{phase}'")]
    UnknownPromptSource { phase: String },

    #[error("worktree setup failed: {0}")]
    Worktree(#[source] anyhow::Error),

    #[error("all accounts exhausted after rate limiting")]
    AccountsExhausted,

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    MaxRetries { attempts: u32, last_error: String },

    #[error("phase '{phase}' failed: {source}")]
    Phase {
        phase: String,
        #[source]
        source: PhaseError,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse error kinds driving the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimited,
    NetworkFailure,
    Timeout,
    PhaseTimeout,
    Unclassified,
}

impl ErrorKind {
    /// Lexical classification: case-insensitive substring match against the
    /// known retryable failure modes of LLM CLIs and hosted APIs.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();

        const RATE_LIMIT: &[&str] = &["rate limit", "usage limit", "too many requests", "429"];
        const NETWORK: &[&str] = &[
            "connection refused",
            "connection reset",
            "temporary failure",
            "service unavailable",
            "503",
            "504",
        ];

        if RATE_LIMIT.iter().any(|m| lower.contains(m)) {
            Self::RateLimited
        } else if NETWORK.iter().any(|m| lower.contains(m)) {
            Self::NetworkFailure
        } else if lower.contains("timeout") {
            Self::Timeout
        } else {
            Self::Unclassified
        }
    }

    /// Whether the driver should retry this kind with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::NetworkFailure | Self::Timeout
        )
    }
}

/// Credential pool seam. At most one credential is active per process; the
/// driver calls `switch_to_next_account` only from the rate-limit retry path.
pub trait CredentialPool: Send + Sync {
    /// Mark the current account exhausted and switch to the next one.
    /// Returns `false` when every account is exhausted. Idempotent.
    fn switch_to_next_account(&self) -> bool;
}

/// Exponential backoff schedule for retryable errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub factor: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            factor: 2.0,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Backoff duration before retry attempt `attempt` (1-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let secs = self.initial_backoff.as_secs_f64() * self.factor.powi(exp as i32);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }

    /// Reset-equivalent: the schedule restarted from attempt 1.
    pub fn first_backoff(&self) -> Duration {
        self.backoff(1)
    }
}
