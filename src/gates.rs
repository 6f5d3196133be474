//! Gates that can reject an agent-claimed completion.
//!
//! Backpressure runs the project's deterministic checks (tests/lint/build);
//! the validator is an LLM judge for per-iteration progress and for the
//! success-criteria check on implement completions. Both are seams: the loop
//! only sees the verdicts.

use std::path::Path;

use async_trait::async_trait;

/// Result of the external deterministic check suite.
#[derive(Debug, Clone)]
pub struct BackpressureReport {
    pub passed: bool,
    /// Failure context fed back to the agent verbatim.
    pub summary: String,
}

impl BackpressureReport {
    pub fn pass() -> Self {
        Self { passed: true, summary: String::new() }
    }

    pub fn fail(summary: &str) -> Self {
        Self { passed: false, summary: summary.to_string() }
    }
}

/// Runs the project's tests/lint/build inside the worktree.
#[async_trait]
pub trait BackpressureRunner: Send + Sync {
    async fn run(&self, worktree: &Path) -> anyhow::Result<BackpressureReport>;
}

/// Verdict of the per-iteration progress validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressVerdict {
    /// The response is on track.
    Continue,
    /// Off track; redirect with this feedback.
    Retry { feedback: String },
    /// Unrecoverably off track; fail the phase.
    Stop { reason: String },
}

impl ProgressVerdict {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Retry { .. } => "retry",
            Self::Stop { .. } => "stop",
        }
    }
}

/// Verdict of the success-criteria check on an implement completion.
#[derive(Debug, Clone)]
pub struct CriteriaVerdict {
    pub all_met: bool,
    /// Feedback injected when criteria are unmet.
    pub feedback: String,
}

impl CriteriaVerdict {
    pub fn met() -> Self {
        Self { all_met: true, feedback: String::new() }
    }

    pub fn unmet(feedback: &str) -> Self {
        Self { all_met: false, feedback: feedback.to_string() }
    }
}

/// LLM judge for progress and criteria checks. Implementations typically run
/// a small fast model.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Judge the latest response against the spec.
    async fn validate_progress(
        &self,
        spec: &str,
        response: &str,
    ) -> anyhow::Result<ProgressVerdict>;

    /// Judge whether the response satisfies every success criterion.
    async fn validate_criteria(
        &self,
        spec: &str,
        response: &str,
    ) -> anyhow::Result<CriteriaVerdict>;
}
