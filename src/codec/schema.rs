//! Phase completion schemas.
//!
//! Every phase reports completion through structured JSON. This module holds
//! the serde types for each schema variant and the selection table that maps
//! a `(phase_id, review_round)` pair to the schema the agent was asked to
//! fill. The codec in `mod.rs` is the single discriminator over the union.

use serde::{Deserialize, Serialize};

/// Which JSON schema the agent was prompted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseSchema {
    Default,
    ContentProducing,
    Verification,
    ReviewFindings,
    ReviewDecision,
    QaResult,
    E2e,
}

impl PhaseSchema {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::ContentProducing => "content-producing",
            Self::Verification => "verification",
            Self::ReviewFindings => "review-findings",
            Self::ReviewDecision => "review-decision",
            Self::QaResult => "qa-result",
            Self::E2e => "e2e",
        }
    }
}

/// Phase ids that produce prose content through the content schema.
pub const CONTENT_PHASES: &[&str] =
    &["spec", "tiny_spec", "research", "tdd_write", "breakdown", "docs"];

/// Phase ids whose content is a spec and must pass spec validation.
pub const SPEC_PHASES: &[&str] = &["spec", "tiny_spec"];

/// The authoritative schema selection table.
pub fn schema_for_phase(phase_id: &str, review_round: u32) -> PhaseSchema {
    if CONTENT_PHASES.contains(&phase_id) {
        return PhaseSchema::ContentProducing;
    }
    match phase_id {
        "implement" => PhaseSchema::Verification,
        "review" if review_round <= 1 => PhaseSchema::ReviewFindings,
        "review" => PhaseSchema::ReviewDecision,
        "qa" => PhaseSchema::QaResult,
        "qa_e2e_test" | "qa_e2e_fix" => PhaseSchema::E2e,
        _ => PhaseSchema::Default,
    }
}

/// Whether the phase id is a spec-producing phase.
pub fn is_spec_phase(phase_id: &str) -> bool {
    SPEC_PHASES.contains(&phase_id)
}

/// Agent-reported status shared by the default, content, and verification
/// schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Complete,
    Blocked,
    Continue,
}

/// Default schema: `{status, reason?, summary?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultResponse {
    pub status: ResponseStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// One entry of the spec quality checklist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityCheck {
    pub id: String,
    pub check: String,
    pub passed: bool,
}

/// Content-producing schema: default plus `content` and an optional quality
/// checklist (required for spec phases).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentResponse {
    pub status: ResponseStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub quality_checklist: Option<Vec<QualityCheck>>,
}

/// A PASS/FAIL/SKIP style outcome with optional evidence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckOutcome {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub evidence: Option<String>,
}

impl CheckOutcome {
    pub fn is_fail(&self) -> bool {
        self.status.eq_ignore_ascii_case("fail")
    }
}

/// One success criterion's verification outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionOutcome {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub evidence: Option<String>,
}

impl CriterionOutcome {
    pub fn is_fail(&self) -> bool {
        self.status.eq_ignore_ascii_case("fail")
    }
}

/// Verification evidence attached to an implement completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub tests: CheckOutcome,
    #[serde(default)]
    pub success_criteria: Vec<CriterionOutcome>,
    #[serde(default)]
    pub build: Option<CheckOutcome>,
    #[serde(default)]
    pub linting: Option<CheckOutcome>,
}

/// Verification schema: default plus the verification block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResponse {
    pub status: ResponseStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub verification: Option<Verification>,
}

/// Severity of a review issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// One issue raised in review round 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: Severity,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    pub description: String,
    #[serde(default)]
    pub suggestion: Option<String>,
}

/// Review round 1 findings schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewFindings {
    pub round: u32,
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub positives: Vec<String>,
    /// Findings responses may still declare themselves blocked.
    #[serde(default)]
    pub status: Option<String>,
}

impl ReviewFindings {
    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }
}

/// Decision reported by review rounds ≥ 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pass,
    Fail,
    NeedsUserInput,
}

/// Review round ≥ 2 decision schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub status: DecisionStatus,
    #[serde(default)]
    pub gaps_addressed: bool,
    pub summary: String,
    #[serde(default)]
    pub issues_resolved: Vec<String>,
    #[serde(default)]
    pub remaining_issues: Vec<String>,
    #[serde(default)]
    pub user_questions: Vec<String>,
    #[serde(default)]
    pub recommendation: Option<String>,
}

/// Verdict reported by the qa phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaStatus {
    Pass,
    Fail,
    NeedsAttention,
}

/// QA result schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaResponse {
    pub status: QaStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// E2E test/fix schema. Loosely structured; any well-formed response counts
/// as complete unless it declares itself blocked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct E2eResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}
