//! Artifact validation for extracted phase content.
//!
//! Spec content is never accepted silently: it must clear a minimum length,
//! must not lead with conversational noise, and must look like a spec. The
//! implement verification block and the spec quality checklist are validated
//! here too, with failures formatted for feedback to the agent.

use crate::codec::schema::{QualityCheck, Verification};
use crate::errors::SpecExtractionError;

const MIN_SPEC_LENGTH: usize = 50;
const SECTIONLESS_MIN_LENGTH: usize = 200;

/// Markers that indicate protocol chatter leaked into spec content.
const NOISE_MARKERS: &[&str] = &[
    "\"status\":\"complete\"",
    "the working tree is clean",
    "spec is in conversation output",
];

/// Words a real spec contains at least one of (unless it is long enough to
/// stand without section headers).
const SECTION_WORDS: &[&str] = &[
    "intent",
    "success criteria",
    "testing",
    "scope",
    "requirements",
    "approach",
    "technical",
    "acceptance",
    "specification",
    "overview",
    "background",
];

/// Quality checklist entries that must pass for a spec to be accepted.
pub const REQUIRED_QUALITY_CHECKS: &[&str] = &[
    "all_criteria_verifiable",
    "no_existence_only_criteria",
    "p1_stories_independent",
    "scope_explicit",
    "max_3_clarifications",
];

fn preview(content: &str) -> String {
    const PREVIEW_LEN: usize = 120;
    let trimmed = content.trim();
    if trimmed.len() <= PREVIEW_LEN {
        trimmed.to_string()
    } else {
        let mut end = PREVIEW_LEN;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}

/// Validate extracted spec content.
pub fn validate_spec_content(content: &str) -> Result<(), SpecExtractionError> {
    let trimmed = content.trim();
    let length = trimmed.len();

    if length < MIN_SPEC_LENGTH {
        return Err(SpecExtractionError {
            reason: format!("content too short ({length}, need {MIN_SPEC_LENGTH})"),
            length,
            preview: preview(content),
            validation_failure: "min_length".into(),
        });
    }

    let lower = trimmed.to_lowercase();
    for marker in NOISE_MARKERS {
        if let Some(pos) = lower.find(marker) {
            let meaningful = trimmed[..pos].trim().len();
            if meaningful < MIN_SPEC_LENGTH {
                return Err(SpecExtractionError {
                    reason: format!(
                        "noise marker '{marker}' after only {meaningful} meaningful chars"
                    ),
                    length,
                    preview: preview(content),
                    validation_failure: "noise_marker".into(),
                });
            }
        }
    }

    let has_section = SECTION_WORDS.iter().any(|w| lower.contains(w));
    if !has_section && length < SECTIONLESS_MIN_LENGTH {
        return Err(SpecExtractionError {
            reason: format!(
                "no spec section words and content under {SECTIONLESS_MIN_LENGTH} chars"
            ),
            length,
            preview: preview(content),
            validation_failure: "missing_sections".into(),
        });
    }

    Ok(())
}

/// Required quality checks that failed or are missing. Empty means the
/// checklist passes.
pub fn quality_checklist_failures(checks: &[QualityCheck]) -> Vec<String> {
    REQUIRED_QUALITY_CHECKS
        .iter()
        .filter_map(|required| {
            match checks.iter().find(|c| c.id == *required) {
                Some(check) if check.passed => None,
                Some(check) => Some(format!("{}: {}", check.id, check.check)),
                None => Some(format!("{required}: missing from checklist")),
            }
        })
        .collect()
}

/// Items in the verification block that failed. Skipped statuses are
/// tolerated; only explicit FAILs reject the completion.
pub fn verification_failures(verification: &Verification) -> Vec<String> {
    let mut failures = Vec::new();

    if verification.tests.is_fail() {
        failures.push(format!(
            "tests: FAIL{}",
            verification
                .tests
                .evidence
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default()
        ));
    }

    for criterion in &verification.success_criteria {
        if criterion.is_fail() {
            failures.push(format!(
                "success criterion {}: FAIL{}",
                criterion.id,
                criterion
                    .evidence
                    .as_deref()
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default()
            ));
        }
    }

    if let Some(build) = &verification.build {
        if build.is_fail() {
            failures.push("build: FAIL".into());
        }
    }
    if let Some(linting) = &verification.linting {
        if linting.is_fail() {
            failures.push("linting: FAIL".into());
        }
    }

    failures
}
