//! Structured phase-response parsing.
//!
//! All JSON-schema variance hides behind one operation:
//! `PhaseResponseCodec::classify` selects the schema for the phase and review
//! round, parses the response strictly (pure JSON only - no fence stripping,
//! no brace matching), and maps it to a loop status. Parse and validation
//! failures are returned as typed errors; the loop turns them into
//! retry-with-feedback iterations.

pub mod schema;
pub mod validate;

use crate::errors::CodecError;
use schema::{
    ContentResponse, DecisionStatus, DefaultResponse, E2eResponse, PhaseSchema, QaResponse,
    QaStatus, QualityCheck, ResponseStatus, ReviewDecision, ReviewFindings, Verification,
    VerificationResponse, is_spec_phase, schema_for_phase,
};

/// Loop-facing classification of a turn response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Complete,
    Blocked,
    Continue,
}

/// Phase-specific payload extracted alongside the status.
#[derive(Debug, Clone)]
pub enum PhasePayload {
    None,
    Content {
        content: Option<String>,
        quality_checklist: Vec<QualityCheck>,
    },
    Verification(Verification),
    Findings(ReviewFindings),
    Decision(ReviewDecision),
    Qa(QaResponse),
}

impl PhasePayload {
    /// The artifact content this payload persists, if any.
    pub fn artifact_content(&self) -> Option<String> {
        match self {
            Self::Content { content, .. } => content.clone(),
            Self::Verification(v) => serde_json::to_string_pretty(v).ok(),
            Self::Findings(f) => serde_json::to_string_pretty(f).ok(),
            Self::Decision(d) => serde_json::to_string_pretty(d).ok(),
            Self::Qa(_) | Self::None => None,
        }
    }
}

/// Result of classifying one response.
#[derive(Debug, Clone)]
pub struct Classification {
    pub status: LoopStatus,
    pub reason: Option<String>,
    pub payload: PhasePayload,
    pub summary: Option<String>,
}

fn map_status(status: ResponseStatus) -> LoopStatus {
    match status {
        ResponseStatus::Complete => LoopStatus::Complete,
        ResponseStatus::Blocked => LoopStatus::Blocked,
        ResponseStatus::Continue => LoopStatus::Continue,
    }
}

fn json_preview(content: &str) -> String {
    const LEN: usize = 80;
    let trimmed = content.trim();
    if trimmed.len() <= LEN {
        trimmed.to_string()
    } else {
        let mut end = LEN;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}

fn parse_strict<T: serde::de::DeserializeOwned>(
    content: &str,
) -> Result<T, CodecError> {
    serde_json::from_str(content).map_err(|err| CodecError::InvalidJson {
        message: err.to_string(),
        preview: json_preview(content),
    })
}

/// The single discriminator over the phase-response union.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhaseResponseCodec;

impl PhaseResponseCodec {
    pub fn new() -> Self {
        Self
    }

    /// Classify a raw turn response for `(phase_id, review_round)`.
    pub fn classify(
        &self,
        phase_id: &str,
        review_round: u32,
        content: &str,
    ) -> Result<Classification, CodecError> {
        match schema_for_phase(phase_id, review_round) {
            PhaseSchema::ContentProducing => self.classify_content(phase_id, content),
            PhaseSchema::Verification => self.classify_verification(content),
            PhaseSchema::ReviewFindings => self.classify_findings(content),
            PhaseSchema::ReviewDecision => self.classify_decision(content),
            PhaseSchema::QaResult => self.classify_qa(content),
            PhaseSchema::E2e => self.classify_e2e(content),
            PhaseSchema::Default => self.classify_default(content),
        }
    }

    fn classify_default(&self, content: &str) -> Result<Classification, CodecError> {
        let response: DefaultResponse = parse_strict(content)?;
        Ok(Classification {
            status: map_status(response.status),
            reason: response.reason,
            payload: PhasePayload::None,
            summary: response.summary,
        })
    }

    fn classify_content(
        &self,
        phase_id: &str,
        content: &str,
    ) -> Result<Classification, CodecError> {
        let response: ContentResponse = parse_strict(content)?;
        let status = map_status(response.status);

        if status == LoopStatus::Complete {
            let body = response.content.as_deref().unwrap_or("");
            if response.content.is_none() {
                return Err(CodecError::MissingField {
                    field: "content".into(),
                    schema: PhaseSchema::ContentProducing.name().into(),
                });
            }

            if is_spec_phase(phase_id) {
                validate::validate_spec_content(body)?;
                let checklist = response.quality_checklist.as_deref().ok_or_else(|| {
                    CodecError::MissingField {
                        field: "quality_checklist".into(),
                        schema: PhaseSchema::ContentProducing.name().into(),
                    }
                })?;
                let failures = validate::quality_checklist_failures(checklist);
                if !failures.is_empty() {
                    return Err(CodecError::QualityChecklistFailed { failures });
                }
            }
        }

        Ok(Classification {
            status,
            reason: response.reason,
            payload: PhasePayload::Content {
                content: response.content,
                quality_checklist: response.quality_checklist.unwrap_or_default(),
            },
            summary: response.summary,
        })
    }

    fn classify_verification(&self, content: &str) -> Result<Classification, CodecError> {
        let response: VerificationResponse = parse_strict(content)?;
        let status = map_status(response.status);

        if status == LoopStatus::Complete {
            let verification = response.verification.ok_or_else(|| CodecError::MissingField {
                field: "verification".into(),
                schema: PhaseSchema::Verification.name().into(),
            })?;
            let failures = validate::verification_failures(&verification);
            if !failures.is_empty() {
                return Err(CodecError::VerificationFailed { failures });
            }
            return Ok(Classification {
                status,
                reason: response.reason,
                payload: PhasePayload::Verification(verification),
                summary: response.summary,
            });
        }

        Ok(Classification {
            status,
            reason: response.reason,
            payload: match response.verification {
                Some(v) => PhasePayload::Verification(v),
                None => PhasePayload::None,
            },
            summary: response.summary,
        })
    }

    fn classify_findings(&self, content: &str) -> Result<Classification, CodecError> {
        let findings: ReviewFindings = parse_strict(content)?;
        let blocked = findings
            .status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("blocked"));
        let summary = findings.summary.clone();
        Ok(Classification {
            status: if blocked { LoopStatus::Blocked } else { LoopStatus::Complete },
            reason: blocked.then(|| summary.clone()),
            payload: PhasePayload::Findings(findings),
            summary: Some(summary),
        })
    }

    fn classify_decision(&self, content: &str) -> Result<Classification, CodecError> {
        let decision: ReviewDecision = parse_strict(content)?;
        let status = match decision.status {
            DecisionStatus::Pass => LoopStatus::Complete,
            DecisionStatus::Fail | DecisionStatus::NeedsUserInput => LoopStatus::Blocked,
        };
        let reason = match status {
            LoopStatus::Blocked => Some(
                decision
                    .recommendation
                    .clone()
                    .unwrap_or_else(|| decision.summary.clone()),
            ),
            _ => None,
        };
        let summary = decision.summary.clone();
        Ok(Classification {
            status,
            reason,
            payload: PhasePayload::Decision(decision),
            summary: Some(summary),
        })
    }

    fn classify_qa(&self, content: &str) -> Result<Classification, CodecError> {
        let response: QaResponse = parse_strict(content)?;
        let status = match response.status {
            QaStatus::Pass => LoopStatus::Complete,
            QaStatus::Fail | QaStatus::NeedsAttention => LoopStatus::Blocked,
        };
        let reason = match status {
            LoopStatus::Blocked => response.reason.clone().or_else(|| response.summary.clone()),
            _ => None,
        };
        let summary = response.summary.clone();
        Ok(Classification {
            status,
            reason,
            payload: PhasePayload::Qa(response),
            summary,
        })
    }

    fn classify_e2e(&self, content: &str) -> Result<Classification, CodecError> {
        let response: E2eResponse = parse_strict(content)?;
        let blocked = response
            .status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("blocked"));
        Ok(Classification {
            status: if blocked { LoopStatus::Blocked } else { LoopStatus::Complete },
            reason: blocked.then(|| {
                response
                    .reason
                    .clone()
                    .or_else(|| response.summary.clone())
                    .unwrap_or_else(|| "blocked".into())
            }),
            payload: PhasePayload::None,
            summary: response.summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> PhaseResponseCodec {
        PhaseResponseCodec::new()
    }

    const VALID_SPEC: &str = "# Overview\nAdd order search with filters.\n\n## Success criteria\n- results under 200ms\n- pagination works";

    fn spec_response(content: &str) -> String {
        let checklist: Vec<serde_json::Value> = validate::REQUIRED_QUALITY_CHECKS
            .iter()
            .map(|id| serde_json::json!({"id": id, "check": id, "passed": true}))
            .collect();
        serde_json::json!({
            "status": "complete",
            "content": content,
            "quality_checklist": checklist,
        })
        .to_string()
    }

    // =========================================
    // Strict parsing
    // =========================================

    #[test]
    fn rejects_markdown_fenced_json() {
        let fenced = "```json\n{\"status\":\"complete\"}\n```";
        let err = codec().classify("test", 1, fenced).unwrap_err();
        assert!(matches!(err, CodecError::InvalidJson { .. }));
    }

    #[test]
    fn rejects_prose_around_json() {
        let wrapped = "Here is my result: {\"status\":\"complete\"}";
        let err = codec().classify("test", 1, wrapped).unwrap_err();
        assert!(matches!(err, CodecError::InvalidJson { .. }));
    }

    #[test]
    fn parse_error_feedback_mentions_json() {
        let err = codec().classify("test", 1, "not json").unwrap_err();
        assert!(err.retry_feedback().contains("pure JSON"));
    }

    // =========================================
    // Default schema
    // =========================================

    #[test]
    fn default_schema_maps_statuses() {
        let complete = codec()
            .classify("test", 1, r#"{"status":"complete"}"#)
            .unwrap();
        assert_eq!(complete.status, LoopStatus::Complete);

        let blocked = codec()
            .classify("finalize", 1, r#"{"status":"blocked","reason":"need creds"}"#)
            .unwrap();
        assert_eq!(blocked.status, LoopStatus::Blocked);
        assert_eq!(blocked.reason.as_deref(), Some("need creds"));

        let cont = codec()
            .classify("validate", 1, r#"{"status":"continue"}"#)
            .unwrap();
        assert_eq!(cont.status, LoopStatus::Continue);
    }

    // =========================================
    // Content schema
    // =========================================

    #[test]
    fn research_complete_without_content_is_missing_field() {
        let err = codec()
            .classify("research", 1, r#"{"status":"complete"}"#)
            .unwrap_err();
        assert!(matches!(err, CodecError::MissingField { ref field, .. } if field == "content"));
    }

    #[test]
    fn research_complete_extracts_content() {
        let response = "{\"status\":\"complete\",\"content\":\"## Findings\\nThe codebase uses axum.\"}";
        let result = codec().classify("research", 1, response).unwrap();
        assert_eq!(result.status, LoopStatus::Complete);
        assert_eq!(
            result.payload.artifact_content().as_deref(),
            Some("## Findings\nThe codebase uses axum.")
        );
    }

    #[test]
    fn spec_content_too_short_is_rejected() {
        let response = spec_response("way too short spec");
        let err = codec().classify("spec", 1, &response).unwrap_err();
        match err {
            CodecError::SpecExtraction(inner) => {
                assert!(inner.reason.contains("content too short (18, need 50)"));
            }
            other => panic!("expected SpecExtraction, got {other}"),
        }
    }

    #[test]
    fn spec_without_checklist_is_missing_field() {
        let response = serde_json::json!({
            "status": "complete",
            "content": VALID_SPEC,
        })
        .to_string();
        let err = codec().classify("spec", 1, &response).unwrap_err();
        assert!(
            matches!(err, CodecError::MissingField { ref field, .. } if field == "quality_checklist")
        );
    }

    #[test]
    fn spec_with_failing_checklist_is_rejected_with_feedback() {
        let mut checklist: Vec<serde_json::Value> = validate::REQUIRED_QUALITY_CHECKS
            .iter()
            .map(|id| serde_json::json!({"id": id, "check": id, "passed": true}))
            .collect();
        checklist[0] = serde_json::json!({
            "id": "all_criteria_verifiable",
            "check": "every criterion is verifiable",
            "passed": false,
        });
        let response = serde_json::json!({
            "status": "complete",
            "content": VALID_SPEC,
            "quality_checklist": checklist,
        })
        .to_string();

        let err = codec().classify("spec", 1, &response).unwrap_err();
        assert!(matches!(err, CodecError::QualityChecklistFailed { .. }));
        assert!(err.retry_feedback().contains("all_criteria_verifiable"));
    }

    #[test]
    fn valid_spec_completes() {
        let response = spec_response(VALID_SPEC);
        let result = codec().classify("spec", 1, &response).unwrap();
        assert_eq!(result.status, LoopStatus::Complete);
    }

    #[test]
    fn tiny_spec_uses_same_rules() {
        let response = spec_response("nope");
        assert!(codec().classify("tiny_spec", 1, &response).is_err());
    }

    #[test]
    fn spec_continue_does_not_validate() {
        // Mid-phase continues carry no content yet; validation only fires on complete.
        let result = codec()
            .classify("spec", 1, r#"{"status":"continue"}"#)
            .unwrap();
        assert_eq!(result.status, LoopStatus::Continue);
    }

    // =========================================
    // Verification schema
    // =========================================

    #[test]
    fn implement_complete_without_verification_is_missing_field() {
        let err = codec()
            .classify("implement", 1, r#"{"status":"complete"}"#)
            .unwrap_err();
        assert!(
            matches!(err, CodecError::MissingField { ref field, .. } if field == "verification")
        );
    }

    #[test]
    fn implement_with_failing_tests_is_gate_failure() {
        let response = serde_json::json!({
            "status": "complete",
            "verification": {
                "tests": {"status": "FAIL", "evidence": "2 failures in auth::tests"},
                "success_criteria": [{"id": "SC-1", "status": "PASS"}],
            }
        })
        .to_string();
        let err = codec().classify("implement", 1, &response).unwrap_err();
        match &err {
            CodecError::VerificationFailed { failures } => {
                assert!(failures[0].contains("auth::tests"));
            }
            other => panic!("expected VerificationFailed, got {other}"),
        }
        assert!(err.retry_feedback().contains("Completion rejected"));
    }

    #[test]
    fn implement_with_passing_verification_completes() {
        let response = serde_json::json!({
            "status": "complete",
            "verification": {
                "tests": {"status": "PASS", "command": "cargo test"},
                "success_criteria": [
                    {"id": "SC-1", "status": "PASS"},
                    {"id": "SC-2", "status": "SKIP"},
                ],
                "build": {"status": "PASS"},
            }
        })
        .to_string();
        let result = codec().classify("implement", 1, &response).unwrap();
        assert_eq!(result.status, LoopStatus::Complete);
        assert!(matches!(result.payload, PhasePayload::Verification(_)));
    }

    // =========================================
    // Review schemas
    // =========================================

    #[test]
    fn review_round_1_any_wellformed_response_completes() {
        let response = serde_json::json!({
            "round": 1,
            "summary": "Found 2 issues",
            "issues": [
                {"severity": "high", "description": "SQL injection in search"},
                {"severity": "medium", "description": "Missing index"},
            ],
        })
        .to_string();
        let result = codec().classify("review", 1, &response).unwrap();
        assert_eq!(result.status, LoopStatus::Complete);
        match result.payload {
            PhasePayload::Findings(f) => assert_eq!(f.issues.len(), 2),
            other => panic!("expected Findings, got {other:?}"),
        }
    }

    #[test]
    fn review_round_1_blocked_status_blocks() {
        let response = serde_json::json!({
            "round": 1,
            "summary": "cannot review - build broken",
            "status": "blocked",
        })
        .to_string();
        let result = codec().classify("review", 1, &response).unwrap();
        assert_eq!(result.status, LoopStatus::Blocked);
    }

    #[test]
    fn review_round_2_pass_completes_fail_blocks() {
        let pass = serde_json::json!({
            "status": "pass", "gaps_addressed": true, "summary": "all fixed",
        })
        .to_string();
        assert_eq!(
            codec().classify("review", 2, &pass).unwrap().status,
            LoopStatus::Complete
        );

        let fail = serde_json::json!({
            "status": "fail",
            "gaps_addressed": false,
            "summary": "issues remain",
            "remaining_issues": ["SQL injection not fixed"],
            "recommendation": "fix injection before merge",
        })
        .to_string();
        let result = codec().classify("review", 2, &fail).unwrap();
        assert_eq!(result.status, LoopStatus::Blocked);
        assert_eq!(result.reason.as_deref(), Some("fix injection before merge"));
    }

    #[test]
    fn review_round_2_needs_user_input_blocks() {
        let response = serde_json::json!({
            "status": "needs_user_input",
            "gaps_addressed": false,
            "summary": "design question",
            "user_questions": ["should deletes cascade?"],
        })
        .to_string();
        let result = codec().classify("review", 2, &response).unwrap();
        assert_eq!(result.status, LoopStatus::Blocked);
    }

    // =========================================
    // QA and e2e schemas
    // =========================================

    #[test]
    fn qa_statuses_map() {
        let pass = r#"{"status":"pass","summary":"all good"}"#;
        assert_eq!(codec().classify("qa", 1, pass).unwrap().status, LoopStatus::Complete);

        let fail = r#"{"status":"fail","reason":"login broken"}"#;
        let result = codec().classify("qa", 1, fail).unwrap();
        assert_eq!(result.status, LoopStatus::Blocked);
        assert_eq!(result.reason.as_deref(), Some("login broken"));

        let attention = r#"{"status":"needs_attention","summary":"flaky"}"#;
        assert_eq!(
            codec().classify("qa", 1, attention).unwrap().status,
            LoopStatus::Blocked
        );
    }

    #[test]
    fn e2e_wellformed_completes_unless_blocked() {
        let done = r#"{"summary":"12 scenarios green"}"#;
        assert_eq!(
            codec().classify("qa_e2e_test", 1, done).unwrap().status,
            LoopStatus::Complete
        );

        let blocked = r#"{"status":"blocked","reason":"no display server"}"#;
        let result = codec().classify("qa_e2e_fix", 1, blocked).unwrap();
        assert_eq!(result.status, LoopStatus::Blocked);
        assert_eq!(result.reason.as_deref(), Some("no display server"));
    }
}
