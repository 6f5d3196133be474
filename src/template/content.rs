//! Prior-phase content resolution.
//!
//! Later phases reference earlier output through template variables. Content
//! is resolved with a fixed precedence: the backend artifact store first,
//! then the per-task artifact file. Transcripts are never mined for content.
//! Specs live in the backend only, so worktrees cannot conflict on them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::backend::Backend;
use crate::codec::schema::{ReviewFindings, Severity};

use super::vars::TemplateVars;

/// Phase ids whose artifacts the backend is authoritative for.
const BACKEND_AUTHORITATIVE: &[&str] = &["spec", "tiny_spec", "research", "tdd_write", "breakdown"];

/// Resolves prior-phase content for template rendering.
pub struct ContentResolver {
    backend: Arc<dyn Backend>,
    task_dir: PathBuf,
}

impl ContentResolver {
    pub fn new(backend: Arc<dyn Backend>, task_dir: &Path) -> Self {
        Self {
            backend,
            task_dir: task_dir.to_path_buf(),
        }
    }

    /// Path of the on-disk artifact file for a phase.
    pub fn artifact_file(&self, phase_id: &str) -> PathBuf {
        self.task_dir.join("artifacts").join(format!("{phase_id}.md"))
    }

    /// Resolve one phase's content: backend first, artifact file second.
    pub async fn resolve(&self, task_id: &str, phase_id: &str) -> Result<Option<String>> {
        let artifacts = self
            .backend
            .load_all_artifacts(task_id)
            .await
            .context("loading artifacts from backend")?;
        if let Some(content) = artifacts.get(phase_id) {
            return Ok(Some(content.clone()));
        }

        // Specs never fall back to the filesystem.
        if BACKEND_AUTHORITATIVE[..2].contains(&phase_id) {
            return Ok(None);
        }

        let file = self.artifact_file(phase_id);
        if file.exists() {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading artifact file {}", file.display()))?;
            return Ok(Some(content));
        }
        Ok(None)
    }

    /// Fill the prior-phase content slots of a variable bag.
    pub async fn populate(&self, task_id: &str, mut vars: TemplateVars) -> Result<TemplateVars> {
        let artifacts = self
            .backend
            .load_all_artifacts(task_id)
            .await
            .context("loading artifacts from backend")?;

        vars.spec = self
            .backend
            .load_spec(task_id)
            .await?
            .or_else(|| artifacts.get("spec").cloned())
            .or_else(|| artifacts.get("tiny_spec").cloned())
            .unwrap_or_default();

        vars.research = self.from_store_or_file(&artifacts, "research")?;
        vars.breakdown = self.from_store_or_file(&artifacts, "breakdown")?;
        vars.tdd_tests = self.from_store_or_file(&artifacts, "tdd_write")?;
        vars.implement = self.from_store_or_file(&artifacts, "implement")?;
        vars.verification = artifacts.get("verification").cloned().unwrap_or_default();

        debug!(
            task_id,
            spec = !vars.spec.is_empty(),
            research = !vars.research.is_empty(),
            breakdown = !vars.breakdown.is_empty(),
            "resolved prior-phase content"
        );
        Ok(vars)
    }

    fn from_store_or_file(
        &self,
        artifacts: &HashMap<String, String>,
        phase_id: &str,
    ) -> Result<String> {
        if let Some(content) = artifacts.get(phase_id) {
            return Ok(content.clone());
        }
        let file = self.artifact_file(phase_id);
        if file.exists() {
            return std::fs::read_to_string(&file)
                .with_context(|| format!("reading artifact file {}", file.display()));
        }
        Ok(String::new())
    }

    /// Load and format findings from every round before `round`.
    pub async fn review_findings_for_round(&self, task_id: &str, round: u32) -> Result<String> {
        let mut all = Vec::new();
        for prior in 1..round {
            if let Some(findings) = self.backend.load_review_findings(task_id, prior).await? {
                all.push(findings);
            }
        }
        Ok(format_review_findings(&all))
    }
}

/// Format prior-round findings for the `{{REVIEW_FINDINGS}}` variable.
pub fn format_review_findings(rounds: &[ReviewFindings]) -> String {
    if rounds.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    for findings in rounds {
        let high = findings.count_by_severity(Severity::High);
        let medium = findings.count_by_severity(Severity::Medium);
        let low = findings.count_by_severity(Severity::Low);
        out.push_str(&format!(
            "## Round {} findings ({} high, {} medium, {} low)\n\n{}\n",
            findings.round, high, medium, low, findings.summary
        ));

        for issue in &findings.issues {
            out.push_str(&format!("\n- [{}]", issue.severity.as_str()));
            if let Some(file) = &issue.file {
                out.push_str(&format!(" {file}"));
                if let Some(line) = issue.line {
                    out.push_str(&format!(":{line}"));
                }
            }
            out.push_str(&format!(" {}", issue.description));
            if let Some(suggestion) = &issue.suggestion {
                out.push_str(&format!(" (suggestion: {suggestion})"));
            }
        }

        if !findings.positives.is_empty() {
            out.push_str("\n\nPositives:\n");
            for positive in &findings.positives {
                out.push_str(&format!("- {positive}\n"));
            }
        }
        if !findings.questions.is_empty() {
            out.push_str("\nQuestions:\n");
            for question in &findings.questions {
                out.push_str(&format!("- {question}\n"));
            }
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}
