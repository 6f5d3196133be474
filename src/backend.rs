//! Persistent storage contract and records.
//!
//! The engine treats storage as opaque: everything it needs is expressed on
//! the `Backend` trait, and the schema behind it is the implementation's
//! business. `MemoryBackend` is a complete in-process implementation used by
//! tests and dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::codec::schema::ReviewFindings;

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Token, cache, and cost totals. Used both per-run and per-phase; run totals
/// are always the sum of the phase totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation: u64,
    pub cache_read: u64,
    pub cost_usd: f64,
}

impl UsageTotals {
    pub fn add(&mut self, other: &UsageTotals) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation += other.cache_creation;
        self.cache_read += other.cache_read;
        self.cost_usd += other.cost_usd;
    }
}

/// One end-to-end attempt for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub task_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub totals: UsageTotals,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(task_id: &str) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            status: RunStatus::Pending,
            totals: UsageTotals::default(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Per-phase slice of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunPhase {
    pub run_id: String,
    pub task_id: String,
    pub phase_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub totals: UsageTotals,
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Structured phase output saved alongside the artifact store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseOutput {
    pub run_id: String,
    pub phase_id: String,
    pub task_id: String,
    pub content: String,
    pub var_name: String,
    pub artifact_type: String,
    pub source: String,
}

/// One transcript line streamed to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub task_id: String,
    pub phase_id: String,
    pub iteration: u32,
    pub role: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Initiative context attached to tasks that belong to a larger effort.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Initiative {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub vision: String,
}

/// Detected project metadata fed into prompt templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectDetection {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub framework: String,
    #[serde(default)]
    pub has_frontend: bool,
    #[serde(default)]
    pub test_command: String,
    #[serde(default)]
    pub lint_command: String,
    #[serde(default)]
    pub build_command: String,
}

/// Best-effort global cost accounting entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEntry {
    pub task_id: String,
    pub phase_id: String,
    pub model: String,
    pub usage: UsageTotals,
    pub timestamp: DateTime<Utc>,
}

/// Storage contract used by the engine. Implementations must serialise writes
/// per `(task, phase)`.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn save_spec(&self, task_id: &str, content: &str, source: &str) -> anyhow::Result<()>;
    async fn load_spec(&self, task_id: &str) -> anyhow::Result<Option<String>>;
    async fn spec_exists(&self, task_id: &str) -> anyhow::Result<bool>;

    async fn save_phase_output(&self, output: PhaseOutput) -> anyhow::Result<()>;
    async fn save_artifact(&self, task_id: &str, phase_id: &str, content: &str)
    -> anyhow::Result<()>;
    async fn load_all_artifacts(&self, task_id: &str) -> anyhow::Result<HashMap<String, String>>;

    async fn save_review_findings(
        &self,
        task_id: &str,
        round: u32,
        findings: &ReviewFindings,
    ) -> anyhow::Result<()>;
    async fn load_review_findings(
        &self,
        task_id: &str,
        round: u32,
    ) -> anyhow::Result<Option<ReviewFindings>>;

    async fn save_workflow_run(&self, run: &WorkflowRun) -> anyhow::Result<()>;
    async fn save_workflow_run_phase(&self, phase: &WorkflowRunPhase) -> anyhow::Result<()>;

    async fn add_transcript(&self, record: TranscriptRecord) -> anyhow::Result<()>;

    async fn load_initiative(&self, id: &str) -> anyhow::Result<Option<Initiative>>;
    async fn load_constitution(&self) -> anyhow::Result<Option<String>>;
    async fn load_detection(&self) -> anyhow::Result<Option<ProjectDetection>>;

    /// Best-effort; callers log and continue on failure.
    async fn record_cost_extended(&self, entry: CostEntry) -> anyhow::Result<()>;

    /// Templates for phases whose prompt source is the backend.
    async fn load_prompt_template(&self, phase_id: &str) -> anyhow::Result<Option<String>>;
}

#[derive(Default)]
struct MemoryStore {
    specs: HashMap<String, String>,
    artifacts: HashMap<(String, String), String>,
    phase_outputs: Vec<PhaseOutput>,
    findings: HashMap<(String, u32), ReviewFindings>,
    runs: HashMap<String, WorkflowRun>,
    run_phases: HashMap<(String, String), WorkflowRunPhase>,
    transcripts: Vec<TranscriptRecord>,
    initiatives: HashMap<String, Initiative>,
    constitution: Option<String>,
    detection: Option<ProjectDetection>,
    costs: Vec<CostEntry>,
    prompt_templates: HashMap<String, String>,
}

/// In-process backend for tests and dry runs.
#[derive(Default)]
pub struct MemoryBackend {
    store: Mutex<MemoryStore>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_constitution(self, content: &str) -> Self {
        self.store.lock().unwrap().constitution = Some(content.to_string());
        self
    }

    pub fn with_detection(self, detection: ProjectDetection) -> Self {
        self.store.lock().unwrap().detection = Some(detection);
        self
    }

    pub fn with_initiative(self, initiative: Initiative) -> Self {
        self.store
            .lock()
            .unwrap()
            .initiatives
            .insert(initiative.id.clone(), initiative);
        self
    }

    pub fn with_prompt_template(self, phase_id: &str, template: &str) -> Self {
        self.store
            .lock()
            .unwrap()
            .prompt_templates
            .insert(phase_id.to_string(), template.to_string());
        self
    }

    pub fn runs(&self) -> Vec<WorkflowRun> {
        self.store.lock().unwrap().runs.values().cloned().collect()
    }

    pub fn run_phase(&self, run_id: &str, phase_id: &str) -> Option<WorkflowRunPhase> {
        self.store
            .lock()
            .unwrap()
            .run_phases
            .get(&(run_id.to_string(), phase_id.to_string()))
            .cloned()
    }

    pub fn transcript_count(&self) -> usize {
        self.store.lock().unwrap().transcripts.len()
    }

    pub fn cost_entries(&self) -> Vec<CostEntry> {
        self.store.lock().unwrap().costs.clone()
    }

    pub fn artifact(&self, task_id: &str, phase_id: &str) -> Option<String> {
        self.store
            .lock()
            .unwrap()
            .artifacts
            .get(&(task_id.to_string(), phase_id.to_string()))
            .cloned()
    }

    pub fn artifact_count(&self, task_id: &str, phase_id: &str) -> usize {
        let store = self.store.lock().unwrap();
        usize::from(
            store
                .artifacts
                .contains_key(&(task_id.to_string(), phase_id.to_string())),
        )
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn save_spec(&self, task_id: &str, content: &str, _source: &str) -> anyhow::Result<()> {
        self.store
            .lock()
            .unwrap()
            .specs
            .insert(task_id.to_string(), content.to_string());
        Ok(())
    }

    async fn load_spec(&self, task_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.store.lock().unwrap().specs.get(task_id).cloned())
    }

    async fn spec_exists(&self, task_id: &str) -> anyhow::Result<bool> {
        Ok(self.store.lock().unwrap().specs.contains_key(task_id))
    }

    async fn save_phase_output(&self, output: PhaseOutput) -> anyhow::Result<()> {
        self.store.lock().unwrap().phase_outputs.push(output);
        Ok(())
    }

    async fn save_artifact(
        &self,
        task_id: &str,
        phase_id: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        self.store
            .lock()
            .unwrap()
            .artifacts
            .insert((task_id.to_string(), phase_id.to_string()), content.to_string());
        Ok(())
    }

    async fn load_all_artifacts(&self, task_id: &str) -> anyhow::Result<HashMap<String, String>> {
        let store = self.store.lock().unwrap();
        Ok(store
            .artifacts
            .iter()
            .filter(|((t, _), _)| t == task_id)
            .map(|((_, phase), content)| (phase.clone(), content.clone()))
            .collect())
    }

    async fn save_review_findings(
        &self,
        task_id: &str,
        round: u32,
        findings: &ReviewFindings,
    ) -> anyhow::Result<()> {
        self.store
            .lock()
            .unwrap()
            .findings
            .insert((task_id.to_string(), round), findings.clone());
        Ok(())
    }

    async fn load_review_findings(
        &self,
        task_id: &str,
        round: u32,
    ) -> anyhow::Result<Option<ReviewFindings>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .findings
            .get(&(task_id.to_string(), round))
            .cloned())
    }

    async fn save_workflow_run(&self, run: &WorkflowRun) -> anyhow::Result<()> {
        self.store
            .lock()
            .unwrap()
            .runs
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn save_workflow_run_phase(&self, phase: &WorkflowRunPhase) -> anyhow::Result<()> {
        self.store
            .lock()
            .unwrap()
            .run_phases
            .insert((phase.run_id.clone(), phase.phase_id.clone()), phase.clone());
        Ok(())
    }

    async fn add_transcript(&self, record: TranscriptRecord) -> anyhow::Result<()> {
        self.store.lock().unwrap().transcripts.push(record);
        Ok(())
    }

    async fn load_initiative(&self, id: &str) -> anyhow::Result<Option<Initiative>> {
        Ok(self.store.lock().unwrap().initiatives.get(id).cloned())
    }

    async fn load_constitution(&self) -> anyhow::Result<Option<String>> {
        Ok(self.store.lock().unwrap().constitution.clone())
    }

    async fn load_detection(&self) -> anyhow::Result<Option<ProjectDetection>> {
        Ok(self.store.lock().unwrap().detection.clone())
    }

    async fn record_cost_extended(&self, entry: CostEntry) -> anyhow::Result<()> {
        self.store.lock().unwrap().costs.push(entry);
        Ok(())
    }

    async fn load_prompt_template(&self, phase_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .prompt_templates
            .get(phase_id)
            .cloned())
    }
}
