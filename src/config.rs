//! Engine configuration.
//!
//! `OrcConfig` is the typed form of `orc.toml`. Every field has a serde
//! default so a partial file (or none at all) yields a working engine.
//! `validate()` reports suspicious values as warnings instead of refusing to
//! start.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityConfig;
use crate::errors::RetryPolicy;
use crate::pr::MergeMethod;
use crate::resources::OrphanFilter;
use crate::task::Weight;

/// What happens after the last phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompletionAction {
    None,
    #[default]
    Pr,
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_retries: u32,
    pub initial_backoff_secs: u64,
    pub backoff_factor: f64,
    pub max_backoff_secs: u64,
    pub checkpoint_interval: u32,
    pub phase_timeout_secs: u64,
    pub turn_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub file_watch_interval_secs: u64,
    pub max_parallel_tasks: usize,
    pub default_model: String,
    pub extended_thinking: bool,
    pub review_rounds: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_secs: 2,
            backoff_factor: 2.0,
            max_backoff_secs: 60,
            checkpoint_interval: 1,
            phase_timeout_secs: 1800,
            turn_timeout_secs: 600,
            idle_timeout_secs: 120,
            heartbeat_interval_secs: 30,
            file_watch_interval_secs: 10,
            max_parallel_tasks: 2,
            default_model: "sonnet".into(),
            extended_thinking: false,
            review_rounds: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub action: CompletionAction,
    pub cleanup_on_complete: bool,
    pub cleanup_on_fail: bool,
    pub merge_method: MergeMethod,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            action: CompletionAction::Pr,
            cleanup_on_complete: true,
            cleanup_on_fail: false,
            merge_method: MergeMethod::Squash,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrConfig {
    pub draft: bool,
    pub labels: Vec<String>,
    pub reviewers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Phase ids gated by the external test/lint/build runner.
    pub phases: Vec<String>,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self { phases: vec!["implement".into()] }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Weights for which per-iteration progress validation runs.
    pub progress_weights: Vec<Weight>,
    /// Whether a validator API error fails the phase (task stays resumable).
    pub fail_on_api_error: bool,
    /// Whether the criteria gate runs on implement completions.
    pub criteria_validation: bool,
    pub coverage_threshold: u32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            progress_weights: vec![Weight::Medium, Weight::Large],
            fail_on_api_error: false,
            criteria_validation: true,
            coverage_threshold: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub enabled: bool,
    pub memory_growth_threshold_mb: f64,
    pub strict_filter: bool,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_growth_threshold_mb: 500.0,
            strict_filter: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub switch_on_rate_limit: bool,
}

/// The full engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrcConfig {
    pub engine: EngineConfig,
    pub completion: CompletionConfig,
    pub pr: PrConfig,
    pub backpressure: BackpressureConfig,
    pub validation: ValidationConfig,
    pub resources: ResourcesConfig,
    pub credentials: CredentialsConfig,
}

impl OrcConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Load `orc.toml` if present; defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.engine.max_retries,
            initial_backoff: Duration::from_secs(self.engine.initial_backoff_secs),
            factor: self.engine.backoff_factor,
            max_backoff: Duration::from_secs(self.engine.max_backoff_secs),
        }
    }

    pub fn activity_config(&self) -> ActivityConfig {
        ActivityConfig {
            heartbeat_interval: Duration::from_secs(self.engine.heartbeat_interval_secs),
            idle_timeout: Duration::from_secs(self.engine.idle_timeout_secs),
            turn_timeout: Duration::from_secs(self.engine.turn_timeout_secs),
        }
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.phase_timeout_secs)
    }

    pub fn file_watch_interval(&self) -> Duration {
        Duration::from_secs(self.engine.file_watch_interval_secs)
    }

    pub fn orphan_filter(&self) -> OrphanFilter {
        if self.resources.strict_filter {
            OrphanFilter::Strict
        } else {
            OrphanFilter::Legacy
        }
    }

    /// Whether the backpressure gate applies to this phase.
    pub fn gates_backpressure(&self, phase_id: &str) -> bool {
        self.backpressure.phases.iter().any(|p| p == phase_id)
    }

    /// Whether progress validation runs for this task weight.
    pub fn validates_progress(&self, weight: Weight) -> bool {
        self.validation.progress_weights.contains(&weight)
    }

    /// Sanity warnings for suspicious values. Never fatal.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.engine.checkpoint_interval == 0 {
            warnings.push("engine.checkpoint_interval is 0; checkpoints disabled mid-phase".into());
        }
        if self.engine.phase_timeout_secs < self.engine.turn_timeout_secs {
            warnings.push(format!(
                "engine.phase_timeout_secs ({}) is below turn_timeout_secs ({}); phases will \
                 time out before a single slow turn does",
                self.engine.phase_timeout_secs, self.engine.turn_timeout_secs
            ));
        }
        if self.engine.max_parallel_tasks == 0 {
            warnings.push("engine.max_parallel_tasks is 0; no task can run".into());
        }
        if self.engine.backoff_factor < 1.0 {
            warnings.push("engine.backoff_factor below 1.0 shrinks backoff on retry".into());
        }
        warnings
    }
}
