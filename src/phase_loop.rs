//! The per-phase execution loop.
//!
//! Drives one phase of one task to a terminal outcome: iterative LLM turns
//! under the JSON completion protocol, with checkpointing, resume, the
//! progress-validation gate, and the backpressure and criteria gates that can
//! reject an agent-claimed completion. Event ordering per iteration is fixed:
//! `phase_start?` → `transcript(prompt)` → `activity(waiting_api)` →
//! `transcript(response)` → `tokens` → gate warnings → terminal event.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::activity::{ActivityState, ActivityTracker};
use crate::backend::{Backend, PhaseOutput, TranscriptRecord};
use crate::cancel::CancelToken;
use crate::checkpoint::{Checkpointer, PhaseCheckpoint, session_id_for};
use crate::codec::{LoopStatus, PhasePayload, PhaseResponseCodec};
use crate::errors::PhaseError;
use crate::events::{EventPublisher, TranscriptRole};
use crate::executor::TurnExecutor;
use crate::gates::{BackpressureRunner, ProgressVerdict, Validator};
use crate::task::{PhaseSpec, Task};
use crate::template::{CONTINUATION_PROMPT, EXTENDED_THINKING_SENTINEL, TemplateVars, render};
use crate::worktree::WorktreeManager;

/// Running accounting for one phase execution. Counters only grow.
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    pub iteration: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost_usd: f64,
    pub last_response: String,
    pub session_id: Option<String>,
    pub validations: Vec<ValidationRecord>,
    pub gate_rejections: u32,
}

/// One progress-validation outcome, kept for observability.
#[derive(Debug, Clone)]
pub struct ValidationRecord {
    pub iteration: u32,
    pub outcome: String,
}

/// Terminal result of a phase loop.
#[derive(Debug)]
pub enum PhaseOutcome {
    Completed { state: LoopState, artifact: Option<String> },
    Blocked { state: LoopState, reason: String },
    Failed { state: LoopState, error: PhaseError },
}

impl PhaseOutcome {
    pub fn state(&self) -> &LoopState {
        match self {
            Self::Completed { state, .. } | Self::Blocked { state, .. } | Self::Failed { state, .. } => {
                state
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Receives running state after every turn so the driver can persist it.
#[async_trait]
pub trait StateUpdater: Send + Sync {
    async fn update(&self, state: &LoopState);
}

/// Per-phase knobs resolved by the driver.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_iterations: u32,
    pub checkpoint_interval: u32,
    pub extended_thinking: bool,
    pub backpressure_gated: bool,
    pub criteria_gate: bool,
    pub progress_validation: bool,
    pub fail_on_validator_error: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            checkpoint_interval: 1,
            extended_thinking: false,
            backpressure_gated: false,
            criteria_gate: false,
            progress_validation: false,
            fail_on_validator_error: false,
        }
    }
}

/// Collaborators the loop calls out to. Optional slots are skipped.
pub struct LoopDeps {
    pub executor: Arc<dyn TurnExecutor>,
    pub backend: Arc<dyn Backend>,
    pub codec: PhaseResponseCodec,
    pub checkpointer: Checkpointer,
    pub publisher: EventPublisher,
    pub activity: Option<Arc<ActivityTracker>>,
    pub backpressure: Option<Arc<dyn BackpressureRunner>>,
    pub validator: Option<Arc<dyn Validator>>,
    pub worktrees: Option<Arc<WorktreeManager>>,
    pub state_updater: Option<Arc<dyn StateUpdater>>,
}

/// One phase of one task, driven to a terminal outcome by `run`.
pub struct PhaseLoop {
    pub task: Task,
    pub phase: PhaseSpec,
    pub review_round: u32,
    pub template: String,
    pub vars: TemplateVars,
    pub worktree: PathBuf,
    pub task_dir: PathBuf,
    pub run_id: String,
    pub config: LoopConfig,
    pub deps: LoopDeps,
    pub cancel: CancelToken,
    /// Session id supplied by the caller; wins over the computed default.
    pub external_session_id: Option<String>,
}

impl PhaseLoop {
    pub async fn run(self) -> PhaseOutcome {
        let mut state = LoopState::default();

        // Resume from a live checkpoint if one exists.
        let resumed = match self.deps.checkpointer.load(&self.task.id, &self.phase.id) {
            Ok(Some(checkpoint)) => {
                info!(
                    task_id = %self.task.id,
                    phase = %self.phase.id,
                    iteration = checkpoint.iteration,
                    "resuming from checkpoint"
                );
                state.iteration = checkpoint.iteration;
                state.input_tokens = checkpoint.input_tokens;
                state.output_tokens = checkpoint.output_tokens;
                state.cache_creation_tokens = checkpoint.cache_creation_tokens;
                state.cache_read_tokens = checkpoint.cache_read_tokens;
                state.cost_usd = checkpoint.cost_usd;
                state.last_response = checkpoint.last_response;
                state.session_id = checkpoint.session_id;
                true
            }
            Ok(None) => false,
            Err(err) => {
                return PhaseOutcome::Failed {
                    state,
                    error: PhaseError::Checkpoint(err),
                };
            }
        };

        let session_id = session_id_for(
            &self.task.id,
            &self.phase.id,
            self.external_session_id
                .as_deref()
                .or(state.session_id.as_deref()),
        );
        self.deps.executor.update_session_id(&session_id);
        state.session_id = Some(session_id);

        let mut prompt = if resumed {
            CONTINUATION_PROMPT.to_string()
        } else {
            let rendered = render(&self.template, &self.vars);
            if self.config.extended_thinking {
                format!("{EXTENDED_THINKING_SENTINEL}\n{rendered}")
            } else {
                rendered
            }
        };

        let start_iteration = state.iteration + 1;
        let mut first_pass = true;

        for iteration in start_iteration..=self.config.max_iterations {
            state.iteration = iteration;
            if let Some(activity) = &self.deps.activity {
                activity.set_iteration(iteration);
            }

            if first_pass && !resumed {
                self.deps.publisher.phase_started(&self.task.id, &self.phase.id);
            }
            first_pass = false;

            self.publish_transcript(iteration, TranscriptRole::Prompt, &prompt).await;
            self.deps
                .publisher
                .activity(&self.task.id, ActivityState::WaitingApi, None);
            if let Some(activity) = &self.deps.activity {
                activity.set_state(ActivityState::WaitingApi);
            }

            let turn = tokio::select! {
                result = self.deps.executor.execute_turn(&prompt) => result,
                _ = self.cancel.cancelled() => {
                    // Capture what we have; the task resumes from here.
                    self.save_checkpoint(&state, false, None, Some("cancelled"));
                    return PhaseOutcome::Failed {
                        state,
                        error: PhaseError::Other(anyhow!("cancelled while waiting for turn")),
                    };
                }
            };

            let turn = match turn {
                Ok(turn) => turn,
                Err(err) => {
                    self.save_checkpoint(&state, false, None, Some(&err.to_string()));
                    return PhaseOutcome::Failed {
                        state,
                        error: PhaseError::TurnFailed { iteration, source: err },
                    };
                }
            };

            if let Some(activity) = &self.deps.activity {
                activity.set_state(ActivityState::Processing);
            }

            // Accumulate before anything can fail: counters never move back.
            state.input_tokens += turn.usage.effective_input();
            state.output_tokens += turn.usage.output_tokens;
            state.cache_creation_tokens += turn.usage.cache_creation_input_tokens;
            state.cache_read_tokens += turn.usage.cache_read_input_tokens;
            state.cost_usd += turn.cost_usd;
            state.last_response = turn.content.clone();
            if !turn.session_id.is_empty() {
                state.session_id = Some(turn.session_id.clone());
            }

            if turn.is_error {
                let message = turn
                    .error_text
                    .clone()
                    .unwrap_or_else(|| "executor reported an error".into());
                self.save_checkpoint(&state, false, None, Some(&message));
                return PhaseOutcome::Failed {
                    state,
                    error: PhaseError::TurnFailed { iteration, source: anyhow!(message) },
                };
            }

            self.publish_transcript(iteration, TranscriptRole::Response, &turn.content)
                .await;
            self.deps.publisher.tokens(
                &self.task.id,
                &self.phase.id,
                state.input_tokens,
                state.output_tokens,
                state.cache_creation_tokens,
                state.cache_read_tokens,
                state.cost_usd,
            );
            if let Some(updater) = &self.deps.state_updater {
                updater.update(&state).await;
            }

            // Progress validation gate.
            if self.config.progress_validation
                && !self.vars.spec.is_empty()
                && let Some(validator) = self.deps.validator.clone()
            {
                match validator.validate_progress(&self.vars.spec, &turn.content).await {
                    Ok(ProgressVerdict::Continue) => {
                        state.validations.push(ValidationRecord {
                            iteration,
                            outcome: "continue".into(),
                        });
                    }
                    Ok(ProgressVerdict::Retry { feedback }) => {
                        state.validations.push(ValidationRecord {
                            iteration,
                            outcome: "retry".into(),
                        });
                        self.deps.publisher.warning(
                            &self.task.id,
                            &format!("progress validation redirected iteration {iteration}"),
                        );
                        prompt = feedback;
                        self.maybe_checkpoint(&state, iteration);
                        continue;
                    }
                    Ok(ProgressVerdict::Stop { reason }) => {
                        state.validations.push(ValidationRecord {
                            iteration,
                            outcome: "stop".into(),
                        });
                        self.save_checkpoint(&state, false, None, Some(&reason));
                        return PhaseOutcome::Failed {
                            state,
                            error: PhaseError::ProgressStop { reason },
                        };
                    }
                    Err(err) => {
                        state.validations.push(ValidationRecord {
                            iteration,
                            outcome: format!("api_error: {err}"),
                        });
                        if self.config.fail_on_validator_error {
                            self.save_checkpoint(&state, false, None, Some(&err.to_string()));
                            return PhaseOutcome::Failed {
                                state,
                                error: PhaseError::ValidatorApi(err),
                            };
                        }
                        warn!(
                            task_id = %self.task.id,
                            phase = %self.phase.id,
                            error = %err,
                            "progress validator unavailable; continuing"
                        );
                    }
                }
            }

            self.maybe_checkpoint(&state, iteration);

            // Classify the response; parse/validation failures recover locally.
            let classification =
                match self
                    .deps
                    .codec
                    .classify(&self.phase.id, self.review_round, &turn.content)
                {
                    Ok(classification) => classification,
                    Err(err) => {
                        debug!(
                            task_id = %self.task.id,
                            phase = %self.phase.id,
                            error = %err,
                            "response rejected; feeding back"
                        );
                        self.deps.publisher.warning(
                            &self.task.id,
                            &format!("iteration {iteration} response rejected: {err}"),
                        );
                        prompt = err.retry_feedback();
                        continue;
                    }
                };

            match classification.status {
                LoopStatus::Complete => {
                    // Backpressure, then criteria; both may demand another turn.
                    if self.config.backpressure_gated
                        && let Some(runner) = self.deps.backpressure.clone()
                    {
                        let report = match runner.run(&self.worktree).await {
                            Ok(report) => report,
                            Err(err) => crate::gates::BackpressureReport::fail(&format!(
                                "backpressure checks could not run: {err}"
                            )),
                        };
                        if !report.passed {
                            state.gate_rejections += 1;
                            self.deps.publisher.warning(
                                &self.task.id,
                                &format!("backpressure rejected completion: {}", report.summary),
                            );
                            prompt = format!(
                                "Completion rejected - project checks are failing:\n{}\n\
                                 Fix the failures and report complete again when checks pass.",
                                report.summary
                            );
                            continue;
                        }
                    }

                    if self.config.criteria_gate
                        && !self.vars.spec.is_empty()
                        && let Some(validator) = self.deps.validator.clone()
                    {
                        match validator.validate_criteria(&self.vars.spec, &turn.content).await {
                            Ok(verdict) if !verdict.all_met => {
                                state.gate_rejections += 1;
                                self.deps.publisher.warning(
                                    &self.task.id,
                                    "success criteria unmet; continuing iteration",
                                );
                                prompt = format!(
                                    "Completion rejected - success criteria are not all \
                                     satisfied:\n{}\nAddress each criterion and report complete \
                                     again.",
                                    verdict.feedback
                                );
                                continue;
                            }
                            Ok(_) => {}
                            Err(err) => {
                                if self.config.fail_on_validator_error {
                                    self.save_checkpoint(&state, false, None, Some(&err.to_string()));
                                    return PhaseOutcome::Failed {
                                        state,
                                        error: PhaseError::ValidatorApi(err),
                                    };
                                }
                                warn!(
                                    task_id = %self.task.id,
                                    error = %err,
                                    "criteria validator unavailable; accepting completion"
                                );
                            }
                        }
                    }

                    let artifact = match self.persist_outputs(&classification.payload, &state).await
                    {
                        Ok(artifact) => artifact,
                        Err(err) => {
                            self.save_checkpoint(&state, false, None, Some(&err.to_string()));
                            return PhaseOutcome::Failed {
                                state,
                                error: PhaseError::ArtifactSave {
                                    phase: self.phase.id.clone(),
                                    source: err,
                                },
                            };
                        }
                    };

                    if let Some(worktrees) = &self.deps.worktrees
                        && let Err(err) = worktrees
                            .checkpoint_commit(&self.worktree, &self.task.id, &self.phase.id)
                            .await
                    {
                        warn!(task_id = %self.task.id, error = %err, "checkpoint commit failed");
                    }

                    if let Err(err) = self.deps.checkpointer.remove(&self.task.id, &self.phase.id) {
                        warn!(task_id = %self.task.id, error = %err, "checkpoint removal failed");
                    }

                    self.deps.publisher.phase_completed(
                        &self.task.id,
                        &self.phase.id,
                        classification.summary.clone(),
                    );
                    if let Some(activity) = &self.deps.activity {
                        activity.set_state(ActivityState::Idle);
                    }
                    info!(
                        task_id = %self.task.id,
                        phase = %self.phase.id,
                        iterations = iteration,
                        "phase completed"
                    );
                    return PhaseOutcome::Completed { state, artifact };
                }
                LoopStatus::Blocked => {
                    let reason = classification
                        .reason
                        .unwrap_or_else(|| "agent reported blocked".into());
                    self.save_checkpoint(&state, true, Some(&reason), None);
                    self.deps
                        .publisher
                        .phase_failed(&self.task.id, &self.phase.id, &format!("blocked: {reason}"));
                    return PhaseOutcome::Blocked { state, reason };
                }
                LoopStatus::Continue => {
                    prompt = CONTINUATION_PROMPT.to_string();
                }
            }
        }

        self.save_checkpoint(&state, false, None, Some("max iterations reached"));
        self.deps.publisher.phase_failed(
            &self.task.id,
            &self.phase.id,
            "max iterations reached",
        );
        PhaseOutcome::Failed {
            state: state.clone(),
            error: PhaseError::MaxIterations { iterations: state.iteration },
        }
    }

    async fn publish_transcript(&self, iteration: u32, role: TranscriptRole, text: &str) {
        self.deps
            .publisher
            .transcript(&self.task.id, &self.phase.id, iteration, role, text);
        let record = TranscriptRecord {
            task_id: self.task.id.clone(),
            phase_id: self.phase.id.clone(),
            iteration,
            role: match role {
                TranscriptRole::Prompt => "prompt".into(),
                TranscriptRole::Response => "response".into(),
            },
            text: text.to_string(),
            timestamp: chrono::Utc::now(),
        };
        if let Err(err) = self.deps.backend.add_transcript(record).await {
            warn!(task_id = %self.task.id, error = %err, "transcript streaming failed");
        }
    }

    fn maybe_checkpoint(&self, state: &LoopState, iteration: u32) {
        let interval = self.config.checkpoint_interval;
        if interval > 0 && iteration % interval == 0 {
            self.save_checkpoint(state, false, None, None);
        }
    }

    fn save_checkpoint(
        &self,
        state: &LoopState,
        blocked: bool,
        block_reason: Option<&str>,
        error: Option<&str>,
    ) {
        let checkpoint = PhaseCheckpoint {
            iteration: state.iteration,
            input_tokens: state.input_tokens,
            output_tokens: state.output_tokens,
            cache_creation_tokens: state.cache_creation_tokens,
            cache_read_tokens: state.cache_read_tokens,
            cost_usd: state.cost_usd,
            last_response: state.last_response.clone(),
            blocked,
            block_reason: block_reason.map(String::from),
            error: error.map(String::from),
            session_id: state.session_id.clone(),
        };
        if let Err(err) = self
            .deps
            .checkpointer
            .save(&self.task.id, &self.phase.id, &checkpoint)
        {
            warn!(task_id = %self.task.id, phase = %self.phase.id, error = %err, "checkpoint save failed");
        }
    }

    /// Persist the completed phase's outputs. Specs go to the backend only;
    /// other artifacts go to both the backend and the task's artifact file.
    async fn persist_outputs(
        &self,
        payload: &PhasePayload,
        state: &LoopState,
    ) -> anyhow::Result<Option<String>> {
        // Round-1 findings must be durably readable before any later round.
        if let PhasePayload::Findings(findings) = payload {
            self.deps
                .backend
                .save_review_findings(&self.task.id, self.review_round, findings)
                .await?;
        }

        // Verification evidence is referenced by later phases under its own key.
        if let PhasePayload::Verification(verification) = payload
            && let Ok(serialized) = serde_json::to_string_pretty(verification)
        {
            self.deps
                .backend
                .save_artifact(&self.task.id, "verification", &serialized)
                .await?;
        }

        let is_spec = crate::codec::schema::is_spec_phase(&self.phase.id);
        if !self.phase.produces_artifact && !is_spec {
            return Ok(None);
        }

        let content = payload
            .artifact_content()
            .unwrap_or_else(|| state.last_response.clone());

        if is_spec {
            self.deps
                .backend
                .save_spec(&self.task.id, &content, "agent")
                .await?;
        } else {
            self.deps
                .backend
                .save_artifact(&self.task.id, &self.phase.id, &content)
                .await?;
            let dir = self.task_dir.join("artifacts");
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join(format!("{}.md", self.phase.id)), &content)?;
        }

        self.deps
            .backend
            .save_phase_output(PhaseOutput {
                run_id: self.run_id.clone(),
                phase_id: self.phase.id.clone(),
                task_id: self.task.id.clone(),
                content: content.clone(),
                var_name: self.phase.id.to_uppercase(),
                artifact_type: if is_spec { "spec".into() } else { "artifact".into() },
                source: "agent".into(),
            })
            .await?;

        Ok(Some(content))
    }
}
