//! The task driver: one `WorkflowRun` for one task.
//!
//! Orders phases, prepares the worktree, runs each phase under a deadline
//! with retry, review-round bookkeeping, and resource tracking, then
//! finalises the branch (auto-commit, push, change request) and cleans up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::activity::{ActivityCallbacks, ActivityState, ActivityTracker};
use crate::backend::{
    Backend, CostEntry, RunStatus, UsageTotals, WorkflowRun, WorkflowRunPhase,
};
use crate::cancel::{CancelToken, cancel_pair};
use crate::checkpoint::Checkpointer;
use crate::codec::PhaseResponseCodec;
use crate::codec::schema::is_spec_phase;
use crate::config::{CompletionAction, OrcConfig};
use crate::errors::{CredentialPool, DriverError, ErrorKind, PhaseError};
use crate::events::EventPublisher;
use crate::executor::TurnExecutor;
use crate::gates::{BackpressureRunner, Validator};
use crate::phase_loop::{
    LoopConfig, LoopDeps, LoopState, PhaseLoop, PhaseOutcome, StateUpdater,
};
use crate::pr::{Pr, PrProvider, resolve_pr_options};
use crate::resources::{ResourceTracker, ResourceReport};
use crate::task::{PhaseSpec, Task, order_phases};
use crate::template::{ContentResolver, PromptResolver, PromptTemplate, TemplateVars};
use crate::watcher::spawn_watcher;
use crate::worktree::{WorktreeContext, WorktreeManager};

/// Terminal summary for one phase of a run.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummary {
    pub id: String,
    pub status: RunStatus,
    pub iterations: u32,
    pub duration_ms: u64,
}

/// Aggregated outcome of the whole run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub total_phases: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub duration_ms: u64,
    pub phases: Vec<PhaseSummary>,
}

/// What `TaskDriver::run` hands back.
#[derive(Debug)]
pub struct RunResult {
    pub run: WorkflowRun,
    pub summary: RunSummary,
    pub pr: Option<Pr>,
    pub resumable: bool,
    pub error: Option<String>,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.run.status == RunStatus::Completed
    }
}

/// Persists running loop state into the phase record after every turn.
struct PhaseStateSink {
    backend: Arc<dyn Backend>,
    run_id: String,
    task_id: String,
    phase_id: String,
}

#[async_trait::async_trait]
impl StateUpdater for PhaseStateSink {
    async fn update(&self, state: &LoopState) {
        let record = WorkflowRunPhase {
            run_id: self.run_id.clone(),
            task_id: self.task_id.clone(),
            phase_id: self.phase_id.clone(),
            status: RunStatus::Running,
            iterations: state.iteration,
            totals: totals_of(state),
            artifact: None,
            error: None,
        };
        if let Err(err) = self.backend.save_workflow_run_phase(&record).await {
            warn!(task_id = %self.task_id, error = %err, "running state persist failed");
        }
    }
}

fn totals_of(state: &LoopState) -> UsageTotals {
    UsageTotals {
        input_tokens: state.input_tokens,
        output_tokens: state.output_tokens,
        cache_creation: state.cache_creation_tokens,
        cache_read: state.cache_read_tokens,
        cost_usd: state.cost_usd,
    }
}

/// Drives one task through its workflow.
pub struct TaskDriver {
    pub config: OrcConfig,
    pub backend: Arc<dyn Backend>,
    pub executor: Arc<dyn TurnExecutor>,
    pub publisher: EventPublisher,
    pub worktrees: Arc<WorktreeManager>,
    pub pr_provider: Option<Arc<dyn PrProvider>>,
    pub backpressure: Option<Arc<dyn BackpressureRunner>>,
    pub validator: Option<Arc<dyn Validator>>,
    pub credentials: Option<Arc<dyn CredentialPool>>,
    pub checkpoint_dir: PathBuf,
    pub task_dir_base: PathBuf,
}

impl TaskDriver {
    /// Execute one workflow run for `task`.
    pub async fn run(
        &self,
        task: &Task,
        phases: &[PhaseSpec],
        cancel: CancelToken,
    ) -> Result<RunResult, DriverError> {
        let started = Instant::now();

        // Ordering first: a cycle must fail before anything runs.
        let ordered = order_phases(phases)?;

        self.check_spec_precondition(task, &ordered).await?;

        let worktree = self
            .worktrees
            .acquire(task, self.config.pr.base_branch.as_deref())
            .await
            .map_err(DriverError::Worktree)?;

        let mut resources = self.config.resources.enabled.then(|| {
            let mut tracker = ResourceTracker::new(
                self.config.orphan_filter(),
                self.config.resources.memory_growth_threshold_mb,
            );
            tracker.snapshot_before();
            tracker
        });

        let mut run = WorkflowRun::new(&task.id);
        run.status = RunStatus::Running;
        self.backend
            .save_workflow_run(&run)
            .await
            .map_err(DriverError::Other)?;
        self.publisher.state(&task.id, "running");

        // Per-run background workers: file watcher + activity monitor.
        let (worker_handle, worker_token) = cancel_pair();
        let watcher = spawn_watcher(
            self.worktrees.git(),
            worktree.path.clone(),
            task.id.clone(),
            self.publisher.clone(),
            self.config.file_watch_interval(),
            worker_token,
        );
        let activity = Arc::new(ActivityTracker::start(
            self.config.activity_config(),
            self.activity_callbacks(&task.id),
        ));

        let mut summary = RunSummary {
            total_phases: ordered.len(),
            ..Default::default()
        };
        let mut resumable = false;
        let mut run_error: Option<String> = None;

        for phase in &ordered {
            let phase_started = Instant::now();

            // Resolve the template up front: its frontmatter overrides feed
            // model/thinking resolution, and an unknown prompt source is fatal.
            let template = match PromptResolver::new(self.backend.clone()).resolve(phase).await {
                Ok(template) => template,
                Err(err) => {
                    let message = err.to_string();
                    self.persist_phase(
                        &run,
                        task,
                        phase,
                        RunStatus::Failed,
                        &LoopState::default(),
                        Some(&message),
                    )
                    .await;
                    summary.phases.push(PhaseSummary {
                        id: phase.id.clone(),
                        status: RunStatus::Failed,
                        iterations: 0,
                        duration_ms: phase_started.elapsed().as_millis() as u64,
                    });
                    summary.failed += 1;
                    run_error = Some(message);
                    break;
                }
            };

            let (status, state, error) = self
                .run_phase_stage(task, phase, &run, &worktree, activity.clone(), &cancel, &template)
                .await;

            let totals = totals_of(&state);
            run.totals.add(&totals);

            summary.phases.push(PhaseSummary {
                id: phase.id.clone(),
                status,
                iterations: state.iteration,
                duration_ms: phase_started.elapsed().as_millis() as u64,
            });
            match status {
                RunStatus::Completed => summary.completed += 1,
                RunStatus::Failed => summary.failed += 1,
                _ => {}
            }

            let cost_entry = CostEntry {
                task_id: task.id.clone(),
                phase_id: phase.id.clone(),
                model: self.resolve_model(phase, &template),
                usage: totals,
                timestamp: Utc::now(),
            };
            if let Err(err) = self.backend.record_cost_extended(cost_entry).await {
                warn!(task_id = %task.id, error = %err, "cost recording failed");
            }

            if status != RunStatus::Completed {
                if let Some(err) = &error {
                    resumable = err.contains("resumable");
                    run_error = Some(err.clone());
                }
                summary.blocked += usize::from(error.as_deref().is_some_and(|e| e.starts_with("blocked")));
                break;
            }
        }

        activity.stop();
        worker_handle.cancel();
        watcher.abort();

        if let Some(tracker) = resources.as_mut() {
            self.report_resources(&task.id, tracker.snapshot_after());
        }

        let all_completed = summary.completed == summary.total_phases;
        let mut pr = None;
        if all_completed {
            pr = self.finalize(task, &worktree).await;
        }

        let blocked = run_error.as_deref().is_some_and(|e| e.starts_with("blocked"));
        run.status = if all_completed {
            RunStatus::Completed
        } else if blocked {
            RunStatus::Paused
        } else {
            RunStatus::Failed
        };
        run.completed_at = Some(Utc::now());
        if let Err(err) = self.backend.save_workflow_run(&run).await {
            warn!(task_id = %task.id, error = %err, "final run persist failed");
        }
        self.publisher.state(
            &task.id,
            match run.status {
                RunStatus::Completed => "completed",
                RunStatus::Paused => "paused",
                _ => "failed",
            },
        );

        let cleanup = if all_completed {
            self.config.completion.cleanup_on_complete
        } else {
            self.config.completion.cleanup_on_fail
        };
        if cleanup && let Err(err) = self.worktrees.cleanup(&task.id).await {
            warn!(task_id = %task.id, error = %err, "worktree cleanup failed");
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            task_id = %task.id,
            completed = summary.completed,
            total = summary.total_phases,
            "run finished"
        );
        Ok(RunResult {
            run,
            summary,
            pr,
            resumable,
            error: run_error,
        })
    }

    /// Non-trivial tasks need a spec up front unless the workflow produces
    /// its own spec before the phases that consume it.
    async fn check_spec_precondition(
        &self,
        task: &Task,
        ordered: &[PhaseSpec],
    ) -> Result<(), DriverError> {
        if !task.weight.requires_spec() {
            return Ok(());
        }
        let produces_own_spec = ordered.iter().any(|p| is_spec_phase(&p.id));
        if produces_own_spec {
            return Ok(());
        }
        let exists = self
            .backend
            .spec_exists(&task.id)
            .await
            .map_err(DriverError::Other)?;
        if !exists {
            return Err(DriverError::MissingSpec {
                task_id: task.id.clone(),
                weight: task.weight.to_string(),
            });
        }
        // Sanity-load: a spec row that cannot be read is as bad as no spec.
        self.backend
            .load_spec(&task.id)
            .await
            .map_err(DriverError::Other)?;
        Ok(())
    }

    /// Run one phase, expanded into review rounds when it is a review phase.
    /// Returns `(status, accumulated state, error text)`.
    #[allow(clippy::too_many_arguments)]
    async fn run_phase_stage(
        &self,
        task: &Task,
        phase: &PhaseSpec,
        run: &WorkflowRun,
        worktree: &WorktreeContext,
        activity: Arc<ActivityTracker>,
        cancel: &CancelToken,
        template: &PromptTemplate,
    ) -> (RunStatus, LoopState, Option<String>) {
        let rounds = if phase.id == "review" {
            self.config.engine.review_rounds.max(1)
        } else {
            1
        };

        let mut combined = LoopState::default();
        for round in 1..=rounds {
            let (status, state, error) = self
                .run_phase_with_retry(
                    task,
                    phase,
                    run,
                    worktree,
                    activity.clone(),
                    cancel,
                    round,
                    template,
                )
                .await;

            combined.input_tokens += state.input_tokens;
            combined.output_tokens += state.output_tokens;
            combined.cache_creation_tokens += state.cache_creation_tokens;
            combined.cache_read_tokens += state.cache_read_tokens;
            combined.cost_usd += state.cost_usd;
            combined.iteration += state.iteration;

            match status {
                RunStatus::Completed if round < rounds => continue,
                RunStatus::Completed => return (RunStatus::Completed, combined, None),
                other => {
                    // A blocked decision from round >= 2 records the reason and
                    // ends the review stage.
                    if round >= 2 {
                        info!(task_id = %task.id, round, "review stage ended: {:?}", error);
                    }
                    return (other, combined, error);
                }
            }
        }
        (RunStatus::Completed, combined, None)
    }

    /// One phase round under the retry envelope.
    #[allow(clippy::too_many_arguments)]
    async fn run_phase_with_retry(
        &self,
        task: &Task,
        phase: &PhaseSpec,
        run: &WorkflowRun,
        worktree: &WorktreeContext,
        activity: Arc<ActivityTracker>,
        cancel: &CancelToken,
        review_round: u32,
        template: &PromptTemplate,
    ) -> (RunStatus, LoopState, Option<String>) {
        let policy = self.config.retry_policy();
        let mut attempt: u32 = 0;
        let mut backoff_attempt: u32 = 0;

        self.persist_phase(run, task, phase, RunStatus::Running, &LoopState::default(), None)
            .await;

        loop {
            let outcome = match self
                .execute_phase_once(
                    task,
                    phase,
                    run,
                    worktree,
                    activity.clone(),
                    cancel,
                    review_round,
                    template,
                )
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    let message = err.to_string();
                    self.persist_phase(
                        run,
                        task,
                        phase,
                        RunStatus::Failed,
                        &LoopState::default(),
                        Some(&message),
                    )
                    .await;
                    return (RunStatus::Failed, LoopState::default(), Some(message));
                }
            };

            match outcome {
                PhaseOutcome::Completed { state, artifact } => {
                    let mut record = self
                        .phase_record(run, task, phase, RunStatus::Completed, &state, None);
                    record.artifact = artifact;
                    if let Err(err) = self.backend.save_workflow_run_phase(&record).await {
                        warn!(task_id = %task.id, error = %err, "phase persist failed");
                    }
                    return (RunStatus::Completed, state, None);
                }
                PhaseOutcome::Blocked { state, reason } => {
                    let message = format!("blocked: {reason}");
                    self.persist_phase(run, task, phase, RunStatus::Paused, &state, Some(&message))
                        .await;
                    return (RunStatus::Paused, state, Some(message));
                }
                PhaseOutcome::Failed { state, error } => {
                    let message = error.to_string();
                    let kind = match &error {
                        PhaseError::PhaseTimeout { .. } => ErrorKind::PhaseTimeout,
                        _ => ErrorKind::classify(&message),
                    };

                    if kind == ErrorKind::PhaseTimeout {
                        // Not retried in place; the checkpoint makes the task
                        // resumable on a later run.
                        self.persist_phase(run, task, phase, RunStatus::Failed, &state, Some(&message))
                            .await;
                        return (RunStatus::Failed, state, Some(message));
                    }

                    if !kind.is_retryable() || attempt >= policy.max_retries {
                        let message = if attempt >= policy.max_retries && kind.is_retryable() {
                            DriverError::MaxRetries {
                                attempts: attempt,
                                last_error: message,
                            }
                            .to_string()
                        } else {
                            message
                        };
                        self.persist_phase(run, task, phase, RunStatus::Failed, &state, Some(&message))
                            .await;
                        return (RunStatus::Failed, state, Some(message));
                    }

                    attempt += 1;
                    backoff_attempt += 1;

                    // Recovery state is durable before we sleep.
                    self.persist_phase(run, task, phase, RunStatus::Running, &state, Some(&message))
                        .await;

                    if kind == ErrorKind::RateLimited
                        && self.config.credentials.switch_on_rate_limit
                        && let Some(pool) = &self.credentials
                    {
                        if pool.switch_to_next_account() {
                            info!(task_id = %task.id, "switched account after rate limit");
                            backoff_attempt = 1;
                        } else {
                            let message = DriverError::AccountsExhausted.to_string();
                            self.persist_phase(
                                run, task, phase, RunStatus::Failed, &state, Some(&message),
                            )
                            .await;
                            return (RunStatus::Failed, state, Some(message));
                        }
                    }

                    let delay = policy.backoff(backoff_attempt);
                    warn!(
                        task_id = %task.id,
                        phase = %phase.id,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "retrying after {kind:?}"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            let message = "cancelled during retry backoff".to_string();
                            self.persist_phase(
                                run, task, phase, RunStatus::Failed, &state, Some(&message),
                            )
                            .await;
                            return (RunStatus::Failed, state, Some(message));
                        }
                    }
                }
            }
        }
    }

    /// Build and run one `PhaseLoop` under the phase deadline, publishing
    /// warnings at 50 % and 75 %.
    #[allow(clippy::too_many_arguments)]
    async fn execute_phase_once(
        &self,
        task: &Task,
        phase: &PhaseSpec,
        run: &WorkflowRun,
        worktree: &WorktreeContext,
        activity: Arc<ActivityTracker>,
        cancel: &CancelToken,
        review_round: u32,
        template: &PromptTemplate,
    ) -> Result<PhaseOutcome, DriverError> {
        let vars = self.build_vars(task, phase, worktree, review_round).await?;

        let task_dir = self.task_dir_base.join(&task.id);
        let loop_config = LoopConfig {
            max_iterations: phase.max_iterations,
            checkpoint_interval: self.config.engine.checkpoint_interval,
            extended_thinking: self.resolve_thinking(phase, template),
            backpressure_gated: self.config.gates_backpressure(&phase.id),
            criteria_gate: phase.id == "implement" && self.config.validation.criteria_validation,
            progress_validation: self.config.validates_progress(task.weight)
                && self.validator.is_some(),
            fail_on_validator_error: self.config.validation.fail_on_api_error,
        };

        let phase_loop = PhaseLoop {
            task: task.clone(),
            phase: phase.clone(),
            review_round,
            template: template.body.clone(),
            vars,
            worktree: worktree.path.clone(),
            task_dir,
            run_id: run.run_id.clone(),
            config: loop_config,
            deps: LoopDeps {
                executor: self.executor.clone(),
                backend: self.backend.clone(),
                codec: PhaseResponseCodec::new(),
                checkpointer: Checkpointer::new(&self.checkpoint_dir),
                publisher: self.publisher.clone(),
                activity: Some(activity),
                backpressure: self.backpressure.clone(),
                validator: self.validator.clone(),
                worktrees: Some(self.worktrees.clone()),
                state_updater: Some(Arc::new(PhaseStateSink {
                    backend: self.backend.clone(),
                    run_id: run.run_id.clone(),
                    task_id: task.id.clone(),
                    phase_id: phase.id.clone(),
                })),
            },
            cancel: cancel.clone(),
            external_session_id: None,
        };

        let phase_max = self.config.phase_timeout();
        let publisher = self.publisher.clone();
        let warn_task = task.id.clone();
        let warn_phase = phase.id.clone();
        let warnings = tokio::spawn(async move {
            tokio::time::sleep(phase_max / 2).await;
            publisher.warning(
                &warn_task,
                &format!("phase {warn_phase} has used 50% of its {phase_max:?} deadline"),
            );
            tokio::time::sleep(phase_max / 4).await;
            publisher.warning(
                &warn_task,
                &format!("phase {warn_phase} has used 75% of its {phase_max:?} deadline"),
            );
        });

        let outcome = tokio::select! {
            outcome = phase_loop.run() => outcome,
            _ = tokio::time::sleep(phase_max) => {
                if cancel.is_cancelled() {
                    PhaseOutcome::Failed {
                        state: LoopState::default(),
                        error: PhaseError::Other(anyhow::anyhow!("parent context cancelled")),
                    }
                } else {
                    self.publisher.phase_failed(&task.id, &phase.id, "phase deadline exceeded");
                    // The dropped loop future cannot save its own checkpoint;
                    // make sure one exists so the task stays resumable.
                    let checkpointer = Checkpointer::new(&self.checkpoint_dir);
                    if !checkpointer.exists(&task.id, &phase.id)
                        && let Err(err) = checkpointer.save(
                            &task.id,
                            &phase.id,
                            &crate::checkpoint::PhaseCheckpoint {
                                error: Some("phase deadline exceeded".into()),
                                ..Default::default()
                            },
                        )
                    {
                        warn!(task_id = %task.id, error = %err, "timeout checkpoint save failed");
                    }
                    PhaseOutcome::Failed {
                        state: LoopState::default(),
                        error: PhaseError::PhaseTimeout {
                            phase: phase.id.clone(),
                            timeout: phase_max,
                            task_id: task.id.clone(),
                        },
                    }
                }
            }
        };
        warnings.abort();
        Ok(outcome)
    }

    async fn build_vars(
        &self,
        task: &Task,
        phase: &PhaseSpec,
        worktree: &WorktreeContext,
        review_round: u32,
    ) -> Result<TemplateVars, DriverError> {
        let task_dir = self.task_dir_base.join(&task.id);
        let resolver = ContentResolver::new(self.backend.clone(), &task_dir);

        let mut vars = TemplateVars::for_task(task, &phase.id, 1).with_worktree_context(
            &worktree.path.to_string_lossy(),
            &worktree.task_branch,
            &worktree.target_branch,
        );
        vars.coverage_threshold = self.config.validation.coverage_threshold;

        vars = resolver
            .populate(&task.id, vars)
            .await
            .map_err(DriverError::Other)?;

        if let Some(initiative_id) = &task.initiative_id
            && let Some(initiative) = self
                .backend
                .load_initiative(initiative_id)
                .await
                .map_err(DriverError::Other)?
        {
            vars = vars.with_initiative_context(&initiative);
        }
        if let Some(constitution) = self
            .backend
            .load_constitution()
            .await
            .map_err(DriverError::Other)?
        {
            vars = vars.with_constitution(&constitution);
        }
        if let Some(detection) = self
            .backend
            .load_detection()
            .await
            .map_err(DriverError::Other)?
        {
            vars = vars.with_project_detection(&detection);
        }

        if phase.id == "review" {
            let findings = resolver
                .review_findings_for_round(&task.id, review_round)
                .await
                .map_err(DriverError::Other)?;
            vars = vars.with_review_round(review_round, &findings);
        }

        Ok(vars)
    }

    /// Phase override > template override > global default.
    fn resolve_model(&self, phase: &PhaseSpec, template: &PromptTemplate) -> String {
        phase
            .model_override
            .clone()
            .or_else(|| template.model_override.clone())
            .unwrap_or_else(|| self.config.engine.default_model.clone())
    }

    /// Phase override > template override > global default; decision phases
    /// default thinking on.
    fn resolve_thinking(&self, phase: &PhaseSpec, template: &PromptTemplate) -> bool {
        phase
            .thinking_override
            .or(template.thinking_override)
            .unwrap_or_else(|| phase.is_decision_phase() || self.config.engine.extended_thinking)
    }

    fn phase_record(
        &self,
        run: &WorkflowRun,
        task: &Task,
        phase: &PhaseSpec,
        status: RunStatus,
        state: &LoopState,
        error: Option<&str>,
    ) -> WorkflowRunPhase {
        WorkflowRunPhase {
            run_id: run.run_id.clone(),
            task_id: task.id.clone(),
            phase_id: phase.id.clone(),
            status,
            iterations: state.iteration,
            totals: totals_of(state),
            artifact: None,
            error: error.map(String::from),
        }
    }

    async fn persist_phase(
        &self,
        run: &WorkflowRun,
        task: &Task,
        phase: &PhaseSpec,
        status: RunStatus,
        state: &LoopState,
        error: Option<&str>,
    ) {
        let record = self.phase_record(run, task, phase, status, state, error);
        if let Err(err) = self.backend.save_workflow_run_phase(&record).await {
            warn!(task_id = %task.id, error = %err, "phase persist failed");
        }
    }

    fn activity_callbacks(&self, task_id: &str) -> ActivityCallbacks {
        let state_pub = self.publisher.clone();
        let state_task = task_id.to_string();
        let beat_pub = self.publisher.clone();
        let beat_task = task_id.to_string();
        let idle_pub = self.publisher.clone();
        let idle_task = task_id.to_string();
        let timeout_pub = self.publisher.clone();
        let timeout_task = task_id.to_string();

        ActivityCallbacks {
            on_state_change: Some(Box::new(move |_, to| {
                state_pub.activity(&state_task, to, None);
            })),
            on_heartbeat: Some(Box::new(move |state: ActivityState, elapsed| {
                beat_pub.activity(
                    &beat_task,
                    state,
                    Some(format!("heartbeat at {}s", elapsed.as_secs())),
                );
            })),
            on_idle_warning: Some(Box::new(move |state, idle_for| {
                idle_pub.warning(
                    &idle_task,
                    &format!("no activity for {}s while {state}", idle_for.as_secs()),
                );
            })),
            on_turn_timeout: Some(Box::new(move |turn_for| {
                timeout_pub.warning(
                    &timeout_task,
                    &format!("turn running for {}s, over the turn timeout", turn_for.as_secs()),
                );
            })),
        }
    }

    fn report_resources(&self, task_id: &str, report: ResourceReport) {
        for orphan in &report.orphans {
            self.publisher.warning(
                task_id,
                &format!(
                    "orphaned process after run: pid {} ({})",
                    orphan.pid, orphan.command
                ),
            );
        }
        if report.growth_exceeded {
            self.publisher.warning(
                task_id,
                &format!(
                    "memory grew {:.0} MB over the run ({:.0} MB -> {:.0} MB)",
                    report.memory_growth_mb, report.memory_before_mb, report.memory_after_mb
                ),
            );
        }
    }

    /// Completion action: auto-commit leftovers, then none / pr / merge.
    async fn finalize(&self, task: &Task, worktree: &WorktreeContext) -> Option<Pr> {
        match self
            .worktrees
            .auto_commit_before_pr(&worktree.path, &task.id)
            .await
        {
            Ok(true) => info!(task_id = %task.id, "auto-committed leftover changes"),
            Ok(false) => {}
            // Best-effort: a failed auto-commit must not sink the run.
            Err(err) => warn!(task_id = %task.id, error = %err, "auto-commit failed"),
        }

        if self.config.completion.action == CompletionAction::None {
            return None;
        }
        let Some(provider) = &self.pr_provider else {
            warn!(task_id = %task.id, "completion action needs a PR provider; skipping");
            return None;
        };

        if let Err(err) = self
            .worktrees
            .git()
            .push(&worktree.path, &worktree.task_branch)
            .await
        {
            warn!(task_id = %task.id, error = %err, "push failed; skipping change request");
            return None;
        }

        let opts = resolve_pr_options(task, &self.config.pr, &worktree.target_branch);
        let pr = match provider.create_pr(&opts).await {
            Ok(pr) => pr,
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "change request creation failed");
                return None;
            }
        };
        info!(task_id = %task.id, url = %pr.url, "change request opened");

        if self.config.completion.action == CompletionAction::Merge
            && let Err(err) = provider
                .merge_pr(pr.number, self.config.completion.merge_method)
                .await
        {
            warn!(task_id = %task.id, error = %err, "merge failed");
        }
        Some(pr)
    }
}

/// Convenience map from a run summary for status displays.
pub fn phase_status_map(summary: &RunSummary) -> HashMap<String, RunStatus> {
    summary
        .phases
        .iter()
        .map(|p| (p.id.clone(), p.status))
        .collect()
}
