//! Run-level orchestration.
//!
//! Stands up one driver per task, runs tasks concurrently up to the
//! configured cap, and owns the session-wide accounting. Within a task,
//! phases are sequential; across tasks, turns may overlap.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::backend::{RunStatus, UsageTotals};
use crate::cancel::CancelToken;
use crate::driver::TaskDriver;
use crate::events::EventPublisher;
use crate::task::{PhaseSpec, Task};

/// Outcome of one task within the session.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub status: RunStatus,
    pub completed_phases: usize,
    pub total_phases: usize,
    pub totals: UsageTotals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub resumable: bool,
}

/// Session-wide accounting across every task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSummary {
    pub tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: usize,
    pub totals: UsageTotals,
    pub reports: Vec<TaskReport>,
}

impl SessionSummary {
    pub fn all_completed(&self) -> bool {
        self.completed == self.tasks
    }
}

/// Runs a set of tasks to completion.
pub struct Orchestrator {
    driver: Arc<TaskDriver>,
    publisher: EventPublisher,
    max_parallel: usize,
}

impl Orchestrator {
    pub fn new(driver: Arc<TaskDriver>, publisher: EventPublisher, max_parallel: usize) -> Self {
        Self {
            driver,
            publisher,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Run every `(task, phases)` pair, at most `max_parallel` at a time.
    pub async fn run_tasks(
        &self,
        tasks: Vec<(Task, Vec<PhaseSpec>)>,
        cancel: CancelToken,
    ) -> SessionSummary {
        let mut summary = SessionSummary {
            tasks: tasks.len(),
            ..Default::default()
        };
        self.publisher
            .session_update(&format!("starting {} task(s)", tasks.len()));

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut set = JoinSet::new();

        for (task, phases) in tasks {
            let driver = self.driver.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                let task_id = task.id.clone();
                let total_phases = phases.len();
                let result = driver.run(&task, &phases, cancel).await;
                (task_id, total_phases, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (task_id, total_phases, result) = match joined {
                Ok(output) => output,
                Err(err) => {
                    error!(error = %err, "task driver panicked");
                    summary.failed += 1;
                    continue;
                }
            };

            let report = match result {
                Ok(run) => TaskReport {
                    task_id: task_id.clone(),
                    status: run.run.status,
                    completed_phases: run.summary.completed,
                    total_phases: run.summary.total_phases,
                    totals: run.run.totals,
                    pr_url: run.pr.map(|pr| pr.url),
                    error: run.error,
                    resumable: run.resumable,
                },
                Err(err) => TaskReport {
                    task_id: task_id.clone(),
                    status: RunStatus::Failed,
                    completed_phases: 0,
                    total_phases,
                    totals: UsageTotals::default(),
                    pr_url: None,
                    error: Some(err.to_string()),
                    resumable: false,
                },
            };

            summary.totals.add(&report.totals);
            match report.status {
                RunStatus::Completed => summary.completed += 1,
                RunStatus::Paused => summary.paused += 1,
                _ => summary.failed += 1,
            }
            self.publisher.session_update(&format!(
                "task {task_id}: {:?} ({}/{} phases)",
                report.status, report.completed_phases, report.total_phases
            ));
            summary.reports.push(report);
        }

        info!(
            tasks = summary.tasks,
            completed = summary.completed,
            failed = summary.failed,
            paused = summary.paused,
            "session finished"
        );
        self.publisher.session_update(&format!(
            "session finished: {}/{} tasks completed",
            summary.completed, summary.tasks
        ));
        summary
    }
}
