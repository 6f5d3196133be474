//! End-to-end engine scenarios with mock collaborators.
//!
//! Each scenario wires a scripted executor, an in-memory backend, and a real
//! git repository, then drives a full task run through the driver.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;

use orc::backend::{Backend, MemoryBackend, RunStatus};
use orc::cancel::CancelToken;
use orc::checkpoint::{Checkpointer, PhaseCheckpoint};
use orc::codec::validate::REQUIRED_QUALITY_CHECKS;
use orc::config::{CompletionAction, OrcConfig};
use orc::driver::TaskDriver;
use orc::events::{Event, EventKind, EventPublisher, PhaseEventKind, Publish, TranscriptRole};
use orc::executor::{TokenUsage, TurnExecutor, TurnResult};
use orc::gates::{
    BackpressureReport, BackpressureRunner, CriteriaVerdict, ProgressVerdict, Validator,
};
use orc::pr::{CheckRun, MergeMethod, Pr, PrComment, PrOptions, PrProvider};
use orc::task::{PhaseSpec, Task, Weight, default_phases};
use orc::worktree::{CommandGit, WorktreeManager};

// =============================================================================
// Mock collaborators
// =============================================================================

type SideEffect = Box<dyn Fn(&str) + Send + Sync>;

/// Pops scripted turn results in order; optionally runs a side effect per
/// prompt (e.g. dirtying the worktree like a real agent would).
struct ScriptedExecutor {
    script: Mutex<Vec<anyhow::Result<TurnResult>>>,
    prompts: Mutex<Vec<String>>,
    side_effect: Option<SideEffect>,
}

impl ScriptedExecutor {
    fn new(script: Vec<anyhow::Result<TurnResult>>) -> Self {
        Self {
            script: Mutex::new(script),
            prompts: Mutex::new(Vec::new()),
            side_effect: None,
        }
    }

    fn with_side_effect(mut self, effect: SideEffect) -> Self {
        self.side_effect = Some(effect);
        self
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TurnExecutor for ScriptedExecutor {
    async fn execute_turn(&self, prompt: &str) -> anyhow::Result<TurnResult> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(effect) = &self.side_effect {
            effect(prompt);
        }
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            anyhow::bail!("executor script exhausted");
        }
        script.remove(0)
    }

    fn update_session_id(&self, _session_id: &str) {}
}

/// Executor whose every turn hangs far past any phase deadline.
struct HangingExecutor;

#[async_trait]
impl TurnExecutor for HangingExecutor {
    async fn execute_turn(&self, _prompt: &str) -> anyhow::Result<TurnResult> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        anyhow::bail!("unreachable")
    }

    fn update_session_id(&self, _session_id: &str) {}
}

#[derive(Default)]
struct CapturingSink {
    events: Mutex<Vec<Event>>,
}

impl CapturingSink {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Publish for CapturingSink {
    fn publish(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
struct RecordingPrProvider {
    created: Mutex<Vec<PrOptions>>,
}

#[async_trait]
impl PrProvider for RecordingPrProvider {
    async fn create_pr(&self, opts: &PrOptions) -> anyhow::Result<Pr> {
        self.created.lock().unwrap().push(opts.clone());
        Ok(Pr { number: 7, url: "https://example.test/pr/7".into() })
    }
    async fn merge_pr(&self, _number: u64, _method: MergeMethod) -> anyhow::Result<()> {
        Ok(())
    }
    async fn update_pr(&self, _number: u64, _opts: &PrOptions) -> anyhow::Result<()> {
        Ok(())
    }
    async fn get_pr_by_url(&self, _url: &str) -> anyhow::Result<Option<Pr>> {
        Ok(None)
    }
    async fn find_pr_by_branch(&self, _branch: &str) -> anyhow::Result<Option<Pr>> {
        Ok(None)
    }
    async fn list_pr_comments(&self, _number: u64) -> anyhow::Result<Vec<PrComment>> {
        Ok(Vec::new())
    }
    async fn create_pr_comment(&self, _number: u64, body: &str) -> anyhow::Result<PrComment> {
        Ok(PrComment { id: 1, author: "orc".into(), body: body.into(), path: None, line: None })
    }
    async fn reply_to_comment(
        &self,
        _number: u64,
        _comment_id: u64,
        body: &str,
    ) -> anyhow::Result<PrComment> {
        Ok(PrComment { id: 2, author: "orc".into(), body: body.into(), path: None, line: None })
    }
    async fn get_check_runs(&self, _number: u64) -> anyhow::Result<Vec<CheckRun>> {
        Ok(Vec::new())
    }
    async fn check_auth(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Backpressure that fails a fixed number of times, then passes.
struct FlakyBackpressure {
    failures_left: Mutex<u32>,
}

#[async_trait]
impl BackpressureRunner for FlakyBackpressure {
    async fn run(&self, _worktree: &Path) -> anyhow::Result<BackpressureReport> {
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            Ok(BackpressureReport::fail("cargo test: FAILED auth::round_trip"))
        } else {
            Ok(BackpressureReport::pass())
        }
    }
}

/// Criteria validator that rejects a fixed number of times, then accepts.
struct FlakyCriteria {
    rejections_left: Mutex<u32>,
}

#[async_trait]
impl Validator for FlakyCriteria {
    async fn validate_progress(
        &self,
        _spec: &str,
        _response: &str,
    ) -> anyhow::Result<ProgressVerdict> {
        Ok(ProgressVerdict::Continue)
    }

    async fn validate_criteria(
        &self,
        _spec: &str,
        _response: &str,
    ) -> anyhow::Result<CriteriaVerdict> {
        let mut left = self.rejections_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            Ok(CriteriaVerdict::unmet("SC-2 (pagination) has no passing evidence"))
        } else {
            Ok(CriteriaVerdict::met())
        }
    }
}

// =============================================================================
// Fixtures
// =============================================================================

struct Harness {
    _dir: TempDir,
    repo: PathBuf,
    backend: Arc<MemoryBackend>,
    sink: Arc<CapturingSink>,
    pr_provider: Arc<RecordingPrProvider>,
    checkpoint_dir: PathBuf,
    worktree_base: PathBuf,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let remote = dir.path().join("origin.git");
        let remote_str = remote.to_string_lossy().into_owned();
        for args in [
            vec!["init", "--bare", remote_str.as_str()],
            vec!["-C", remote_str.as_str(), "symbolic-ref", "HEAD", "refs/heads/main"],
        ] {
            let output = Command::new("git").args(&args).output().await.unwrap();
            assert!(output.status.success(), "git {args:?} failed");
        }
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
            vec!["remote", "add", "origin", remote_str.as_str()],
            vec!["commit", "--allow-empty", "-m", "initial"],
        ] {
            let output = Command::new("git")
                .args(&args)
                .current_dir(&repo)
                .output()
                .await
                .unwrap();
            assert!(output.status.success(), "git {args:?} failed");
        }

        let checkpoint_dir = dir.path().join("checkpoints");
        let worktree_base = dir.path().join("worktrees");
        Self {
            _dir: dir,
            repo,
            backend: Arc::new(MemoryBackend::new()),
            sink: Arc::new(CapturingSink::default()),
            pr_provider: Arc::new(RecordingPrProvider::default()),
            checkpoint_dir,
            worktree_base,
        }
    }

    fn config(&self) -> OrcConfig {
        let mut config = OrcConfig::default();
        config.resources.enabled = false;
        config.engine.file_watch_interval_secs = 3600;
        config
    }

    fn driver(&self, config: OrcConfig, executor: Arc<dyn TurnExecutor>) -> TaskDriver {
        TaskDriver {
            config,
            backend: self.backend.clone(),
            executor,
            publisher: EventPublisher::new(self.sink.clone()),
            worktrees: Arc::new(WorktreeManager::new(
                Arc::new(CommandGit::new()),
                &self.repo,
                &self.worktree_base,
            )),
            pr_provider: Some(self.pr_provider.clone()),
            backpressure: None,
            validator: None,
            credentials: None,
            checkpoint_dir: self.checkpoint_dir.clone(),
            task_dir_base: self._dir.path().join("tasks"),
        }
    }

    async fn branch_log(&self, branch: &str) -> String {
        let output = Command::new("git")
            .args(["log", "--format=%s", branch])
            .current_dir(&self.repo)
            .output()
            .await
            .unwrap();
        String::from_utf8_lossy(&output.stdout).into_owned()
    }
}

fn turn(content: &str) -> anyhow::Result<TurnResult> {
    Ok(TurnResult {
        content: content.to_string(),
        session_id: "sess-1".into(),
        usage: TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        },
        cost_usd: 0.02,
        is_error: false,
        error_text: None,
        status: None,
        reason: None,
    })
}

fn content_complete(body: &str) -> String {
    serde_json::json!({"status": "complete", "content": body}).to_string()
}

fn spec_complete() -> String {
    let checklist: Vec<serde_json::Value> = REQUIRED_QUALITY_CHECKS
        .iter()
        .map(|id| serde_json::json!({"id": id, "check": id, "passed": true}))
        .collect();
    serde_json::json!({
        "status": "complete",
        "content": "# Overview\nAdd order search.\n\n## Success criteria\n- results under 200ms\n- pagination stable",
        "quality_checklist": checklist,
    })
    .to_string()
}

fn implement_complete() -> String {
    serde_json::json!({
        "status": "complete",
        "verification": {
            "tests": {"status": "PASS", "command": "cargo test"},
            "success_criteria": [
                {"id": "SC-1", "status": "PASS", "evidence": "search_under_200ms passed"},
                {"id": "SC-2", "status": "PASS", "evidence": "pagination_stable passed"},
            ],
            "build": {"status": "PASS"},
        }
    })
    .to_string()
}

fn default_complete() -> String {
    serde_json::json!({"status": "complete", "summary": "done"}).to_string()
}

// =============================================================================
// S1 - happy path, small task
// =============================================================================

#[tokio::test]
async fn s1_happy_path_small_task() {
    let harness = Harness::new().await;
    let worktree = harness.worktree_base.join("t-1");
    let executor = Arc::new(
        ScriptedExecutor::new(vec![
            turn(&content_complete("## Findings\nThe API lives in src/api.")),
            turn(&spec_complete()),
            turn(&implement_complete()),
            turn(&default_complete()),
        ])
        .with_side_effect(Box::new(move |prompt| {
            // The "agent" writes code while implementing.
            if prompt.contains("Implement:") {
                std::fs::write(worktree.join("search.rs"), "pub fn search() {}\n").unwrap();
            }
        })),
    );

    let task = Task::new("t-1", "Add search", Weight::Small, "orc/t-1");
    let phases = default_phases(Weight::Small);
    let driver = harness.driver(harness.config(), executor.clone());
    let result = driver
        .run(&task, &phases, CancelToken::never())
        .await
        .unwrap();

    assert_eq!(result.run.status, RunStatus::Completed);
    assert!(result.succeeded());
    assert_eq!(result.summary.completed, 4);
    // One iteration per phase.
    assert!(result.summary.phases.iter().all(|p| p.iterations == 1));

    // Exactly one research artifact; spec in the backend, never on disk.
    assert_eq!(harness.backend.artifact_count("t-1", "research"), 1);
    assert!(harness.backend.load_spec("t-1").await.unwrap().is_some());
    assert!(
        !harness
            ._dir
            .path()
            .join("tasks/t-1/artifacts/spec.md")
            .exists()
    );

    // The implement changes were committed on the task branch and a change
    // request was opened against it.
    let log = harness.branch_log("orc/t-1").await;
    assert!(log.contains("[orc] t-1:"), "no engine commit in:\n{log}");
    let created = harness.pr_provider.created.lock().unwrap().clone();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].head, "orc/t-1");
    assert_eq!(result.pr.as_ref().unwrap().number, 7);

    // Run totals equal the sum of per-phase totals.
    let phase_total: u64 = result.summary.phases.iter().map(|_| 100).sum();
    assert_eq!(result.run.totals.input_tokens, phase_total);

    // Worktree cleaned up on success.
    assert!(!harness.worktree_base.join("t-1").exists());
}

#[tokio::test]
async fn s1_event_ordering_per_phase() {
    let harness = Harness::new().await;
    let executor = Arc::new(ScriptedExecutor::new(vec![turn(&default_complete())]));

    let task = Task::new("t-2", "tiny fix", Weight::Trivial, "orc/t-2");
    let phases = vec![PhaseSpec::new("test", 5, 1)];
    let mut config = harness.config();
    config.completion.action = CompletionAction::None;
    let driver = harness.driver(config, executor);
    driver.run(&task, &phases, CancelToken::never()).await.unwrap();

    let events = harness.sink.events();
    let position = |pred: &dyn Fn(&Event) -> bool| events.iter().position(|e| pred(e)).unwrap();

    let started = position(&|e| {
        matches!(&e.kind, EventKind::Phase { kind: PhaseEventKind::Started, .. })
    });
    let prompt = position(&|e| {
        matches!(&e.kind, EventKind::Transcript { role: TranscriptRole::Prompt, .. })
    });
    let waiting = position(&|e| matches!(&e.kind, EventKind::Activity { .. }));
    let response = position(&|e| {
        matches!(&e.kind, EventKind::Transcript { role: TranscriptRole::Response, .. })
    });
    let tokens = position(&|e| matches!(&e.kind, EventKind::Tokens { .. }));
    let completed = position(&|e| {
        matches!(&e.kind, EventKind::Phase { kind: PhaseEventKind::Completed, .. })
    });

    assert!(started < prompt, "phase_start before prompt");
    assert!(prompt < waiting, "prompt before waiting_api");
    assert!(waiting < response, "waiting_api before response");
    assert!(response < tokens, "response before tokens");
    assert!(tokens < completed, "tokens before terminal event");
}

// =============================================================================
// S2 - spec validation retry
// =============================================================================

#[tokio::test]
async fn s2_spec_validation_retry() {
    let harness = Harness::new().await;
    let too_short = serde_json::json!({
        "status": "complete",
        "content": "only twenty chars!!",
        "quality_checklist": [],
    })
    .to_string();
    let executor = Arc::new(ScriptedExecutor::new(vec![
        turn(&too_short),
        turn(&spec_complete()),
    ]));

    let task = Task::new("t-3", "Add search", Weight::Medium, "orc/t-3");
    let phases = vec![PhaseSpec::new("spec", 5, 1).with_artifact()];
    let mut config = harness.config();
    config.completion.action = CompletionAction::None;
    let driver = harness.driver(config, executor.clone());
    let result = driver
        .run(&task, &phases, CancelToken::never())
        .await
        .unwrap();

    assert_eq!(result.run.status, RunStatus::Completed);
    assert_eq!(result.summary.phases[0].iterations, 2);

    // Iteration 2 was prompted with the structured failure detail.
    let prompts = executor.prompts();
    assert!(prompts[1].contains("content too short (19, need 50)"));
    assert!(harness.backend.load_spec("t-3").await.unwrap().is_some());
}

// =============================================================================
// S3 - backpressure loop and criteria gate
// =============================================================================

#[tokio::test]
async fn s3_backpressure_then_criteria_then_complete() {
    let harness = Harness::new().await;
    harness
        .backend
        .save_spec("t-4", "# Overview\nsearch spec with criteria", "caller")
        .await
        .unwrap();

    let executor = Arc::new(ScriptedExecutor::new(vec![
        turn(&implement_complete()),
        turn(&implement_complete()),
        turn(&implement_complete()),
    ]));

    let task = Task::new("t-4", "Add search", Weight::Small, "orc/t-4");
    let phases = vec![PhaseSpec::new("implement", 10, 1)];
    let mut config = harness.config();
    config.completion.action = CompletionAction::None;
    let mut driver = harness.driver(config, executor.clone());
    driver.backpressure = Some(Arc::new(FlakyBackpressure { failures_left: Mutex::new(1) }));
    driver.validator = Some(Arc::new(FlakyCriteria { rejections_left: Mutex::new(1) }));

    let result = driver
        .run(&task, &phases, CancelToken::never())
        .await
        .unwrap();

    assert_eq!(result.run.status, RunStatus::Completed);
    // Iter 1 rejected by backpressure, iter 2 rejected by criteria, iter 3 accepted.
    assert_eq!(result.summary.phases[0].iterations, 3);

    let prompts = executor.prompts();
    assert!(prompts[1].contains("FAILED auth::round_trip"));
    assert!(prompts[2].contains("SC-2 (pagination)"));
}

// =============================================================================
// S4 - review round 2 fail
// =============================================================================

#[tokio::test]
async fn s4_review_round_two_fail_blocks() {
    let harness = Harness::new().await;
    let findings = serde_json::json!({
        "round": 1,
        "summary": "two high issues",
        "issues": [
            {"severity": "high", "description": "SQL injection in search"},
            {"severity": "high", "description": "missing authz check"},
        ],
    })
    .to_string();
    let decision = serde_json::json!({
        "status": "fail",
        "gaps_addressed": false,
        "summary": "issues remain",
        "remaining_issues": ["SQL injection still present"],
        "recommendation": "fix the injection before merging",
    })
    .to_string();
    let executor = Arc::new(ScriptedExecutor::new(vec![turn(&findings), turn(&decision)]));

    let task = Task::new("t-5", "review me", Weight::Trivial, "orc/t-5");
    let phases = vec![PhaseSpec::new("review", 5, 1).with_artifact()];
    let mut config = harness.config();
    config.completion.action = CompletionAction::None;
    let driver = harness.driver(config, executor.clone());
    let result = driver
        .run(&task, &phases, CancelToken::never())
        .await
        .unwrap();

    assert_eq!(result.run.status, RunStatus::Paused);
    assert!(
        result
            .error
            .as_deref()
            .unwrap()
            .contains("fix the injection before merging")
    );

    // Round-1 findings are durably readable, and round 2 saw them.
    let stored = harness
        .backend
        .load_review_findings("t-5", 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.issues.len(), 2);
    let prompts = executor.prompts();
    assert!(prompts[1].contains("2 high"));
    assert!(prompts[1].contains("SQL injection in search"));
}

// =============================================================================
// S5 - phase timeout
// =============================================================================

#[tokio::test(start_paused = true)]
async fn s5_phase_timeout_is_resumable() {
    let harness = Harness::new().await;
    let task = Task::new("t-6", "slow task", Weight::Trivial, "orc/t-6");
    let phases = vec![PhaseSpec::new("test", 5, 1)];
    let mut config = harness.config();
    config.completion.action = CompletionAction::None;
    config.engine.phase_timeout_secs = 60;
    config.engine.max_retries = 0;

    let driver = harness.driver(config, Arc::new(HangingExecutor));
    let result = driver
        .run(&task, &phases, CancelToken::never())
        .await
        .unwrap();

    assert_eq!(result.run.status, RunStatus::Failed);
    assert!(result.resumable, "phase timeout must leave the task resumable");
    let error = result.error.unwrap();
    assert!(error.contains("test"));
    assert!(error.contains("t-6"));

    // Deadline warnings at 50% and 75% were published before failure.
    let warnings: Vec<String> = harness
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::Warning { message } => Some(message),
            _ => None,
        })
        .collect();
    assert!(warnings.iter().any(|w| w.contains("50%")));
    assert!(warnings.iter().any(|w| w.contains("75%")));

    // A checkpoint exists, so a later run resumes.
    assert!(Checkpointer::new(&harness.checkpoint_dir).exists("t-6", "test"));
}

// =============================================================================
// S6 - resume from checkpoint
// =============================================================================

#[tokio::test]
async fn s6_resume_from_checkpoint() {
    let harness = Harness::new().await;
    Checkpointer::new(&harness.checkpoint_dir)
        .save(
            "t-7",
            "test",
            &PhaseCheckpoint {
                iteration: 3,
                input_tokens: 1000,
                output_tokens: 500,
                ..Default::default()
            },
        )
        .unwrap();

    let executor = Arc::new(ScriptedExecutor::new(vec![turn(&default_complete())]));
    let task = Task::new("t-7", "resumed task", Weight::Trivial, "orc/t-7");
    let phases = vec![PhaseSpec::new("test", 10, 1)];
    let mut config = harness.config();
    config.completion.action = CompletionAction::None;
    let driver = harness.driver(config, executor.clone());
    let result = driver
        .run(&task, &phases, CancelToken::never())
        .await
        .unwrap();

    assert_eq!(result.run.status, RunStatus::Completed);
    // Resumed at iteration 4 with carried totals plus the new turn.
    assert_eq!(result.summary.phases[0].iterations, 4);
    assert_eq!(result.run.totals.input_tokens, 1100);
    assert_eq!(result.run.totals.output_tokens, 550);

    // Continuation prompt, not the full template.
    assert_eq!(executor.prompts()[0], "Continue working on the task.");

    // Checkpoint removed on completion.
    assert!(!Checkpointer::new(&harness.checkpoint_dir).exists("t-7", "test"));
}

// =============================================================================
// Retry envelope
// =============================================================================

#[tokio::test(start_paused = true)]
async fn retryable_turn_errors_are_retried_with_backoff() {
    let harness = Harness::new().await;
    let executor = Arc::new(ScriptedExecutor::new(vec![
        Err(anyhow::anyhow!("connection reset by peer")),
        turn(&default_complete()),
    ]));

    let task = Task::new("t-8", "flaky network", Weight::Trivial, "orc/t-8");
    let phases = vec![PhaseSpec::new("test", 5, 1)];
    let mut config = harness.config();
    config.completion.action = CompletionAction::None;
    let driver = harness.driver(config, executor.clone());
    let result = driver
        .run(&task, &phases, CancelToken::never())
        .await
        .unwrap();

    assert_eq!(result.run.status, RunStatus::Completed);
    assert_eq!(executor.prompts().len(), 2);
}

// =============================================================================
// Orchestrator: concurrent tasks
// =============================================================================

#[tokio::test]
async fn orchestrator_runs_tasks_concurrently() {
    use orc::orchestrator::Orchestrator;

    let harness = Harness::new().await;
    let executor = Arc::new(ScriptedExecutor::new(vec![
        turn(&default_complete()),
        turn(&default_complete()),
    ]));

    let mut config = harness.config();
    config.completion.action = CompletionAction::None;
    let driver = Arc::new(harness.driver(config, executor));
    let orchestrator = Orchestrator::new(driver, EventPublisher::new(harness.sink.clone()), 2);

    let tasks = vec![
        (
            Task::new("t-a", "first", Weight::Trivial, "orc/t-a"),
            vec![PhaseSpec::new("test", 5, 1)],
        ),
        (
            Task::new("t-b", "second", Weight::Trivial, "orc/t-b"),
            vec![PhaseSpec::new("test", 5, 1)],
        ),
    ];
    let summary = orchestrator.run_tasks(tasks, CancelToken::never()).await;

    assert_eq!(summary.tasks, 2);
    assert_eq!(summary.completed, 2);
    assert!(summary.all_completed());
    assert_eq!(summary.totals.input_tokens, 200);

    // Session-wide updates went to the global sentinel id.
    let session_events: Vec<Event> = harness
        .sink
        .events()
        .into_iter()
        .filter(|e| matches!(e.kind, EventKind::SessionUpdate { .. }))
        .collect();
    assert!(session_events.len() >= 3);
    assert!(session_events.iter().all(|e| e.task_id == "_global"));
}

#[tokio::test(start_paused = true)]
async fn non_retryable_errors_fail_immediately() {
    let harness = Harness::new().await;
    let executor = Arc::new(ScriptedExecutor::new(vec![Err(anyhow::anyhow!(
        "invalid api key"
    ))]));

    let task = Task::new("t-9", "bad creds", Weight::Trivial, "orc/t-9");
    let phases = vec![PhaseSpec::new("test", 5, 1)];
    let mut config = harness.config();
    config.completion.action = CompletionAction::None;
    let driver = harness.driver(config, executor.clone());
    let result = driver
        .run(&task, &phases, CancelToken::never())
        .await
        .unwrap();

    assert_eq!(result.run.status, RunStatus::Failed);
    assert_eq!(executor.prompts().len(), 1);
    assert!(result.error.unwrap().contains("invalid api key"));
}
