use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use orc::agent_cli::{AgentCliConfig, AgentCliExecutor};
use orc::backend::MemoryBackend;
use orc::cancel::cancel_pair;
use orc::checkpoint::Checkpointer;
use orc::config::OrcConfig;
use orc::driver::TaskDriver;
use orc::events::EventPublisher;
use orc::orchestrator::Orchestrator;
use orc::task::{PhaseSpec, Task, default_phases};
use orc::worktree::{CommandGit, WorktreeManager};

#[derive(Parser)]
#[command(name = "orc")]
#[command(version, about = "LLM task orchestration engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Repository the tasks run against.
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    /// Path to orc.toml. Defaults to {repo}/orc.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the tasks described in a JSON file.
    Run {
        /// JSON array of task definitions.
        #[arg(long)]
        tasks: PathBuf,
        /// Agent CLI binary to drive.
        #[arg(long, default_value = "claude")]
        agent: String,
    },
    /// Show the phase workflow a task weight would run.
    Phases {
        #[arg(long, default_value = "small")]
        weight: String,
    },
    /// List resumable task phases (live checkpoints).
    Status,
    /// Validate the configuration and print warnings.
    Config,
}

/// One entry of the tasks file: a task plus an optional custom workflow.
#[derive(Debug, Deserialize)]
struct TaskDef {
    #[serde(flatten)]
    task: Task,
    #[serde(default)]
    phases: Option<Vec<PhaseSpec>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "orc=debug" } else { "orc=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let repo = match cli.repo.clone() {
        Some(repo) => repo,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| repo.join("orc.toml"));
    let config = OrcConfig::load_or_default(&config_path)?;

    for warning in config.validate() {
        eprintln!("{} {warning}", console::style("warning:").yellow());
    }

    match &cli.command {
        Commands::Run { tasks, agent } => cmd_run(&repo, config, tasks, agent).await,
        Commands::Phases { weight } => cmd_phases(weight),
        Commands::Status => cmd_status(&repo),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn cmd_run(
    repo: &std::path::Path,
    config: OrcConfig,
    tasks_file: &std::path::Path,
    agent: &str,
) -> Result<()> {
    let content = std::fs::read_to_string(tasks_file)
        .with_context(|| format!("reading tasks file {}", tasks_file.display()))?;
    let defs: Vec<TaskDef> = serde_json::from_str(&content)
        .with_context(|| format!("parsing tasks file {}", tasks_file.display()))?;
    if defs.is_empty() {
        anyhow::bail!("tasks file is empty");
    }

    let orc_dir = repo.join(".orc");
    let max_parallel = config.engine.max_parallel_tasks;
    let executor = Arc::new(AgentCliExecutor::new(
        AgentCliConfig::new(agent, repo).with_model(&config.engine.default_model),
    ));
    let driver = Arc::new(TaskDriver {
        config,
        backend: Arc::new(MemoryBackend::new()),
        executor,
        publisher: EventPublisher::disabled(),
        worktrees: Arc::new(WorktreeManager::new(
            Arc::new(CommandGit::new()),
            repo,
            &orc_dir.join("worktrees"),
        )),
        pr_provider: None,
        backpressure: None,
        validator: None,
        credentials: None,
        checkpoint_dir: orc_dir.join("checkpoints"),
        task_dir_base: orc_dir.join("tasks"),
    });

    let orchestrator = Orchestrator::new(driver, EventPublisher::disabled(), max_parallel);
    let (handle, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    let pairs: Vec<(Task, Vec<PhaseSpec>)> = defs
        .into_iter()
        .map(|def| {
            let phases = def
                .phases
                .unwrap_or_else(|| default_phases(def.task.weight));
            (def.task, phases)
        })
        .collect();

    let summary = orchestrator.run_tasks(pairs, token).await;
    for report in &summary.reports {
        let status = format!("{:?}", report.status).to_lowercase();
        let styled = match status.as_str() {
            "completed" => console::style(status).green(),
            "paused" => console::style(status).yellow(),
            _ => console::style(status).red(),
        };
        println!(
            "{} {} ({}/{} phases){}",
            styled,
            report.task_id,
            report.completed_phases,
            report.total_phases,
            report
                .pr_url
                .as_deref()
                .map(|url| format!(" -> {url}"))
                .unwrap_or_default()
        );
        if let Some(error) = &report.error {
            println!("    {error}");
        }
    }

    if summary.all_completed() {
        Ok(())
    } else {
        anyhow::bail!(
            "{} of {} tasks did not complete",
            summary.tasks - summary.completed,
            summary.tasks
        )
    }
}

fn cmd_phases(weight: &str) -> Result<()> {
    let weight = serde_json::from_value(serde_json::Value::String(weight.to_string()))
        .with_context(|| format!("unknown weight '{weight}'"))?;
    for phase in default_phases(weight) {
        println!(
            "{:<12} max_iterations={:<3} depends_on={}",
            phase.id,
            phase.max_iterations,
            phase
                .parse_depends_on()
                .map(|deps| deps.join(","))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn cmd_status(repo: &std::path::Path) -> Result<()> {
    let checkpoint_dir = repo.join(".orc/checkpoints");
    if !checkpoint_dir.exists() {
        println!("no live checkpoints");
        return Ok(());
    }
    let checkpointer = Checkpointer::new(&checkpoint_dir);
    let mut found = false;
    for entry in std::fs::read_dir(&checkpoint_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
            continue;
        };
        // Checkpoint files are named {task_id}-{phase_id}.json.
        let Some((task_id, phase_id)) = stem.rsplit_once('-') else {
            continue;
        };
        if let Ok(Some(checkpoint)) = checkpointer.load(task_id, phase_id) {
            found = true;
            println!(
                "{task_id} / {phase_id}: iteration {}, {} in / {} out tokens{}",
                checkpoint.iteration,
                checkpoint.input_tokens,
                checkpoint.output_tokens,
                if checkpoint.blocked { " (blocked)" } else { "" }
            );
        }
    }
    if !found {
        println!("no live checkpoints");
    }
    Ok(())
}
