//! Process-tree resource tracking.
//!
//! A snapshot is taken before and after a task. Afterwards, new PIDs whose
//! parent died (reparented to init, or parent missing from the "after"
//! snapshot) are reported as orphans, optionally filtered to orc-related
//! commands: browser automation, Node tooling, agent CLIs, MCP servers.
//! Total memory growth beyond a threshold is reported as a warning.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One enumerated process, shared schema across platforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub command: String,
    pub memory_mb: f64,
    pub is_mcp: bool,
    pub is_orc_related: bool,
}

/// Commands that belong to the orchestration stack.
static ORC_RELATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        playwright | puppeteer | chromedriver | headless_shell |
        chromium .* --remote-debugging |
        \b node \b | \b npm \b | \b npx \b |
        \b claude \b | claude-code |
        mcp-server | mcp_
        ",
    )
    .expect("valid pattern")
});

static MCP_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)mcp[-_]").expect("valid pattern"));

/// Classify a raw command line.
pub fn classify_command(command: &str) -> (bool, bool) {
    let is_mcp = MCP_PATTERN.is_match(command);
    let is_orc_related = ORC_RELATED.is_match(command);
    (is_mcp, is_orc_related)
}

/// Which orphans get reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrphanFilter {
    /// Only orc-related orphans.
    #[default]
    Strict,
    /// Every orphan.
    Legacy,
}

/// A point-in-time view of the process tree.
#[derive(Debug, Clone, Default)]
pub struct ProcessSnapshot {
    pub processes: HashMap<u32, ProcessInfo>,
}

impl ProcessSnapshot {
    pub fn total_memory_mb(&self) -> f64 {
        self.processes.values().map(|p| p.memory_mb).sum()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.processes.contains_key(&pid)
    }
}

/// Pure orphan detection over two snapshots.
///
/// Orphan = PID new since `before` whose `ppid == 1` or whose parent is
/// absent from `after`. The strict filter additionally requires an
/// orc-related command.
pub fn detect_orphans(
    before: &ProcessSnapshot,
    after: &ProcessSnapshot,
    filter: OrphanFilter,
) -> Vec<ProcessInfo> {
    let mut orphans: Vec<ProcessInfo> = after
        .processes
        .values()
        .filter(|p| !before.contains(p.pid))
        .filter(|p| p.ppid == 1 || !after.contains(p.ppid))
        .filter(|p| match filter {
            OrphanFilter::Strict => p.is_orc_related,
            OrphanFilter::Legacy => true,
        })
        .cloned()
        .collect();
    orphans.sort_by_key(|p| p.pid);
    orphans
}

/// Report produced by the after-task snapshot.
#[derive(Debug, Clone, Default)]
pub struct ResourceReport {
    pub orphans: Vec<ProcessInfo>,
    pub memory_before_mb: f64,
    pub memory_after_mb: f64,
    pub memory_growth_mb: f64,
    pub growth_exceeded: bool,
}

/// Tracks resource usage around one task run.
pub struct ResourceTracker {
    filter: OrphanFilter,
    memory_threshold_mb: f64,
    before: Option<ProcessSnapshot>,
}

impl ResourceTracker {
    pub fn new(filter: OrphanFilter, memory_threshold_mb: f64) -> Self {
        Self {
            filter,
            memory_threshold_mb,
            before: None,
        }
    }

    /// Snapshot the process tree before the task starts.
    pub fn snapshot_before(&mut self) {
        let snapshot = enumerate().unwrap_or_else(|err| {
            warn!(error = %err, "process enumeration failed; resource tracking degraded");
            ProcessSnapshot::default()
        });
        debug!(count = snapshot.processes.len(), "before snapshot taken");
        self.before = Some(snapshot);
    }

    /// Snapshot after the task and compare. Resets the before snapshot.
    pub fn snapshot_after(&mut self) -> ResourceReport {
        let Some(before) = self.before.take() else {
            return ResourceReport::default();
        };
        let after = enumerate().unwrap_or_else(|err| {
            warn!(error = %err, "process enumeration failed; resource tracking degraded");
            ProcessSnapshot::default()
        });

        let orphans = detect_orphans(&before, &after, self.filter);
        let memory_before_mb = before.total_memory_mb();
        let memory_after_mb = after.total_memory_mb();
        let memory_growth_mb = memory_after_mb - memory_before_mb;
        let growth_exceeded =
            self.memory_threshold_mb > 0.0 && memory_growth_mb > self.memory_threshold_mb;

        if growth_exceeded {
            warn!(
                before_mb = memory_before_mb,
                after_mb = memory_after_mb,
                delta_mb = memory_growth_mb,
                threshold_mb = self.memory_threshold_mb,
                "memory growth over threshold"
            );
        }

        ResourceReport {
            orphans,
            memory_before_mb,
            memory_after_mb,
            memory_growth_mb,
            growth_exceeded,
        }
    }
}

/// Platform adapter: list `{pid, ppid, command, memory_mb}` for every
/// process.
#[cfg(unix)]
fn enumerate() -> anyhow::Result<ProcessSnapshot> {
    use anyhow::Context;

    let output = std::process::Command::new("ps")
        .args(["-eo", "pid=,ppid=,rss=,args="])
        .output()
        .context("running ps")?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    let mut processes = HashMap::new();
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        let (Some(pid), Some(ppid), Some(rss)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let (Ok(pid), Ok(ppid), Ok(rss_kb)) =
            (pid.parse::<u32>(), ppid.parse::<u32>(), rss.parse::<f64>())
        else {
            continue;
        };
        let command = parts.collect::<Vec<_>>().join(" ");
        let (is_mcp, is_orc_related) = classify_command(&command);
        processes.insert(
            pid,
            ProcessInfo {
                pid,
                ppid,
                command,
                memory_mb: rss_kb / 1024.0,
                is_mcp,
                is_orc_related,
            },
        );
    }
    Ok(ProcessSnapshot { processes })
}

#[cfg(not(unix))]
fn enumerate() -> anyhow::Result<ProcessSnapshot> {
    // Resource tracking is best-effort off unix; report an empty tree.
    Ok(ProcessSnapshot::default())
}
