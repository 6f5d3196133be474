//! Git worktree lifecycle and the `GitOps` contract.
//!
//! Each task runs in an isolated worktree on its own branch. The manager
//! creates or reuses the worktree (aborting any in-progress merge/rebase and
//! resetting clean on reuse), creates checkpoint commits after phases, and
//! auto-commits leftover changes before a change request is opened.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::events::FileChange;
use crate::task::Task;

/// Trailer appended to every commit the engine makes on the agent's behalf.
pub const CO_AUTHOR_TRAILER: &str = "Co-Authored-By: orc <orc@localhost>";

/// The worktree triple handed to phases.
#[derive(Debug, Clone)]
pub struct WorktreeContext {
    pub path: PathBuf,
    pub task_branch: String,
    pub target_branch: String,
}

/// Git porcelain used by the engine. Implementations must be context-aware:
/// dropping a returned future must not leave locks behind.
#[async_trait]
pub trait GitOps: Send + Sync {
    async fn create_worktree(
        &self,
        repo_root: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<()>;
    async fn remove_worktree(&self, repo_root: &Path, path: &Path) -> Result<()>;

    async fn abort_merge(&self, worktree: &Path) -> Result<()>;
    async fn abort_rebase(&self, worktree: &Path) -> Result<()>;
    async fn reset_clean(&self, worktree: &Path) -> Result<()>;

    async fn has_uncommitted(&self, worktree: &Path) -> Result<bool>;
    async fn stage_all(&self, worktree: &Path) -> Result<()>;
    /// Commit staged changes. `None` when there was nothing to commit.
    async fn commit(&self, worktree: &Path, message: &str) -> Result<Option<String>>;
    async fn push(&self, worktree: &Path, branch: &str) -> Result<()>;

    async fn diff_files(&self, worktree: &Path) -> Result<Vec<FileChange>>;

    async fn default_branch(&self, repo_root: &Path) -> Result<String>;
    async fn branch_exists(&self, repo_root: &Path, branch: &str) -> Result<bool>;
}

/// `GitOps` over the git CLI, with libgit2 for diff computation.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandGit;

impl CommandGit {
    pub fn new() -> Self {
        Self
    }

    async fn git(cwd: &Path, args: &[&str]) -> Result<std::process::Output> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .with_context(|| format!("spawning git {}", args.join(" ")))?;
        Ok(output)
    }

    async fn git_ok(cwd: &Path, args: &[&str]) -> Result<()> {
        let output = Self::git(cwd, args).await?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl GitOps for CommandGit {
    async fn create_worktree(
        &self,
        repo_root: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating worktree base dir {}", parent.display()))?;
        }

        let path_str = path.to_string_lossy();
        if self.branch_exists(repo_root, branch).await? {
            Self::git_ok(repo_root, &["worktree", "add", &path_str, branch]).await?;
        } else {
            Self::git_ok(repo_root, &["worktree", "add", &path_str, "-b", branch, base]).await?;
        }
        info!(path = %path.display(), branch, base, "worktree created");
        Ok(())
    }

    async fn remove_worktree(&self, repo_root: &Path, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        let output =
            Self::git(repo_root, &["worktree", "remove", &path_str, "--force"]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("is not a working tree") {
                bail!("git worktree remove failed: {}", stderr.trim());
            }
        }
        Ok(())
    }

    async fn abort_merge(&self, worktree: &Path) -> Result<()> {
        // Nothing to abort is fine.
        let _ = Self::git(worktree, &["merge", "--abort"]).await?;
        Ok(())
    }

    async fn abort_rebase(&self, worktree: &Path) -> Result<()> {
        let _ = Self::git(worktree, &["rebase", "--abort"]).await?;
        Ok(())
    }

    async fn reset_clean(&self, worktree: &Path) -> Result<()> {
        Self::git_ok(worktree, &["reset", "--hard", "HEAD"]).await?;
        Self::git_ok(worktree, &["clean", "-fd"]).await?;
        Ok(())
    }

    async fn has_uncommitted(&self, worktree: &Path) -> Result<bool> {
        let output = Self::git(worktree, &["status", "--porcelain"]).await?;
        if !output.status.success() {
            bail!(
                "git status failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(!output.stdout.is_empty())
    }

    async fn stage_all(&self, worktree: &Path) -> Result<()> {
        Self::git_ok(worktree, &["add", "-A"]).await
    }

    async fn commit(&self, worktree: &Path, message: &str) -> Result<Option<String>> {
        let output = Self::git(worktree, &["commit", "-m", message]).await?;
        if !output.status.success() {
            let combined = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            if combined.contains("nothing to commit") || combined.contains("nothing added") {
                return Ok(None);
            }
            bail!("git commit failed: {}", combined.trim());
        }
        let sha = Self::git(worktree, &["rev-parse", "HEAD"]).await?;
        Ok(Some(String::from_utf8_lossy(&sha.stdout).trim().to_string()))
    }

    async fn push(&self, worktree: &Path, branch: &str) -> Result<()> {
        Self::git_ok(worktree, &["push", "-u", "origin", branch]).await
    }

    async fn diff_files(&self, worktree: &Path) -> Result<Vec<FileChange>> {
        // libgit2 walks the diff; untracked files count as additions.
        let repo = git2::Repository::open(worktree)
            .with_context(|| format!("opening repository at {}", worktree.display()))?;

        let head_tree = repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_tree().ok());

        let mut opts = git2::DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let diff = repo
            .diff_tree_to_workdir_with_index(head_tree.as_ref(), Some(&mut opts))
            .context("computing workdir diff")?;

        let stats: std::cell::RefCell<BTreeMap<String, FileChange>> =
            std::cell::RefCell::new(BTreeMap::new());
        diff.foreach(
            &mut |delta, _| {
                if let Some(path) = delta.new_file().path() {
                    let status = match delta.status() {
                        git2::Delta::Added | git2::Delta::Untracked => "added",
                        git2::Delta::Modified => "modified",
                        git2::Delta::Deleted => "deleted",
                        git2::Delta::Renamed => "renamed",
                        _ => "other",
                    };
                    let path = path.to_string_lossy().into_owned();
                    stats.borrow_mut().insert(
                        path.clone(),
                        FileChange { path, status: status.into(), additions: 0, deletions: 0 },
                    );
                }
                true
            },
            None,
            None,
            Some(&mut |delta, _, line| {
                if let Some(path) = delta.new_file().path() {
                    let key = path.to_string_lossy();
                    if let Some(change) = stats.borrow_mut().get_mut(key.as_ref()) {
                        match line.origin() {
                            '+' => change.additions += 1,
                            '-' => change.deletions += 1,
                            _ => {}
                        }
                    }
                }
                true
            }),
        )
        .context("walking diff")?;

        Ok(stats.into_inner().into_values().collect())
    }

    async fn default_branch(&self, repo_root: &Path) -> Result<String> {
        // origin/HEAD when a remote exists, the current branch otherwise.
        let output = Self::git(
            repo_root,
            &["symbolic-ref", "refs/remotes/origin/HEAD", "--short"],
        )
        .await?;
        if output.status.success() {
            let full = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if let Some(branch) = full.strip_prefix("origin/") {
                return Ok(branch.to_string());
            }
        }
        let output = Self::git(repo_root, &["branch", "--show-current"]).await?;
        let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if branch.is_empty() {
            bail!("could not resolve a default branch for {}", repo_root.display());
        }
        Ok(branch)
    }

    async fn branch_exists(&self, repo_root: &Path, branch: &str) -> Result<bool> {
        let output = Self::git(
            repo_root,
            &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
        )
        .await?;
        Ok(output.status.success())
    }
}

/// Owns per-task worktrees under one base directory.
pub struct WorktreeManager {
    git: Arc<dyn GitOps>,
    repo_root: PathBuf,
    base_dir: PathBuf,
}

impl WorktreeManager {
    pub fn new(git: Arc<dyn GitOps>, repo_root: &Path, base_dir: &Path) -> Self {
        Self {
            git,
            repo_root: repo_root.to_path_buf(),
            base_dir: base_dir.to_path_buf(),
        }
    }

    pub fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.base_dir.join(task_id)
    }

    /// Create the worktree for a task, or reuse an existing one after
    /// aborting any in-progress merge/rebase and resetting it clean.
    pub async fn acquire(
        &self,
        task: &Task,
        configured_target: Option<&str>,
    ) -> Result<WorktreeContext> {
        let target_branch = match configured_target {
            Some(branch) if !branch.is_empty() => branch.to_string(),
            _ => self.git.default_branch(&self.repo_root).await?,
        };

        let path = self.worktree_path(&task.id);
        if path.exists() {
            debug!(path = %path.display(), "reusing worktree");
            self.git.abort_merge(&path).await?;
            self.git.abort_rebase(&path).await?;
            if self.git.has_uncommitted(&path).await? {
                warn!(task_id = %task.id, "uncommitted changes in reused worktree; resetting");
                self.git.reset_clean(&path).await?;
            }
        } else {
            self.git
                .create_worktree(&self.repo_root, &path, &task.branch, &target_branch)
                .await?;
        }

        Ok(WorktreeContext {
            path,
            task_branch: task.branch.clone(),
            target_branch,
        })
    }

    /// Remove the task's worktree.
    pub async fn cleanup(&self, task_id: &str) -> Result<()> {
        let path = self.worktree_path(task_id);
        if !path.exists() {
            return Ok(());
        }
        self.git.remove_worktree(&self.repo_root, &path).await?;
        info!(task_id, "worktree removed");
        Ok(())
    }

    /// Checkpoint commit after a completed phase.
    pub async fn checkpoint_commit(
        &self,
        worktree: &Path,
        task_id: &str,
        phase_id: &str,
    ) -> Result<()> {
        if !self.git.has_uncommitted(worktree).await? {
            return Ok(());
        }
        self.git.stage_all(worktree).await?;
        let message = format!("[orc] {task_id}: checkpoint after {phase_id}\n\n{CO_AUTHOR_TRAILER}");
        if let Some(sha) = self.git.commit(worktree, &message).await? {
            debug!(task_id, phase_id, sha, "checkpoint commit");
        }
        Ok(())
    }

    /// Auto-commit any leftover changes before a change request is opened.
    /// Returns whether a commit was created.
    pub async fn auto_commit_before_pr(&self, worktree: &Path, task_id: &str) -> Result<bool> {
        if !self.git.has_uncommitted(worktree).await? {
            return Ok(false);
        }
        self.git.stage_all(worktree).await?;
        let message = auto_commit_message(task_id);
        Ok(self.git.commit(worktree, &message).await?.is_some())
    }

    pub fn git(&self) -> Arc<dyn GitOps> {
        self.git.clone()
    }
}

/// The fixed-format auto-commit message.
pub fn auto_commit_message(task_id: &str) -> String {
    format!("[orc] {task_id}: Auto-commit before PR creation\n\n{CO_AUTHOR_TRAILER}")
}
