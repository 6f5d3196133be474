//! Background file-change watcher.
//!
//! Polls the worktree diff on an interval and publishes `files_changed`
//! events. Consecutive identical file lists are de-duplicated by a digest of
//! the sorted `{path, status, additions, deletions}` tuples; an empty list
//! never publishes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::events::{EventPublisher, FileChange};
use crate::worktree::GitOps;

/// Digest of a sorted change list; equal digests mean no event.
pub fn change_digest(changes: &[FileChange]) -> String {
    let mut sorted: Vec<&FileChange> = changes.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Sha256::new();
    for change in sorted {
        hasher.update(change.path.as_bytes());
        hasher.update([0]);
        hasher.update(change.status.as_bytes());
        hasher.update(change.additions.to_le_bytes());
        hasher.update(change.deletions.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Spawn the watcher loop for one task's worktree.
pub fn spawn_watcher(
    git: Arc<dyn GitOps>,
    worktree: PathBuf,
    task_id: String,
    publisher: EventPublisher,
    interval: Duration,
    cancel: CancelToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_digest: Option<String> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let changes = match git.diff_files(&worktree).await {
                Ok(changes) => changes,
                Err(err) => {
                    debug!(task_id, error = %err, "file watch diff failed");
                    continue;
                }
            };
            if changes.is_empty() {
                continue;
            }

            let digest = change_digest(&changes);
            if last_digest.as_deref() == Some(digest.as_str()) {
                continue;
            }
            last_digest = Some(digest);
            publisher.files_changed(&task_id, changes);
        }
    })
}
