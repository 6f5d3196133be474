//! Per-phase iteration checkpoints.
//!
//! A checkpoint exists exactly while a phase is in flight: written during
//! iteration, removed on successful completion. Writes are atomic (serialise,
//! write a sibling temp file, rename over the target) so a crash mid-write
//! never leaves a torn checkpoint behind.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Durable mid-phase state enabling resume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseCheckpoint {
    pub iteration: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub last_response: String,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub block_reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Owns the checkpoint directory and the save/load/remove lifecycle.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    dir: PathBuf,
}

impl Checkpointer {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    pub fn path(&self, task_id: &str, phase_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}-{phase_id}.json"))
    }

    /// Atomic write: serialise, ensure the parent exists, replace the file.
    pub fn save(&self, task_id: &str, phase_id: &str, checkpoint: &PhaseCheckpoint) -> Result<()> {
        let path = self.path(task_id, phase_id);
        let bytes = serde_json::to_vec_pretty(checkpoint).context("serializing checkpoint")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating checkpoint dir {}", parent.display()))?;
        }

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes)
            .with_context(|| format!("writing checkpoint temp file {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("replacing checkpoint {}", path.display()))?;

        debug!(task_id, phase_id, iteration = checkpoint.iteration, "checkpoint saved");
        Ok(())
    }

    /// Load a checkpoint if one exists. Absence is not an error.
    pub fn load(&self, task_id: &str, phase_id: &str) -> Result<Option<PhaseCheckpoint>> {
        let path = self.path(task_id, phase_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)
            .with_context(|| format!("reading checkpoint {}", path.display()))?;
        let checkpoint = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing checkpoint {}", path.display()))?;
        Ok(Some(checkpoint))
    }

    /// Remove the checkpoint. Already-absent is fine.
    pub fn remove(&self, task_id: &str, phase_id: &str) -> Result<()> {
        let path = self.path(task_id, phase_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(task_id, phase_id, "checkpoint removed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("removing checkpoint {}", path.display()))
            }
        }
    }

    pub fn exists(&self, task_id: &str, phase_id: &str) -> bool {
        self.path(task_id, phase_id).exists()
    }
}

/// The session identity for a phase: an externally provided id wins over the
/// computed `{task_id}-{phase_id}` default.
pub fn session_id_for(task_id: &str, phase_id: &str, external: Option<&str>) -> String {
    match external {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("{task_id}-{phase_id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn checkpoint() -> PhaseCheckpoint {
        PhaseCheckpoint {
            iteration: 3,
            input_tokens: 1000,
            output_tokens: 500,
            cache_creation_tokens: 20,
            cache_read_tokens: 800,
            cost_usd: 0.42,
            last_response: r#"{"status":"continue"}"#.into(),
            blocked: false,
            block_reason: None,
            error: None,
            session_id: Some("t-1-implement".into()),
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempdir().unwrap();
        let checkpointer = Checkpointer::new(dir.path());
        let original = checkpoint();

        checkpointer.save("t-1", "implement", &original).unwrap();
        let loaded = checkpointer.load("t-1", "implement").unwrap().unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let checkpointer = Checkpointer::new(dir.path());
        assert!(checkpointer.load("t-1", "implement").unwrap().is_none());
    }

    #[test]
    fn save_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let checkpointer = Checkpointer::new(&dir.path().join("nested/checkpoints"));
        checkpointer.save("t-1", "spec", &checkpoint()).unwrap();
        assert!(checkpointer.exists("t-1", "spec"));
    }

    #[test]
    fn save_replaces_previous() {
        let dir = tempdir().unwrap();
        let checkpointer = Checkpointer::new(dir.path());

        let mut first = checkpoint();
        first.iteration = 1;
        checkpointer.save("t-1", "implement", &first).unwrap();

        let mut second = checkpoint();
        second.iteration = 2;
        checkpointer.save("t-1", "implement", &second).unwrap();

        let loaded = checkpointer.load("t-1", "implement").unwrap().unwrap();
        assert_eq!(loaded.iteration, 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let checkpointer = Checkpointer::new(dir.path());

        checkpointer.save("t-1", "implement", &checkpoint()).unwrap();
        checkpointer.remove("t-1", "implement").unwrap();
        assert!(!checkpointer.exists("t-1", "implement"));

        // Second removal of an absent checkpoint is not an error.
        checkpointer.remove("t-1", "implement").unwrap();
    }

    #[test]
    fn torn_temp_file_does_not_shadow_checkpoint() {
        let dir = tempdir().unwrap();
        let checkpointer = Checkpointer::new(dir.path());
        checkpointer.save("t-1", "implement", &checkpoint()).unwrap();

        // A leftover temp file from a crashed write is ignored by load.
        std::fs::write(
            checkpointer.path("t-1", "implement").with_extension("json.tmp"),
            b"{ torn",
        )
        .unwrap();
        let loaded = checkpointer.load("t-1", "implement").unwrap().unwrap();
        assert_eq!(loaded.iteration, 3);
    }

    #[test]
    fn session_id_prefers_external() {
        assert_eq!(session_id_for("t-1", "spec", None), "t-1-spec");
        assert_eq!(session_id_for("t-1", "spec", Some("")), "t-1-spec");
        assert_eq!(session_id_for("t-1", "spec", Some("ext-9")), "ext-9");
    }
}
