//! Structured engine events and the publisher that fans them out.
//!
//! Every event carries a task id and a timestamp. Session-wide events use the
//! sentinel `GLOBAL_TASK_ID` so every subscriber receives them regardless of
//! which task it follows. The publisher is nil-safe: constructed without a
//! sink it silently drops everything, so callers never branch on "is there a
//! subscriber".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::activity::ActivityState;

/// Sentinel task id for session-wide events.
pub const GLOBAL_TASK_ID: &str = "_global";

/// Terminal states a phase event can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseEventKind {
    Started,
    Completed,
    Failed,
}

/// Direction of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    Prompt,
    Response,
}

/// One file touched in the worktree, as reported by the watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub status: String,
    pub additions: u32,
    pub deletions: u32,
}

/// The payload union. Tagged serde representation so subscribers off-process
/// can decode the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Phase {
        phase: String,
        kind: PhaseEventKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Transcript {
        phase: String,
        iteration: u32,
        role: TranscriptRole,
        text: String,
    },
    TranscriptChunk {
        phase: String,
        iteration: u32,
        chunk: String,
    },
    Tokens {
        phase: String,
        input_tokens: u64,
        output_tokens: u64,
        cache_creation_tokens: u64,
        cache_read_tokens: u64,
        cost_usd: f64,
    },
    Error {
        message: String,
    },
    State {
        status: String,
    },
    FilesChanged {
        files: Vec<FileChange>,
    },
    SessionUpdate {
        message: String,
    },
    Activity {
        state: ActivityState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Warning {
        message: String,
    },
}

/// A published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Subscriber interface. Implementations must tolerate concurrent calls.
pub trait Publish: Send + Sync {
    fn publish(&self, event: Event);
}

/// Nil-safe fan-out wrapper. Cloning is cheap; every helper stamps the
/// current time and the right task id.
#[derive(Clone, Default)]
pub struct EventPublisher {
    sink: Option<Arc<dyn Publish>>,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn Publish>) -> Self {
        Self { sink: Some(sink) }
    }

    /// A publisher that drops everything.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    fn emit(&self, task_id: &str, kind: EventKind) {
        if let Some(sink) = &self.sink {
            sink.publish(Event {
                task_id: task_id.to_string(),
                timestamp: Utc::now(),
                kind,
            });
        }
    }

    pub fn phase_started(&self, task_id: &str, phase: &str) {
        self.emit(
            task_id,
            EventKind::Phase {
                phase: phase.to_string(),
                kind: PhaseEventKind::Started,
                detail: None,
            },
        );
    }

    pub fn phase_completed(&self, task_id: &str, phase: &str, detail: Option<String>) {
        self.emit(
            task_id,
            EventKind::Phase {
                phase: phase.to_string(),
                kind: PhaseEventKind::Completed,
                detail,
            },
        );
    }

    pub fn phase_failed(&self, task_id: &str, phase: &str, detail: &str) {
        self.emit(
            task_id,
            EventKind::Phase {
                phase: phase.to_string(),
                kind: PhaseEventKind::Failed,
                detail: Some(detail.to_string()),
            },
        );
    }

    pub fn transcript(
        &self,
        task_id: &str,
        phase: &str,
        iteration: u32,
        role: TranscriptRole,
        text: &str,
    ) {
        self.emit(
            task_id,
            EventKind::Transcript {
                phase: phase.to_string(),
                iteration,
                role,
                text: text.to_string(),
            },
        );
    }

    pub fn transcript_chunk(&self, task_id: &str, phase: &str, iteration: u32, chunk: &str) {
        self.emit(
            task_id,
            EventKind::TranscriptChunk {
                phase: phase.to_string(),
                iteration,
                chunk: chunk.to_string(),
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn tokens(
        &self,
        task_id: &str,
        phase: &str,
        input_tokens: u64,
        output_tokens: u64,
        cache_creation_tokens: u64,
        cache_read_tokens: u64,
        cost_usd: f64,
    ) {
        self.emit(
            task_id,
            EventKind::Tokens {
                phase: phase.to_string(),
                input_tokens,
                output_tokens,
                cache_creation_tokens,
                cache_read_tokens,
                cost_usd,
            },
        );
    }

    pub fn error(&self, task_id: &str, message: &str) {
        self.emit(task_id, EventKind::Error { message: message.to_string() });
    }

    pub fn state(&self, task_id: &str, status: &str) {
        self.emit(task_id, EventKind::State { status: status.to_string() });
    }

    pub fn files_changed(&self, task_id: &str, files: Vec<FileChange>) {
        self.emit(task_id, EventKind::FilesChanged { files });
    }

    /// Session-wide update; always addressed to the global sentinel id.
    pub fn session_update(&self, message: &str) {
        self.emit(GLOBAL_TASK_ID, EventKind::SessionUpdate { message: message.to_string() });
    }

    pub fn activity(&self, task_id: &str, state: ActivityState, label: Option<String>) {
        self.emit(task_id, EventKind::Activity { state, label });
    }

    pub fn warning(&self, task_id: &str, message: &str) {
        self.emit(task_id, EventKind::Warning { message: message.to_string() });
    }
}
