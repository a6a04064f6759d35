// ── TransferTask – queue entry and its state machine ────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskKind {
    /// Local file to remote path.
    Upload,
    /// Remote file to local path.
    Download,
    /// Remote rename; no byte copy, never resumable.
    Move,
}

impl TaskKind {
    /// Whether a partially transferred destination can be continued
    /// from its current length.
    pub fn is_resumable(self) -> bool {
        !matches!(self, TaskKind::Move)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Paused,
    Completed,
    Error,
    Canceled,
}

impl TaskState {
    /// Terminal states are sinks; only `Error` can be re-entered into
    /// the queue, and only through an explicit retry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Error | TaskState::Canceled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    pub id: String,
    pub kind: TaskKind,
    pub source: String,
    pub destination: String,
    /// Total size when known at enqueue/stat time.
    pub size: Option<u64>,
    /// Bytes committed to the destination so far.
    pub transferred: u64,
    pub state: TaskState,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Per-task cap in KB/s; 0 defers entirely to the global limit.
    pub rate_limit_kbps: u64,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Outcome annotation, e.g. "skipped" for a skip conflict decision.
    pub note: Option<String>,
    /// Conflict decisions marked "apply to all" stick within this scope.
    pub batch_id: String,
    /// Offset to continue from after a resume-style conflict decision.
    pub resume_offset: u64,
}

impl TransferTask {
    pub fn new(
        kind: TaskKind,
        source: impl Into<String>,
        destination: impl Into<String>,
        max_attempts: u32,
        batch_id: impl Into<String>,
    ) -> Self {
        TransferTask {
            id: Uuid::new_v4().to_string(),
            kind,
            source: source.into(),
            destination: destination.into(),
            size: None,
            transferred: 0,
            state: TaskState::Queued,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            rate_limit_kbps: 0,
            created_at: Utc::now(),
            last_error: None,
            note: None,
            batch_id: batch_id.into(),
            resume_offset: 0,
        }
    }

    /// Record forward progress, clamped to the known size.
    pub fn advance(&mut self, bytes: u64) {
        self.transferred = match self.size {
            Some(total) => (self.transferred + bytes).min(total),
            None => self.transferred + bytes,
        };
    }

    pub fn progress_percent(&self) -> Option<f64> {
        match self.size {
            Some(0) => Some(100.0),
            Some(total) => Some(self.transferred as f64 * 100.0 / total as f64),
            None => None,
        }
    }

    /// Reset for an explicit retry out of `Error`. Progress survives
    /// only for kinds that can continue mid-file.
    pub fn reset_for_retry(&mut self) {
        self.state = TaskState::Queued;
        self.attempts = 0;
        self.last_error = None;
        if !self.kind.is_resumable() {
            self.transferred = 0;
            self.resume_offset = 0;
        }
    }
}
