// ── Conflict resolution – what to do when the destination exists ────────────

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub task_id: String,
    /// Display name of the colliding entry.
    pub name: String,
    pub source_size: Option<u64>,
    pub source_modified: Option<u64>,
    pub dest_size: Option<u64>,
    pub dest_modified: Option<u64>,
    /// True only when the destination is shorter than the source and
    /// the operation can continue from an offset. When false, Resume is
    /// not on offer and a resolver answering it is coerced to Overwrite.
    pub resumable: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Continue from the destination's current length.
    Resume,
    Overwrite,
    /// Leave the destination untouched; the task completes with zero
    /// bytes moved.
    Skip,
    /// Cancel this task.
    Cancel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReply {
    pub choice: ConflictChoice,
    /// Reuse this choice for every later conflict in the same batch.
    pub apply_to_all: bool,
}

impl ConflictReply {
    pub fn once(choice: ConflictChoice) -> Self {
        ConflictReply {
            choice,
            apply_to_all: false,
        }
    }
}

/// Decides overwrite conflicts. The worker awaits the decision without
/// holding any queue lock, so a slow answer stalls only its own task.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, info: ConflictInfo) -> ConflictReply;
}

/// Always answers with a fixed choice. The headless default and the
/// workhorse of the engine tests.
pub struct AutoResolver(pub ConflictChoice);

#[async_trait]
impl ConflictResolver for AutoResolver {
    async fn resolve(&self, _info: ConflictInfo) -> ConflictReply {
        ConflictReply::once(self.0)
    }
}

/// Forwards conflicts over a channel to whoever drives the UI and waits
/// for the answer. A dropped receiver or reply sender degrades to Skip,
/// leaving the destination alone.
pub struct ChannelResolver {
    out: mpsc::Sender<(ConflictInfo, oneshot::Sender<ConflictReply>)>,
}

impl ChannelResolver {
    pub fn new() -> (
        Self,
        mpsc::Receiver<(ConflictInfo, oneshot::Sender<ConflictReply>)>,
    ) {
        let (out, rx) = mpsc::channel(16);
        (ChannelResolver { out }, rx)
    }
}

#[async_trait]
impl ConflictResolver for ChannelResolver {
    async fn resolve(&self, info: ConflictInfo) -> ConflictReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.out.send((info, reply_tx)).await.is_err() {
            return ConflictReply::once(ConflictChoice::Skip);
        }
        reply_rx
            .await
            .unwrap_or_else(|_| ConflictReply::once(ConflictChoice::Skip))
    }
}
