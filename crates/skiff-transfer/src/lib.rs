//! # skiff-transfer
//!
//! The transfer engine behind the dual-pane file manager: a FIFO queue
//! dispatching uploads, downloads and remote moves to a bounded worker
//! pool, with cooperative pause/resume/cancel, automatic retry of
//! transient failures, token-bucket rate limiting, overwrite-conflict
//! resolution, and a recursive staging preparer.

pub mod transfer;

pub use transfer::conflict::{
    AutoResolver, ChannelResolver, ConflictChoice, ConflictInfo, ConflictReply, ConflictResolver,
};
pub use transfer::limiter::RateLimiter;
pub use transfer::local::LocalFsClient;
pub use transfer::scheduler::{TransferEvent, TransferQueue};
pub use transfer::staging::{StagingJob, StagingPreparer, StagingReport};
pub use transfer::task::{TaskKind, TaskState, TransferTask};
