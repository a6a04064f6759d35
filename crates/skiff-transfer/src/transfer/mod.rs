// ── skiff-transfer / transfer module ────────────────────────────────────────
//
// Queue engine layout:
//   task:      TransferTask state machine
//   limiter:   token-bucket rate limiter (global + per-task)
//   conflict:  overwrite/resume conflict resolution
//   scheduler: TransferQueue, FIFO dispatch to a bounded worker pool
//   staging:   recursive remote-to-local staging preparer
//   local:     local-filesystem adapter for the RemoteClient seam

pub mod conflict;
pub mod limiter;
pub mod local;
pub mod scheduler;
pub mod staging;
pub mod task;
