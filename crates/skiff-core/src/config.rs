//! Engine configuration.
//!
//! Passed by value into the scheduler / session-service constructors.
//! Live changes go through dedicated calls (`set_concurrency`,
//! `set_global_rate_limit`), never through shared globals.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ── Serde default helpers ────────────────────────────────────────────────────

fn default_concurrency() -> usize {
    2
}
fn default_chunk_size() -> usize {
    1_048_576 // 1 MiB; also bounds pause/cancel latency
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_max_depth() -> u32 {
    32
}
fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("skiff-staging")
}
fn default_false() -> bool {
    false
}

/// Host-key verification policy, selected per connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum HostKeyPolicy {
    /// Unknown key is an immediate rejection, no prompt.
    Strict,
    /// Trust-on-first-use: unknown key raises a confirmation request.
    #[default]
    Tofu,
    /// Skip verification entirely. Surfaced to the caller as an
    /// explicit insecure marker on the session.
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Maximum simultaneously running transfer tasks.
    #[serde(default = "default_concurrency")]
    pub max_concurrent: usize,
    /// Global bandwidth limit in KB/s. 0 = unlimited.
    #[serde(default)]
    pub global_rate_limit_kbps: u64,
    /// Transfer chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Automatic retry budget for transient failures.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay of the bounded exponential retry backoff.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Where the staging preparer materialises remote selections.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Recursion bound for staging walks (symlink-loop guard).
    #[serde(default = "default_max_depth")]
    pub max_recursion_depth: u32,
    /// Hash host identities in the trust store (OpenSSH `|1|…` lines).
    #[serde(default = "default_false")]
    pub hash_known_hosts: bool,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    /// Resumed tasks keep their queue position instead of moving to
    /// the back of the Queued set.
    #[serde(default = "default_false")]
    pub resume_in_place: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_concurrency(),
            global_rate_limit_kbps: 0,
            chunk_size: default_chunk_size(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            staging_dir: default_staging_dir(),
            max_recursion_depth: default_max_depth(),
            hash_known_hosts: false,
            host_key_policy: HostKeyPolicy::default(),
            resume_in_place: false,
        }
    }
}

impl EngineConfig {
    /// Backoff before retry attempt `attempt` (1-based), bounded
    /// exponential: `retry_delay_ms * 2^(attempt-1)`, capped at 30 s.
    pub fn retry_backoff(&self, attempt: u32) -> std::time::Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .retry_delay_ms
            .saturating_mul(1u64 << shift)
            .min(30_000);
        std::time::Duration::from_millis(ms)
    }
}
