// ── Types ─────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skiff_core::HostKeyPolicy;

// ── Serde default helpers ────────────────────────────────────────────────────

fn default_port() -> u16 {
    22
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_keepalive_secs() -> u64 {
    60
}

// ── Connection ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default = "default_false")]
    pub use_agent: bool,
    /// Override for the trust-store location; defaults to
    /// `~/.ssh/known_hosts`.
    #[serde(default)]
    pub known_hosts_path: Option<std::path::PathBuf>,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default)]
    pub initial_directory: Option<String>,
}

// ── Session ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: String,
    pub connected: bool,
    /// Set when the connection was made with host-key verification
    /// off. The caller must surface this.
    pub insecure_host_key: bool,
    pub host_key_algorithm: Option<String>,
    pub host_key_fingerprint: Option<String>,
    pub server_banner: Option<String>,
    pub remote_home: Option<String>,
    pub current_directory: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub operations_count: u64,
}

// ── Directory listing ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    pub entry_type: EntryType,
    /// Unknown when the server does not report a size.
    pub size: Option<u64>,
    pub permissions: u32,
    pub permissions_string: String,
    pub modified: Option<u64>,
    pub is_hidden: bool,
    pub link_target: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EntryType {
    File,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    NamedPipe,
    Socket,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    #[serde(default = "default_false")]
    pub include_hidden: bool,
    #[serde(default)]
    pub sort_by: SortField,
    #[serde(default = "default_true")]
    pub ascending: bool,
    #[serde(default)]
    pub filter_glob: Option<String>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            include_hidden: false,
            sort_by: SortField::Name,
            ascending: true,
            filter_glob: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    #[default]
    Name,
    Size,
    Modified,
    Permissions,
}

// ── File stat ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub path: String,
    pub size: Option<u64>,
    pub permissions: u32,
    pub permissions_string: String,
    pub modified: Option<u64>,
    pub entry_type: EntryType,
    pub link_target: Option<String>,
}

// ── Bulk operations ──────────────────────────────────────────────────────────

/// Aggregate result of a bulk operation (delete / move / chmod over a
/// selection). Bulk operations complete as many items as possible and
/// never abort on the first failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Last individual error, kept for diagnosis.
    pub last_error: Option<String>,
}

impl BulkOutcome {
    pub fn record_ok(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_err(&mut self, err: impl std::fmt::Display) {
        self.failed += 1;
        self.last_error = Some(err.to_string());
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }
}
