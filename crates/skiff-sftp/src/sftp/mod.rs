// ── skiff-sftp / sftp module ─────────────────────────────────────────────────
//
// SFTP session layer providing:
//   • Session management (password / key / agent auth)
//   • Host-key verification: strict, trust-on-first-use, or off
//   • OpenSSH-compatible known_hosts store (plain and hashed entries)
//   • Endpoint-keyed session pool with fatal-error eviction
//   • The `RemoteClient` seam the transfer engine drives, with an
//     ssh2 implementation and an in-memory mock for tests

pub mod client;
pub mod dir_ops;
pub mod file_ops;
pub mod mock;
pub mod pool;
pub mod service;
pub mod trust;
pub mod types;

pub use client::{Ssh2RemoteClient, RemoteClient};
pub use mock::MemoryRemoteClient;
pub use pool::SessionPool;
pub use service::{SftpService, SftpServiceState};
pub use trust::{
    fingerprint_sha256, HostCheck, HostKeyPrompt, HostKeyVerifier, HostTrustStore, TrustDecision,
};
pub use types::*;
