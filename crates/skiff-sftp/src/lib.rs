//! # skiff-sftp
//!
//! SFTP connectivity for the skiff transfer engine: session
//! establishment with host-key verification, the trust store, the
//! session pool, and the remote-filesystem operation surface.

pub mod sftp;

pub use sftp::client::{RemoteClient, Ssh2RemoteClient};
pub use sftp::mock::MemoryRemoteClient;
pub use sftp::pool::SessionPool;
pub use sftp::service::{SftpService, SftpServiceState};
pub use sftp::trust::{HostKeyVerifier, HostTrustStore, TrustDecision};
pub use sftp::types::{ConnectionConfig, DirEntry, EntryType, FileStat, SessionInfo};
