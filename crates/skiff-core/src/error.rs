//! Engine-wide error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised engine error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    /// Path (local or remote) the error relates to, if any.
    pub path: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    /// TCP / DNS resolution failure.
    ConnectionFailed,
    /// SSH handshake failure.
    HandshakeFailed,
    /// No authentication method succeeded.
    AuthFailed,
    /// Host key unknown and the policy (or the user) rejected it.
    HostKeyRejected,
    /// Host key on record does not match the presented key.
    HostKeyMismatch,
    /// The remote refused the operation semantically.
    ProtocolError,
    /// Permission denied on the server.
    PermissionDenied,
    /// File/directory not found on the server.
    NotFound,
    /// An I/O error on the local side (disk full, local permissions).
    LocalIo,
    /// Destination exists and the conflict went unresolved.
    Conflict,
    /// Invalid entry name (control characters, empty, slash).
    InvalidName,
    /// Config / parameter validation error.
    InvalidConfig,
    /// Session was not found (invalid session id).
    SessionNotFound,
    /// Session dropped mid-operation.
    Disconnected,
    /// Operation timed out.
    Timeout,
    /// Operation cancelled by the user.
    Cancelled,
    /// Disk quota exceeded on the server.
    QuotaExceeded,
    /// Catch-all.
    Unknown,
}

pub type EngineResult<T> = Result<T, EngineError>;

// ── Construction helpers ─────────────────────────────────────────────

impl EngineError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            path: None,
            session_id: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionFailed, msg)
    }

    pub fn handshake_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::HandshakeFailed, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailed, msg)
    }

    pub fn host_key_rejected(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::HostKeyRejected, msg)
    }

    pub fn host_key_mismatch(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::HostKeyMismatch, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolError, msg)
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn local_io(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::LocalIo, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, msg)
    }

    pub fn invalid_name(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidName, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, msg)
    }

    pub fn session_not_found(id: &str) -> Self {
        Self::new(
            ErrorKind::SessionNotFound,
            format!("Session '{}' not found", id),
        )
        .with_session(id)
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Disconnected, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Cancelled by user")
    }

    /// Whether an automatic retry may help. Local disk errors and
    /// semantic rejections are permanent; only transport-level
    /// failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ConnectionFailed | ErrorKind::Disconnected | ErrorKind::Timeout
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(p) => write!(f, "[{:?}] {} ({})", self.kind, self.message, p),
            None => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::timeout(format!("I/O timeout: {}", e)),
            std::io::ErrorKind::NotFound => Self::not_found(e.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::local_io(format!("Permission denied: {}", e)),
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                Self::disconnected(e.to_string())
            }
            _ => Self::local_io(e.to_string()),
        }
    }
}

// libssh2 session error codes we classify specially.
const ERR_SOCKET_SEND: i32 = -7;
const ERR_TIMEOUT: i32 = -9;
const ERR_SOCKET_DISCONNECT: i32 = -13;
const ERR_AUTHENTICATION_FAILED: i32 = -18;
const ERR_SOCKET_RECV: i32 = -43;

impl From<ssh2::Error> for EngineError {
    fn from(e: ssh2::Error) -> Self {
        use ssh2::ErrorCode;
        let kind = match e.code() {
            // SFTP status codes (draft-ietf-secsh-filexfer section 7)
            ErrorCode::SFTP(2) => ErrorKind::NotFound,          // NO_SUCH_FILE
            ErrorCode::SFTP(3) => ErrorKind::PermissionDenied,  // PERMISSION_DENIED
            ErrorCode::SFTP(6) => ErrorKind::Disconnected,      // NO_CONNECTION
            ErrorCode::SFTP(7) => ErrorKind::Disconnected,      // CONNECTION_LOST
            ErrorCode::SFTP(8) => ErrorKind::ProtocolError,     // OP_UNSUPPORTED
            ErrorCode::SFTP(_) => ErrorKind::ProtocolError,
            ErrorCode::Session(ERR_TIMEOUT) => ErrorKind::Timeout,
            ErrorCode::Session(ERR_SOCKET_DISCONNECT) => ErrorKind::Disconnected,
            ErrorCode::Session(ERR_SOCKET_SEND) | ErrorCode::Session(ERR_SOCKET_RECV) => {
                ErrorKind::ConnectionFailed
            }
            ErrorCode::Session(ERR_AUTHENTICATION_FAILED) => ErrorKind::AuthFailed,
            ErrorCode::Session(_) => ErrorKind::ProtocolError,
        };
        Self::new(kind, e.message().to_string())
    }
}

/// Validate a single path component for rename / create-folder.
///
/// Rejects empty names, path separators, `.`/`..`, and control
/// characters, which some servers accept and then render unusable.
pub fn validate_entry_name(name: &str) -> EngineResult<()> {
    if name.is_empty() {
        return Err(EngineError::invalid_name("Name must not be empty"));
    }
    if name == "." || name == ".." {
        return Err(EngineError::invalid_name(format!("'{}' is reserved", name)));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(EngineError::invalid_name(format!(
            "'{}' contains a path separator",
            name
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(EngineError::invalid_name(format!(
            "'{}' contains control characters",
            name.escape_debug()
        )));
    }
    Ok(())
}
