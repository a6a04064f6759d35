// ── SftpService – session lifecycle management ──────────────────────────────

use crate::sftp::trust::{verify_presented_key, HostKeyVerifier, HostTrustStore};
use crate::sftp::types::*;
use chrono::Utc;
use log::{info, warn};
use skiff_core::{Credential, CredentialProvider, Endpoint, EngineError, EngineResult};
use ssh2::Session;
use std::collections::HashMap;
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

// ── Internal session handle (not serialised to the caller) ───────────────────

pub(crate) struct SessionHandle {
    pub info: SessionInfo,
    pub session: Session,
    #[allow(dead_code)] // held to keep the TCP connection alive
    pub tcp: TcpStream,
}

// ── Service struct ───────────────────────────────────────────────────────────

pub struct SftpService {
    pub(crate) sessions: HashMap<String, SessionHandle>,
    hash_known_hosts: bool,
}

pub type SftpServiceState = Arc<Mutex<SftpService>>;

impl SftpService {
    /// Create a new service wrapped in the shared state type.
    pub fn new(hash_known_hosts: bool) -> SftpServiceState {
        Arc::new(Mutex::new(SftpService {
            sessions: HashMap::new(),
            hash_known_hosts,
        }))
    }

    // ── Connect ──────────────────────────────────────────────────────────────

    pub async fn connect(
        &mut self,
        config: ConnectionConfig,
        credentials: &dyn CredentialProvider,
        verifier: &dyn HostKeyVerifier,
    ) -> EngineResult<SessionInfo> {
        let addr = format!("{}:{}", config.host, config.port);
        info!("connecting to {}", addr);

        if credentials.insecure_fallback_active() {
            warn!("credential provider is using an insecure on-disk fallback");
        }

        use std::net::ToSocketAddrs;
        let sock_addr = addr
            .to_socket_addrs()
            .map_err(|e| {
                EngineError::connection_failed(format!("Cannot resolve '{}': {}", addr, e))
            })?
            .next()
            .ok_or_else(|| EngineError::connection_failed(format!("No address for '{}'", addr)))?;

        let tcp = TcpStream::connect_timeout(
            &sock_addr,
            std::time::Duration::from_secs(config.timeout_secs),
        )
        .map_err(|e| {
            EngineError::connection_failed(format!("TCP connection to {} failed: {}", addr, e))
        })?;
        tcp.set_nonblocking(false)
            .map_err(|e| EngineError::connection_failed(format!("Socket setup failed: {}", e)))?;

        let mut session = Session::new()
            .map_err(|e| EngineError::handshake_failed(format!("Session init failed: {}", e)))?;
        session.set_tcp_stream(
            tcp.try_clone()
                .map_err(|e| EngineError::connection_failed(e.to_string()))?,
        );
        session
            .handshake()
            .map_err(|e| EngineError::handshake_failed(format!("SSH handshake failed: {}", e)))?;

        let banner = session.banner().map(|b| b.to_string());

        // ── Host-key verification ────────────────────────────────────────────

        let (key, key_type) = session.host_key().ok_or_else(|| {
            EngineError::handshake_failed("Server presented no host key".to_string())
        })?;
        let algorithm = host_key_algorithm_name(key_type);
        let fingerprint = crate::sftp::trust::fingerprint_sha256(key);

        let trust_path = config
            .known_hosts_path
            .clone()
            .unwrap_or_else(HostTrustStore::default_path);
        let mut store = HostTrustStore::load(trust_path, self.hash_known_hosts)?;
        let insecure = verify_presented_key(
            &mut store,
            config.host_key_policy,
            verifier,
            &config.host,
            config.port,
            algorithm,
            key,
        )
        .await?;

        // ── Authentication ───────────────────────────────────────────────────

        let endpoint = Endpoint::new(config.host.clone(), config.port, config.username.clone());
        let credential = credentials.get_credential(&endpoint).await?;
        let auth_method = authenticate(&mut session, &config, credential)?;
        if !session.authenticated() {
            return Err(EngineError::auth_failed(
                "Not authenticated after auth attempt",
            ));
        }
        info!("authenticated to {} via {}", addr, auth_method);

        // Probe the remote home directory.
        let remote_home = session
            .sftp()
            .ok()
            .and_then(|sftp| sftp.realpath(Path::new(".")).ok())
            .map(|p| p.to_string_lossy().to_string());

        let initial_dir = config
            .initial_directory
            .clone()
            .or_else(|| remote_home.clone())
            .unwrap_or_else(|| "/".to_string());

        let keepalive = config.keepalive_interval_secs;
        session.set_keepalive(keepalive > 0, keepalive as u32);

        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let info = SessionInfo {
            id: session_id.clone(),
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            auth_method,
            connected: true,
            insecure_host_key: insecure,
            host_key_algorithm: Some(algorithm.to_string()),
            host_key_fingerprint: Some(fingerprint),
            server_banner: banner,
            remote_home,
            current_directory: initial_dir,
            connected_at: now,
            last_activity: now,
            bytes_uploaded: 0,
            bytes_downloaded: 0,
            operations_count: 0,
        };

        self.sessions.insert(
            session_id,
            SessionHandle {
                info: info.clone(),
                session,
                tcp,
            },
        );
        Ok(info)
    }

    // ── Disconnect ───────────────────────────────────────────────────────────

    pub async fn disconnect(&mut self, session_id: &str) -> EngineResult<()> {
        let handle = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| EngineError::session_not_found(session_id))?;
        let _ = handle
            .session
            .disconnect(None, "Client disconnecting", None);
        info!("session {} disconnected", session_id);
        Ok(())
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn session_info(&self, session_id: &str) -> EngineResult<SessionInfo> {
        self.sessions
            .get(session_id)
            .map(|h| h.info.clone())
            .ok_or_else(|| EngineError::session_not_found(session_id))
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.values().map(|h| h.info.clone()).collect()
    }

    /// Check whether a session is still alive (send a keepalive).
    pub fn ping(&mut self, session_id: &str) -> EngineResult<bool> {
        let handle = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::session_not_found(session_id))?;
        match handle.session.keepalive_send() {
            Ok(_) => {
                handle.info.last_activity = Utc::now();
                Ok(true)
            }
            Err(e) => {
                warn!("keepalive failed for {}: {}", session_id, e);
                handle.info.connected = false;
                Ok(false)
            }
        }
    }

    /// Resolve a remote path and make it the session's current directory.
    pub fn set_current_directory(
        &mut self,
        session_id: &str,
        path: &str,
    ) -> EngineResult<String> {
        let handle = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::session_not_found(session_id))?;
        let sftp = handle
            .session
            .sftp()
            .map_err(|e| EngineError::from(e).with_session(session_id))?;
        let resolved = sftp
            .realpath(Path::new(path))
            .map_err(|e| EngineError::from(e).with_path(path))?
            .to_string_lossy()
            .to_string();
        handle.info.current_directory = resolved.clone();
        handle.info.last_activity = Utc::now();
        handle.info.operations_count += 1;
        Ok(resolved)
    }

    /// A `RemoteClient` over an active session, for the transfer engine
    /// and the bulk operations. ssh2 sessions are reference counted, so
    /// the client stays valid until `disconnect`.
    pub fn client(&mut self, session_id: &str) -> EngineResult<Arc<crate::sftp::client::Ssh2RemoteClient>> {
        let handle = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::session_not_found(session_id))?;
        handle.info.last_activity = Utc::now();
        handle.info.operations_count += 1;
        Ok(Arc::new(crate::sftp::client::Ssh2RemoteClient::new(
            handle.session.clone(),
        )))
    }
}

// ── Authentication ladder ────────────────────────────────────────────────────

fn authenticate(
    session: &mut Session,
    config: &ConnectionConfig,
    credential: Credential,
) -> EngineResult<String> {
    // 1. Agent-based auth.
    if config.use_agent || matches!(credential, Credential::Agent) {
        if let Ok(mut agent) = session.agent() {
            if agent.connect().is_ok() {
                let _ = agent.list_identities();
                for identity in agent.identities().unwrap_or_default() {
                    if agent.userauth(&config.username, &identity).is_ok()
                        && session.authenticated()
                    {
                        return Ok("agent".to_string());
                    }
                }
            }
        }
    }

    match credential {
        Credential::PrivateKey { path, passphrase } => {
            session
                .userauth_pubkey_file(&config.username, None, &path, passphrase.as_deref())
                .map_err(|e| {
                    EngineError::auth_failed(format!("Public-key auth failed: {}", e))
                })?;
            if session.authenticated() {
                return Ok("publickey".to_string());
            }
        }
        Credential::Password(password) => {
            if session
                .userauth_password(&config.username, &password)
                .is_ok()
                && session.authenticated()
            {
                return Ok("password".to_string());
            }

            // Keyboard-interactive fallback, answering every prompt
            // with the stored password.
            struct KbdHandler {
                password: String,
            }
            impl ssh2::KeyboardInteractivePrompt for KbdHandler {
                fn prompt(
                    &mut self,
                    _username: &str,
                    _instructions: &str,
                    prompts: &[ssh2::Prompt],
                ) -> Vec<String> {
                    prompts.iter().map(|_| self.password.clone()).collect()
                }
            }
            let mut handler = KbdHandler { password };
            if session
                .userauth_keyboard_interactive(&config.username, &mut handler)
                .is_ok()
                && session.authenticated()
            {
                return Ok("keyboard-interactive".to_string());
            }
        }
        Credential::Agent => {} // handled above
        Credential::None => {
            // Nothing stored: try default key paths.
            if let Some(ssh_dir) = dirs::home_dir().map(|h| h.join(".ssh")) {
                for name in &["id_ed25519", "id_rsa", "id_ecdsa"] {
                    let path = ssh_dir.join(name);
                    if path.exists()
                        && session
                            .userauth_pubkey_file(&config.username, None, &path, None)
                            .is_ok()
                        && session.authenticated()
                    {
                        return Ok(format!("publickey-default({})", name));
                    }
                }
            }
        }
    }

    Err(EngineError::auth_failed("No authentication method succeeded"))
}

fn host_key_algorithm_name(key_type: ssh2::HostKeyType) -> &'static str {
    match key_type {
        ssh2::HostKeyType::Rsa => "ssh-rsa",
        ssh2::HostKeyType::Dss => "ssh-dss",
        ssh2::HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        ssh2::HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        ssh2::HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        ssh2::HostKeyType::Ed25519 => "ssh-ed25519",
        ssh2::HostKeyType::Unknown => "unknown",
    }
}
