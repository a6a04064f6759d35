//! Credential-provider seam.
//!
//! The engine never talks to a keychain or secret service itself; it
//! consumes this interface and surfaces whatever warning flag the
//! provider reports. An insecure on-disk fallback, if the embedding
//! application offers one, shows up here only as the
//! `insecure_fallback_active` capability.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Identifies one remote account: where and who.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// What the provider hands back for an endpoint.
#[derive(Debug, Clone)]
pub enum Credential {
    Password(String),
    PrivateKey {
        path: std::path::PathBuf,
        passphrase: Option<String>,
    },
    /// Authenticate through a running SSH agent.
    Agent,
    /// Nothing stored; the session layer may still try default keys.
    None,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_credential(&self, endpoint: &Endpoint) -> EngineResult<Credential>;

    /// True while the provider is persisting secrets outside the OS
    /// secure store. The engine logs a persistent warning per connect
    /// while this is set; it never checks the environment itself.
    fn insecure_fallback_active(&self) -> bool {
        false
    }
}

/// In-memory provider for tests and simple embeddings.
pub struct StaticCredentialProvider {
    entries: Mutex<HashMap<Endpoint, Credential>>,
    insecure: bool,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            insecure: false,
        }
    }

    /// Mark the provider as an insecure fallback store, e.g. for
    /// exercising the warning path in tests.
    pub fn insecure(mut self) -> Self {
        self.insecure = true;
        self
    }

    pub fn insert(&self, endpoint: Endpoint, credential: Credential) {
        if let Ok(mut map) = self.entries.lock() {
            map.insert(endpoint, credential);
        }
    }
}

impl Default for StaticCredentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_credential(&self, endpoint: &Endpoint) -> EngineResult<Credential> {
        let map = self
            .entries
            .lock()
            .map_err(|_| EngineError::invalid_config("Credential store poisoned"))?;
        Ok(map.get(endpoint).cloned().unwrap_or(Credential::None))
    }

    fn insecure_fallback_active(&self) -> bool {
        self.insecure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_round_trip() {
        let provider = StaticCredentialProvider::new();
        let ep = Endpoint::new("files.example.net", 22, "deploy");
        provider.insert(ep.clone(), Credential::Password("hunter2".into()));

        match provider.get_credential(&ep).await.unwrap() {
            Credential::Password(p) => assert_eq!(p, "hunter2"),
            other => panic!("unexpected credential: {:?}", other),
        }

        let unknown = Endpoint::new("files.example.net", 2222, "deploy");
        assert!(matches!(
            provider.get_credential(&unknown).await.unwrap(),
            Credential::None
        ));
        assert!(!provider.insecure_fallback_active());
        assert!(StaticCredentialProvider::new()
            .insecure()
            .insecure_fallback_active());
    }
}
