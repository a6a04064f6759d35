// ── Session pool: idle RemoteClient handles keyed by endpoint ───────────────

use crate::sftp::client::RemoteClient;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use skiff_core::Endpoint;
use std::collections::HashMap;
use std::sync::Arc;

struct PooledClient {
    client: Arc<dyn RemoteClient>,
    idle_since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub endpoints: u32,
    pub idle_sessions: u32,
    pub max_idle_per_endpoint: u32,
}

/// Keeps disconnected-from-work but still-open sessions around so the
/// next transfer to the same endpoint skips handshake and auth. Workers
/// check a client out, use it exclusively, and check it back in.
pub struct SessionPool {
    idle: HashMap<Endpoint, Vec<PooledClient>>,
    /// Per-endpoint cap on parked sessions (0 = unlimited).
    max_idle_per_endpoint: usize,
    /// Sessions parked longer than this are dropped by `reap_idle`.
    idle_timeout_sec: u64,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::with_limits(4, 300)
    }

    pub fn with_limits(max_idle_per_endpoint: usize, idle_timeout_sec: u64) -> Self {
        SessionPool {
            idle: HashMap::new(),
            max_idle_per_endpoint,
            idle_timeout_sec,
        }
    }

    /// Take an idle client for an endpoint, most recently parked first.
    pub fn checkout(&mut self, endpoint: &Endpoint) -> Option<Arc<dyn RemoteClient>> {
        let parked = self.idle.get_mut(endpoint)?;
        let entry = parked.pop();
        if parked.is_empty() {
            self.idle.remove(endpoint);
        }
        entry.map(|e| e.client)
    }

    /// Park a client for reuse. Drops it instead when the endpoint is at
    /// its idle cap.
    pub fn checkin(&mut self, endpoint: Endpoint, client: Arc<dyn RemoteClient>) {
        let parked = self.idle.entry(endpoint).or_default();
        if self.max_idle_per_endpoint > 0 && parked.len() >= self.max_idle_per_endpoint {
            return;
        }
        parked.push(PooledClient {
            client,
            idle_since: Utc::now(),
        });
    }

    /// Drop all parked sessions for an endpoint (e.g. after auth changes
    /// or a detected disconnect).
    pub fn evict(&mut self, endpoint: &Endpoint) -> usize {
        self.idle.remove(endpoint).map(|v| v.len()).unwrap_or(0)
    }

    /// Drop sessions parked beyond the idle timeout.
    pub fn reap_idle(&mut self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.idle_timeout_sec as i64);
        let mut reaped = 0;
        self.idle.retain(|_, parked| {
            let before = parked.len();
            parked.retain(|p| p.idle_since >= cutoff);
            reaped += before - parked.len();
            !parked.is_empty()
        });
        if reaped > 0 {
            info!("session pool: reaped {} idle sessions", reaped);
        }
        reaped
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            endpoints: self.idle.len() as u32,
            idle_sessions: self.idle.values().map(|v| v.len()).sum::<usize>() as u32,
            max_idle_per_endpoint: self.max_idle_per_endpoint as u32,
        }
    }

    pub fn clear(&mut self) {
        self.idle.clear();
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}
