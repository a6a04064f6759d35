// ── Host trust: OpenSSH-compatible known_hosts store and TOFU protocol ───────

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use skiff_core::{EngineError, EngineResult, HostKeyPolicy};
use std::io::Write;
use std::path::{Path, PathBuf};

type HmacSha1 = Hmac<Sha1>;

/// One known_hosts line. `host_pattern` is either the plain
/// `host` / `[host]:port` form or the `|1|salt|digest|` hashed form.
#[derive(Debug, Clone)]
pub struct KnownHostRecord {
    pub host_pattern: String,
    pub algorithm: String,
    pub key_base64: String,
}

/// Outcome of checking a presented key against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCheck {
    /// Host on record with this exact key.
    Match,
    /// Host on record with a different key for the same algorithm.
    Mismatch,
    /// No record for this host.
    Unknown,
}

/// Confirmation request raised for an unknown key under TOFU.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostKeyPrompt {
    pub host: String,
    pub port: u16,
    pub algorithm: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrustDecision {
    TrustAndSave,
    TrustOnce,
    Reject,
}

/// Decision provider for trust prompts. Injected so the engine can be
/// driven by a dialog or by an automated policy in tests.
#[async_trait]
pub trait HostKeyVerifier: Send + Sync {
    async fn verify(&self, prompt: &HostKeyPrompt) -> TrustDecision;

    /// Secondary confirmation used when "trust and save" could not be
    /// persisted: `true` means connect once without saving, `false`
    /// aborts the connection.
    async fn confirm_unsaved(&self, prompt: &HostKeyPrompt) -> bool;
}

/// Automated verifier accepting every key; `save` selects
/// trust-and-save versus trust-once.
pub struct AcceptAll {
    pub save: bool,
}

#[async_trait]
impl HostKeyVerifier for AcceptAll {
    async fn verify(&self, _prompt: &HostKeyPrompt) -> TrustDecision {
        if self.save {
            TrustDecision::TrustAndSave
        } else {
            TrustDecision::TrustOnce
        }
    }

    async fn confirm_unsaved(&self, _prompt: &HostKeyPrompt) -> bool {
        true
    }
}

/// Automated verifier rejecting every key.
pub struct RejectAll;

#[async_trait]
impl HostKeyVerifier for RejectAll {
    async fn verify(&self, _prompt: &HostKeyPrompt) -> TrustDecision {
        TrustDecision::Reject
    }

    async fn confirm_unsaved(&self, _prompt: &HostKeyPrompt) -> bool {
        false
    }
}

/// OpenSSH-style fingerprint: `SHA256:` + unpadded base64 of the
/// SHA-256 of the raw key blob.
pub fn fingerprint_sha256(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

/// The pattern OpenSSH uses for a host entry: bare hostname for the
/// default port, `[host]:port` otherwise.
pub fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

fn hashed_pattern(pattern: &str) -> String {
    use rand::RngCore;
    let mut salt = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut mac = HmacSha1::new_from_slice(&salt).expect("hmac accepts any key length");
    mac.update(pattern.as_bytes());
    let digest = mac.finalize().into_bytes();
    format!("|1|{}|{}|", STANDARD.encode(salt), STANDARD.encode(digest))
}

fn hashed_entry_matches(entry: &str, pattern: &str) -> bool {
    // |1|base64(salt)|base64(hmac_sha1(salt, pattern))|
    let mut parts = entry.trim_matches('|').split('|');
    if parts.next() != Some("1") {
        return false;
    }
    let (Some(salt_b64), Some(digest_b64)) = (parts.next(), parts.next()) else {
        return false;
    };
    let (Ok(salt), Ok(digest)) = (STANDARD.decode(salt_b64), STANDARD.decode(digest_b64)) else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(&salt) else {
        return false;
    };
    mac.update(pattern.as_bytes());
    mac.verify_slice(&digest).is_ok()
}

fn plain_entry_matches(entry: &str, pattern: &str) -> bool {
    // A plain field may carry several comma-separated patterns.
    entry.split(',').any(|p| p == pattern)
}

enum Line {
    /// Comment or blank, preserved verbatim on save.
    Raw(String),
    Record(KnownHostRecord),
}

/// Persisted host-key records. Created when a new host key is first
/// seen; updated only by explicit trust decisions.
pub struct HostTrustStore {
    path: PathBuf,
    lines: Vec<Line>,
    hash_hostnames: bool,
}

impl HostTrustStore {
    /// Default location, matching the OpenSSH client.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".ssh")
            .join("known_hosts")
    }

    /// Load the store. A missing file is an empty store, not an error;
    /// the same goes for a path whose parent is not a directory, which
    /// surfaces later as a save failure instead.
    pub fn load(path: impl Into<PathBuf>, hash_hostnames: bool) -> EngineResult<Self> {
        let path = path.into();
        let mut lines = Vec::new();
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                for raw in content.lines() {
                    lines.push(Self::parse_line(raw));
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
                ) => {}
            Err(e) => {
                return Err(EngineError::local_io(format!(
                    "Cannot read known_hosts: {}",
                    e
                ))
                .with_path(path.display().to_string()))
            }
        }
        Ok(Self {
            path,
            lines,
            hash_hostnames,
        })
    }

    fn parse_line(raw: &str) -> Line {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Line::Raw(raw.to_string());
        }
        let mut fields = trimmed.split_whitespace();
        // `@marker` fields (e.g. @revoked) are preserved but not interpreted.
        let first = match fields.next() {
            Some(f) if f.starts_with('@') => fields.next(),
            f => f,
        };
        let (Some(host_pattern), Some(algorithm), Some(key_base64)) =
            (first, fields.next(), fields.next())
        else {
            return Line::Raw(raw.to_string());
        };
        Line::Record(KnownHostRecord {
            host_pattern: host_pattern.to_string(),
            algorithm: algorithm.to_string(),
            key_base64: key_base64.to_string(),
        })
    }

    pub fn records(&self) -> impl Iterator<Item = &KnownHostRecord> {
        self.lines.iter().filter_map(|l| match l {
            Line::Record(r) => Some(r),
            Line::Raw(_) => None,
        })
    }

    /// Check a presented key. A host may legitimately have keys of
    /// several algorithms on record; only a same-algorithm entry with
    /// a different key is a mismatch.
    pub fn check(&self, host: &str, port: u16, algorithm: &str, key: &[u8]) -> HostCheck {
        let pattern = host_pattern(host, port);
        let key_b64 = STANDARD.encode(key);
        let mut seen_other_key = false;

        for record in self.records() {
            let hit = if record.host_pattern.starts_with('|') {
                hashed_entry_matches(&record.host_pattern, &pattern)
            } else {
                plain_entry_matches(&record.host_pattern, &pattern)
            };
            if !hit || record.algorithm != algorithm {
                continue;
            }
            if record.key_base64 == key_b64 {
                return HostCheck::Match;
            }
            seen_other_key = true;
        }

        if seen_other_key {
            HostCheck::Mismatch
        } else {
            HostCheck::Unknown
        }
    }

    /// Record a trusted key. Only called on an explicit user decision;
    /// never used to overwrite a mismatching record.
    pub fn add(&mut self, host: &str, port: u16, algorithm: &str, key: &[u8]) {
        let pattern = host_pattern(host, port);
        let host_pattern = if self.hash_hostnames {
            hashed_pattern(&pattern)
        } else {
            pattern
        };
        self.lines.push(Line::Record(KnownHostRecord {
            host_pattern,
            algorithm: algorithm.to_string(),
            key_base64: STANDARD.encode(key),
        }));
    }

    /// Write the store back, preserving comments and unknown lines.
    pub fn save(&self) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::local_io(format!("Cannot create {}: {}", parent.display(), e))
            })?;
        }
        let mut out = Vec::new();
        for line in &self.lines {
            match line {
                Line::Raw(raw) => writeln!(out, "{}", raw),
                Line::Record(r) => {
                    writeln!(out, "{} {} {}", r.host_pattern, r.algorithm, r.key_base64)
                }
            }
            .map_err(|e| EngineError::local_io(e.to_string()))?;
        }
        std::fs::write(&self.path, &out).map_err(|e| {
            EngineError::local_io(format!("Cannot write known_hosts: {}", e))
                .with_path(self.path.display().to_string())
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Run the verification protocol for a presented key.
///
/// Returns `Ok(true)` when the session proceeds with verification off
/// (the insecure marker the caller must surface), `Ok(false)` for a
/// verified key, and an error when the connection must not proceed.
pub async fn verify_presented_key(
    store: &mut HostTrustStore,
    policy: HostKeyPolicy,
    verifier: &dyn HostKeyVerifier,
    host: &str,
    port: u16,
    algorithm: &str,
    key: &[u8],
) -> EngineResult<bool> {
    if policy == HostKeyPolicy::Off {
        warn!(
            "host key verification disabled for {}:{}; connection is not authenticated",
            host, port
        );
        return Ok(true);
    }

    let fingerprint = fingerprint_sha256(key);
    match store.check(host, port, algorithm, key) {
        HostCheck::Match => Ok(false),
        HostCheck::Mismatch => Err(EngineError::host_key_mismatch(format!(
            "Host key for {}:{} changed (presented {} {})",
            host, port, algorithm, fingerprint
        ))),
        HostCheck::Unknown if policy == HostKeyPolicy::Strict => {
            Err(EngineError::host_key_rejected(format!(
                "Unknown host key for {}:{} under strict policy ({} {})",
                host, port, algorithm, fingerprint
            )))
        }
        HostCheck::Unknown => {
            let prompt = HostKeyPrompt {
                host: host.to_string(),
                port,
                algorithm: algorithm.to_string(),
                fingerprint: fingerprint.clone(),
            };
            match verifier.verify(&prompt).await {
                TrustDecision::Reject => Err(EngineError::host_key_rejected(format!(
                    "Host key for {}:{} rejected by user",
                    host, port
                ))),
                TrustDecision::TrustOnce => {
                    info!("host key for {}:{} trusted for this session only", host, port);
                    Ok(false)
                }
                TrustDecision::TrustAndSave => {
                    store.add(host, port, algorithm, key);
                    match store.save() {
                        Ok(()) => {
                            info!(
                                "host key for {}:{} saved to {}",
                                host,
                                port,
                                store.path().display()
                            );
                            Ok(false)
                        }
                        Err(e) => {
                            // The store is unwritable. Never proceed
                            // silently: ask again, offering a one-time
                            // unsaved connection.
                            warn!(
                                "could not persist host key for {}:{}: {}",
                                host, port, e
                            );
                            if verifier.confirm_unsaved(&prompt).await {
                                Ok(false)
                            } else {
                                Err(EngineError::host_key_rejected(format!(
                                    "Host key for {}:{} not saved and connection aborted",
                                    host, port
                                )))
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &[u8] = b"\x00\x00\x00\x0bssh-ed25519\x00\x00\x00 key-material-a";
    const KEY_B: &[u8] = b"\x00\x00\x00\x0bssh-ed25519\x00\x00\x00 key-material-b";

    fn store_in(dir: &tempfile::TempDir, hash: bool) -> HostTrustStore {
        HostTrustStore::load(dir.path().join("known_hosts"), hash).unwrap()
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, false);
        assert_eq!(
            store.check("files.example.net", 22, "ssh-ed25519", KEY_A),
            HostCheck::Unknown
        );
    }

    #[test]
    fn add_save_reload_matches() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir, false);
        store.add("files.example.net", 22, "ssh-ed25519", KEY_A);
        store.save().unwrap();

        let reloaded = store_in(&dir, false);
        assert_eq!(
            reloaded.check("files.example.net", 22, "ssh-ed25519", KEY_A),
            HostCheck::Match
        );
        assert_eq!(
            reloaded.check("files.example.net", 22, "ssh-ed25519", KEY_B),
            HostCheck::Mismatch
        );
        // Same host, other port: a separate identity.
        assert_eq!(
            reloaded.check("files.example.net", 2222, "ssh-ed25519", KEY_A),
            HostCheck::Unknown
        );
    }

    #[test]
    fn nonstandard_port_uses_bracket_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir, false);
        store.add("files.example.net", 2222, "ssh-rsa", KEY_A);
        store.save().unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("known_hosts")).unwrap();
        assert!(content.starts_with("[files.example.net]:2222 ssh-rsa "));
    }

    #[test]
    fn hashed_entries_round_trip_and_leak_no_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir, true);
        store.add("secret-host.internal", 22, "ssh-ed25519", KEY_A);
        store.save().unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("known_hosts")).unwrap();
        assert!(content.starts_with("|1|"));
        assert!(!content.contains("secret-host"));

        let reloaded = store_in(&dir, true);
        assert_eq!(
            reloaded.check("secret-host.internal", 22, "ssh-ed25519", KEY_A),
            HostCheck::Match
        );
        assert_eq!(
            reloaded.check("other-host.internal", 22, "ssh-ed25519", KEY_A),
            HostCheck::Unknown
        );
    }

    #[test]
    fn comments_and_unknown_lines_survive_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, "# managed by hand\n\nnot a record\n").unwrap();

        let mut store = HostTrustStore::load(&path, false).unwrap();
        store.add("h", 22, "ssh-rsa", KEY_A);
        store.save().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("# managed by hand"));
        assert!(content.contains("not a record"));
        assert!(content.contains("h ssh-rsa "));
    }

    #[test]
    fn multiple_algorithms_per_host_do_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir, false);
        store.add("h", 22, "ssh-rsa", KEY_A);
        store.add("h", 22, "ssh-ed25519", KEY_B);
        assert_eq!(store.check("h", 22, "ssh-rsa", KEY_A), HostCheck::Match);
        assert_eq!(store.check("h", 22, "ssh-ed25519", KEY_B), HostCheck::Match);
    }

    #[test]
    fn fingerprint_is_openssh_shaped() {
        let fp = fingerprint_sha256(KEY_A);
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        assert_eq!(fp, fingerprint_sha256(KEY_A));
        assert_ne!(fp, fingerprint_sha256(KEY_B));
    }

    // ── TOFU protocol (spec scenario: unknown key, TrustAndSave,
    // no prompt on the next connection) ─────────────────────────────

    struct Recording {
        decision: TrustDecision,
        prompts: std::sync::Mutex<Vec<HostKeyPrompt>>,
        allow_unsaved: bool,
    }

    #[async_trait]
    impl HostKeyVerifier for Recording {
        async fn verify(&self, prompt: &HostKeyPrompt) -> TrustDecision {
            self.prompts.lock().unwrap().push(prompt.clone());
            self.decision
        }

        async fn confirm_unsaved(&self, _prompt: &HostKeyPrompt) -> bool {
            self.allow_unsaved
        }
    }

    #[tokio::test]
    async fn tofu_trust_and_save_then_silent_match() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir, false);
        let verifier = Recording {
            decision: TrustDecision::TrustAndSave,
            prompts: std::sync::Mutex::new(Vec::new()),
            allow_unsaved: false,
        };

        let insecure = verify_presented_key(
            &mut store,
            HostKeyPolicy::Tofu,
            &verifier,
            "files.example.net",
            22,
            "ssh-ed25519",
            KEY_A,
        )
        .await
        .unwrap();
        assert!(!insecure);

        let prompts = verifier.prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].fingerprint, fingerprint_sha256(KEY_A));
        assert_eq!(prompts[0].host, "files.example.net");
        drop(prompts);

        // Second connection: the saved record matches, no new prompt.
        let mut store = store_in(&dir, false);
        verify_presented_key(
            &mut store,
            HostKeyPolicy::Tofu,
            &verifier,
            "files.example.net",
            22,
            "ssh-ed25519",
            KEY_A,
        )
        .await
        .unwrap();
        assert_eq!(verifier.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn strict_rejects_unknown_without_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir, false);
        let verifier = Recording {
            decision: TrustDecision::TrustAndSave,
            prompts: std::sync::Mutex::new(Vec::new()),
            allow_unsaved: false,
        };
        let err = verify_presented_key(
            &mut store,
            HostKeyPolicy::Strict,
            &verifier,
            "h",
            22,
            "ssh-ed25519",
            KEY_A,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, skiff_core::ErrorKind::HostKeyRejected);
        assert!(verifier.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mismatch_is_fatal_even_under_tofu() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir, false);
        store.add("h", 22, "ssh-ed25519", KEY_A);
        let verifier = Recording {
            decision: TrustDecision::TrustAndSave,
            prompts: std::sync::Mutex::new(Vec::new()),
            allow_unsaved: false,
        };
        let err = verify_presented_key(
            &mut store,
            HostKeyPolicy::Tofu,
            &verifier,
            "h",
            22,
            "ssh-ed25519",
            KEY_B,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, skiff_core::ErrorKind::HostKeyMismatch);
        assert!(verifier.prompts.lock().unwrap().is_empty());
    }

    #[test]
    fn load_tolerates_a_parent_that_is_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blocker"), b"plain file").unwrap();
        let store =
            HostTrustStore::load(dir.path().join("blocker").join("known_hosts"), false).unwrap();
        assert_eq!(store.records().count(), 0);
        // The broken path still refuses writes.
        assert!(store.save().is_err());
    }

    #[tokio::test]
    async fn unwritable_store_degrades_to_confirmed_unsaved_connection() {
        let dir = tempfile::tempdir().unwrap();
        // Point the store at a path that cannot be created.
        let bad_path = dir.path().join("missing").join("known_hosts");
        std::fs::write(dir.path().join("missing"), b"a file, not a dir").unwrap();
        let mut store = HostTrustStore::load(&bad_path, false).unwrap();

        let verifier = Recording {
            decision: TrustDecision::TrustAndSave,
            prompts: std::sync::Mutex::new(Vec::new()),
            allow_unsaved: true,
        };
        // Save fails, the secondary confirmation accepts a one-time
        // unsaved connection.
        let insecure = verify_presented_key(
            &mut store,
            HostKeyPolicy::Tofu,
            &verifier,
            "h",
            22,
            "ssh-ed25519",
            KEY_A,
        )
        .await
        .unwrap();
        assert!(!insecure);

        let verifier = Recording {
            decision: TrustDecision::TrustAndSave,
            prompts: std::sync::Mutex::new(Vec::new()),
            allow_unsaved: false,
        };
        let mut store = HostTrustStore::load(&bad_path, false).unwrap();
        let err = verify_presented_key(
            &mut store,
            HostKeyPolicy::Tofu,
            &verifier,
            "h",
            22,
            "ssh-ed25519",
            KEY_A,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, skiff_core::ErrorKind::HostKeyRejected);
    }

    #[tokio::test]
    async fn off_policy_sets_insecure_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir, false);
        let insecure = verify_presented_key(
            &mut store,
            HostKeyPolicy::Off,
            &RejectAll,
            "h",
            22,
            "ssh-ed25519",
            KEY_A,
        )
        .await
        .unwrap();
        assert!(insecure);
    }
}
