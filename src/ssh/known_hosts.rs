//! Host key verification against the OpenSSH `known_hosts` file.
//!
//! Only consulted when strict host key checking is enabled; the store is
//! read-only and entries are maintained with the usual OpenSSH tooling.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::error::SshError;

/// Outcome of checking a server key against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a stored entry.
    Verified,
    /// Host (or this key type for it) has never been seen.
    Unknown { fingerprint: String },
    /// Stored entry exists but the key differs. Possible MITM.
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// In-memory view of a `known_hosts` file.
pub struct KnownHostsStore {
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// Store backed by `~/.ssh/known_hosts`.
    pub fn open_default() -> Self {
        let path = dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from(".known_hosts"));
        Self::open(path)
    }

    /// Store backed by an arbitrary file (used by tests).
    pub fn open(path: PathBuf) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
        };
        if let Err(e) = store.load() {
            debug!("known_hosts not loaded: {}", e);
        }
        store
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(&self.path)?;
        let mut hosts = self.hosts.write();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias...] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed entries (|1|...) are not comparable by name.
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(Self::normalize(hostname))
                    .or_default()
                    .push(entry.clone());
            }
        }

        debug!("loaded {} known host names", hosts.len());
        Ok(())
    }

    /// `[host]:port` and bare `host` both map to the bare lowercase host.
    fn normalize(host: &str) -> String {
        let host = host.trim_start_matches('[');
        match host.find("]:") {
            Some(idx) => host[..idx].to_lowercase(),
            None => host.trim_end_matches(']').to_lowercase(),
        }
    }

    /// `SHA256:...` fingerprint of a public key.
    pub fn fingerprint(key: &PublicKey) -> String {
        let digest = Sha256::digest(key.public_key_bytes());
        format!("SHA256:{}", BASE64.encode(digest).trim_end_matches('='))
    }

    fn fingerprint_of_b64(stored: &str) -> String {
        match BASE64.decode(stored) {
            Ok(bytes) => {
                let digest = Sha256::digest(&bytes);
                format!("SHA256:{}", BASE64.encode(digest).trim_end_matches('='))
            }
            Err(_) => "unknown".to_string(),
        }
    }

    /// Check a server key against the store.
    pub fn verify(&self, host: &str, _port: u16, key: &PublicKey) -> HostKeyVerification {
        let actual_data = key.public_key_base64();
        let actual_type = key.algorithm().to_string();
        let fingerprint = Self::fingerprint(key);

        // Entries are indexed by bare lowercase host; `[host]:port` names
        // from the file collapse onto the same slot.
        let name = Self::normalize(host);
        let hosts = self.hosts.read();

        if let Some(entries) = hosts.get(&name) {
            for entry in entries {
                if entry.key_type != actual_type {
                    continue;
                }
                if entry.key_data == actual_data {
                    debug!("host key verified for {} ({})", name, actual_type);
                    return HostKeyVerification::Verified;
                }
                let expected_fingerprint = Self::fingerprint_of_b64(&entry.key_data);
                warn!(
                    "host key changed for {} ({}): expected {}, got {}",
                    name, actual_type, expected_fingerprint, fingerprint
                );
                return HostKeyVerification::Changed {
                    expected_fingerprint,
                    actual_fingerprint: fingerprint,
                };
            }
            // Host known, but not under this key type.
        }

        HostKeyVerification::Unknown { fingerprint }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_brackets_and_port() {
        assert_eq!(KnownHostsStore::normalize("example.net"), "example.net");
        assert_eq!(KnownHostsStore::normalize("[example.net]:22"), "example.net");
        assert_eq!(
            KnownHostsStore::normalize("[bastion.example.net]:2222"),
            "bastion.example.net"
        );
    }

    #[test]
    fn unknown_host_on_empty_store() {
        let temp = tempfile::tempdir().unwrap();
        let store = KnownHostsStore::open(temp.path().join("known_hosts"));
        let key = russh::keys::PrivateKey::random(
            &mut rand::rngs::OsRng,
            russh::keys::Algorithm::Ed25519,
        )
        .unwrap();
        let public = key.public_key();
        match store.verify("example.net", 22, public) {
            HostKeyVerification::Unknown { fingerprint } => {
                assert!(fingerprint.starts_with("SHA256:"));
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn stored_key_verifies_and_other_key_is_changed() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("known_hosts");

        let first = russh::keys::PrivateKey::random(
            &mut rand::rngs::OsRng,
            russh::keys::Algorithm::Ed25519,
        )
        .unwrap();
        let public = first.public_key();
        std::fs::write(
            &path,
            format!(
                "example.net {} {}\n",
                public.algorithm(),
                public.public_key_base64()
            ),
        )
        .unwrap();

        let store = KnownHostsStore::open(path);
        assert_eq!(
            store.verify("example.net", 22, public),
            HostKeyVerification::Verified
        );
        // Bracketed names in the file collapse onto the same host.
        assert_eq!(
            store.verify("EXAMPLE.net", 2222, public),
            HostKeyVerification::Verified
        );

        let second = russh::keys::PrivateKey::random(
            &mut rand::rngs::OsRng,
            russh::keys::Algorithm::Ed25519,
        )
        .unwrap();
        match store.verify("example.net", 22, second.public_key()) {
            HostKeyVerification::Changed { .. } => {}
            other => panic!("expected Changed, got {other:?}"),
        }
    }
}
