//! Session configuration types.
//!
//! A [`SessionConfig`] describes one tunnel session: the SSH target, an
//! optional jump host, the two local listener ports and the system-proxy
//! switch. The same document is what gets persisted to disk between runs
//! (see [`storage`]).

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod storage;

pub use storage::{ProfileStorage, StorageError};

/// Default local SOCKS5 listener port.
pub const DEFAULT_SOCKS_PORT: u16 = 10800;
/// Default local HTTP proxy listener port.
pub const DEFAULT_HTTP_PORT: u16 = 10801;
/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// A `host:port` pair. The host may be an IP literal or a DNS name;
/// whether (and where) the name gets resolved is up to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One way of proving who we are to an SSH server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// Password authentication.
    Password { password: String },

    /// Private-key authentication.
    Key {
        /// Path to the private key file.
        path: PathBuf,
        /// Passphrase for encrypted keys.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

impl Credential {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        Self::Key {
            path: path.into(),
            passphrase,
        }
    }

    /// Reject obviously unusable key files before we ever dial: a missing
    /// file, or a `.pub` picked by mistake.
    pub fn validate(&self, label: &str) -> Result<(), String> {
        if let Credential::Key { path, .. } = self {
            if path
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("pub"))
            {
                return Err(format!(
                    "{label}: {} looks like a public key, select the private key file",
                    path.display()
                ));
            }
            if !path.is_file() {
                return Err(format!(
                    "{label}: private key file not found: {}",
                    path.display()
                ));
            }
        }
        Ok(())
    }
}

/// Where to connect and how to log in. Used for both the target host and
/// the jump host; the two are validated identically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub endpoint: Endpoint,
    pub user: String,
    /// Ordered authentication candidates; the first one the server
    /// accepts wins. A key is listed before a password so key auth is
    /// tried first with password fallback.
    pub credentials: Vec<Credential>,
}

impl HostConfig {
    pub fn validate(&self, label: &str) -> Result<(), String> {
        if self.endpoint.host.trim().is_empty() {
            return Err(format!("{label}: host must not be empty"));
        }
        if self.user.trim().is_empty() {
            return Err(format!("{label}: user must not be empty"));
        }
        if self.credentials.is_empty() {
            return Err(format!("{label}: supply a password or a private key"));
        }
        for cred in &self.credentials {
            cred.validate(label)?;
        }
        Ok(())
    }
}

/// Full description of a tunnel session.
///
/// This document is persisted verbatim between runs, credentials
/// included: passwords and key passphrases are stored in plain text in
/// the profile file. The file is created with mode 0600 on Unix, and
/// `--no-save` skips persistence entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub target: HostConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump: Option<HostConfig>,

    /// Local SOCKS5 listener port.
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,

    /// Local HTTP proxy listener port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Rewrite the OS per-user proxy settings while the tunnel runs.
    #[serde(default = "default_true")]
    pub manage_system_proxy: bool,

    /// Require host keys to match `~/.ssh/known_hosts`. Off by default,
    /// in which case any key is accepted and its fingerprint logged.
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.target.validate("target")?;
        if let Some(jump) = &self.jump {
            jump.validate("jump host")?;
        }
        Ok(())
    }
}

fn default_socks_port() -> u16 {
    DEFAULT_SOCKS_PORT
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionConfig {
        SessionConfig {
            target: HostConfig {
                endpoint: Endpoint::new("198.51.100.7", 22),
                user: "deploy".into(),
                credentials: vec![Credential::password("hunter2")],
            },
            jump: None,
            socks_port: DEFAULT_SOCKS_PORT,
            http_port: DEFAULT_HTTP_PORT,
            manage_system_proxy: true,
            strict_host_key_checking: false,
        }
    }

    #[test]
    fn endpoint_display() {
        assert_eq!(
            Endpoint::new("example.net", 443).to_string(),
            "example.net:443"
        );
    }

    #[test]
    fn json_round_trip() {
        let cfg = sample();
        let json = serde_json::to_string_pretty(&cfg).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.target.endpoint, cfg.target.endpoint);
        assert_eq!(back.socks_port, DEFAULT_SOCKS_PORT);
        assert!(back.manage_system_proxy);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let json = r#"{
            "target": {
                "endpoint": { "host": "example.net", "port": 22 },
                "user": "root",
                "credentials": [ { "type": "password", "password": "x" } ]
            }
        }"#;
        let cfg: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.socks_port, DEFAULT_SOCKS_PORT);
        assert_eq!(cfg.http_port, DEFAULT_HTTP_PORT);
        assert!(cfg.manage_system_proxy);
        assert!(!cfg.strict_host_key_checking);
        assert!(cfg.jump.is_none());
    }

    #[test]
    fn validate_rejects_empty_user() {
        let mut cfg = sample();
        cfg.target.user = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_public_key_path() {
        let mut cfg = sample();
        cfg.target.credentials = vec![Credential::key("/tmp/id_ed25519.pub", None)];
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("public key"));
    }

    #[test]
    fn validate_jump_like_target() {
        let mut cfg = sample();
        cfg.jump = Some(HostConfig {
            endpoint: Endpoint::new("", 22),
            user: "bastion".into(),
            credentials: vec![Credential::password("x")],
        });
        assert!(cfg.validate().unwrap_err().contains("jump host"));
    }
}
