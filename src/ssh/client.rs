//! SSH session establishment.
//!
//! Dials the target (directly, or through a jump host by nesting a
//! second SSH handshake inside a `direct-tcpip` channel of the outer
//! session) and authenticates with the configured credentials.

use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info};

use crate::config::{Credential, HostConfig, SessionConfig};

use super::error::SshError;
use super::known_hosts::{HostKeyVerification, KnownHostsStore};

/// An established SSH session: the authenticated target handle plus the
/// jump handle (if any), which must stay alive for the whole session.
pub(crate) struct Established {
    pub target: Handle<ClientHandler>,
    pub jump: Option<Handle<ClientHandler>>,
}

/// Host key policy applied during the handshake.
#[derive(Clone)]
pub(crate) struct HostKeyPolicy {
    host: String,
    port: u16,
    strict: bool,
    known_hosts_path: Option<PathBuf>,
}

impl HostKeyPolicy {
    pub(crate) fn new(host: &str, port: u16, strict: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            strict,
            known_hosts_path: None,
        }
    }

    /// Use a non-default known_hosts file (for testing).
    #[cfg(test)]
    pub(crate) fn with_known_hosts(mut self, path: PathBuf) -> Self {
        self.known_hosts_path = Some(path);
        self
    }

    fn store(&self) -> KnownHostsStore {
        match &self.known_hosts_path {
            Some(path) => KnownHostsStore::open(path.clone()),
            None => KnownHostsStore::open_default(),
        }
    }

    fn check(&self, key: &PublicKey) -> Result<bool, SshError> {
        if !self.strict {
            // The server key is taken on faith; the fingerprint still
            // goes to the log so a suspicious user can compare it.
            debug!(
                "accepting host key for {}:{} ({})",
                self.host,
                self.port,
                KnownHostsStore::fingerprint(key)
            );
            return Ok(true);
        }

        match self.store().verify(&self.host, self.port, key) {
            HostKeyVerification::Verified => Ok(true),
            HostKeyVerification::Unknown { fingerprint } => Err(SshError::HostKeyRejected(
                format!(
                    "unknown host {}:{} (fingerprint {}); add it to known_hosts or \
                     disable strict host key checking",
                    self.host, self.port, fingerprint
                ),
            )),
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => Err(SshError::HostKeyRejected(format!(
                "host key for {}:{} has changed (expected {}, got {}); refusing to \
                 connect. Remove the old entry from known_hosts if the change is \
                 legitimate",
                self.host, self.port, expected_fingerprint, actual_fingerprint
            ))),
        }
    }
}

/// russh callback handler: only host key checking is needed on this side.
pub(crate) struct ClientHandler {
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub(crate) fn new(policy: HostKeyPolicy) -> Self {
        Self { policy }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.policy.check(server_public_key)
    }
}

fn client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        // The transport layer probes liveness itself; the protocol-level
        // keepalive is a second line of defence.
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Dial one host over TCP and run the SSH handshake.
async fn handshake_tcp(
    host: &HostConfig,
    strict: bool,
    timeout: Duration,
) -> Result<Handle<ClientHandler>, SshError> {
    let addr = host.endpoint.to_string();
    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| SshError::ConnectionFailed(format!("failed to resolve {addr}: {e}")))?
        .next()
        .ok_or_else(|| SshError::ConnectionFailed(format!("no address found for {addr}")))?;

    info!("connecting to {}", addr);

    let handler = ClientHandler::new(HostKeyPolicy::new(
        &host.endpoint.host,
        host.endpoint.port,
        strict,
    ));

    let handle = tokio::time::timeout(
        timeout,
        client::connect(client_config(), socket_addr, handler),
    )
    .await
    .map_err(|_| SshError::Timeout(format!("connection to {addr} timed out")))?
    .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

    debug!("SSH handshake with {} complete", addr);
    Ok(handle)
}

/// Run the SSH handshake over an existing byte-stream (the nested hop of
/// a jump chain).
async fn handshake_stream(
    host: &HostConfig,
    stream: russh::ChannelStream<client::Msg>,
    strict: bool,
    timeout: Duration,
) -> Result<Handle<ClientHandler>, SshError> {
    let addr = host.endpoint.to_string();
    info!("starting nested SSH handshake with {}", addr);

    let handler = ClientHandler::new(HostKeyPolicy::new(
        &host.endpoint.host,
        host.endpoint.port,
        strict,
    ));

    let handle = tokio::time::timeout(
        timeout,
        client::connect_stream(client_config(), stream, handler),
    )
    .await
    .map_err(|_| SshError::Timeout(format!("tunnelled connection to {addr} timed out")))?
    .map_err(|e| SshError::ConnectionFailed(format!("tunnelled handshake with {addr}: {e}")))?;

    debug!("nested SSH handshake with {} complete", addr);
    Ok(handle)
}

/// Try each credential in order; the first `userauth` the server accepts
/// wins. A key that fails to load falls through to the next candidate.
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    credentials: &[Credential],
) -> Result<(), SshError> {
    let mut failures: Vec<String> = Vec::new();

    for credential in credentials {
        let outcome = match credential {
            Credential::Key { path, passphrase } => {
                let key = match russh::keys::load_secret_key(path, passphrase.as_deref()) {
                    Ok(key) => key,
                    Err(e) => {
                        failures.push(format!("key {}: {}", path.display(), e));
                        continue;
                    }
                };
                debug!("attempting public key auth with {}", path.display());
                handle
                    .authenticate_publickey(
                        user,
                        PrivateKeyWithHashAlg::new(Arc::new(key), None),
                    )
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
            Credential::Password { password } => {
                debug!("attempting password auth");
                handle
                    .authenticate_password(user, password.as_str())
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if outcome.success() {
            info!("authenticated as {}", user);
            return Ok(());
        }

        failures.push(match credential {
            Credential::Key { path, .. } => {
                format!("server rejected public key {}", path.display())
            }
            Credential::Password { .. } => "server rejected password".to_string(),
        });
    }

    Err(SshError::AuthenticationFailed(if failures.is_empty() {
        "no credentials supplied".to_string()
    } else {
        failures.join("; ")
    }))
}

/// Establish the session described by `cfg`: jump first when configured,
/// then the target, authenticated with its own credentials.
pub(crate) async fn establish(
    cfg: &SessionConfig,
    timeout: Duration,
) -> Result<Established, SshError> {
    let strict = cfg.strict_host_key_checking;

    if let Some(jump) = &cfg.jump {
        let mut jump_handle = handshake_tcp(jump, strict, timeout).await?;
        authenticate(&mut jump_handle, &jump.user, &jump.credentials).await?;
        info!("jump host {} ready", jump.endpoint);

        // The target hostname is passed through verbatim; the jump SSH
        // server resolves it on its side.
        let channel = jump_handle
            .channel_open_direct_tcpip(
                &cfg.target.endpoint.host,
                cfg.target.endpoint.port as u32,
                "127.0.0.1",
                0,
            )
            .await
            .map_err(|e| {
                SshError::ConnectionFailed(format!(
                    "jump host could not reach {} (check AllowTcpForwarding there): {}",
                    cfg.target.endpoint, e
                ))
            })?;

        let mut target_handle =
            handshake_stream(&cfg.target, channel.into_stream(), strict, timeout).await?;
        authenticate(&mut target_handle, &cfg.target.user, &cfg.target.credentials).await?;

        Ok(Established {
            target: target_handle,
            jump: Some(jump_handle),
        })
    } else {
        let mut target_handle = handshake_tcp(&cfg.target, strict, timeout).await?;
        authenticate(&mut target_handle, &cfg.target.user, &cfg.target.credentials).await?;

        Ok(Established {
            target: target_handle,
            jump: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_key() -> russh::keys::PrivateKey {
        russh::keys::PrivateKey::random(
            &mut rand::rngs::OsRng,
            russh::keys::Algorithm::Ed25519,
        )
        .unwrap()
    }

    #[test]
    fn strict_policy_rejects_unknown_host() {
        let temp = tempfile::tempdir().unwrap();
        let policy = HostKeyPolicy::new("example.net", 22, true)
            .with_known_hosts(temp.path().join("known_hosts"));
        let key = fresh_key();
        let err = policy.check(key.public_key()).unwrap_err();
        assert!(matches!(err, SshError::HostKeyRejected(_)));
    }

    #[test]
    fn permissive_policy_accepts_anything() {
        let temp = tempfile::tempdir().unwrap();
        let policy = HostKeyPolicy::new("example.net", 22, false)
            .with_known_hosts(temp.path().join("known_hosts"));
        let key = fresh_key();
        assert!(policy.check(key.public_key()).unwrap());
    }

    #[test]
    fn strict_policy_accepts_stored_key_and_refuses_changed() {
        use russh::keys::PublicKeyBase64;

        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("known_hosts");
        let key = fresh_key();
        let public = key.public_key();
        std::fs::write(
            &path,
            format!(
                "example.net {} {}\n",
                public.algorithm(),
                public.public_key_base64()
            ),
        )
        .unwrap();

        let strict = HostKeyPolicy::new("example.net", 22, true).with_known_hosts(path.clone());
        assert!(strict.check(public).unwrap());

        let other = fresh_key();
        let strict = HostKeyPolicy::new("example.net", 22, true).with_known_hosts(path);
        let err = strict.check(other.public_key()).unwrap_err();
        assert!(err.to_string().contains("changed"));
    }
}
