//! SSH transport manager.
//!
//! One task owns the russh `Handle` for the whole session; everything
//! else talks to it through a cloneable [`TransportController`]. This
//! keeps the handle single-owner (no lock held across awaits, no
//! concurrent protocol access) and gives the rest of the system a single
//! place to observe transport death.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use russh::client::Msg;
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{Endpoint, SessionConfig};

use super::client::{establish, ClientHandler};
use super::error::SshError;

/// Transport lifecycle. Written only by the manager; readers snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Ready,
    Closing,
    Closed,
}

/// Tunables that tests override.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Per-hop TCP + handshake deadline.
    pub connect_timeout: Duration,
    /// Interval between liveness probes on the target session.
    pub health_interval: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            health_interval: Duration::from_secs(10),
        }
    }
}

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

enum TransportCommand {
    Open {
        endpoint: Endpoint,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, SshError>>,
    },
    Close,
}

/// Handle to a live transport. Cloning is cheap; every clone has full
/// control, so controllers stay inside the process.
#[derive(Clone)]
pub struct TransportController {
    cmd_tx: mpsc::Sender<TransportCommand>,
    state: Arc<RwLock<TransportState>>,
    disconnect_tx: broadcast::Sender<String>,
}

impl TransportController {
    /// Snapshot of the transport state.
    pub fn state(&self) -> TransportState {
        *self.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == TransportState::Ready
    }

    /// Receiver that yields the failure reason once, when the transport
    /// dies or is closed. The master cancellation signal for everything
    /// built on top.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<String> {
        self.disconnect_tx.subscribe()
    }

    /// Open a `direct-tcpip` channel to `endpoint`. The host string is
    /// sent to the SSH server verbatim; name resolution happens remotely.
    pub async fn open(&self, endpoint: &Endpoint) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(TransportCommand::Open {
                endpoint: endpoint.clone(),
                reply_tx,
            })
            .await
            .map_err(|_| SshError::TransportDown)?;
        reply_rx.await.map_err(|_| SshError::TransportDown)?
    }

    /// Ask the owner task to shut the session down. Idempotent.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(TransportCommand::Close).await;
    }
}

/// Establish the SSH session for `cfg` and spawn its owner task.
pub async fn connect(
    cfg: &SessionConfig,
    settings: TransportSettings,
) -> Result<TransportController, SshError> {
    let state = Arc::new(RwLock::new(TransportState::Idle));
    *state.write() = TransportState::Connecting;

    let established = match establish(cfg, settings.connect_timeout).await {
        Ok(established) => established,
        Err(e) => {
            *state.write() = TransportState::Closed;
            return Err(e);
        }
    };

    let (cmd_tx, cmd_rx) = mpsc::channel::<TransportCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<String>(4);

    *state.write() = TransportState::Ready;
    info!("SSH transport ready ({})", cfg.target.endpoint);

    spawn_owner_task(
        established.target,
        established.jump,
        cmd_rx,
        state.clone(),
        disconnect_tx.clone(),
        settings.health_interval,
    );

    Ok(TransportController {
        cmd_tx,
        state,
        disconnect_tx,
    })
}

fn spawn_owner_task(
    handle: russh::client::Handle<ClientHandler>,
    jump_handle: Option<russh::client::Handle<ClientHandler>>,
    mut cmd_rx: mpsc::Receiver<TransportCommand>,
    state: Arc<RwLock<TransportState>>,
    disconnect_tx: broadcast::Sender<String>,
    health_interval: Duration,
) {
    tokio::spawn(async move {
        let mut handle = handle;
        // Kept alive so the outer session (and the nested channel the
        // target session runs over) survives as long as we do.
        let _jump_handle = jump_handle;

        let mut health = tokio::time::interval_at(
            tokio::time::Instant::now() + health_interval,
            health_interval,
        );
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // None = clean close, Some = failure reason.
        let failure: Option<String> = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(TransportCommand::Open { endpoint, reply_tx }) => {
                        let result = handle
                            .channel_open_direct_tcpip(
                                &endpoint.host,
                                endpoint.port as u32,
                                "127.0.0.1",
                                0,
                            )
                            .await;
                        match result {
                            Ok(channel) => {
                                debug!("opened channel to {}", endpoint);
                                if reply_tx.send(Ok(channel)).is_err() {
                                    // Caller went away; dropping the channel
                                    // lets the server close it.
                                    warn!("caller dropped before channel handoff");
                                }
                            }
                            Err(russh::Error::ChannelOpenFailure(reason)) => {
                                let _ = reply_tx.send(Err(SshError::ChannelOpenRefused(
                                    format!("{} ({:?})", endpoint, reason),
                                )));
                            }
                            Err(e) => {
                                let _ = reply_tx.send(Err(SshError::TransportDown));
                                break Some(format!("ssh transport error: {e}"));
                            }
                        }
                    }
                    Some(TransportCommand::Close) | None => break None,
                },
                _ = health.tick() => {
                    match tokio::time::timeout(
                        HEALTH_PROBE_TIMEOUT,
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => debug!("transport liveness probe ok"),
                        Ok(Err(e)) => break Some(format!("ssh transport lost: {e}")),
                        Err(_) => break Some("ssh transport unresponsive (probe timeout)".into()),
                    }
                }
            }
        };

        let reason = match failure {
            Some(reason) => {
                warn!("{}", reason);
                *state.write() = TransportState::Closed;
                reason
            }
            None => {
                info!("closing SSH transport");
                *state.write() = TransportState::Closing;
                "transport closed".to_string()
            }
        };

        // Fail everything still queued before touching the wire.
        drain_pending(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "session closed", "en")
            .await;

        *state.write() = TransportState::Closed;
        let _ = disconnect_tx.send(reason);
        info!("SSH transport task finished");
    });
}

/// Answer every queued command with `TransportDown`.
fn drain_pending(cmd_rx: &mut mpsc::Receiver<TransportCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        if let TransportCommand::Open { reply_tx, .. } = cmd {
            let _ = reply_tx.send(Err(SshError::TransportDown));
        }
    }
}
