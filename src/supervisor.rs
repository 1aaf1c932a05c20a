//! Tunnel-session lifecycle.
//!
//! The supervisor owns everything with a lifetime: the SSH transport,
//! the two listeners and the system-proxy toggle. `start` brings them up
//! in dependency order, `stop` tears them down in reverse, and an
//! unsolicited transport death triggers the same teardown with the
//! failure recorded for observers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::proxy::{
    http, socks5, FrontendContext, FrontendHandle, ProxyError, TrafficCounters, TrafficSnapshot,
    DEFAULT_MAX_RELAYS,
};
use crate::ssh::{self, SshError, TransportSettings};
use crate::sysproxy::{PlatformProxy, SystemProxy};

/// Session lifecycle, as observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Read-only view for GUI/CLI polling.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: LifecycleState,
    pub counters: TrafficSnapshot,
    pub last_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("a tunnel session is already active")]
    AlreadyRunning,

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Supervisor tunables.
#[derive(Clone)]
pub struct SupervisorSettings {
    pub transport: TransportSettings,
    /// Relay idle timeout handed to both front-ends.
    pub idle_timeout: Duration,
    /// Concurrent relay cap handed to both front-ends.
    pub max_relays: u64,
    /// How long `stop` waits for live relays to drain.
    pub drain_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            transport: TransportSettings::default(),
            idle_timeout: crate::proxy::relay::DEFAULT_IDLE_TIMEOUT,
            max_relays: DEFAULT_MAX_RELAYS,
            drain_timeout: Duration::from_secs(3),
        }
    }
}

struct ActiveSession {
    transport: ssh::TransportController,
    socks: FrontendHandle,
    http: FrontendHandle,
    proxy_set: bool,
}

struct Inner {
    state: RwLock<LifecycleState>,
    last_error: RwLock<Option<String>>,
    counters: Arc<TrafficCounters>,
    session: Mutex<Option<ActiveSession>>,
    settings: SupervisorSettings,
    sysproxy: Box<dyn SystemProxy>,
}

/// Owns one tunnel session at a time. Cloning shares the same session.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_settings(SupervisorSettings::default())
    }

    pub fn with_settings(settings: SupervisorSettings) -> Self {
        Self::build(settings, Box::new(PlatformProxy))
    }

    /// Substitute the system-proxy backend (used by tests).
    pub fn with_system_proxy(settings: SupervisorSettings, sysproxy: Box<dyn SystemProxy>) -> Self {
        Self::build(settings, sysproxy)
    }

    fn build(settings: SupervisorSettings, sysproxy: Box<dyn SystemProxy>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(LifecycleState::Stopped),
                last_error: RwLock::new(None),
                counters: TrafficCounters::new(),
                session: Mutex::new(None),
                settings,
                sysproxy,
            }),
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: *self.inner.state.read(),
            counters: self.inner.counters.snapshot(),
            last_error: self.inner.last_error.read().clone(),
        }
    }

    pub fn counters(&self) -> Arc<TrafficCounters> {
        self.inner.counters.clone()
    }

    /// Bound addresses of the two listeners, once running.
    pub async fn listen_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        let session = self.inner.session.lock().await;
        session
            .as_ref()
            .map(|s| (s.socks.bound_addr(), s.http.bound_addr()))
    }

    /// Bring a session up: transport first, then the listeners, then the
    /// system proxy. Any failure unwinds what already started and leaves
    /// the supervisor `Stopped` with the error recorded.
    pub async fn start(&self, cfg: SessionConfig) -> Result<(), StartError> {
        let mut session_slot = self.inner.session.lock().await;
        {
            let mut state = self.inner.state.write();
            if *state != LifecycleState::Stopped {
                return Err(StartError::AlreadyRunning);
            }
            *state = LifecycleState::Starting;
        }
        *self.inner.last_error.write() = None;

        match self.bring_up(&cfg).await {
            Ok((session, disconnect_rx)) => {
                *session_slot = Some(session);
                *self.inner.state.write() = LifecycleState::Running;
                self.spawn_transport_watch(disconnect_rx);
                info!("tunnel running: traffic relays via {}", cfg.target.endpoint);
                Ok(())
            }
            Err(e) => {
                *self.inner.last_error.write() = Some(e.to_string());
                *self.inner.state.write() = LifecycleState::Stopped;
                Err(e)
            }
        }
    }

    async fn bring_up(
        &self,
        cfg: &SessionConfig,
    ) -> Result<
        (
            ActiveSession,
            tokio::sync::broadcast::Receiver<String>,
        ),
        StartError,
    > {
        let transport = ssh::connect(cfg, self.inner.settings.transport.clone()).await?;
        // Subscribed before anything else can fail so a transport death
        // during the rest of startup is never missed.
        let disconnect_rx = transport.subscribe_disconnect();

        let ctx = FrontendContext {
            transport: transport.clone(),
            counters: self.inner.counters.clone(),
            idle_timeout: self.inner.settings.idle_timeout,
            max_relays: self.inner.settings.max_relays,
        };

        let socks = match socks5::spawn(ctx.clone(), cfg.socks_port).await {
            Ok(handle) => handle,
            Err(e) => {
                transport.close().await;
                return Err(e.into());
            }
        };

        let http = match http::spawn(ctx, cfg.http_port).await {
            Ok(handle) => handle,
            Err(e) => {
                socks.stop().await;
                transport.close().await;
                return Err(e.into());
            }
        };

        let proxy_set = if cfg.manage_system_proxy {
            let http_addr = format!("127.0.0.1:{}", http.bound_addr().port());
            let socks_addr = format!("127.0.0.1:{}", socks.bound_addr().port());
            match self.inner.sysproxy.set(&http_addr, &socks_addr) {
                Ok(()) => true,
                Err(e) => {
                    warn!("could not set system proxy: {}", e);
                    false
                }
            }
        } else {
            false
        };

        Ok((
            ActiveSession {
                transport,
                socks,
                http,
                proxy_set,
            },
            disconnect_rx,
        ))
    }

    /// Orderly shutdown. No-op unless running.
    pub async fn stop(&self) {
        let mut session_slot = self.inner.session.lock().await;
        {
            let mut state = self.inner.state.write();
            if *state != LifecycleState::Running {
                return;
            }
            *state = LifecycleState::Stopping;
        }

        if let Some(session) = session_slot.take() {
            self.tear_down(session).await;
        }

        *self.inner.state.write() = LifecycleState::Stopped;
        info!("tunnel stopped");
    }

    async fn tear_down(&self, session: ActiveSession) {
        if session.proxy_set {
            if let Err(e) = self.inner.sysproxy.clear() {
                warn!("could not clear system proxy: {}", e);
            }
        }

        session.socks.stop().await;
        session.http.stop().await;
        session.transport.close().await;

        // Closing the transport fails every channel, which drives each
        // relay to exit. Give them a bounded window to drain.
        let deadline = tokio::time::Instant::now() + self.inner.settings.drain_timeout;
        while self.inner.counters.active() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "{} relays still active at shutdown, abandoning them",
                    self.inner.counters.active()
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// React to the transport dying underneath a running session.
    fn spawn_transport_watch(&self, mut disconnect_rx: tokio::sync::broadcast::Receiver<String>) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let reason = match disconnect_rx.recv().await {
                Ok(reason) => reason,
                Err(_) => "transport closed".to_string(),
            };

            let mut session_slot = supervisor.inner.session.lock().await;
            {
                let mut state = supervisor.inner.state.write();
                if *state != LifecycleState::Running {
                    // A deliberate stop is already handling teardown.
                    return;
                }
                *state = LifecycleState::Stopping;
            }

            warn!("session ended: {}", reason);
            if let Some(session) = session_slot.take() {
                supervisor.tear_down(session).await;
            }
            *supervisor.inner.last_error.write() = Some(reason);
            *supervisor.inner.state.write() = LifecycleState::Stopped;
        });
    }
}
