//! Local proxy front-ends and the relay that feeds them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::ssh::TransportController;

pub mod counters;
pub mod http;
pub mod relay;
pub mod socks5;

pub use counters::{TrafficCounters, TrafficSnapshot};

/// Cap on concurrently live relay pairs, enforced at accept time.
pub const DEFAULT_MAX_RELAYS: u64 = 256;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a front-end needs to serve connections.
#[derive(Clone)]
pub struct FrontendContext {
    pub transport: TransportController,
    pub counters: Arc<TrafficCounters>,
    pub idle_timeout: Duration,
    pub max_relays: u64,
}

impl FrontendContext {
    /// True when the pair cap leaves no room for another connection.
    pub(crate) fn at_capacity(&self) -> bool {
        self.counters.active() >= self.max_relays
    }
}

/// Handle to a running listener task.
pub struct FrontendHandle {
    bound_addr: SocketAddr,
    stop_tx: mpsc::Sender<()>,
}

impl FrontendHandle {
    pub(crate) fn new(bound_addr: SocketAddr, stop_tx: mpsc::Sender<()>) -> Self {
        Self {
            bound_addr,
            stop_tx,
        }
    }

    /// The address actually bound (relevant when the port was 0).
    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// Stop accepting. Connections already relaying are left to the
    /// transport shutdown cascade.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(()).await;
    }
}

/// Friendly bind-error text, by failure class.
pub(crate) fn bind_error(addr: &str, e: &std::io::Error) -> ProxyError {
    let reason = match e.kind() {
        std::io::ErrorKind::AddrInUse => {
            "port already in use; another application may be using it".to_string()
        }
        std::io::ErrorKind::PermissionDenied => {
            "permission denied; ports below 1024 require elevated privileges".to_string()
        }
        _ => e.to_string(),
    };
    ProxyError::Bind {
        addr: addr.to_string(),
        reason,
    }
}
