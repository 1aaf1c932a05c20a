//! SSH transport: session establishment, authentication and the
//! single-owner channel manager.

mod client;
mod error;
mod known_hosts;
mod transport;

pub use error::SshError;
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use transport::{connect, TransportController, TransportSettings, TransportState};
