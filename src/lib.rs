//! sshveil: a user-space VPN-style proxy over SSH.
//!
//! The engine accepts local application traffic on two listeners (SOCKS5
//! and HTTP/HTTPS CONNECT), carries every outbound TCP connection inside
//! `direct-tcpip` channels of one SSH session (optionally reached
//! through a jump host), and can rewrite the OS proxy settings so
//! unconfigured applications route through it automatically.
//!
//! Front-ends live in [`proxy`], the SSH side in [`ssh`], and
//! [`supervisor::Supervisor`] ties one session's lifecycle together for
//! whichever front (CLI or GUI) is driving.

pub mod cli;
pub mod config;
pub mod proxy;
pub mod ssh;
pub mod supervisor;
pub mod sysproxy;

pub use config::{Credential, Endpoint, HostConfig, SessionConfig};
pub use proxy::{TrafficCounters, TrafficSnapshot};
pub use supervisor::{LifecycleState, StatusSnapshot, Supervisor, SupervisorSettings};
