//! SSH transport error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("key error: {0}")]
    KeyError(String),

    #[error("host key rejected: {0}")]
    HostKeyRejected(String),

    /// The server refused this particular channel; the transport itself
    /// is still usable.
    #[error("channel open refused: {0}")]
    ChannelOpenRefused(String),

    /// The SSH session is gone; every further operation will fail.
    #[error("transport closed")]
    TransportDown,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    Protocol(String),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}
