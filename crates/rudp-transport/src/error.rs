use std::io;

use thiserror::Error;

/// Errors surfaced to the application or returned from setup calls.
///
/// Malformed datagrams never become a `TransportError`; they are dropped at
/// the codec boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("peer stopped responding to keepalives")]
    KeepAliveTimeout,
    #[error("could not resolve remote address: {0}")]
    Resolve(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Lifecycle errors end the connection; the others are setup failures.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::HandshakeTimeout | TransportError::KeepAliveTimeout
        )
    }
}
