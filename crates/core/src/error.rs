//! Unified error type for the Raceway stack.

use crate::addr::Network;
use thiserror::Error;

/// Result type alias using Raceway's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced at the transport/pool/server boundary.
///
/// The type is `Clone` so a single failure (e.g. one coalesced dial) can be
/// delivered to every waiter; sources are captured as strings at
/// construction for the same reason.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Address network tag does not match the transport's supported set.
    #[error("invalid network {actual}, expected {expected}")]
    InvalidNetwork { expected: Network, actual: Network },

    /// Listener bind failed because the address is already bound.
    #[error("address in use: {0}")]
    AddressInUse(String),

    /// Dial found no listener, or the underlying transport refused.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Operation attempted on a closed connection, stream, or listener.
    #[error("closed")]
    Closed,

    /// The server has been closed.
    #[error("server closed")]
    ServerClosed,

    /// The caller's cancellation fired before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Mux adapter failed during client or server negotiation.
    #[error("mux setup failed: {0}")]
    MuxSetup(String),

    /// Underlying dial failed.
    #[error("dial failed: {0}")]
    Dial(String),

    /// Recoverable condition; accept loops retry these with backoff.
    #[error("temporary failure: {0}")]
    Temporary(String),

    /// A connection for this address is already tracked by the dial strategy.
    #[error("already tracking connection for {0}")]
    AlreadyTracking(String),

    /// Wrapped I/O error.
    #[error("i/o error: {0}")]
    Io(String),
}

impl Error {
    /// Whether a server accept loop should retry after backoff.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Capture an I/O error, preserving transient classification.
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => {
                Self::Temporary(err.to_string())
            }
            std::io::ErrorKind::ConnectionRefused => Self::ConnectionRefused(err.to_string()),
            std::io::ErrorKind::AddrInUse => Self::AddressInUse(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err)
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Closed | Error::ServerClosed => std::io::ErrorKind::BrokenPipe,
            Error::Cancelled => std::io::ErrorKind::Interrupted,
            Error::ConnectionRefused(_) => std::io::ErrorKind::ConnectionRefused,
            Error::AddressInUse(_) => std::io::ErrorKind::AddrInUse,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err.to_string())
    }
}
