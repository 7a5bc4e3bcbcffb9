//! Crate error types.
//!
//! Per-request failures (format mismatch, peer withdrawal, protocol
//! refusal) never travel through these types: they resolve the pending
//! [`AsyncRequest`](crate::request::AsyncRequest) with its failure value.
//! `ExchangeError` is reserved for setup errors and for the transport
//! itself going away.

/// Errors returned by the exchange engine and its backends.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// The display / compositor connection failed or was closed.
    /// Every live session is invalid once this is returned.
    #[error("connection: {0}")]
    Connection(String),

    /// A native request could not be issued (bad reply, protocol state).
    #[error("protocol: {0}")]
    Protocol(String),

    /// No usable backend for the requested platform.
    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),

    /// A format with an empty name, or otherwise unusable.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Errno(#[from] nix::Error),
}

impl ExchangeError {
    /// Whether this error invalidates the whole connection rather than a
    /// single request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExchangeError::Connection(_))
    }
}

/// Errors returned by [`AsyncRequest::wait`](crate::request::AsyncRequest::wait).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The wait was interrupted through a [`CancelHandle`](crate::request::CancelHandle).
    /// The request is still pending and may be waited on again.
    #[error("wait cancelled")]
    Cancelled,

    /// The value was already taken. Consuming a request twice is a
    /// contract violation.
    #[error("request already consumed")]
    Consumed,

    /// The event loop reported that the underlying connection died.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

pub type Result<T, E = ExchangeError> = std::result::Result<T, E>;
