//! Error types for the relay pool.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the pool handle.
///
/// Transport failures never appear here; they become connection state
/// changes and log lines.
#[derive(Error, Debug)]
pub enum Error {
    /// Relay URL or wire encoding error from the core crate.
    #[error(transparent)]
    Core(#[from] outpost_core::Error),

    /// The pool actor has stopped.
    #[error("relay pool is shut down")]
    PoolClosed,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors produced while opening or driving a socket.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The handshake did not finish in time.
    #[error("connect timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Websocket protocol or I/O error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Either side closed the socket, or the stream ended.
    #[error("socket closed")]
    Closed,
}
