//! Relay error types.

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors that end a single connection or stop the listener.
///
/// None of these cross connection boundaries: a connection task logs its own
/// terminal error and exits.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
