//! Error types for KNXnet/IP connection handling.
//!
//! [`KnxError`] is the error type returned by all operations of this crate.
//! Frame-level problems are grouped under [`FormatError`]; everything the
//! peer reports carries the peer's textual status verbatim.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for KNX operations.
pub type Result<T> = std::result::Result<T, KnxError>;

/// Malformed frame or structure encountered while decoding.
///
/// During normal operation such frames are logged and dropped; during connect
/// they surface to the caller as an invalid response.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Input ended before the structure was complete.
    #[error("structure too short, need {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// Header structure length octet differs from 6.
    #[error("invalid header length {0:#04x}")]
    InvalidHeaderLength(u8),

    /// Declared total length exceeds the received data.
    #[error("declared frame length {declared} exceeds received {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    /// A typed sub-structure (HPAI, CRI/CRD, connection header) is invalid.
    #[error("invalid structure: {0}")]
    InvalidStructure(&'static str),
}

/// Errors raised by the connection engine.
#[derive(Debug, Error)]
pub enum KnxError {
    /// Malformed frame or structure.
    #[error("frame format error: {0}")]
    Format(#[from] FormatError),

    /// A bounded wait elapsed: no ack after all send attempts, no cEMI
    /// confirmation, or no connect response.
    #[error("timeout {0}")]
    Timeout(String),

    /// The peer reported a non-zero status on connect or acknowledgment.
    #[error("error response from {endpoint}: {status}")]
    Remote { endpoint: SocketAddr, status: String },

    /// The peer answered with a structurally valid but unusable response.
    #[error("invalid response from {endpoint}: {details}")]
    InvalidResponse { endpoint: SocketAddr, details: String },

    /// Socket I/O failure; closes the connection.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// Operation not permitted in the current connection state. The state is
    /// left untouched.
    #[error("{0}")]
    IllegalState(&'static str),

    /// The connection has reached its terminal state.
    #[error("connection closed ({reason})")]
    ConnectionClosed { reason: String },

    /// Invalid caller-supplied argument (endpoint, address, ...).
    #[error("{0}")]
    InvalidArgument(String),
}

impl KnxError {
    pub(crate) fn timeout(context: impl Into<String>) -> Self {
        Self::Timeout(context.into())
    }

    pub(crate) fn remote(endpoint: SocketAddr, status: impl Into<String>) -> Self {
        Self::Remote { endpoint, status: status.into() }
    }

    pub(crate) fn invalid_response(endpoint: SocketAddr, details: impl Into<String>) -> Self {
        Self::InvalidResponse { endpoint, details: details.into() }
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Check if the peer reported the error.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_peer_status() {
        let err = KnxError::remote("192.0.2.1:3671".parse().unwrap(), "no more connections");
        let msg = err.to_string();
        assert!(msg.contains("192.0.2.1:3671"));
        assert!(msg.contains("no more connections"));
    }

    #[test]
    fn format_error_wraps() {
        let err: KnxError = FormatError::TooShort { expected: 6, actual: 2 }.into();
        assert!(matches!(err, KnxError::Format(_)));
        assert!(!err.is_timeout());
    }
}
