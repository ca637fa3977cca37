//! NNTP peering error types

use thiserror::Error;

/// Errors raised by the peering engine
///
/// Errors never escape the per-connection supervisor: transport and TLS
/// failures tear the connection down, everything else is logged and the
/// command loop continues.
#[derive(Error, Debug)]
pub enum NntpError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS upgrade or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Connection closed by the peer
    #[error("Connection closed")]
    ConnectionClosed,

    /// A line exceeded the codec's length cap
    #[error("Line longer than {0} bytes")]
    LineTooLong(usize),

    /// Reply line did not carry a 3-digit code
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Peer answered with an unexpected reply code
    #[error("NNTP error {code}: {message}")]
    Protocol {
        /// NNTP reply code (e.g., 431, 480, 502)
        code: u16,
        /// Reply text from the peer
        message: String,
    },

    /// Malformed MIME header block
    #[error("Bad header: {0}")]
    BadHeader(String),

    /// AUTHINFO exchange failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Article store rejected or failed an ingest
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type alias using NntpError
pub type Result<T> = std::result::Result<T, NntpError>;
