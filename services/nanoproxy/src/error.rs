//! Error types for the proxy engine.

use std::io;

use thiserror::Error;

/// Errors produced while resolving or relaying a single connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The client's opening request could not be parsed.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Dialing an outbound address failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The client hung up before the request header block was complete.
    #[error("client closed the connection before the request was complete")]
    ClientClosed,

    /// Read or write failure on either leg of the connection.
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    /// The configured upstream proxy URL is unusable.
    #[error("invalid upstream proxy: {0}")]
    InvalidUpstream(String),
}

impl ProxyError {
    /// Whether this error was caused by the client sending something unparsable.
    pub fn is_malformed(&self) -> bool {
        matches!(self, ProxyError::MalformedRequest(_))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ProxyError>;
