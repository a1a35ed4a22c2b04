//! Error types for the proxy.

use std::time::Duration;

use thiserror::Error;

use crate::session::ConnectionId;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The first line of a message was not a request or status line.
    #[error("Malformed start line: {0:?}")]
    MalformedStartLine(String),

    /// No header terminator within the allowed header size.
    #[error("Header block exceeds {0} bytes")]
    HeaderTooLarge(usize),

    /// Peer closed the stream in the middle of a header block.
    #[error("Connection closed before end of headers ({0} bytes buffered)")]
    IncompleteHeaders(usize),

    /// Declared body length is above the accepted maximum.
    #[error("Declared body of {declared} bytes exceeds {limit} bytes")]
    BodyTooLarge { declared: usize, limit: usize },

    /// Peer closed the stream before the declared body length arrived.
    #[error("Body truncated: expected {expected} bytes, received {received}")]
    TruncatedBody { expected: usize, received: usize },

    /// Could not reach the origin server.
    #[error("Origin connect to {addr} failed: {reason}")]
    OriginConnect { addr: String, reason: String },

    /// An operation exceeded its configured timeout.
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    /// A request arrived for a session that is no longer registered.
    #[error("No session registered for client {0}")]
    UnknownSession(ConnectionId),

    /// The shared upstream task is no longer running.
    #[error("Upstream worker stopped")]
    UpstreamClosed,
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
