//! Error types for the download layer

use thiserror::Error;

/// Error types for HTTP range and source operations
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server did not answer a range request with partial content
    #[error("server does not support range requests (status {status})")]
    RangeNotSupported {
        /// Status the server answered with
        status: u16,
    },

    /// Content-Range header disagrees with the requested range
    #[error("invalid Content-Range header: {header}")]
    InvalidContentRange {
        /// The offending header value
        header: String,
    },

    /// Body ended before the requested range was delivered
    #[error("incomplete range: expected {expected} bytes, received {received}")]
    IncompleteRange {
        /// Bytes requested
        expected: u64,
        /// Bytes received
        received: u64,
    },

    /// Multipart body could not be parsed
    #[error("invalid multipart/byteranges body: {reason}")]
    InvalidMultipart {
        /// What was wrong
        reason: String,
    },

    /// Resource is gone from the server
    #[error("remote content not found: {url}")]
    NotFound {
        /// Requested URL
        url: String,
    },

    /// Rate limit exceeded
    #[error("rate limit exceeded: retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying
        retry_after_secs: u64,
    },

    /// Throughput stayed under the stall threshold for too long
    #[error("download stalled: under {threshold_bytes_per_sec} B/s for {window_secs} seconds")]
    Stalled {
        /// Threshold in bytes per second
        threshold_bytes_per_sec: u64,
        /// Sustained window in seconds
        window_secs: u64,
    },

    /// Invalid response from the server
    #[error("invalid response: {reason}")]
    InvalidResponse {
        /// Reason the response was unusable
        reason: String,
    },

    /// No source plugin accepts the URL
    #[error("no update source accepts URL: {url}")]
    UnknownSourceScheme {
        /// The unmatched URL
        url: String,
    },

    /// Session challenge kind cannot be solved headlessly
    #[error("source {source_id}: challenge kind {kind:?} requires a browser")]
    UnsolvableChallenge {
        /// Identifier of the source that announced the challenge
        source_id: String,
        /// Challenge kind announced by the server
        kind: String,
    },

    /// Session protocol violation
    #[error("source {source_id}: session protocol error: {reason}")]
    SessionProtocol {
        /// Identifier of the source the handshake ran against
        source_id: String,
        /// What went wrong
        reason: String,
    },

    /// Remote package is malformed
    #[error(transparent)]
    Format(#[from] kachina_format::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for download operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid response error
    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    /// Create an invalid multipart error
    pub fn invalid_multipart(reason: impl Into<String>) -> Self {
        Self::InvalidMultipart {
            reason: reason.into(),
        }
    }

    /// Create a session protocol error for a named source
    pub fn session_protocol(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SessionProtocol {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether a retry may help for this error
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Self::RateLimited { .. }
            | Self::Stalled { .. }
            | Self::IncompleteRange { .. }
            | Self::RangeNotSupported { .. } => true,
            _ => false,
        }
    }
}
