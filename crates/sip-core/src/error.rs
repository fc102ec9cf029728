//! Error types for the SIP codec.
//!
//! Parse failures are reported per message; a malformed frame is discarded
//! and logged by the caller, it never tears the connection down.

use thiserror::Error;

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while parsing or assembling SIP messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The request-line or status-line could not be parsed
    #[error("malformed start line: {0}")]
    MalformedStart(String),

    /// A header line could not be split or its value failed to parse
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// A header that may appear at most once appeared again
    #[error("duplicate singleton header: {0}")]
    DuplicateSingletonHeader(String),

    /// Content-Length disagrees with the actual body length
    #[error("Content-Length mismatch: declared {declared}, body has {actual} bytes")]
    BadContentLength {
        /// Value carried in the Content-Length header
        declared: usize,
        /// Number of body bytes actually present in the frame
        actual: usize,
    },

    /// A SIP URI could not be parsed
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// A required header is missing from the message
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    /// An SDP body could not be parsed
    #[error("invalid SDP: {0}")]
    InvalidSdp(String),

    /// A WWW-Authenticate / Proxy-Authenticate value could not be parsed
    #[error("invalid digest challenge: {0}")]
    InvalidChallenge(String),

    /// The challenge advertises an algorithm this stack does not implement
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),
}
