//! Error types for dialog and transaction handling.

use thiserror::Error;

/// Result type alias for dialog-core operations
pub type DialogResult<T> = std::result::Result<T, DialogError>;

/// Errors raised by the dialog and transaction layers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialogError {
    /// Timer B/F fired before a final response arrived
    #[error("transaction timed out after {seconds} s")]
    TransactionTimeout {
        /// Configured timeout that elapsed
        seconds: u64,
    },

    /// A response carried a branch no live transaction matches
    #[error("no transaction matches branch {branch}")]
    UnknownBranch {
        /// The unmatched Via branch
        branch: String,
    },

    /// A request arrived for a branch that already has a live server
    /// transaction
    #[error("transaction already exists for branch {branch}")]
    DuplicateTransaction {
        /// The duplicated Via branch
        branch: String,
    },

    /// An in-dialog request regressed the remote CSeq
    #[error("out-of-order CSeq: got {got}, last seen {last}")]
    OutOfOrderCSeq {
        /// CSeq number on the offending request
        got: u32,
        /// Highest CSeq number previously accepted
        last: u32,
    },

    /// No dialog matches the (Call-ID, tags) triple
    #[error("dialog not found")]
    DialogNotFound,

    /// The message violates dialog-layer expectations
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying message could not be parsed or lacked headers
    #[error(transparent)]
    Codec(#[from] siprtc_sip_core::Error),
}
