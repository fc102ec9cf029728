//! Error types for the client coordination layer.
//!
//! The taxonomy mirrors how failures propagate: per-account errors mutate
//! only that account, a media error only terminates its call, protocol
//! errors on one frame are contained to the frame, and transport errors
//! route into the reconnection controller. State errors are returned
//! synchronously from the public API.

use thiserror::Error;

use crate::call::CallId;

/// Result type alias for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client coordination layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    // --- Transport ---
    /// Opening or writing to the signaling transport failed
    #[error("transport failed: {reason}")]
    TransportFailed {
        /// What went wrong
        reason: String,
    },

    /// The transport closed unexpectedly
    #[error("transport closed with code {code}: {reason}")]
    TransportClosed {
        /// WebSocket close code
        code: u16,
        /// Close reason as reported
        reason: String,
    },

    // --- Protocol ---
    /// The peer violated SIP protocol expectations
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// What was violated
        reason: String,
    },

    // --- Auth ---
    /// The account has no credentials to answer a challenge with
    #[error("no credentials available for authentication")]
    MissingCredentials,

    /// A digest challenge could not be satisfied
    #[error("authentication failed: {reason}")]
    AuthenticationFailed {
        /// Specific reason (retry exhausted, realm change, bad challenge)
        reason: String,
    },

    /// The registrar rejected the REGISTER with a final non-2xx
    #[error("registration rejected: {code} {reason}")]
    RegistrationRejected {
        /// SIP status code
        code: u16,
        /// Reason phrase
        reason: String,
    },

    // --- Timeout ---
    /// An operation did not complete within its deadline
    #[error("{operation} timed out after {seconds} s")]
    OperationTimeout {
        /// The operation that timed out
        operation: &'static str,
        /// The deadline that elapsed
        seconds: u64,
    },

    // --- State ---
    /// The operation is not valid in the current state
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// State the operation requires
        expected: String,
        /// State actually observed
        actual: String,
    },

    /// No call is active on the selected account
    #[error("no active call")]
    NoActiveCall,

    /// The call id does not match any live call
    #[error("call not found: {call_id}")]
    CallNotFound {
        /// The unmatched call id
        call_id: CallId,
    },

    /// A call is already active on this account
    #[error("call already active: {call_id}")]
    CallAlreadyActive {
        /// The live call occupying the account
        call_id: CallId,
    },

    /// The account key does not match any registered account
    #[error("account not found: {key}")]
    AccountNotFound {
        /// The unmatched account key
        key: String,
    },

    /// The operation requires a registered account
    #[error("account not registered: {key}")]
    AccountNotRegistered {
        /// The unregistered account key
        key: String,
    },

    /// An account with this key already exists
    #[error("account already exists: {key}")]
    AccountAlreadyExists {
        /// The duplicated account key
        key: String,
    },

    /// An account identity failed validation
    #[error("invalid account key: {reason}")]
    InvalidAccountKey {
        /// Why validation failed
        reason: String,
    },

    /// A configuration field is missing or inconsistent
    #[error("invalid configuration for {field}: {reason}")]
    InvalidConfiguration {
        /// The offending field
        field: &'static str,
        /// Why it is invalid
        reason: String,
    },

    // --- Media ---
    /// The media engine failed an operation
    #[error("media error: {reason}")]
    MediaFailed {
        /// What the media engine reported
        reason: String,
    },

    /// The media engine has not been initialized
    #[error("media engine not initialized")]
    MediaUninitialized,

    // --- Network ---
    /// No network connectivity; distinct from transport failure so the
    /// reconnection controller can hold off instead of backing off
    #[error("network unavailable")]
    NetworkUnavailable,

    /// The core is shutting down and no longer accepts work
    #[error("client is shut down")]
    ShutDown,
}

impl ClientError {
    /// Shorthand constructor for transport failures.
    pub fn transport(reason: impl Into<String>) -> Self {
        ClientError::TransportFailed {
            reason: reason.into(),
        }
    }

    /// Shorthand constructor for protocol violations.
    pub fn protocol(reason: impl Into<String>) -> Self {
        ClientError::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Shorthand constructor for media failures.
    pub fn media(reason: impl Into<String>) -> Self {
        ClientError::MediaFailed {
            reason: reason.into(),
        }
    }

    /// Shorthand constructor for state errors.
    pub fn invalid_state(expected: impl Into<String>, actual: impl std::fmt::Debug) -> Self {
        ClientError::InvalidState {
            expected: expected.into(),
            actual: format!("{actual:?}"),
        }
    }

    /// Coarse category used for logging and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            ClientError::TransportFailed { .. } | ClientError::TransportClosed { .. } => "transport",
            ClientError::ProtocolViolation { .. } => "protocol",
            ClientError::MissingCredentials
            | ClientError::AuthenticationFailed { .. }
            | ClientError::RegistrationRejected { .. } => "auth",
            ClientError::OperationTimeout { .. } => "timeout",
            ClientError::InvalidState { .. }
            | ClientError::NoActiveCall
            | ClientError::CallNotFound { .. }
            | ClientError::CallAlreadyActive { .. }
            | ClientError::AccountNotFound { .. }
            | ClientError::AccountNotRegistered { .. }
            | ClientError::AccountAlreadyExists { .. }
            | ClientError::InvalidAccountKey { .. }
            | ClientError::InvalidConfiguration { .. }
            | ClientError::ShutDown => "state",
            ClientError::MediaFailed { .. } | ClientError::MediaUninitialized => "media",
            ClientError::NetworkUnavailable => "network",
        }
    }

    /// Whether retrying later can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            "transport" | "timeout" | "network"
        )
    }

    /// Whether the failure is credential-related.
    pub fn is_auth_error(&self) -> bool {
        self.category() == "auth"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert_eq!(ClientError::transport("x").category(), "transport");
        assert_eq!(ClientError::MissingCredentials.category(), "auth");
        assert_eq!(ClientError::NoActiveCall.category(), "state");
        assert_eq!(ClientError::NetworkUnavailable.category(), "network");
        assert_eq!(
            ClientError::OperationTimeout {
                operation: "registration",
                seconds: 30
            }
            .category(),
            "timeout"
        );
    }

    #[test]
    fn recoverability() {
        assert!(ClientError::transport("x").is_recoverable());
        assert!(ClientError::NetworkUnavailable.is_recoverable());
        assert!(!ClientError::MissingCredentials.is_recoverable());
        assert!(!ClientError::NoActiveCall.is_recoverable());
    }

    #[test]
    fn auth_classification() {
        assert!(ClientError::AuthenticationFailed {
            reason: "retry exhausted".into()
        }
        .is_auth_error());
        assert!(!ClientError::transport("x").is_auth_error());
    }
}
