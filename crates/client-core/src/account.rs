//! Account identity, registration state, and snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// Canonical account identity: `username@domain`.
///
/// Construction validates the parts so the invariant
/// `key == username + "@" + domain` holds everywhere a key exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountKey {
    username: String,
    domain: String,
}

impl AccountKey {
    /// Validate and build a key.
    pub fn new(username: &str, domain: &str) -> ClientResult<Self> {
        if username.is_empty() || username.contains('@') || username.contains(char::is_whitespace) {
            return Err(ClientError::InvalidAccountKey {
                reason: format!("bad username {username:?}"),
            });
        }
        if domain.is_empty() || domain.contains('@') || domain.contains(char::is_whitespace) {
            return Err(ClientError::InvalidAccountKey {
                reason: format!("bad domain {domain:?}"),
            });
        }
        Ok(AccountKey {
            username: username.to_string(),
            domain: domain.to_string(),
        })
    }

    /// The user part.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The domain part.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// `sip:username@domain`.
    pub fn uri(&self) -> siprtc_sip_core::Uri {
        siprtc_sip_core::Uri::sip(self.username.clone(), self.domain.clone())
    }
}

impl std::fmt::Display for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.username, self.domain)
    }
}

/// Registration lifecycle of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    /// Nothing sent, or reset after a transport drop
    None,
    /// REGISTER in flight (including the auth retry)
    InProgress,
    /// Registrar accepted the binding
    Ok,
    /// Terminal failure (auth exhausted, timeout, rejection)
    Failed,
    /// Unregistered on purpose
    Cleared,
}

impl RegistrationState {
    /// The single source of truth for "is registered".
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationState::Ok)
    }
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Foreground/background mode of the embedding application.
///
/// Background mode advertises push routing to the registrar by appending
/// the literal ` Push` suffix to the User-Agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppMode {
    /// App is in the foreground
    Foreground,
    /// App is backgrounded; wake-up pushes expected
    Background,
}

/// Account credentials and push metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Digest password
    pub password: String,
    /// Push token handed to the registrar, if any
    pub push_token: Option<String>,
    /// Push provider identifier, if any
    pub push_provider: Option<String>,
}

/// Snapshot of one account's registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    /// Account identity
    pub account: AccountKey,
    /// Current state
    pub state: RegistrationState,
    /// Granted expiry in seconds, when registered
    pub expires: Option<u32>,
    /// Timestamp of the last successful registration
    pub registered_at: Option<DateTime<Utc>>,
    /// Last failure reason, if any
    pub last_error: Option<String>,
}

/// Aggregate counts over accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistrationStats {
    /// All accounts known to the registry
    pub total_accounts: usize,
    /// Accounts in `Ok`
    pub registered_accounts: usize,
    /// Accounts in `Failed`
    pub failed_accounts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_invariant() {
        let key = AccountKey::new("alice", "example.com").unwrap();
        assert_eq!(key.to_string(), format!("{}@{}", key.username(), key.domain()));
        assert_eq!(key.uri().to_string(), "sip:alice@example.com");
    }

    #[test]
    fn key_validation() {
        assert!(AccountKey::new("", "example.com").is_err());
        assert!(AccountKey::new("alice", "").is_err());
        assert!(AccountKey::new("al@ice", "example.com").is_err());
        assert!(AccountKey::new("alice", "exa mple.com").is_err());
    }

    #[test]
    fn only_ok_counts_as_registered() {
        assert!(RegistrationState::Ok.is_registered());
        for state in [
            RegistrationState::None,
            RegistrationState::InProgress,
            RegistrationState::Failed,
            RegistrationState::Cleared,
        ] {
            assert!(!state.is_registered());
        }
    }
}
