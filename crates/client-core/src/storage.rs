//! Storage collaborator contracts.
//!
//! Durable storage lives outside the core. These traits are the narrow
//! surface it consumes: an account catalog for re-hydration at startup and
//! an append-only call log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::AccountKey;
use crate::call::{CallDirection, CallId, CallLogClass};
use crate::error::ClientResult;

/// One persisted account row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAccount {
    /// SIP username
    pub username: String,
    /// Digest password
    pub password: String,
    /// SIP domain
    pub domain: String,
    /// Optional display name
    pub display_name: Option<String>,
    /// Push token, if the platform registered one
    pub push_token: Option<String>,
    /// Push provider identifier
    pub push_provider: Option<String>,
    /// Whether the account was registered when last persisted
    pub last_registration_ok: bool,
    /// When the last granted registration would have expired
    pub last_expiry: Option<DateTime<Utc>>,
}

/// Account catalog.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// All persisted accounts.
    async fn load_accounts(&self) -> ClientResult<Vec<StoredAccount>>;

    /// Persist (insert or update) one account.
    async fn save_account(&self, account: &StoredAccount) -> ClientResult<()>;

    /// Remove one account.
    async fn remove_account(&self, key: &AccountKey) -> ClientResult<()>;
}

/// One terminated call, ready for the call log table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallLogEntry {
    /// Stable call identifier
    pub call_id: CallId,
    /// Account that carried the call
    pub account: AccountKey,
    /// Direction
    pub direction: CallDirection,
    /// Remote party (URI or number)
    pub peer: String,
    /// When the call started
    pub start: DateTime<Utc>,
    /// When the call ended
    pub end: DateTime<Utc>,
    /// Terminal classification
    pub classification: CallLogClass,
}

/// Append-only call log.
#[async_trait]
pub trait CallLogSink: Send + Sync {
    /// Append one terminated call.
    async fn append(&self, entry: CallLogEntry) -> ClientResult<()>;
}

/// No-op account store for embeddings without persistence.
#[derive(Debug, Default)]
pub struct NullAccountStore;

#[async_trait]
impl AccountStore for NullAccountStore {
    async fn load_accounts(&self) -> ClientResult<Vec<StoredAccount>> {
        Ok(Vec::new())
    }

    async fn save_account(&self, _account: &StoredAccount) -> ClientResult<()> {
        Ok(())
    }

    async fn remove_account(&self, _key: &AccountKey) -> ClientResult<()> {
        Ok(())
    }
}

/// No-op call log.
#[derive(Debug, Default)]
pub struct NullCallLog;

#[async_trait]
impl CallLogSink for NullCallLog {
    async fn append(&self, _entry: CallLogEntry) -> ClientResult<()> {
        Ok(())
    }
}
