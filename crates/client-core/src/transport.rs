//! Transport adapter contract.
//!
//! The core never opens sockets. The embedding layer supplies a factory
//! producing bidirectional text-frame sessions (in production, a WebSocket
//! negotiated with `Sec-WebSocket-Protocol: sip` and the configured Origin).
//! The adapter owns keepalive: a missed pong must surface as
//! [`TransportEvent::Error`], and it ticks [`TransportEvent::RenewalTick`]
//! every `ping_interval` as a soft registration-refresh hint.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::account::AccountKey;
use crate::error::ClientResult;

/// Events a transport session delivers to its account's signaling task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The session is open and writable
    Opened,
    /// One inbound text frame (one SIP message)
    Frame(String),
    /// The session closed; code 1000 is an orderly local close
    Closed {
        /// WebSocket close code
        code: u16,
        /// Close reason as reported by the transport
        reason: String,
    },
    /// The session failed (write error, pong timeout, TLS failure)
    Error {
        /// What the adapter observed
        reason: String,
    },
    /// A pong arrived; keepalive is healthy
    Pong,
    /// Periodic soft hint that registration may want refreshing
    RenewalTick,
}

/// One open signaling session.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send one text frame.
    async fn send(&self, frame: &str) -> ClientResult<()>;

    /// Close with a WebSocket code and reason.
    async fn close(&self, code: u16, reason: &str) -> ClientResult<()>;

    /// Whether the session is currently open.
    fn is_open(&self) -> bool;
}

/// Produces signaling sessions on demand.
///
/// `connect` resolves once the session is being established; the `Opened`
/// event on `events` marks actual readiness. Each reconnect attempt calls
/// this again with a fresh channel.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a new session for `account`, delivering its events on `events`.
    async fn connect(
        &self,
        account: &AccountKey,
        events: mpsc::Sender<TransportEvent>,
    ) -> ClientResult<Arc<dyn SignalingTransport>>;
}
