//! SIP transaction state (RFC 3261 §17) over a reliable transport.
//!
//! WebSocket delivery is reliable and message-framed, so the retransmission
//! timers (A/E/G) and the retransmit-absorption waits (D/K) collapse to
//! nothing. What remains is correlation — responses match requests by Via
//! branch and CSeq method — and the transaction timeout, timer B/F.
//!
//! Responses are correlated synchronously by [`TransactionRegistry::on_response`];
//! only timeouts travel over the registry's event channel, so the owning
//! signaling task stays the single writer for everything else.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use siprtc_sip_core::{HeaderAccess, Method, Request, Response};

use crate::errors::{DialogError, DialogResult};

/// Timer B/F default (RFC 3261: 64*T1 with T1 = 500 ms).
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(32);

/// Transaction identity: Via branch plus CSeq method.
///
/// The method disambiguates a CANCEL from the INVITE it cancels; both carry
/// the same branch (RFC 3261 §9.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    /// Via branch token
    pub branch: String,
    /// CSeq method
    pub method: Method,
}

impl TransactionKey {
    /// Key for a request about to be sent or just received.
    pub fn from_request(request: &Request) -> DialogResult<Self> {
        let via = request.via()?;
        let branch = via
            .branch()
            .ok_or_else(|| DialogError::Protocol("request Via has no branch".into()))?
            .to_string();
        Ok(TransactionKey {
            branch,
            method: request.method.clone(),
        })
    }

    /// Key a response correlates under (RFC 3261 §17.1.3).
    pub fn from_response(response: &Response) -> DialogResult<Self> {
        let via = response.via()?;
        let branch = via
            .branch()
            .ok_or_else(|| DialogError::Protocol("response Via has no branch".into()))?
            .to_string();
        Ok(TransactionKey {
            branch,
            method: response.cseq()?.method,
        })
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch, self.method)
    }
}

/// The four RFC 3261 transaction roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Client INVITE
    InviteClient,
    /// Client non-INVITE
    NonInviteClient,
    /// Server INVITE
    InviteServer,
    /// Server non-INVITE
    NonInviteServer,
}

/// Transaction state. `Calling`/`Trying` are the initial client states for
/// INVITE / non-INVITE respectively; servers start in `Proceeding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

#[derive(Debug)]
struct TransactionEntry {
    kind: TransactionKind,
    state: TransactionState,
    request: Request,
}

/// Outcome of correlating a response, or a timer firing.
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    /// 1xx received on a client transaction
    Provisional {
        /// Transaction the response matched
        key: TransactionKey,
        /// The original request
        request: Request,
        /// The provisional response
        response: Response,
    },
    /// Final response received; the transaction is consumed
    Final {
        /// Transaction the response matched
        key: TransactionKey,
        /// The original request (ACK construction needs it)
        request: Request,
        /// The final response
        response: Response,
    },
    /// Timer B/F fired with no final response
    TimedOut {
        /// The abandoned transaction
        key: TransactionKey,
        /// The original request
        request: Request,
    },
}

/// Table of live transactions for one account.
///
/// Cloning shares the underlying table; the per-transaction timeout tasks
/// hold such clones.
#[derive(Clone)]
pub struct TransactionRegistry {
    entries: Arc<DashMap<TransactionKey, TransactionEntry>>,
    timeouts_tx: mpsc::Sender<TransactionEvent>,
    timeout: Duration,
}

impl TransactionRegistry {
    /// Registry with the default 32 s timer B/F.
    pub fn new(timeouts_tx: mpsc::Sender<TransactionEvent>) -> Self {
        Self::with_timeout(timeouts_tx, DEFAULT_TRANSACTION_TIMEOUT)
    }

    /// Registry with an explicit transaction timeout.
    pub fn with_timeout(timeouts_tx: mpsc::Sender<TransactionEvent>, timeout: Duration) -> Self {
        TransactionRegistry {
            entries: Arc::new(DashMap::new()),
            timeouts_tx,
            timeout,
        }
    }

    /// Register a client transaction for a request about to be sent and arm
    /// its timer B/F.
    pub fn start_client(&self, request: &Request) -> DialogResult<TransactionKey> {
        let key = TransactionKey::from_request(request)?;
        let kind = if request.method.is_invite() {
            TransactionKind::InviteClient
        } else {
            TransactionKind::NonInviteClient
        };
        let state = match kind {
            TransactionKind::InviteClient => TransactionState::Calling,
            _ => TransactionState::Trying,
        };
        self.insert(key.clone(), kind, state, request.clone())?;
        self.arm_timer(key.clone());
        trace!(key = %key, "client transaction started");
        Ok(key)
    }

    /// Register a server transaction for a request just received.
    pub fn start_server(&self, request: &Request) -> DialogResult<TransactionKey> {
        let key = TransactionKey::from_request(request)?;
        let kind = if request.method.is_invite() {
            TransactionKind::InviteServer
        } else {
            TransactionKind::NonInviteServer
        };
        self.insert(key.clone(), kind, TransactionState::Proceeding, request.clone())?;
        self.arm_timer(key.clone());
        trace!(key = %key, "server transaction started");
        Ok(key)
    }

    fn insert(
        &self,
        key: TransactionKey,
        kind: TransactionKind,
        state: TransactionState,
        request: Request,
    ) -> DialogResult<()> {
        if self.entries.contains_key(&key) {
            return Err(DialogError::DuplicateTransaction { branch: key.branch });
        }
        self.entries.insert(
            key,
            TransactionEntry {
                kind,
                state,
                request,
            },
        );
        Ok(())
    }

    fn arm_timer(&self, key: TransactionKey) {
        let entries = Arc::clone(&self.entries);
        let tx = self.timeouts_tx.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let removed = entries.remove_if(&key, |_, e| {
                !matches!(e.state, TransactionState::Terminated)
            });
            if let Some((key, entry)) = removed {
                debug!(key = %key, "transaction timed out");
                let _ = tx
                    .send(TransactionEvent::TimedOut {
                        key,
                        request: entry.request,
                    })
                    .await;
            }
        });
    }

    /// Correlate an incoming response to its client transaction.
    ///
    /// An unknown branch yields [`DialogError::UnknownBranch`]; the caller
    /// logs and discards the frame. Final responses consume the transaction
    /// (timer D/K is zero over a reliable transport).
    pub fn on_response(&self, response: &Response) -> DialogResult<TransactionEvent> {
        let key = TransactionKey::from_response(response)?;
        let event = {
            let mut entry = self
                .entries
                .get_mut(&key)
                .ok_or_else(|| DialogError::UnknownBranch {
                    branch: key.branch.clone(),
                })?;
            if !matches!(
                entry.kind,
                TransactionKind::InviteClient | TransactionKind::NonInviteClient
            ) {
                return Err(DialogError::Protocol(format!(
                    "response correlates to server transaction {key}"
                )));
            }
            if response.status.is_provisional() {
                entry.state = TransactionState::Proceeding;
                TransactionEvent::Provisional {
                    key: key.clone(),
                    request: entry.request.clone(),
                    response: response.clone(),
                }
            } else {
                entry.state = TransactionState::Terminated;
                TransactionEvent::Final {
                    key: key.clone(),
                    request: entry.request.clone(),
                    response: response.clone(),
                }
            }
        };
        if matches!(event, TransactionEvent::Final { .. }) {
            self.entries.remove(&key);
        }
        Ok(event)
    }

    /// Record that a final response was sent on a server transaction.
    ///
    /// Non-INVITE servers terminate immediately; an INVITE server lingers in
    /// `Completed` until [`TransactionRegistry::on_ack`] (its timer cleans
    /// up if the ACK never comes).
    pub fn on_server_final_sent(&self, key: &TransactionKey) {
        let mut remove = false;
        if let Some(mut entry) = self.entries.get_mut(key) {
            match entry.kind {
                TransactionKind::InviteServer => entry.state = TransactionState::Completed,
                _ => {
                    entry.state = TransactionState::Terminated;
                    remove = true;
                }
            }
        }
        if remove {
            self.entries.remove(key);
        }
    }

    /// Consume an INVITE server transaction on ACK receipt.
    pub fn on_ack(&self, branch: &str) {
        let key = TransactionKey {
            branch: branch.to_string(),
            method: Method::Invite,
        };
        if self.entries.remove(&key).is_some() {
            trace!(key = %key, "INVITE server transaction acknowledged");
        }
    }

    /// The stored request for a live transaction, if any.
    pub fn original_request(&self, key: &TransactionKey) -> Option<Request> {
        self.entries.get(key).map(|e| e.request.clone())
    }

    /// Drop a transaction without emitting any event.
    pub fn abandon(&self, key: &TransactionKey) {
        self.entries.remove(key);
    }

    /// Number of live transactions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no transactions are live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siprtc_sip_core::{Address, RequestBuilder, ResponseBuilder, StatusCode, Uri};

    fn request(method: Method, branch: &str) -> Request {
        RequestBuilder::new(method.clone(), "sip:bob@example.com")
            .unwrap()
            .via("client.invalid", "WS", branch)
            .from(Address::new(Uri::sip("alice", "example.com")).with_tag("f"))
            .to(Address::new(Uri::sip("bob", "example.com")))
            .call_id("tx-test")
            .cseq(1)
            .build()
    }

    fn registry() -> (TransactionRegistry, mpsc::Receiver<TransactionEvent>) {
        let (tx, rx) = mpsc::channel(8);
        (TransactionRegistry::new(tx), rx)
    }

    #[tokio::test]
    async fn correlates_provisional_then_final() {
        let (reg, _rx) = registry();
        let invite = request(Method::Invite, "z9hG4bKtx1");
        reg.start_client(&invite).unwrap();

        let ringing = ResponseBuilder::reply(StatusCode::Ringing, &invite).build();
        match reg.on_response(&ringing).unwrap() {
            TransactionEvent::Provisional { response, .. } => {
                assert_eq!(response.status, StatusCode::Ringing)
            }
            other => panic!("expected provisional, got {other:?}"),
        }

        let ok = ResponseBuilder::reply(StatusCode::Ok, &invite).build();
        match reg.on_response(&ok).unwrap() {
            TransactionEvent::Final { request, .. } => assert_eq!(request.method, Method::Invite),
            other => panic!("expected final, got {other:?}"),
        }
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn unknown_branch_is_rejected() {
        let (reg, _rx) = registry();
        let invite = request(Method::Invite, "z9hG4bKknown");
        reg.start_client(&invite).unwrap();

        let mut stray = ResponseBuilder::reply(StatusCode::Ok, &invite).build();
        stray.set_header(
            siprtc_sip_core::HeaderName::Via,
            "SIP/2.0/WS client.invalid;branch=z9hG4bKother",
        );
        assert!(matches!(
            reg.on_response(&stray),
            Err(DialogError::UnknownBranch { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_and_invite_share_branch_without_colliding() {
        let (reg, _rx) = registry();
        let invite = request(Method::Invite, "z9hG4bKshared");
        reg.start_client(&invite).unwrap();
        let cancel = RequestBuilder::new(Method::Cancel, "sip:bob@example.com")
            .unwrap()
            .via("client.invalid", "WS", "z9hG4bKshared")
            .from(Address::new(Uri::sip("alice", "example.com")).with_tag("f"))
            .to(Address::new(Uri::sip("bob", "example.com")))
            .call_id("tx-test")
            .cseq(1)
            .build();
        reg.start_client(&cancel).unwrap();
        assert_eq!(reg.len(), 2);

        // 200 for the CANCEL consumes only the CANCEL transaction.
        let ok_cancel = ResponseBuilder::reply(StatusCode::Ok, &cancel).build();
        match reg.on_response(&ok_cancel).unwrap() {
            TransactionEvent::Final { key, .. } => assert_eq!(key.method, Method::Cancel),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_f_fires_for_unanswered_request() {
        let (tx, mut rx) = mpsc::channel(8);
        let reg = TransactionRegistry::with_timeout(tx, Duration::from_secs(32));
        let register = request(Method::Register, "z9hG4bKslow");
        reg.start_client(&register).unwrap();

        // let the timer task park on its sleep before moving the clock
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(33)).await;
        match rx.recv().await.unwrap() {
            TransactionEvent::TimedOut { key, request } => {
                assert_eq!(key.branch, "z9hG4bKslow");
                assert_eq!(request.method, Method::Register);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn answered_transaction_does_not_time_out() {
        let (tx, mut rx) = mpsc::channel(8);
        let reg = TransactionRegistry::with_timeout(tx, Duration::from_secs(32));
        let register = request(Method::Register, "z9hG4bKfast");
        reg.start_client(&register).unwrap();

        let ok = ResponseBuilder::reply(StatusCode::Ok, &register).build();
        reg.on_response(&ok).unwrap();

        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(40)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn server_invite_lives_until_ack() {
        let (reg, _rx) = registry();
        let invite = request(Method::Invite, "z9hG4bKsrv");
        let key = reg.start_server(&invite).unwrap();

        reg.on_server_final_sent(&key);
        assert_eq!(reg.len(), 1);
        reg.on_ack("z9hG4bKsrv");
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn server_non_invite_terminates_on_final() {
        let (reg, _rx) = registry();
        let notify = request(Method::Notify, "z9hG4bKntfy");
        let key = reg.start_server(&notify).unwrap();
        reg.on_server_final_sent(&key);
        assert!(reg.is_empty());
    }
}
