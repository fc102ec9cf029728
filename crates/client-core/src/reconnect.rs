//! Network-aware reconnection.
//!
//! Policy (per account): exponential backoff `min(base * 2^(n-1), cap)`,
//! a bounded attempt budget before escalating to `Failed`, one reconnect
//! task per account, and a global semaphore so a network flap does not
//! stampede the server. Network loss cancels everything and parks the
//! account in `None`; network recovery waits out a stabilization window
//! and dials directly.
//!
//! The controller never races the registrar: an attempt only replaces the
//! transport and lets the registrar's onOpen hook drive REGISTER.

use tracing::{debug, info, warn};

use crate::account::RegistrationState;
use crate::error::ClientError;
use crate::events::TransportStatusInfo;
use crate::signaling::{AccountCommand, AccountTask};

/// Per-account reconnection bookkeeping.
pub(crate) struct ReconnectState {
    /// Consecutive failed attempts; cleared on successful registration
    pub attempts: u32,
    /// Bumped to cancel scheduled attempts (network loss, unregister)
    pub generation: u64,
    /// A delay task is already armed
    pub pending: bool,
    /// Last transport error observed
    pub last_error: Option<String>,
    /// The account was `Ok` when the network went away
    pub was_registered: bool,
}

impl ReconnectState {
    pub(crate) fn new() -> Self {
        ReconnectState {
            attempts: 0,
            generation: 0,
            pending: false,
            last_error: None,
            was_registered: false,
        }
    }
}

impl AccountTask {
    /// Arm the next backoff attempt, if policy allows one.
    pub(crate) async fn schedule_reconnect(&mut self) {
        if self.reconnect.pending {
            return;
        }
        if !self.network_up {
            debug!(account = %self.key, "no network, reconnect deferred");
            return;
        }
        let policy = self.env.config.reconnect.clone();
        self.reconnect.attempts += 1;
        let attempt = self.reconnect.attempts;
        if attempt > policy.max_attempts {
            warn!(
                account = %self.key,
                attempts = attempt - 1,
                last_error = ?self.reconnect.last_error,
                "reconnect attempts exhausted"
            );
            self.fail_registration(ClientError::transport("reconnect attempts exhausted"))
                .await;
            return;
        }

        let delay = policy.delay_for_attempt(attempt);
        info!(account = %self.key, attempt, delay_s = delay.as_secs(), "reconnect scheduled");
        self.reconnect.pending = true;
        self.env
            .events
            .emit_transport(TransportStatusInfo::Reconnecting {
                account: self.key.clone(),
                attempt,
            })
            .await;

        let generation = self.reconnect.generation;
        let cmd_tx = self.cmd_tx.clone();
        let limiter = self.env.reconnect_limiter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Global rate limit: hold a permit while handing the dial to
            // the account task.
            let _permit = limiter.acquire().await;
            let _ = cmd_tx.send(AccountCommand::Reconnect { generation }).await;
        });
    }

    /// Perform one reconnect: replace the transport and let the registrar's
    /// onOpen hook take over.
    pub(crate) async fn do_reconnect(&mut self, generation: u64) {
        if generation != self.reconnect.generation {
            debug!(account = %self.key, "stale reconnect attempt ignored");
            return;
        }
        self.reconnect.pending = false;
        if !self.network_up {
            debug!(account = %self.key, "network gone before reconnect fired");
            return;
        }
        match self.connect_transport().await {
            Ok(()) => {
                debug!(account = %self.key, "reconnect dial succeeded, awaiting open");
            }
            Err(e) => {
                self.reconnect.last_error = Some(e.to_string());
                warn!(account = %self.key, error = %e, "reconnect dial failed");
                self.schedule_reconnect().await;
            }
        }
    }

    /// Network went away: cancel everything, park in `None`.
    pub(crate) async fn on_network_lost(&mut self) {
        info!(account = %self.key, "network lost");
        self.reconnect.was_registered = self.registrar.state() == RegistrationState::Ok;
        // Cancelled reconnects must observe cancellation between attempts.
        self.reconnect.generation += 1;
        self.reconnect.pending = false;
        self.registration_transport_lost("network lost").await;
        self.call_transport_lost().await;
    }

    /// Network came back: stabilization window, then a direct dial.
    pub(crate) async fn on_network_restored(&mut self) {
        let transport_open = self.transport.as_ref().map(|t| t.is_open()) == Some(true);
        if !self.reconnect.was_registered && transport_open {
            return;
        }
        info!(account = %self.key, "network restored, reconnecting after stabilization");
        self.reconnect.attempts = 0;
        self.reconnect.generation += 1;
        self.reconnect.pending = true;
        let generation = self.reconnect.generation;
        let window = self.env.config.reconnect.stabilization_window;
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = cmd_tx.send(AccountCommand::Reconnect { generation }).await;
        });
    }
}
