//! Registrar client: REGISTER construction, digest retry, refresh timers
//! and the foreground/background mode switch.
//!
//! One [`Registrar`] lives inside each account's signaling task; all entry
//! points run on that task, so registration state has a single writer.

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use siprtc_dialog_core::{TransactionEvent, TransactionKey};
use siprtc_sip_core::{
    generate_branch, Address, Contact, DigestChallenge, HeaderAccess, HeaderName, Method,
    RequestBuilder, Response, StatusCode, Uri,
};

use crate::account::{AppMode, RegistrationState};
use crate::error::{ClientError, ClientResult};
use crate::events::RegistrationStatusInfo;
use crate::signaling::{AccountCommand, AccountTask};

/// An in-flight REGISTER transaction.
pub(crate) struct PendingRegistration {
    /// Transaction carrying the current attempt
    pub key: TransactionKey,
    /// Attempt sequence number, for deadline correlation
    pub attempt: u64,
    /// Whether the one allowed auth retry was already spent
    pub auth_retried: bool,
    /// Realm of the challenge the retry answered
    pub challenged_realm: Option<String>,
    /// True when this attempt carries `Expires: 0`
    pub unregister: bool,
    /// API caller waiting for the outcome
    pub reply: Option<oneshot::Sender<ClientResult<()>>>,
}

/// Per-account registration state machine.
pub(crate) struct Registrar {
    pub state_tx: watch::Sender<RegistrationState>,
    pub authenticator: siprtc_sip_core::DigestAuthenticator,
    /// Call-ID reused across every REGISTER of this account
    pub reg_call_id: String,
    /// From tag reused across re-registrations
    pub from_tag: String,
    pub attempt_seq: u64,
    pub pending: Option<PendingRegistration>,
    pub refresh_handle: Option<JoinHandle<()>>,
    pub granted_expires: Option<u32>,
    pub registered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Registrar {
    pub(crate) fn new(state_tx: watch::Sender<RegistrationState>) -> Self {
        Registrar {
            state_tx,
            authenticator: siprtc_sip_core::DigestAuthenticator::new(),
            reg_call_id: uuid::Uuid::new_v4().to_string(),
            from_tag: siprtc_sip_core::generate_tag(),
            attempt_seq: 0,
            pending: None,
            refresh_handle: None,
            granted_expires: None,
            registered_at: None,
            last_error: None,
        }
    }

    pub(crate) fn state(&self) -> RegistrationState {
        *self.state_tx.borrow()
    }

    pub(crate) fn cancel_refresh(&mut self) {
        if let Some(handle) = self.refresh_handle.take() {
            handle.abort();
        }
    }
}

impl AccountTask {
    /// Move registration state, update the watch channel, notify observers.
    pub(crate) async fn set_registration_state(
        &mut self,
        state: RegistrationState,
        reason: Option<String>,
    ) {
        if self.registrar.state() == state {
            return;
        }
        if let Some(r) = &reason {
            self.registrar.last_error = Some(r.clone());
        }
        let _ = self.registrar.state_tx.send(state);
        self.env
            .events
            .emit_registration(RegistrationStatusInfo {
                account: self.key.clone(),
                state,
                reason,
                timestamp: Utc::now(),
            })
            .await;
    }

    /// Kick off a REGISTER attempt (initial, refresh, or unregister).
    ///
    /// Any previous in-flight attempt is abandoned; its caller gets a
    /// transport error rather than hanging.
    pub(crate) async fn start_registration(
        &mut self,
        unregister: bool,
        reply: Option<oneshot::Sender<ClientResult<()>>>,
    ) {
        if self.transport.as_ref().map(|t| t.is_open()) != Some(true) {
            if let Some(reply) = reply {
                let _ = reply.send(Err(ClientError::transport("signaling transport not open")));
            }
            // the reconnect path re-enters here through its onOpen hook
            self.schedule_reconnect().await;
            return;
        }

        if let Some(mut stale) = self.registrar.pending.take() {
            self.transactions.abandon(&stale.key);
            if let Some(reply) = stale.reply.take() {
                let _ = reply.send(Err(ClientError::transport(
                    "registration superseded by a newer attempt",
                )));
            }
        }
        self.registrar.cancel_refresh();

        let expires = if unregister {
            0
        } else {
            self.env.config.register_expires
        };
        let request = self.build_register(expires, None);
        let key = match self.transactions.start_client(&request) {
            Ok(key) => key,
            Err(e) => {
                warn!(account = %self.key, error = %e, "could not start REGISTER transaction");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(ClientError::protocol(e.to_string())));
                }
                return;
            }
        };

        self.registrar.attempt_seq += 1;
        let attempt = self.registrar.attempt_seq;
        self.registrar.pending = Some(PendingRegistration {
            key,
            attempt,
            auth_retried: false,
            challenged_realm: None,
            unregister,
            reply,
        });

        if let Err(e) = self.send_frame(&request.to_string()).await {
            warn!(account = %self.key, error = %e, "REGISTER send failed");
            self.fail_registration(e).await;
            return;
        }

        info!(account = %self.key, expires, "REGISTER sent");
        self.set_registration_state(RegistrationState::InProgress, None)
            .await;

        // Registration attempts carry their own deadline, tighter than
        // timer F.
        let deadline = self.env.config.register_timeout;
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = cmd_tx
                .send(AccountCommand::RegistrationDeadline { attempt })
                .await;
        });
    }

    /// Deadline for attempt `attempt` fired.
    pub(crate) async fn on_registration_deadline(&mut self, attempt: u64) {
        let Some(pending) = &self.registrar.pending else {
            return;
        };
        if pending.attempt != attempt {
            return;
        }
        let pending = self.registrar.pending.take().expect("checked above");
        self.transactions.abandon(&pending.key);
        let seconds = self.env.config.register_timeout.as_secs();
        warn!(account = %self.key, seconds, "registration timed out");
        if let Some(reply) = pending.reply {
            let _ = reply.send(Err(ClientError::OperationTimeout {
                operation: "registration",
                seconds,
            }));
        }
        self.set_registration_state(RegistrationState::Failed, Some("Timeout".into()))
            .await;
    }

    /// A final response arrived on the pending REGISTER transaction.
    pub(crate) async fn on_register_response(&mut self, event: TransactionEvent) {
        let response = match event {
            TransactionEvent::Final { response, .. } => response,
            TransactionEvent::Provisional { .. } => return,
            TransactionEvent::TimedOut { .. } => {
                self.fail_registration(ClientError::OperationTimeout {
                    operation: "registration",
                    seconds: siprtc_dialog_core::DEFAULT_TRANSACTION_TIMEOUT.as_secs(),
                })
                .await;
                return;
            }
        };

        if response.status.is_auth_challenge() {
            self.on_register_challenge(&response).await;
            return;
        }

        let Some(pending) = self.registrar.pending.take() else {
            debug!(account = %self.key, "REGISTER response without pending attempt");
            return;
        };

        if response.status.is_success() {
            self.on_register_accepted(pending, &response).await;
        } else {
            let reason = format!("{} {}", response.status.code(), response.reason);
            warn!(account = %self.key, status = %response.status, "registration rejected");
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(ClientError::RegistrationRejected {
                    code: response.status.code(),
                    reason: response.reason.clone(),
                }));
            }
            self.set_registration_state(RegistrationState::Failed, Some(reason))
                .await;
        }
    }

    async fn on_register_challenge(&mut self, response: &Response) {
        let Some(mut pending) = self.registrar.pending.take() else {
            return;
        };

        if pending.auth_retried {
            // One retry only; a second challenge is terminal even when the
            // realm changed.
            let realm_changed = response
                .header_value(&HeaderName::WwwAuthenticate)
                .or_else(|| response.header_value(&HeaderName::ProxyAuthenticate))
                .and_then(|v| DigestChallenge::parse(v).ok())
                .map(|c| Some(c.realm) != pending.challenged_realm)
                .unwrap_or(false);
            warn!(account = %self.key, realm_changed, "second auth challenge, giving up");
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(Err(ClientError::AuthenticationFailed {
                    reason: "challenge retry exhausted".into(),
                }));
            }
            self.set_registration_state(
                RegistrationState::Failed,
                Some("AuthenticationFailed".into()),
            )
            .await;
            return;
        }

        let proxy = response.status == StatusCode::ProxyAuthenticationRequired;
        let header = if proxy {
            HeaderName::ProxyAuthenticate
        } else {
            HeaderName::WwwAuthenticate
        };
        let challenge = response
            .header_value(&header)
            .ok_or_else(|| ClientError::protocol("challenge response without authenticate header"))
            .and_then(|v| {
                DigestChallenge::parse(v).map_err(|e| ClientError::AuthenticationFailed {
                    reason: e.to_string(),
                })
            });
        let challenge = match challenge {
            Ok(c) => c,
            Err(e) => {
                if let Some(reply) = pending.reply.take() {
                    let _ = reply.send(Err(e.clone()));
                }
                self.set_registration_state(RegistrationState::Failed, Some(e.to_string()))
                    .await;
                return;
            }
        };

        let register_uri = Uri::sip_host(self.key.domain()).to_string();
        let username = self.key.username().to_string();
        let password = self.credentials.password.clone();
        let authorization = match self.registrar.authenticator.respond(
            &challenge,
            &Method::Register,
            &register_uri,
            &username,
            &password,
        ) {
            Ok(a) => a,
            Err(e) => {
                let err = ClientError::AuthenticationFailed {
                    reason: e.to_string(),
                };
                if let Some(reply) = pending.reply.take() {
                    let _ = reply.send(Err(err.clone()));
                }
                self.set_registration_state(RegistrationState::Failed, Some(err.to_string()))
                    .await;
                return;
            }
        };

        // Same logical attempt: fresh branch, higher CSeq (RFC 3261 §22.2),
        // the deadline armed at start keeps running.
        let expires = if pending.unregister {
            0
        } else {
            self.env.config.register_expires
        };
        let request = self.build_register(expires, Some((proxy, authorization)));
        match self.transactions.start_client(&request) {
            Ok(key) => {
                pending.key = key;
                pending.auth_retried = true;
                pending.challenged_realm = Some(challenge.realm.clone());
                self.registrar.pending = Some(pending);
                if let Err(e) = self.send_frame(&request.to_string()).await {
                    self.fail_registration(e).await;
                } else {
                    debug!(account = %self.key, realm = %challenge.realm, "REGISTER retried with credentials");
                }
            }
            Err(e) => {
                if let Some(reply) = pending.reply.take() {
                    let _ = reply.send(Err(ClientError::protocol(e.to_string())));
                }
                self.set_registration_state(RegistrationState::Failed, Some(e.to_string()))
                    .await;
            }
        }
    }

    async fn on_register_accepted(&mut self, pending: PendingRegistration, response: &Response) {
        if pending.unregister {
            info!(account = %self.key, "unregistered");
            self.registrar.granted_expires = None;
            self.registrar.registered_at = None;
            if let Some(reply) = pending.reply {
                let _ = reply.send(Ok(()));
            }
            self.set_registration_state(RegistrationState::Cleared, None)
                .await;
            return;
        }

        // The binding is ours only if the registrar echoes our contact with
        // a positive expiry.
        let our_contact = self.contact();
        let granted = response
            .header_values(&HeaderName::Contact)
            .iter()
            .filter_map(|v| v.parse::<Contact>().ok())
            .find(|c| c.binding_matches(&our_contact))
            .and_then(|c| c.expires())
            .or_else(|| response.expires())
            .unwrap_or(self.env.config.register_expires);

        if granted == 0 {
            warn!(account = %self.key, "registrar granted zero expiry");
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(ClientError::RegistrationRejected {
                    code: response.status.code(),
                    reason: "zero expiry granted".into(),
                }));
            }
            self.set_registration_state(
                RegistrationState::Failed,
                Some("zero expiry granted".into()),
            )
            .await;
            return;
        }

        self.registrar.granted_expires = Some(granted);
        self.registrar.registered_at = Some(Utc::now());
        self.registrar.last_error = None;
        self.reconnect.attempts = 0;
        info!(account = %self.key, granted, "registered");

        if let Some(reply) = pending.reply {
            let _ = reply.send(Ok(()));
        }
        self.set_registration_state(RegistrationState::Ok, None).await;
        self.schedule_refresh(granted);

        // A mode switch that arrived while the transport was unhealthy is
        // applied now.
        if let Some(mode) = self.pending_mode.take() {
            if mode != self.mode {
                self.mode = mode;
                self.start_registration(false, None).await;
            }
        }
    }

    pub(crate) fn schedule_refresh(&mut self, granted: u32) {
        self.registrar.cancel_refresh();
        let delay = self.env.config.refresh_after(granted);
        let cmd_tx = self.cmd_tx.clone();
        debug!(account = %self.key, delay_s = delay.as_secs(), "registration refresh armed");
        self.registrar.refresh_handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(AccountCommand::RefreshRegistration).await;
        }));
    }

    /// The refresh timer fired, or a renewal tick decided a refresh is due.
    pub(crate) async fn on_refresh_due(&mut self) {
        match self.registrar.state() {
            RegistrationState::Ok => {
                if self.transport.as_ref().map(|t| t.is_open()) == Some(true) {
                    self.start_registration(false, None).await;
                } else {
                    self.schedule_reconnect().await;
                }
            }
            state => debug!(account = %self.key, %state, "refresh skipped"),
        }
    }

    /// Soft refresh hint from the transport adapter.
    pub(crate) async fn on_renewal_tick(&mut self) {
        if self.registrar.state() != RegistrationState::Ok {
            return;
        }
        let (Some(granted), Some(registered_at)) = (
            self.registrar.granted_expires,
            self.registrar.registered_at,
        ) else {
            return;
        };
        let elapsed = (Utc::now() - registered_at).num_seconds().max(0) as u64;
        let remaining = (granted as u64).saturating_sub(elapsed);
        if remaining <= 2 * self.env.config.register_safety_margin.as_secs() {
            debug!(account = %self.key, remaining, "renewal tick triggering refresh");
            self.start_registration(false, None).await;
        }
    }

    /// Foreground/background switch; re-registers with the new User-Agent
    /// when the transport is healthy, defers otherwise.
    pub(crate) async fn set_app_mode(&mut self, mode: AppMode) {
        if mode == self.mode {
            return;
        }
        let healthy = self.transport.as_ref().map(|t| t.is_open()) == Some(true)
            && self.registrar.state() == RegistrationState::Ok;
        if healthy {
            self.mode = mode;
            self.start_registration(false, None).await;
        } else {
            debug!(account = %self.key, ?mode, "mode switch deferred until reconnection");
            self.pending_mode = Some(mode);
        }
    }

    /// Drop the pending attempt with `error` and mark the account failed.
    pub(crate) async fn fail_registration(&mut self, error: ClientError) {
        if let Some(mut pending) = self.registrar.pending.take() {
            self.transactions.abandon(&pending.key);
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(Err(error.clone()));
            }
        }
        self.set_registration_state(RegistrationState::Failed, Some(error.to_string()))
            .await;
    }

    /// The transport went away: cancel in-flight work and drop to `None`
    /// pending reconnection.
    pub(crate) async fn registration_transport_lost(&mut self, reason: &str) {
        self.registrar.cancel_refresh();
        if let Some(mut pending) = self.registrar.pending.take() {
            self.transactions.abandon(&pending.key);
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(Err(ClientError::transport(reason.to_string())));
            }
        }
        if matches!(
            self.registrar.state(),
            RegistrationState::Ok | RegistrationState::Failed | RegistrationState::InProgress
        ) {
            self.set_registration_state(RegistrationState::None, Some(reason.to_string()))
                .await;
        }
    }

    /// Our registration Contact.
    pub(crate) fn contact(&self) -> Contact {
        let mut uri = Uri::sip(self.key.username(), self.contact_host.clone())
            .with_param("transport", "ws");
        // RFC 8599 push parameters, advertised whenever the platform
        // provided them.
        if let (Some(provider), Some(token)) = (
            self.credentials.push_provider.as_ref(),
            self.credentials.push_token.as_ref(),
        ) {
            uri = uri
                .with_param("pn-provider", provider.clone())
                .with_param("pn-prid", token.clone());
        }
        Contact::new(Address::new(uri))
    }

    fn build_register(
        &mut self,
        expires: u32,
        authorization: Option<(bool, String)>,
    ) -> siprtc_sip_core::Request {
        let branch = generate_branch();
        let user_agent = self.env.config.user_agent_for(self.mode);
        let contact = self.contact();
        let identity = Address::new(self.key.uri());
        let cseq = self.next_cseq();

        let mut builder =
            RequestBuilder::from_uri(Method::Register, Uri::sip_host(self.key.domain()))
                .via(&self.contact_host, "WS", &branch)
                .from(identity.clone().with_tag(self.registrar.from_tag.clone()))
                .to(identity)
                .call_id(self.registrar.reg_call_id.clone())
                .cseq(cseq)
                .contact(contact)
                .expires(expires)
                .user_agent(user_agent)
                .header(
                    HeaderName::Allow,
                    "INVITE, ACK, CANCEL, BYE, REFER, NOTIFY, INFO, OPTIONS",
                )
                .header(HeaderName::Supported, "path, outbound");
        if let Some((proxy, value)) = authorization {
            builder = builder.authorization(proxy, value);
        }
        builder.build()
    }
}
