//! Per-account signaling task.
//!
//! Exactly one task owns all mutation of an account's bundle: registration
//! state, the call slot, the dialog table and the transaction registry.
//! Inbound transport frames, API commands and timer ticks all arrive
//! through one bounded inbox, so handlers never race. Outbound sends are
//! serialized here before hitting the transport.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use siprtc_dialog_core::{
    DialogError, DialogId, DialogRequestTemplate, DialogStore, TransactionEvent,
    TransactionRegistry,
};
use siprtc_sip_core::{
    generate_branch, parse_message, HeaderAccess, HeaderName, Message, Method, Request,
    RequestBuilder, Response, ResponseBuilder, SdpSession, StatusCode,
};

use crate::account::{AccountKey, AppMode, Credentials, RegistrationState};
use crate::call::CallId;
use crate::calls::CallSession;
use crate::client::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::events::{EventDispatcher, TransportStatusInfo};
use crate::media::MediaEngine;
use crate::reconnect::ReconnectState;
use crate::registrar::Registrar;
use crate::storage::CallLogSink;
use crate::transport::{SignalingTransport, TransportEvent, TransportFactory};

/// Bounded inbox per account (inbound frames + commands).
const INBOX_CAPACITY: usize = 64;

/// Commands a signaling task accepts.
pub(crate) enum AccountCommand {
    Register {
        reply: oneshot::Sender<ClientResult<()>>,
    },
    Unregister {
        reply: oneshot::Sender<ClientResult<()>>,
    },
    Reconnect {
        generation: u64,
    },
    NetworkChanged(bool),
    SetMode(AppMode),
    MakeCall {
        to: String,
        reply: oneshot::Sender<ClientResult<CallId>>,
    },
    Accept {
        call_id: Option<CallId>,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    Decline {
        call_id: Option<CallId>,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    End {
        call_id: Option<CallId>,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    Hold {
        reply: oneshot::Sender<ClientResult<()>>,
    },
    Resume {
        reply: oneshot::Sender<ClientResult<()>>,
    },
    SetMuted {
        muted: bool,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    Dtmf {
        digits: String,
        duration_ms: u32,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    Transfer {
        to: String,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    Deflect {
        to: String,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    CallInfo {
        reply: oneshot::Sender<Option<crate::call::CallInfo>>,
    },
    Transport(TransportEvent),
    RefreshRegistration,
    RegistrationDeadline {
        attempt: u64,
    },
    CallGraceExpired {
        call_id: CallId,
    },
    Shutdown,
}

/// The capabilities an account task needs; no pointer back to the manager.
#[derive(Clone)]
pub(crate) struct AccountEnv {
    pub config: Arc<ClientConfig>,
    pub transport_factory: Arc<dyn TransportFactory>,
    pub media: Arc<dyn MediaEngine>,
    pub events: EventDispatcher,
    pub call_log: Arc<dyn CallLogSink>,
    pub reconnect_limiter: Arc<Semaphore>,
}

/// Handle the manager keeps per account.
pub(crate) struct AccountHandle {
    pub key: AccountKey,
    pub commands: mpsc::Sender<AccountCommand>,
    pub registration: watch::Receiver<RegistrationState>,
    pub join: JoinHandle<()>,
}

/// The signaling task's owned state.
pub(crate) struct AccountTask {
    pub(crate) key: AccountKey,
    pub(crate) credentials: Credentials,
    pub(crate) env: AccountEnv,
    pub(crate) cmd_rx: mpsc::Receiver<AccountCommand>,
    pub(crate) cmd_tx: mpsc::Sender<AccountCommand>,
    pub(crate) transport: Option<Arc<dyn SignalingTransport>>,
    pub(crate) transport_forwarder: Option<JoinHandle<()>>,
    /// Randomized host used in Via and Contact (RFC 7118 pattern)
    pub(crate) contact_host: String,
    pub(crate) mode: AppMode,
    pub(crate) pending_mode: Option<AppMode>,
    /// Account-level CSeq counter for out-of-dialog requests
    pub(crate) cseq: u32,
    pub(crate) registrar: Registrar,
    pub(crate) pending_register_reply: Option<oneshot::Sender<ClientResult<()>>>,
    pub(crate) dialogs: DialogStore,
    pub(crate) transactions: TransactionRegistry,
    pub(crate) txn_timeout_rx: mpsc::Receiver<TransactionEvent>,
    pub(crate) media_rx: broadcast::Receiver<crate::media::MediaEvent>,
    pub(crate) media_enabled: bool,
    pub(crate) call: Option<CallSession>,
    pub(crate) reconnect: ReconnectState,
    pub(crate) network_up: bool,
}

/// Create and start the signaling task for one account.
pub(crate) fn spawn_account_task(
    key: AccountKey,
    credentials: Credentials,
    env: AccountEnv,
) -> AccountHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(INBOX_CAPACITY);
    let (state_tx, state_rx) = watch::channel(RegistrationState::None);
    let (txn_tx, txn_timeout_rx) = mpsc::channel(32);
    let media_rx = env.media.subscribe();
    let contact_host = format!("{:08x}.invalid", rand::random::<u32>());

    let task = AccountTask {
        key: key.clone(),
        credentials,
        cmd_rx,
        cmd_tx: cmd_tx.clone(),
        transport: None,
        transport_forwarder: None,
        contact_host,
        mode: AppMode::Foreground,
        pending_mode: None,
        cseq: 0,
        registrar: Registrar::new(state_tx),
        pending_register_reply: None,
        dialogs: DialogStore::new(),
        transactions: TransactionRegistry::new(txn_tx),
        txn_timeout_rx,
        media_rx,
        media_enabled: true,
        call: None,
        reconnect: ReconnectState::new(),
        network_up: true,
        env,
    };
    let join = tokio::spawn(task.run());
    AccountHandle {
        key,
        commands: cmd_tx,
        registration: state_rx,
        join,
    }
}

impl AccountTask {
    pub(crate) async fn run(mut self) {
        info!(account = %self.key, "signaling task started");
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(AccountCommand::Shutdown) => {
                        self.shutdown().await;
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(event) = self.txn_timeout_rx.recv() => {
                    self.route_transaction_event(event).await;
                }
                event = self.media_rx.recv(), if self.media_enabled => match event {
                    Ok(event) => self.handle_media_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(account = %self.key, skipped, "media events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.media_enabled = false;
                    }
                },
            }
        }
        info!(account = %self.key, "signaling task stopped");
    }

    async fn handle_command(&mut self, cmd: AccountCommand) {
        match cmd {
            AccountCommand::Register { reply } => self.handle_register_command(reply).await,
            AccountCommand::Unregister { reply } => self.handle_unregister_command(reply).await,
            AccountCommand::Reconnect { generation } => self.do_reconnect(generation).await,
            AccountCommand::NetworkChanged(up) => self.handle_network_changed(up).await,
            AccountCommand::SetMode(mode) => self.set_app_mode(mode).await,
            AccountCommand::MakeCall { to, reply } => {
                let _ = reply.send(self.make_call(&to).await);
            }
            AccountCommand::Accept { call_id, reply } => {
                let _ = reply.send(self.accept_call(call_id).await);
            }
            AccountCommand::Decline { call_id, reply } => {
                let _ = reply.send(self.decline_call(call_id).await);
            }
            AccountCommand::End { call_id, reply } => {
                let _ = reply.send(self.end_call(call_id).await);
            }
            AccountCommand::Hold { reply } => {
                let _ = reply.send(self.hold_call().await);
            }
            AccountCommand::Resume { reply } => {
                let _ = reply.send(self.resume_call().await);
            }
            AccountCommand::SetMuted { muted, reply } => {
                let _ = reply.send(self.set_muted(muted).await);
            }
            AccountCommand::Dtmf {
                digits,
                duration_ms,
                reply,
            } => {
                let _ = reply.send(self.send_dtmf(&digits, duration_ms).await);
            }
            AccountCommand::Transfer { to, reply } => {
                let _ = reply.send(self.transfer_call(&to).await);
            }
            AccountCommand::Deflect { to, reply } => {
                let _ = reply.send(self.deflect_call(&to, None).await);
            }
            AccountCommand::CallInfo { reply } => {
                let _ = reply.send(self.call.as_ref().map(|c| c.info(self.key.clone())));
            }
            AccountCommand::Transport(event) => self.handle_transport_event(event).await,
            AccountCommand::RefreshRegistration => self.on_refresh_due().await,
            AccountCommand::RegistrationDeadline { attempt } => {
                self.on_registration_deadline(attempt).await;
            }
            AccountCommand::CallGraceExpired { call_id } => {
                self.on_call_grace_expired(call_id).await;
            }
            AccountCommand::Shutdown => unreachable!("handled in run"),
        }
    }

    // --- lifecycle commands ---

    async fn handle_register_command(&mut self, reply: oneshot::Sender<ClientResult<()>>) {
        if self.transport.as_ref().map(|t| t.is_open()) == Some(true) {
            self.start_registration(false, Some(reply)).await;
            return;
        }
        // Registration starts from the transport's onOpen hook.
        self.pending_register_reply = Some(reply);
        if let Err(e) = self.connect_transport().await {
            warn!(account = %self.key, error = %e, "transport connect failed");
            if let Some(reply) = self.pending_register_reply.take() {
                let _ = reply.send(Err(e.clone()));
            }
            self.set_registration_state(RegistrationState::Failed, Some(e.to_string()))
                .await;
            self.schedule_reconnect().await;
        }
    }

    async fn handle_unregister_command(&mut self, reply: oneshot::Sender<ClientResult<()>>) {
        // The account releases its call before it goes away.
        self.reset_call_to_idle().await;
        let transport_open = self.transport.as_ref().map(|t| t.is_open()) == Some(true);
        if transport_open && self.registrar.state() == RegistrationState::Ok {
            self.start_registration(true, Some(reply)).await;
        } else {
            self.registrar.cancel_refresh();
            self.set_registration_state(RegistrationState::Cleared, None)
                .await;
            let _ = reply.send(Ok(()));
        }
    }

    async fn shutdown(&mut self) {
        debug!(account = %self.key, "shutting down");
        self.reset_call_to_idle().await;
        self.registrar.cancel_refresh();
        if let Some(handle) = self.transport_forwarder.take() {
            handle.abort();
        }
        if let Some(transport) = self.transport.take() {
            let _ = transport.close(1000, "shutdown").await;
        }
    }

    // --- transport ---

    /// Tear down any existing session and dial a new one.
    pub(crate) async fn connect_transport(&mut self) -> ClientResult<()> {
        if let Some(handle) = self.transport_forwarder.take() {
            handle.abort();
        }
        if let Some(old) = self.transport.take() {
            let _ = old.close(1000, "superseded").await;
        }

        let (event_tx, mut event_rx) = mpsc::channel::<TransportEvent>(INBOX_CAPACITY);
        let transport = self
            .env
            .transport_factory
            .connect(&self.key, event_tx)
            .await?;
        let cmd_tx = self.cmd_tx.clone();
        self.transport_forwarder = Some(tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if cmd_tx.send(AccountCommand::Transport(event)).await.is_err() {
                    break;
                }
            }
        }));
        self.transport = Some(transport);
        Ok(())
    }

    pub(crate) async fn send_frame(&self, frame: &str) -> ClientResult<()> {
        match &self.transport {
            Some(transport) if transport.is_open() => {
                trace!(account = %self.key, bytes = frame.len(), "frame sent");
                transport.send(frame).await
            }
            _ => Err(ClientError::transport("signaling transport not open")),
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                info!(account = %self.key, "transport open");
                self.env
                    .events
                    .emit_transport(TransportStatusInfo::Connected {
                        account: self.key.clone(),
                    })
                    .await;
                self.call_transport_restored();
                // onOpen hook: the registrar drives REGISTER.
                let reply = self.pending_register_reply.take();
                if self.registrar.state() != RegistrationState::Cleared || reply.is_some() {
                    self.start_registration(false, reply).await;
                }
            }
            TransportEvent::Frame(frame) => self.handle_frame(&frame).await,
            TransportEvent::Closed { code, reason } => {
                info!(account = %self.key, code, reason = %reason, "transport closed");
                self.env
                    .events
                    .emit_transport(TransportStatusInfo::Disconnected {
                        account: self.key.clone(),
                        code: Some(code),
                        reason: reason.clone(),
                    })
                    .await;
                self.registration_transport_lost(&reason).await;
                self.call_transport_lost().await;
                if code != 1000 {
                    self.schedule_reconnect().await;
                }
            }
            TransportEvent::Error { reason } => {
                warn!(account = %self.key, reason = %reason, "transport error");
                self.env
                    .events
                    .emit_transport(TransportStatusInfo::Disconnected {
                        account: self.key.clone(),
                        code: None,
                        reason: reason.clone(),
                    })
                    .await;
                self.registration_transport_lost(&reason).await;
                self.call_transport_lost().await;
                self.schedule_reconnect().await;
            }
            TransportEvent::Pong => trace!(account = %self.key, "pong"),
            TransportEvent::RenewalTick => self.on_renewal_tick().await,
        }
    }

    async fn handle_network_changed(&mut self, up: bool) {
        if self.network_up == up {
            return;
        }
        self.network_up = up;
        if up {
            self.on_network_restored().await;
        } else {
            self.on_network_lost().await;
        }
    }

    // --- inbound frames ---

    async fn handle_frame(&mut self, frame: &str) {
        let message = match parse_message(frame) {
            Ok(message) => message,
            Err(e) => {
                // Contained: the frame is dropped, the connection stays.
                warn!(account = %self.key, error = %e, "dropping malformed frame");
                return;
            }
        };
        match message {
            Message::Response(response) => self.handle_response(response).await,
            Message::Request(request) => self.handle_request(request).await,
        }
    }

    async fn handle_response(&mut self, response: Response) {
        match self.transactions.on_response(&response) {
            Ok(event) => self.route_transaction_event(event).await,
            Err(DialogError::UnknownBranch { branch }) => {
                debug!(account = %self.key, branch = %branch, "response with unknown branch dropped");
            }
            Err(e) => {
                warn!(account = %self.key, error = %e, "response dropped");
            }
        }
    }

    /// Transaction events from correlation and from the timeout channel.
    pub(crate) async fn route_transaction_event(&mut self, event: TransactionEvent) {
        let key = match &event {
            TransactionEvent::Provisional { key, .. }
            | TransactionEvent::Final { key, .. }
            | TransactionEvent::TimedOut { key, .. } => key.clone(),
        };
        if self
            .registrar
            .pending
            .as_ref()
            .map(|p| p.key == key)
            .unwrap_or(false)
        {
            self.on_register_response(event).await;
            return;
        }
        if self
            .call
            .as_ref()
            .map(|c| {
                c.invite_key.as_ref() == Some(&key)
                    || c.bye_key.as_ref() == Some(&key)
                    || c.refer_key.as_ref() == Some(&key)
                    || c.reinvite.as_ref().map(|(k, _)| k) == Some(&key)
            })
            .unwrap_or(false)
        {
            self.route_call_transaction_event(event).await;
            return;
        }
        debug!(account = %self.key, key = %key, "transaction event without owner");
    }

    async fn handle_request(&mut self, request: Request) {
        trace!(account = %self.key, method = %request.method, "request received");
        match request.method.clone() {
            Method::Invite => self.dispatch_invite(request).await,
            Method::Ack => {
                if let Some(branch) = request.via().ok().and_then(|v| v.branch().map(str::to_string))
                {
                    self.transactions.on_ack(&branch);
                }
            }
            Method::Cancel => self.handle_incoming_cancel(&request).await,
            Method::Options => {
                let reply = ResponseBuilder::reply(StatusCode::Ok, &request)
                    .header(
                        HeaderName::Allow,
                        "INVITE, ACK, CANCEL, BYE, REFER, NOTIFY, INFO, OPTIONS",
                    )
                    .build();
                let _ = self.send_frame(&reply.to_string()).await;
            }
            Method::Bye | Method::Notify | Method::Info | Method::Refer | Method::Update => {
                self.handle_in_dialog_request(request).await;
            }
            other => {
                debug!(account = %self.key, method = %other, "method not supported");
                let reply = ResponseBuilder::reply(StatusCode::Other(501), &request)
                    .reason("Not Implemented")
                    .build();
                let _ = self.send_frame(&reply.to_string()).await;
            }
        }
    }

    async fn dispatch_invite(&mut self, request: Request) {
        let to_tag = request
            .to()
            .ok()
            .and_then(|t| t.tag().map(str::to_string));
        match to_tag {
            Some(to_tag) => {
                // In-dialog re-INVITE.
                let call_id = request.call_id().unwrap_or_default().to_string();
                let from_tag = request.from().ok().and_then(|f| f.tag().map(str::to_string));
                match self.dialogs.find(&call_id, &to_tag, from_tag.as_deref()) {
                    Some(dialog_id) => self.handle_reinvite(dialog_id, request).await,
                    None => {
                        let reply = ResponseBuilder::reply(
                            StatusCode::CallOrTransactionDoesNotExist,
                            &request,
                        )
                        .build();
                        let _ = self.send_frame(&reply.to_string()).await;
                    }
                }
            }
            None => self.handle_incoming_invite(request).await,
        }
    }

    async fn handle_reinvite(&mut self, dialog_id: DialogId, request: Request) {
        let sequence = self
            .dialogs
            .with_mut(&dialog_id, |d| d.validate_remote_sequence(&request))
            .unwrap_or(Ok(()));
        if let Err(DialogError::OutOfOrderCSeq { got, last }) = sequence {
            warn!(account = %self.key, got, last, "out-of-order re-INVITE dropped");
            let reply = ResponseBuilder::reply(StatusCode::ServerInternalError, &request)
                .retry_after(0)
                .build();
            let _ = self.send_frame(&reply.to_string()).await;
            return;
        }

        // An offerless re-INVITE asks us to repeat our current description.
        let answer = if request.body.is_empty() {
            self.call.as_ref().and_then(|c| c.local_sdp.clone())
        } else {
            self.env.media.create_answer(&request.body).await.ok()
        };
        let Some(answer) = answer else {
            warn!(account = %self.key, "re-INVITE answer failed");
            let reply = ResponseBuilder::reply(StatusCode::Other(488), &request)
                .reason("Not Acceptable Here")
                .build();
            let _ = self.send_frame(&reply.to_string()).await;
            return;
        };

        self.dialogs
            .with_mut(&dialog_id, |d| d.update_remote_target(&request));
        if let Ok(sdp) = SdpSession::parse(&request.body) {
            if sdp.audio_direction().is_paused() {
                debug!(account = %self.key, "peer placed the call on hold");
            }
        }

        let reply = ResponseBuilder::reply(StatusCode::Ok, &request)
            .contact(self.contact())
            .body("application/sdp", answer)
            .build();
        match self.transactions.start_server(&request) {
            Ok(key) => {
                let _ = self.send_frame(&reply.to_string()).await;
                self.transactions.on_server_final_sent(&key);
            }
            Err(_) => {
                let _ = self.send_frame(&reply.to_string()).await;
            }
        }
    }

    async fn handle_in_dialog_request(&mut self, request: Request) {
        let call_id = request.call_id().unwrap_or_default().to_string();
        let to_tag = request.to().ok().and_then(|t| t.tag().map(str::to_string));
        let from_tag = request.from().ok().and_then(|f| f.tag().map(str::to_string));

        let dialog_id = to_tag.as_deref().and_then(|to_tag| {
            self.dialogs.find(&call_id, to_tag, from_tag.as_deref())
        });
        let Some(dialog_id) = dialog_id else {
            let reply =
                ResponseBuilder::reply(StatusCode::CallOrTransactionDoesNotExist, &request).build();
            let _ = self.send_frame(&reply.to_string()).await;
            return;
        };

        // Remote CSeq must move strictly forward.
        let sequence = self
            .dialogs
            .with_mut(&dialog_id, |d| d.validate_remote_sequence(&request))
            .unwrap_or(Ok(()));
        if let Err(DialogError::OutOfOrderCSeq { got, last }) = sequence {
            warn!(account = %self.key, got, last, method = %request.method, "out-of-order request dropped");
            let reply = ResponseBuilder::reply(StatusCode::ServerInternalError, &request)
                .retry_after(0)
                .build();
            let _ = self.send_frame(&reply.to_string()).await;
            return;
        }

        match request.method {
            Method::Bye => {
                self.dialogs.with_mut(&dialog_id, |d| d.terminate());
                self.handle_incoming_bye(&request).await;
            }
            Method::Notify => {
                let is_refer = request
                    .header_value(&HeaderName::Event)
                    .map(|e| e.trim().to_ascii_lowercase().starts_with("refer"))
                    .unwrap_or(false);
                if is_refer {
                    self.handle_refer_notify(&request).await;
                } else {
                    let reply = ResponseBuilder::reply(StatusCode::Ok, &request).build();
                    let _ = self.send_frame(&reply.to_string()).await;
                }
            }
            Method::Refer => {
                // We act as transferor only; incoming transfer is refused.
                let reply = ResponseBuilder::reply(StatusCode::Other(501), &request)
                    .reason("Not Implemented")
                    .build();
                let _ = self.send_frame(&reply.to_string()).await;
            }
            _ => {
                let reply = ResponseBuilder::reply(StatusCode::Ok, &request).build();
                let _ = self.send_frame(&reply.to_string()).await;
            }
        }
    }

    // --- helpers shared with registrar/calls ---

    /// Next value of the account-level CSeq counter.
    pub(crate) fn next_cseq(&mut self) -> u32 {
        self.cseq += 1;
        self.cseq
    }

    /// Builder pre-filled from an in-dialog request template.
    pub(crate) fn in_dialog_builder(&self, template: DialogRequestTemplate) -> RequestBuilder {
        let method = template.method.clone();
        let mut builder = RequestBuilder::from_uri(method.clone(), template.target)
            .via(&self.contact_host, "WS", &generate_branch());
        for route in &template.route_set {
            builder = builder.route(route);
        }
        builder
            .from(template.local)
            .to(template.remote)
            .call_id(template.call_id)
            .cseq_with_method(template.cseq, method)
            .user_agent(self.env.config.user_agent_for(self.mode))
    }
}
