//! Per-call lifecycle: the state machine, its media-engine interlocks, and
//! the in-dialog operations (hold, resume, DTMF, transfer, deflection).
//!
//! All entry points run on the account's signaling task; the call slot has
//! a single writer. The hard ordering rules live here:
//!
//! - a 2xx to INVITE is never sent before local SDP exists;
//! - teardown is BYE, then a 500 ms grace, then media dispose, then the
//!   one and only `Ended` record;
//! - DTMF is dispatched only in `Connected`/`StreamsRunning`;
//! - hold/resume re-INVITEs are serialized and spaced by a settle delay.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use siprtc_dialog_core::{DialogId, TransactionEvent, TransactionKey};
use siprtc_sip_core::{
    generate_branch, generate_tag, Address, HeaderAccess, HeaderName, Method, Request,
    RequestBuilder, ResponseBuilder, StatusCode, Uri,
};

use crate::call::{CallDirection, CallId, CallInfo, CallLogClass, CallState, CallStateRecord};
use crate::error::{ClientError, ClientResult};
use crate::events::{CallAction, IncomingCallInfo};
use crate::media::MediaEvent;
use crate::signaling::{AccountCommand, AccountTask};
use crate::storage::CallLogEntry;

/// Wait after sending BYE before disposing media.
pub(crate) const TERMINATE_GRACE: Duration = Duration::from_millis(500);
/// Minimum spacing between hold/resume renegotiations.
pub(crate) const HOLD_SETTLE: Duration = Duration::from_secs(1);
/// Gap between digits when falling back to INFO DTMF.
pub(crate) const DTMF_INTER_DIGIT_GAP: Duration = Duration::from_millis(150);
/// Default DTMF tone duration.
pub(crate) const DEFAULT_DTMF_DURATION_MS: u32 = 160;
/// How long a confirmed call survives a transport drop.
pub(crate) const CONFIRMED_CALL_TRANSPORT_GRACE: Duration = Duration::from_secs(30);

/// What an in-flight re-INVITE is trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReinviteKind {
    Hold,
    Resume,
}

/// The account's single call slot.
pub(crate) struct CallSession {
    pub id: CallId,
    pub sip_call_id: String,
    pub direction: CallDirection,
    pub state: CallState,
    pub local_uri: Uri,
    pub remote_uri: Uri,
    pub remote_display_name: Option<String>,
    pub local_tag: String,
    pub dialog: Option<DialogId>,
    /// Client transaction of our initial INVITE
    pub invite_key: Option<TransactionKey>,
    /// Our sent INVITE, kept for CANCEL and the auth retry
    pub invite_request: Option<Request>,
    /// Client transaction of an in-flight re-INVITE
    pub reinvite: Option<(TransactionKey, ReinviteKind)>,
    /// Client transaction of our BYE
    pub bye_key: Option<TransactionKey>,
    /// Client transaction of our REFER
    pub refer_key: Option<TransactionKey>,
    /// Server transaction + request of a pending incoming INVITE
    pub server_invite: Option<(TransactionKey, Request)>,
    pub local_sdp: Option<String>,
    pub remote_sdp: Option<String>,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub on_hold: bool,
    pub last_hold_change: Option<Instant>,
    pub transfer_in_progress: bool,
    pub invite_auth_retried: bool,
    pub transport_grace_armed: bool,
    pub ended_emitted: bool,
}

impl CallSession {
    fn new(
        direction: CallDirection,
        sip_call_id: String,
        local_uri: Uri,
        remote_uri: Uri,
        local_tag: String,
    ) -> Self {
        CallSession {
            id: Uuid::new_v4(),
            sip_call_id,
            direction,
            state: CallState::Idle,
            local_uri,
            remote_uri,
            remote_display_name: None,
            local_tag,
            dialog: None,
            invite_key: None,
            invite_request: None,
            reinvite: None,
            bye_key: None,
            refer_key: None,
            server_invite: None,
            local_sdp: None,
            remote_sdp: None,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            on_hold: false,
            last_hold_change: None,
            transfer_in_progress: false,
            invite_auth_retried: false,
            transport_grace_armed: false,
            ended_emitted: false,
        }
    }

    /// Snapshot for the embedding application.
    pub(crate) fn info(&self, account: crate::account::AccountKey) -> CallInfo {
        CallInfo {
            call_id: self.id,
            sip_call_id: self.sip_call_id.clone(),
            state: self.state,
            direction: self.direction,
            account,
            local_uri: self.local_uri.to_string(),
            remote_uri: self.remote_uri.to_string(),
            remote_display_name: self.remote_display_name.clone(),
            created_at: self.created_at,
            connected_at: self.connected_at,
            ended_at: self.ended_at,
            on_hold: self.on_hold,
        }
    }

    fn owns_transaction(&self, key: &TransactionKey) -> bool {
        self.invite_key.as_ref() == Some(key)
            || self.bye_key.as_ref() == Some(key)
            || self.refer_key.as_ref() == Some(key)
            || self.reinvite.as_ref().map(|(k, _)| k) == Some(key)
    }
}

impl AccountTask {
    /// Validate the call-id argument of a public operation.
    pub(crate) fn check_call(&self, call_id: Option<CallId>) -> ClientResult<()> {
        match (&self.call, call_id) {
            (None, _) => Err(ClientError::NoActiveCall),
            (Some(call), Some(id)) if call.id != id => Err(ClientError::CallNotFound { call_id: id }),
            _ => Ok(()),
        }
    }

    /// Apply one state transition and emit its record.
    ///
    /// Returns false when the graph forbids the edge or the call already
    /// emitted its terminal record (duplicate terminations are idempotent).
    pub(crate) async fn transition_call(
        &mut self,
        next: CallState,
        sip: Option<(u16, String)>,
        error_reason: Option<String>,
    ) -> bool {
        let record = {
            let Some(call) = self.call.as_mut() else {
                return false;
            };
            if next == CallState::Ended && call.ended_emitted {
                return false;
            }
            if !call.state.can_transition_to(next) {
                warn!(call_id = %call.id, from = %call.state, to = %next, "transition rejected");
                return false;
            }
            call.state = next;
            match next {
                CallState::Connected => call.connected_at = Some(Utc::now()),
                CallState::Ended => {
                    call.ended_emitted = true;
                    call.ended_at = Some(Utc::now());
                }
                CallState::Error => call.ended_at = Some(Utc::now()),
                _ => {}
            }
            CallStateRecord {
                call_id: call.id,
                account: self.key.clone(),
                state: next,
                timestamp: Utc::now(),
                error_reason,
                sip_code: sip.as_ref().map(|(code, _)| *code),
                sip_reason: sip.map(|(_, reason)| reason),
            }
        };
        self.env.events.emit_call_state(record).await;
        true
    }

    /// Release everything a finished call holds and write the log row.
    async fn finalize_call(&mut self, classification: CallLogClass) {
        let Some(call) = self.call.take() else {
            return;
        };
        if let Some(dialog) = call.dialog {
            self.dialogs.remove(&dialog);
        }
        for key in [
            call.invite_key.as_ref(),
            call.bye_key.as_ref(),
            call.refer_key.as_ref(),
            call.reinvite.as_ref().map(|(k, _)| k),
            call.server_invite.as_ref().map(|(k, _)| k),
        ]
        .into_iter()
        .flatten()
        {
            self.transactions.abandon(key);
        }

        let entry = CallLogEntry {
            call_id: call.id,
            account: self.key.clone(),
            direction: call.direction,
            peer: call.remote_uri.to_string(),
            start: call.created_at,
            end: call.ended_at.unwrap_or_else(Utc::now),
            classification,
        };
        if let Err(e) = self.env.call_log.append(entry).await {
            warn!(call_id = %call.id, error = %e, "call log append failed");
        }

        // Last call gone: the media engine is released (idempotent if the
        // teardown path already disposed it).
        if let Err(e) = self.env.media.dispose().await {
            debug!(error = %e, "media dispose reported failure");
        }
        info!(call_id = %call.id, ?classification, "call finished");
    }

    /// Orderly completion: `Ending` then `Ended`, then cleanup.
    async fn conclude_call(&mut self, classification: CallLogClass) {
        if let Some(call) = &self.call {
            if !call.state.is_terminal() && call.state != CallState::Ending {
                self.transition_call(CallState::Ending, None, None).await;
            }
        }
        self.transition_call(CallState::Ended, None, None).await;
        self.finalize_call(classification).await;
    }

    /// Failure completion: single `Error` record, then cleanup.
    pub(crate) async fn fail_call(
        &mut self,
        reason: impl Into<String>,
        sip: Option<(u16, String)>,
        classification: CallLogClass,
    ) {
        self.transition_call(CallState::Error, sip, Some(reason.into()))
            .await;
        self.finalize_call(classification).await;
    }

    fn resolve_target(&self, to: &str) -> ClientResult<Uri> {
        let to = to.trim();
        if to.is_empty() {
            return Err(ClientError::protocol("empty call target"));
        }
        if to.starts_with("sip:") || to.starts_with("sips:") {
            return to
                .parse()
                .map_err(|e: siprtc_sip_core::Error| ClientError::protocol(e.to_string()));
        }
        match to.split_once('@') {
            Some((user, domain)) => Ok(Uri::sip(user, domain)),
            None => Ok(Uri::sip(to, self.key.domain())),
        }
    }

    // --- outgoing ---

    /// Start an outgoing call; S1's `OutgoingInit` is emitted before this
    /// returns.
    pub(crate) async fn make_call(&mut self, to: &str) -> ClientResult<CallId> {
        if !self.registrar.state().is_registered() {
            return Err(ClientError::AccountNotRegistered {
                key: self.key.to_string(),
            });
        }
        if let Some(call) = &self.call {
            if call.state.is_active() {
                return Err(ClientError::CallAlreadyActive { call_id: call.id });
            }
        }
        let target = self.resolve_target(to)?;

        // The 2xx/offer interlock: no INVITE without local SDP.
        self.env.media.initialize().await?;
        let offer = self.env.media.create_offer().await?;

        let local_tag = generate_tag();
        let sip_call_id = Uuid::new_v4().to_string();
        let cseq = self.next_cseq();
        let request = RequestBuilder::from_uri(Method::Invite, target.clone())
            .via(&self.contact_host, "WS", &generate_branch())
            .from(Address::new(self.key.uri()).with_tag(local_tag.clone()))
            .to(Address::new(target.clone()))
            .call_id(sip_call_id.clone())
            .cseq(cseq)
            .contact(self.contact())
            .user_agent(self.env.config.user_agent_for(self.mode))
            .header(
                HeaderName::Allow,
                "INVITE, ACK, CANCEL, BYE, REFER, NOTIFY, INFO, OPTIONS",
            )
            .body("application/sdp", offer.clone())
            .build();

        let key = self
            .transactions
            .start_client(&request)
            .map_err(|e| ClientError::protocol(e.to_string()))?;
        if let Err(e) = self.send_frame(&request.to_string()).await {
            self.transactions.abandon(&key);
            let _ = self.env.media.dispose().await;
            return Err(e);
        }

        let mut call = CallSession::new(
            CallDirection::Outgoing,
            sip_call_id,
            self.key.uri(),
            target,
            local_tag,
        );
        call.invite_key = Some(key);
        call.invite_request = Some(request);
        call.local_sdp = Some(offer);
        let id = call.id;
        self.call = Some(call);
        self.transition_call(CallState::OutgoingInit, None, None).await;
        Ok(id)
    }

    async fn retry_invite_with_auth(&mut self, response: &siprtc_sip_core::Response) -> bool {
        let Some(call) = self.call.as_mut() else {
            return false;
        };
        if call.invite_auth_retried {
            return false;
        }
        let Some(original) = call.invite_request.clone() else {
            return false;
        };
        let proxy = response.status == StatusCode::ProxyAuthenticationRequired;
        let header = if proxy {
            HeaderName::ProxyAuthenticate
        } else {
            HeaderName::WwwAuthenticate
        };
        let Some(challenge) = response
            .header_value(&header)
            .and_then(|v| siprtc_sip_core::DigestChallenge::parse(v).ok())
        else {
            return false;
        };
        let uri = original.uri.to_string();
        let username = self.key.username().to_string();
        let password = self.credentials.password.clone();
        let Ok(authorization) = self.registrar.authenticator.respond(
            &challenge,
            &Method::Invite,
            &uri,
            &username,
            &password,
        ) else {
            return false;
        };

        // Same call, fresh branch and CSeq, credentials attached.
        let cseq = self.next_cseq();
        let call = self.call.as_mut().expect("checked above");
        let mut request = original;
        request.set_header(HeaderName::Via, {
            siprtc_sip_core::Via::new(self.contact_host.clone(), "WS", generate_branch()).to_string()
        });
        request.set_header(
            HeaderName::CSeq,
            siprtc_sip_core::CSeq::new(cseq, Method::Invite).to_string(),
        );
        let name = if proxy {
            HeaderName::ProxyAuthorization
        } else {
            HeaderName::Authorization
        };
        request.set_header(name, authorization);

        match self.transactions.start_client(&request) {
            Ok(key) => {
                call.invite_key = Some(key);
                call.invite_request = Some(request.clone());
                call.invite_auth_retried = true;
                if self.send_frame(&request.to_string()).await.is_ok() {
                    debug!(account = %self.key, "INVITE retried with credentials");
                    return true;
                }
                false
            }
            Err(_) => false,
        }
    }

    async fn on_invite_provisional(&mut self, response: &siprtc_sip_core::Response) {
        let code = response.status.code();
        if code == 100 {
            self.transition_call(CallState::OutgoingProgress, Some((100, response.reason.clone())), None)
                .await;
            return;
        }

        // 180/183: early dialog when the To tag is there.
        if let Some(call) = &self.call {
            if call.dialog.is_none() {
                if let Some(invite) = &call.invite_request {
                    if let Some(dialog) =
                        siprtc_dialog_core::Dialog::from_uac_response(invite, response)
                    {
                        let id = self.dialogs.insert(dialog);
                        if let Some(call) = self.call.as_mut() {
                            call.dialog = Some(id);
                        }
                    }
                }
            }
        }
        self.transition_call(
            CallState::OutgoingRinging,
            Some((code, response.reason.clone())),
            None,
        )
        .await;
    }

    async fn on_invite_accepted(&mut self, request: &Request, response: &siprtc_sip_core::Response) {
        // Dialog: confirm the early one or create from the 2xx.
        let dialog_id = {
            let existing = self.call.as_ref().and_then(|c| c.dialog);
            match existing {
                Some(id) => {
                    self.dialogs.with_mut(&id, |d| d.update_from_2xx(response));
                    Some(id)
                }
                None => siprtc_dialog_core::Dialog::from_uac_response(request, response)
                    .map(|d| self.dialogs.insert(d)),
            }
        };
        let Some(dialog_id) = dialog_id else {
            self.fail_call(
                "2xx did not establish a dialog",
                Some((response.status.code(), response.reason.clone())),
                CallLogClass::Aborted,
            )
            .await;
            return;
        };
        if let Some(call) = self.call.as_mut() {
            call.dialog = Some(dialog_id);
            call.remote_sdp = Some(response.body.clone());
        }

        // ACK before anything can fail; the dialog is established either way.
        self.send_ack(dialog_id).await;

        if !response.body.is_empty() {
            if let Err(e) = self.env.media.set_remote_description(&response.body).await {
                self.send_bye_and_conclude(CallLogClass::Aborted, Some(e.to_string()))
                    .await;
                return;
            }
        }

        // User hung up while the 2xx was in flight: close the new dialog.
        if self.call.as_ref().map(|c| c.state) == Some(CallState::Ending) {
            self.send_bye_and_conclude(CallLogClass::Aborted, None).await;
            return;
        }

        self.transition_call(
            CallState::Connected,
            Some((response.status.code(), response.reason.clone())),
            None,
        )
        .await;
    }

    async fn send_ack(&mut self, dialog_id: DialogId) {
        let template = self
            .dialogs
            .with_mut(&dialog_id, |d| d.create_request(Method::Ack));
        if let Some(template) = template {
            let request = self.in_dialog_builder(template).build();
            if let Err(e) = self.send_frame(&request.to_string()).await {
                warn!(account = %self.key, error = %e, "ACK send failed");
            }
        }
    }

    async fn send_bye_and_conclude(
        &mut self,
        classification: CallLogClass,
        media_error: Option<String>,
    ) {
        if let Some(dialog_id) = self.call.as_ref().and_then(|c| c.dialog) {
            let template = self
                .dialogs
                .with_mut(&dialog_id, |d| d.create_request(Method::Bye));
            if let Some(template) = template {
                let request = self.in_dialog_builder(template).build();
                if let Ok(key) = self.transactions.start_client(&request) {
                    if let Some(call) = self.call.as_mut() {
                        call.bye_key = Some(key);
                    }
                }
                let _ = self.send_frame(&request.to_string()).await;
            }
        }
        if let Some(reason) = media_error {
            self.fail_call(reason, None, classification).await;
        } else {
            if let Some(call) = &self.call {
                if !call.state.is_terminal() && call.state != CallState::Ending {
                    self.transition_call(CallState::Ending, None, None).await;
                }
            }
            tokio::time::sleep(TERMINATE_GRACE).await;
            let _ = self.env.media.dispose().await;
            self.conclude_call(classification).await;
        }
    }

    // --- incoming ---

    pub(crate) async fn handle_incoming_invite(&mut self, request: Request) {
        // One active call per account: a second INVITE gets 486.
        if self.call.as_ref().map(|c| c.state.is_active()).unwrap_or(false) {
            info!(account = %self.key, "busy: rejecting second incoming INVITE");
            let busy = ResponseBuilder::reply(StatusCode::BusyHere, &request)
                .to_tag(&generate_tag())
                .build();
            if let Ok(key) = self.transactions.start_server(&request) {
                let _ = self.send_frame(&busy.to_string()).await;
                self.transactions.on_server_final_sent(&key);
            }
            return;
        }

        let server_key = match self.transactions.start_server(&request) {
            Ok(key) => key,
            Err(e) => {
                debug!(account = %self.key, error = %e, "dropping INVITE retransmit");
                return;
            }
        };

        let local_tag = generate_tag();
        let dialog = match siprtc_dialog_core::Dialog::from_uas_request(&request, &local_tag) {
            Ok(d) => d,
            Err(e) => {
                warn!(account = %self.key, error = %e, "unusable INVITE");
                let reply = ResponseBuilder::reply(StatusCode::BadRequest, &request).build();
                let _ = self.send_frame(&reply.to_string()).await;
                self.transactions.on_server_final_sent(&server_key);
                return;
            }
        };

        let from = request.from().ok();
        let remote_uri = from
            .as_ref()
            .map(|a| a.uri.clone())
            .unwrap_or_else(|| Uri::sip_host("unknown.invalid"));
        let dialog_id = self.dialogs.insert(dialog);

        let mut call = CallSession::new(
            CallDirection::Incoming,
            request.call_id().unwrap_or_default().to_string(),
            self.key.uri(),
            remote_uri.clone(),
            local_tag.clone(),
        );
        call.remote_display_name = from.and_then(|a| a.display_name);
        call.dialog = Some(dialog_id);
        call.remote_sdp = Some(request.body.clone());
        call.server_invite = Some((server_key, request.clone()));
        let call_id = call.id;
        self.call = Some(call);

        // Ring before asking anyone; the tag establishes the early dialog.
        let ringing = ResponseBuilder::reply(StatusCode::Ringing, &request)
            .to_tag(&local_tag)
            .build();
        let _ = self.send_frame(&ringing.to_string()).await;
        self.transition_call(CallState::IncomingReceived, None, None)
            .await;

        let info = IncomingCallInfo {
            account: self.key.clone(),
            call_id,
            from: remote_uri.to_string(),
            display_name: self.call.as_ref().and_then(|c| c.remote_display_name.clone()),
            timestamp: Utc::now(),
        };
        match self.env.events.emit_incoming_call(info).await {
            CallAction::Accept => {
                if let Err(e) = self.accept_call(Some(call_id)).await {
                    warn!(call_id = %call_id, error = %e, "auto-accept failed");
                }
            }
            CallAction::Decline => {
                let _ = self.decline_call(Some(call_id)).await;
            }
            CallAction::Ignore => {}
        }
    }

    pub(crate) async fn accept_call(&mut self, call_id: Option<CallId>) -> ClientResult<()> {
        self.check_call(call_id)?;
        let (state, server_invite, remote_sdp, local_tag) = {
            let call = self.call.as_ref().expect("checked");
            (
                call.state,
                call.server_invite.clone(),
                call.remote_sdp.clone().unwrap_or_default(),
                call.local_tag.clone(),
            )
        };
        if state != CallState::IncomingReceived {
            return Err(ClientError::invalid_state("IncomingReceived", state));
        }
        let Some((server_key, invite)) = server_invite else {
            return Err(ClientError::protocol("incoming call lost its INVITE"));
        };

        // Answer SDP must exist before the 200 goes out.
        self.env.media.initialize().await?;
        let answer = self.env.media.create_answer(&remote_sdp).await?;

        let ok = ResponseBuilder::reply(StatusCode::Ok, &invite)
            .to_tag(&local_tag)
            .contact(self.contact())
            .body("application/sdp", answer.clone())
            .build();
        self.send_frame(&ok.to_string()).await?;
        self.transactions.on_server_final_sent(&server_key);

        if let Some(call) = self.call.as_mut() {
            call.local_sdp = Some(answer);
        }
        if let Some(dialog_id) = self.call.as_ref().and_then(|c| c.dialog) {
            self.dialogs.with_mut(&dialog_id, |d| d.confirm());
        }
        self.transition_call(CallState::Connected, Some((200, "OK".into())), None)
            .await;
        Ok(())
    }

    pub(crate) async fn decline_call(&mut self, call_id: Option<CallId>) -> ClientResult<()> {
        self.check_call(call_id)?;
        let (state, server_invite, local_tag) = {
            let call = self.call.as_ref().expect("checked");
            (call.state, call.server_invite.clone(), call.local_tag.clone())
        };
        if state != CallState::IncomingReceived {
            return Err(ClientError::invalid_state("IncomingReceived", state));
        }
        let Some((server_key, invite)) = server_invite else {
            return Err(ClientError::protocol("incoming call lost its INVITE"));
        };

        let decline = ResponseBuilder::reply(StatusCode::Decline, &invite)
            .to_tag(&local_tag)
            .build();
        self.send_frame(&decline.to_string()).await?;
        self.transactions.on_server_final_sent(&server_key);
        self.conclude_call(CallLogClass::Declined).await;
        Ok(())
    }

    /// 302 deflection of a still-ringing incoming INVITE.
    pub(crate) async fn deflect_call(&mut self, to: &str, call_id: Option<CallId>) -> ClientResult<()> {
        self.check_call(call_id)?;
        let (state, server_invite, local_tag) = {
            let call = self.call.as_ref().expect("checked");
            (call.state, call.server_invite.clone(), call.local_tag.clone())
        };
        if state != CallState::IncomingReceived {
            return Err(ClientError::invalid_state("IncomingReceived", state));
        }
        let Some((server_key, invite)) = server_invite else {
            return Err(ClientError::protocol("incoming call lost its INVITE"));
        };
        let target = self.resolve_target(to)?;

        let moved = ResponseBuilder::reply(StatusCode::MovedTemporarily, &invite)
            .to_tag(&local_tag)
            .contact(siprtc_sip_core::Contact::new(Address::new(target)))
            .build();
        self.send_frame(&moved.to_string()).await?;
        self.transactions.on_server_final_sent(&server_key);
        self.conclude_call(CallLogClass::Deflected).await;
        Ok(())
    }

    // --- teardown ---

    pub(crate) async fn end_call(&mut self, call_id: Option<CallId>) -> ClientResult<()> {
        self.check_call(call_id)?;
        let state = self.call.as_ref().expect("checked").state;
        match state {
            CallState::Ended | CallState::Error | CallState::Ending => Ok(()),
            CallState::IncomingReceived => self.decline_call(call_id).await,
            CallState::OutgoingInit | CallState::OutgoingProgress | CallState::OutgoingRinging => {
                self.cancel_outgoing().await
            }
            _ => {
                let connected = self.call.as_ref().expect("checked").connected_at.is_some();
                let classification = if connected {
                    CallLogClass::Success
                } else {
                    CallLogClass::Aborted
                };
                self.send_bye_and_conclude(classification, None).await;
                Ok(())
            }
        }
    }

    async fn cancel_outgoing(&mut self) -> ClientResult<()> {
        let invite = self
            .call
            .as_ref()
            .and_then(|c| c.invite_request.clone())
            .ok_or_else(|| ClientError::protocol("outgoing call lost its INVITE"))?;

        // CANCEL mirrors the INVITE: same branch, same CSeq number.
        let cseq = invite.cseq().map_err(|e| ClientError::protocol(e.to_string()))?;
        let mut cancel = RequestBuilder::from_uri(Method::Cancel, invite.uri.clone())
            .cseq_with_method(cseq.seq, Method::Cancel)
            .build();
        for name in [
            HeaderName::Via,
            HeaderName::From,
            HeaderName::To,
            HeaderName::CallId,
        ] {
            if let Some(value) = invite.header_value(&name) {
                cancel.set_header(name, value.to_string());
            }
        }

        if let Ok(_key) = self.transactions.start_client(&cancel) {
            let _ = self.send_frame(&cancel.to_string()).await;
        }
        self.transition_call(CallState::Ending, None, None).await;
        // the 487 on the INVITE transaction completes the teardown
        Ok(())
    }

    /// BYE from the peer (already CSeq-validated by the dispatcher).
    pub(crate) async fn handle_incoming_bye(&mut self, request: &Request) {
        let reply = ResponseBuilder::reply(StatusCode::Ok, request).build();
        let _ = self.send_frame(&reply.to_string()).await;

        let connected = self
            .call
            .as_ref()
            .map(|c| c.connected_at.is_some())
            .unwrap_or(false);
        let classification = if connected {
            CallLogClass::Success
        } else {
            CallLogClass::Missed
        };
        let _ = self.env.media.dispose().await;
        self.conclude_call(classification).await;
    }

    /// CANCEL of a still-ringing incoming INVITE.
    pub(crate) async fn handle_incoming_cancel(&mut self, request: &Request) {
        let reply = ResponseBuilder::reply(StatusCode::Ok, request).build();
        let _ = self.send_frame(&reply.to_string()).await;

        let pending = self
            .call
            .as_ref()
            .filter(|c| c.state == CallState::IncomingReceived)
            .and_then(|c| c.server_invite.clone());
        let Some((server_key, invite)) = pending else {
            return;
        };
        let local_tag = self.call.as_ref().expect("checked").local_tag.clone();
        let terminated = ResponseBuilder::reply(StatusCode::RequestTerminated, &invite)
            .to_tag(&local_tag)
            .build();
        let _ = self.send_frame(&terminated.to_string()).await;
        self.transactions.on_server_final_sent(&server_key);
        self.conclude_call(CallLogClass::Missed).await;
    }

    // --- hold / resume ---

    pub(crate) async fn hold_call(&mut self) -> ClientResult<()> {
        self.renegotiate(ReinviteKind::Hold).await
    }

    pub(crate) async fn resume_call(&mut self) -> ClientResult<()> {
        self.renegotiate(ReinviteKind::Resume).await
    }

    async fn renegotiate(&mut self, kind: ReinviteKind) -> ClientResult<()> {
        let (state, reinvite_pending, last_change, dialog_id) = {
            let call = self.call.as_ref().ok_or(ClientError::NoActiveCall)?;
            (
                call.state,
                call.reinvite.is_some(),
                call.last_hold_change,
                call.dialog,
            )
        };
        if reinvite_pending {
            return Err(ClientError::invalid_state("no renegotiation in flight", state));
        }
        match kind {
            ReinviteKind::Hold => {
                if !matches!(state, CallState::Connected | CallState::StreamsRunning) {
                    return Err(ClientError::invalid_state("Connected or StreamsRunning", state));
                }
            }
            ReinviteKind::Resume => {
                if state != CallState::Paused {
                    return Err(ClientError::invalid_state("Paused", state));
                }
            }
        }
        let Some(dialog_id) = dialog_id else {
            return Err(ClientError::protocol("call has no dialog"));
        };

        // Settle spacing between consecutive renegotiations.
        if let Some(last) = last_change {
            let since = last.elapsed();
            if since < HOLD_SETTLE {
                tokio::time::sleep(HOLD_SETTLE - since).await;
            }
        }

        let sdp = match kind {
            ReinviteKind::Hold => self.env.media.hold_local().await?,
            ReinviteKind::Resume => self.env.media.resume_local().await?,
        };

        let next = match kind {
            ReinviteKind::Hold => CallState::Pausing,
            ReinviteKind::Resume => CallState::Resuming,
        };
        self.transition_call(next, None, None).await;

        let template = self
            .dialogs
            .with_mut(&dialog_id, |d| d.create_request(Method::Invite))
            .ok_or(ClientError::protocol("dialog disappeared"))?;
        let request = self
            .in_dialog_builder(template)
            .body("application/sdp", sdp.clone())
            .build();
        let key = self
            .transactions
            .start_client(&request)
            .map_err(|e| ClientError::protocol(e.to_string()))?;
        self.send_frame(&request.to_string()).await?;

        if let Some(call) = self.call.as_mut() {
            call.reinvite = Some((key, kind));
            call.local_sdp = Some(sdp);
        }
        Ok(())
    }

    async fn on_reinvite_final(&mut self, kind: ReinviteKind, response: &siprtc_sip_core::Response) {
        if let Some(call) = self.call.as_mut() {
            call.reinvite = None;
        }
        if response.status.is_success() {
            if let Some(dialog_id) = self.call.as_ref().and_then(|c| c.dialog) {
                self.dialogs
                    .with_mut(&dialog_id, |d| d.update_from_2xx(response));
                self.send_ack(dialog_id).await;
            }
            let (next, on_hold) = match kind {
                ReinviteKind::Hold => (CallState::Paused, true),
                ReinviteKind::Resume => (CallState::StreamsRunning, false),
            };
            if let Some(call) = self.call.as_mut() {
                call.on_hold = on_hold;
                call.last_hold_change = Some(Instant::now());
                if let Some(dialog_id) = call.dialog {
                    self.dialogs.with_mut(&dialog_id, |d| d.on_hold = on_hold);
                }
            }
            self.transition_call(next, Some((response.status.code(), response.reason.clone())), None)
                .await;
        } else {
            // A refused renegotiation leaves the session in an unknown
            // media state; treat it as a protocol failure.
            let connected = self
                .call
                .as_ref()
                .map(|c| c.connected_at.is_some())
                .unwrap_or(false);
            self.fail_call(
                "renegotiation rejected",
                Some((response.status.code(), response.reason.clone())),
                if connected {
                    CallLogClass::Success
                } else {
                    CallLogClass::Aborted
                },
            )
            .await;
        }
    }

    // --- DTMF ---

    pub(crate) async fn send_dtmf(&mut self, digits: &str, duration_ms: u32) -> ClientResult<()> {
        let state = self.call.as_ref().ok_or(ClientError::NoActiveCall)?.state;
        if !state.allows_dtmf() {
            return Err(ClientError::invalid_state("Connected or StreamsRunning", state));
        }
        if digits.is_empty()
            || !digits
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '*' | '#' | 'A'..='D' | 'a'..='d'))
        {
            return Err(ClientError::protocol(format!("invalid DTMF digits {digits:?}")));
        }

        let gap = DTMF_INTER_DIGIT_GAP.as_millis() as u32;
        let via_media = self
            .env
            .media
            .send_dtmf(digits, duration_ms, gap)
            .await
            .unwrap_or(false);
        if via_media {
            return Ok(());
        }

        // Media engine cannot inject tones; fall back to in-dialog INFO.
        let dialog_id = self
            .call
            .as_ref()
            .and_then(|c| c.dialog)
            .ok_or(ClientError::protocol("call has no dialog"))?;
        let mut first = true;
        for digit in digits.chars() {
            if !first {
                tokio::time::sleep(DTMF_INTER_DIGIT_GAP).await;
            }
            first = false;
            // Termination mid-sequence flushes the rest.
            let state = self.call.as_ref().map(|c| c.state);
            if state.map(|s| s.allows_dtmf()) != Some(true) {
                debug!(account = %self.key, "DTMF flushed by call termination");
                return Ok(());
            }
            let template = self
                .dialogs
                .with_mut(&dialog_id, |d| d.create_request(Method::Info))
                .ok_or(ClientError::protocol("dialog disappeared"))?;
            let body = format!("Signal={digit}\r\nDuration={duration_ms}\r\n");
            let request = self
                .in_dialog_builder(template)
                .body("application/dtmf-relay", body)
                .build();
            let _ = self.transactions.start_client(&request);
            self.send_frame(&request.to_string()).await?;
        }
        Ok(())
    }

    // --- transfer ---

    pub(crate) async fn transfer_call(&mut self, to: &str) -> ClientResult<()> {
        let (state, dialog_id) = {
            let call = self.call.as_ref().ok_or(ClientError::NoActiveCall)?;
            (call.state, call.dialog)
        };
        if !matches!(
            state,
            CallState::Connected | CallState::StreamsRunning | CallState::Paused
        ) {
            return Err(ClientError::invalid_state(
                "Connected, StreamsRunning or Paused",
                state,
            ));
        }
        let dialog_id = dialog_id.ok_or(ClientError::protocol("call has no dialog"))?;
        let target = self.resolve_target(to)?;

        let template = self
            .dialogs
            .with_mut(&dialog_id, |d| d.create_request(Method::Refer))
            .ok_or(ClientError::protocol("dialog disappeared"))?;
        let request = self
            .in_dialog_builder(template)
            .header(HeaderName::ReferTo, format!("<{target}>"))
            .header(HeaderName::ReferredBy, format!("<{}>", self.key.uri()))
            .build();
        let key = self
            .transactions
            .start_client(&request)
            .map_err(|e| ClientError::protocol(e.to_string()))?;
        self.send_frame(&request.to_string()).await?;

        if let Some(call) = self.call.as_mut() {
            call.refer_key = Some(key);
            call.transfer_in_progress = true;
        }
        info!(account = %self.key, target = %target, "transfer initiated");
        Ok(())
    }

    /// NOTIFY with Event: refer carrying a message/sipfrag body.
    pub(crate) async fn handle_refer_notify(&mut self, request: &Request) {
        let reply = ResponseBuilder::reply(StatusCode::Ok, request).build();
        let _ = self.send_frame(&reply.to_string()).await;

        let transfer_pending = self
            .call
            .as_ref()
            .map(|c| c.transfer_in_progress)
            .unwrap_or(false);
        if !transfer_pending {
            return;
        }
        let Some(code) = parse_sipfrag_status(&request.body) else {
            return;
        };
        if (200..300).contains(&code) {
            info!(account = %self.key, "transfer succeeded, releasing our leg");
            self.send_bye_and_conclude(CallLogClass::Success, None).await;
        } else if code >= 300 {
            warn!(account = %self.key, code, "transfer failed, keeping the call");
            if let Some(call) = self.call.as_mut() {
                call.transfer_in_progress = false;
            }
        }
    }

    // --- mute ---

    pub(crate) async fn set_muted(&mut self, muted: bool) -> ClientResult<()> {
        let active = self.call.as_ref().map(|c| c.state.is_active()).unwrap_or(false);
        if !active {
            return Err(ClientError::NoActiveCall);
        }
        self.env.media.set_muted(muted).await
    }

    // --- routing from the dispatcher ---

    /// A transaction event whose key belongs to this account's call.
    pub(crate) async fn route_call_transaction_event(&mut self, event: TransactionEvent) {
        let Some(call) = &self.call else {
            return;
        };
        match &event {
            TransactionEvent::Provisional { key, response, .. } => {
                if call.invite_key.as_ref() == Some(key) {
                    let response = response.clone();
                    self.on_invite_provisional(&response).await;
                }
            }
            TransactionEvent::Final { key, request, response } => {
                if call.invite_key.as_ref() == Some(key) {
                    let (request, response) = (request.clone(), response.clone());
                    self.on_invite_final(&request, &response).await;
                } else if let Some((reinvite_key, kind)) = call.reinvite.clone() {
                    if &reinvite_key == key {
                        let response = response.clone();
                        self.on_reinvite_final(kind, &response).await;
                    }
                } else if call.refer_key.as_ref() == Some(key) {
                    if !response.status.is_success() {
                        warn!(account = %self.key, status = %response.status, "REFER rejected");
                        if let Some(call) = self.call.as_mut() {
                            call.transfer_in_progress = false;
                            call.refer_key = None;
                        }
                    }
                } else if call.bye_key.as_ref() == Some(key) {
                    debug!(account = %self.key, status = %response.status, "BYE answered");
                } else {
                    debug!(account = %self.key, key = %key, "response for untracked call transaction");
                }
            }
            TransactionEvent::TimedOut { key, .. } => {
                if call.owns_transaction(key) {
                    let connected = call.connected_at.is_some();
                    self.fail_call(
                        "transaction timeout",
                        None,
                        if connected {
                            CallLogClass::Success
                        } else {
                            CallLogClass::Aborted
                        },
                    )
                    .await;
                }
            }
        }
    }

    async fn on_invite_final(&mut self, request: &Request, response: &siprtc_sip_core::Response) {
        let status = response.status;
        if status.is_success() {
            self.on_invite_accepted(request, response).await;
            return;
        }

        // Non-2xx finals are ACKed within the transaction.
        self.ack_rejected_invite(request, response).await;

        if status.is_auth_challenge() && self.retry_invite_with_auth(response).await {
            return;
        }

        let ending = self.call.as_ref().map(|c| c.state) == Some(CallState::Ending);
        if ending && status == StatusCode::RequestTerminated {
            // our CANCEL completed
            self.conclude_call(CallLogClass::Aborted).await;
        } else {
            self.fail_call(
                format!("call rejected: {} {}", status.code(), response.reason),
                Some((status.code(), response.reason.clone())),
                CallLogClass::Aborted,
            )
            .await;
        }
    }

    async fn ack_rejected_invite(&mut self, request: &Request, response: &siprtc_sip_core::Response) {
        // ACK for a non-2xx final reuses the INVITE's Via and CSeq number
        // (RFC 3261 §17.1.1.3); the To comes from the response.
        let mut ack = RequestBuilder::from_uri(Method::Ack, request.uri.clone()).build();
        for name in [HeaderName::Via, HeaderName::From, HeaderName::CallId] {
            if let Some(value) = request.header_value(&name) {
                ack.set_header(name, value.to_string());
            }
        }
        if let Some(to) = response.header_value(&HeaderName::To) {
            ack.set_header(HeaderName::To, to.to_string());
        }
        if let Ok(cseq) = request.cseq() {
            ack.set_header(
                HeaderName::CSeq,
                siprtc_sip_core::CSeq::new(cseq.seq, Method::Ack).to_string(),
            );
        }
        let _ = self.send_frame(&ack.to_string()).await;
    }

    // --- media events ---

    pub(crate) async fn handle_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Connected => {
                if self.call.as_ref().map(|c| c.state) == Some(CallState::Connected) {
                    self.transition_call(CallState::StreamsRunning, None, None)
                        .await;
                }
            }
            MediaEvent::Closed => {
                let state = self.call.as_ref().map(|c| c.state);
                if let Some(state) = state {
                    if state.is_active() && state != CallState::Ending {
                        let connected = self
                            .call
                            .as_ref()
                            .map(|c| c.connected_at.is_some())
                            .unwrap_or(false);
                        self.fail_call(
                            "media session closed",
                            None,
                            if connected {
                                CallLogClass::Success
                            } else {
                                CallLogClass::Aborted
                            },
                        )
                        .await;
                    }
                }
            }
            MediaEvent::RemoteAudioAvailable => {
                debug!(account = %self.key, "remote audio available");
            }
            MediaEvent::AudioDeviceChanged { device } => {
                self.env.events.emit_audio_device_changed(device).await;
            }
        }
    }

    // --- transport interaction ---

    /// The transport dropped while a call exists.
    pub(crate) async fn call_transport_lost(&mut self) {
        let Some(call) = &self.call else {
            return;
        };
        if !call.state.is_active() {
            return;
        }
        if call.state.is_early() {
            let classification = match call.direction {
                CallDirection::Outgoing => CallLogClass::Aborted,
                CallDirection::Incoming => CallLogClass::Missed,
            };
            self.fail_call("NetworkError", None, classification).await;
            return;
        }
        // Confirmed call: the dialog stays logically alive for a while in
        // case the transport comes back.
        if !call.transport_grace_armed {
            let call_id = call.id;
            if let Some(call) = self.call.as_mut() {
                call.transport_grace_armed = true;
            }
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(CONFIRMED_CALL_TRANSPORT_GRACE).await;
                let _ = cmd_tx
                    .send(AccountCommand::CallGraceExpired { call_id })
                    .await;
            });
        }
    }

    /// The transport came back before the grace deadline.
    pub(crate) fn call_transport_restored(&mut self) {
        if let Some(call) = self.call.as_mut() {
            call.transport_grace_armed = false;
        }
    }

    pub(crate) async fn on_call_grace_expired(&mut self, call_id: CallId) {
        let expired = self
            .call
            .as_ref()
            .map(|c| c.id == call_id && c.transport_grace_armed && c.state.is_active())
            .unwrap_or(false);
        if !expired {
            return;
        }
        warn!(call_id = %call_id, "transport did not return within the call grace window");
        self.fail_call("NetworkError", None, CallLogClass::Success).await;
    }

    /// Shutdown escape hatch: force the slot empty, emitting terminal
    /// records where they have not been emitted yet.
    pub(crate) async fn reset_call_to_idle(&mut self) {
        if self.call.is_some() {
            self.conclude_call(CallLogClass::Aborted).await;
        }
    }
}

/// First status code of a `message/sipfrag` body.
fn parse_sipfrag_status(body: &str) -> Option<u16> {
    let first = body.lines().next()?.trim();
    let rest = first.strip_prefix("SIP/2.0 ")?;
    rest.split_whitespace().next()?.parse().ok()
}
