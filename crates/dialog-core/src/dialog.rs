//! RFC 3261 dialogs.
//!
//! A dialog is created UAC-side from a provisional or 2xx response carrying
//! a To tag, and UAS-side when a tagged response to an INVITE is sent. It
//! owns both CSeq counters and the route set, and hands the upper layer
//! request templates with the local CSeq already advanced.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use siprtc_sip_core::{Address, HeaderAccess, Method, Request, Response, Uri};

use crate::errors::{DialogError, DialogResult};

/// Opaque dialog handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DialogId(Uuid);

impl DialogId {
    /// Fresh random id.
    pub fn new() -> Self {
        DialogId(Uuid::new_v4())
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Dialog lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogState {
    /// Created from a tagged provisional response; no 2xx yet
    Early,
    /// Established by a 2xx
    Confirmed,
    /// Ended by BYE or error
    Terminated,
}

/// A SIP dialog as defined in RFC 3261 §12.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dialog {
    /// Unique identifier for this dialog
    pub id: DialogId,
    /// Current state
    pub state: DialogState,
    /// Call-ID shared by everything in the dialog
    pub call_id: String,
    /// Local URI (From for the initiator, To otherwise)
    pub local_uri: Uri,
    /// Remote URI
    pub remote_uri: Uri,
    /// Local tag; always present once the dialog exists
    pub local_tag: Option<String>,
    /// Remote tag; absent only while early on the UAS side
    pub remote_tag: Option<String>,
    /// Last CSeq number used for a locally originated request
    pub local_cseq: u32,
    /// Highest CSeq number accepted from the peer
    pub remote_cseq: u32,
    /// Where in-dialog requests are sent (peer's Contact)
    pub remote_target: Uri,
    /// Route set; already reversed for the initiator
    pub route_set: Vec<Address>,
    /// Whether the local UA created the dialog
    pub is_initiator: bool,
    /// Whether the dialog was established over sips
    pub secure: bool,
    /// Local hold flag maintained by call control
    pub on_hold: bool,
}

/// Everything the sending layer needs to build one in-dialog request.
///
/// Produced by [`Dialog::create_request`]; the Via (with a fresh branch) and
/// the transport-specific headers are added by the sender.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogRequestTemplate {
    /// Request method
    pub method: Method,
    /// Request-URI (the remote target)
    pub target: Uri,
    /// Call-ID
    pub call_id: String,
    /// From address with the local tag
    pub local: Address,
    /// To address with the remote tag when known
    pub remote: Address,
    /// CSeq number to carry
    pub cseq: u32,
    /// Route headers to attach, in order
    pub route_set: Vec<Address>,
}

impl Dialog {
    /// Build a dialog UAC-side from a response to our INVITE.
    ///
    /// Returns `None` when the response cannot create a dialog: no To tag,
    /// not an INVITE transaction, or a non-dialog-creating status.
    pub fn from_uac_response(request: &Request, response: &Response) -> Option<Dialog> {
        if request.method != Method::Invite {
            return None;
        }
        let status = response.status;
        let early = if status.is_success() {
            false
        } else if status.is_provisional() && status.code() > 100 {
            true
        } else {
            return None;
        };

        let from = request.from().ok()?;
        let to = response.to().ok()?;
        let remote_tag = to.tag()?.to_string();
        let call_id = response.call_id().ok()?.to_string();
        let local_cseq = request.cseq().ok()?.seq;

        // Early responses are not required to carry Contact yet.
        let remote_target = match response.contact() {
            Ok(contact) => contact.address.uri,
            Err(_) if early => to.uri.clone(),
            Err(_) => {
                debug!(call_id = %call_id, "2xx without Contact cannot create dialog");
                return None;
            }
        };

        // Record-Route, reversed for the initiator (RFC 3261 §12.1.2).
        let mut route_set = response.record_routes().ok()?;
        route_set.reverse();

        let secure = request.uri.is_secure();
        Some(Dialog {
            id: DialogId::new(),
            state: if early {
                DialogState::Early
            } else {
                DialogState::Confirmed
            },
            call_id,
            local_uri: from.uri.clone(),
            remote_uri: to.uri.clone(),
            local_tag: from.tag().map(str::to_string),
            remote_tag: Some(remote_tag),
            local_cseq,
            remote_cseq: 0,
            remote_target,
            route_set,
            is_initiator: true,
            secure,
            on_hold: false,
        })
    }

    /// Build a dialog UAS-side from an incoming INVITE, using `local_tag`
    /// as the tag we answer with.
    pub fn from_uas_request(request: &Request, local_tag: &str) -> DialogResult<Dialog> {
        if request.method != Method::Invite {
            return Err(DialogError::Protocol(format!(
                "cannot create UAS dialog from {}",
                request.method
            )));
        }
        let from = request.from()?;
        let to = request.to()?;
        let contact = request.contact().map_err(|_| {
            DialogError::Protocol("INVITE without Contact cannot create dialog".into())
        })?;
        let remote_cseq = request.cseq()?.seq;

        Ok(Dialog {
            id: DialogId::new(),
            state: DialogState::Early,
            call_id: request.call_id()?.to_string(),
            local_uri: to.uri.clone(),
            remote_uri: from.uri.clone(),
            local_tag: Some(local_tag.to_string()),
            remote_tag: from.tag().map(str::to_string),
            local_cseq: 0,
            remote_cseq,
            remote_target: contact.address.uri,
            // UAS keeps Record-Route order as received (RFC 3261 §12.1.1)
            route_set: request.record_routes()?,
            is_initiator: false,
            secure: request.uri.is_secure(),
            on_hold: false,
        })
    }

    /// Apply a 2xx on the UAC side: confirm an early dialog and refresh the
    /// remote tag and target.
    pub fn update_from_2xx(&mut self, response: &Response) {
        if let Ok(to) = response.to() {
            if let Some(tag) = to.tag() {
                self.remote_tag = Some(tag.to_string());
            }
        }
        if let Ok(contact) = response.contact() {
            self.remote_target = contact.address.uri;
        }
        if self.state == DialogState::Early {
            self.state = DialogState::Confirmed;
        }
    }

    /// Confirm the dialog (UAS side, once the 2xx is sent).
    pub fn confirm(&mut self) {
        if self.state == DialogState::Early {
            self.state = DialogState::Confirmed;
        }
    }

    /// Refresh the remote target from a re-INVITE's Contact.
    pub fn update_remote_target(&mut self, request: &Request) {
        if let Ok(contact) = request.contact() {
            self.remote_target = contact.address.uri;
        }
    }

    /// Validate and record the CSeq of an incoming in-dialog request.
    ///
    /// ACK and CANCEL reuse the INVITE's number and are exempt. A regression
    /// yields [`DialogError::OutOfOrderCSeq`]; the caller answers with
    /// `500` + `Retry-After: 0` and drops the request.
    pub fn validate_remote_sequence(&mut self, request: &Request) -> DialogResult<()> {
        if matches!(request.method, Method::Ack | Method::Cancel) {
            return Ok(());
        }
        let seq = request.cseq()?.seq;
        if self.remote_cseq != 0 && seq <= self.remote_cseq {
            return Err(DialogError::OutOfOrderCSeq {
                got: seq,
                last: self.remote_cseq,
            });
        }
        self.remote_cseq = seq;
        Ok(())
    }

    /// Template for a new in-dialog request, advancing the local CSeq.
    ///
    /// ACK and CANCEL reuse the current number (RFC 3261 §13.2.2.4, §9.1).
    pub fn create_request(&mut self, method: Method) -> DialogRequestTemplate {
        if !matches!(method, Method::Ack | Method::Cancel) {
            self.local_cseq += 1;
        }
        let mut local = Address::new(self.local_uri.clone());
        if let Some(tag) = &self.local_tag {
            local.set_tag(tag.clone());
        }
        let mut remote = Address::new(self.remote_uri.clone());
        if let Some(tag) = &self.remote_tag {
            remote.set_tag(tag.clone());
        }
        DialogRequestTemplate {
            method,
            target: self.remote_target.clone(),
            call_id: self.call_id.clone(),
            local,
            remote,
            cseq: self.local_cseq,
            route_set: self.route_set.clone(),
        }
    }

    /// `(Call-ID, local tag, remote tag)` identity.
    pub fn key(&self) -> (String, Option<String>, Option<String>) {
        (
            self.call_id.clone(),
            self.local_tag.clone(),
            self.remote_tag.clone(),
        )
    }

    /// Whether this dialog matches an identity triple, with partial match
    /// while either side's remote tag is still unknown.
    pub fn matches(&self, call_id: &str, local_tag: &str, remote_tag: Option<&str>) -> bool {
        if self.call_id != call_id {
            return false;
        }
        if self.local_tag.as_deref() != Some(local_tag) {
            return false;
        }
        match (self.remote_tag.as_deref(), remote_tag) {
            (Some(ours), Some(theirs)) => ours == theirs,
            // early dialog: remote tag not pinned yet on one side
            _ => true,
        }
    }

    /// Mark terminated.
    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
    }

    /// Whether the dialog is terminated.
    pub fn is_terminated(&self) -> bool {
        self.state == DialogState::Terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siprtc_sip_core::{Contact, HeaderName, RequestBuilder, ResponseBuilder, StatusCode};

    fn invite() -> Request {
        RequestBuilder::new(Method::Invite, "sip:bob@example.com")
            .unwrap()
            .via("client.invalid", "WS", "z9hG4bKdlg")
            .from(Address::new(Uri::sip("alice", "example.com")).with_tag("ltag"))
            .to(Address::new(Uri::sip("bob", "example.com")))
            .call_id("dlg-call-1")
            .cseq(10)
            .contact(Contact::new(Address::new(Uri::sip("alice", "client.invalid"))))
            .build()
    }

    fn ok_response(request: &Request) -> Response {
        ResponseBuilder::reply(StatusCode::Ok, request)
            .to_tag("rtag")
            .contact(Contact::new(Address::new(Uri::sip("bob", "ua2.example.com"))))
            .build()
    }

    #[test]
    fn uac_dialog_from_2xx() {
        let req = invite();
        let resp = ok_response(&req);
        let dialog = Dialog::from_uac_response(&req, &resp).unwrap();
        assert_eq!(dialog.state, DialogState::Confirmed);
        assert_eq!(dialog.call_id, "dlg-call-1");
        assert_eq!(dialog.local_tag.as_deref(), Some("ltag"));
        assert_eq!(dialog.remote_tag.as_deref(), Some("rtag"));
        assert_eq!(dialog.local_cseq, 10);
        assert_eq!(dialog.remote_target.host, "ua2.example.com");
        assert!(dialog.is_initiator);
    }

    #[test]
    fn uac_route_set_is_reversed() {
        let req = invite();
        let mut resp = ok_response(&req);
        resp.push_header(
            HeaderName::RecordRoute,
            "<sip:p1.example.com;lr>, <sip:p2.example.com;lr>",
        );
        let dialog = Dialog::from_uac_response(&req, &resp).unwrap();
        assert_eq!(dialog.route_set[0].uri.host, "p2.example.com");
        assert_eq!(dialog.route_set[1].uri.host, "p1.example.com");
    }

    #[test]
    fn early_dialog_from_ringing_needs_tag() {
        let req = invite();
        let no_tag = ResponseBuilder::reply(StatusCode::Ringing, &req).build();
        assert!(Dialog::from_uac_response(&req, &no_tag).is_none());

        let tagged = ResponseBuilder::reply(StatusCode::Ringing, &req)
            .to_tag("rtag")
            .build();
        let dialog = Dialog::from_uac_response(&req, &tagged).unwrap();
        assert_eq!(dialog.state, DialogState::Early);
        // no Contact in the 180: target falls back to the remote URI
        assert_eq!(dialog.remote_target.host, "example.com");
    }

    #[test]
    fn trying_does_not_create_dialog() {
        let req = invite();
        let trying = ResponseBuilder::reply(StatusCode::Trying, &req).to_tag("x").build();
        assert!(Dialog::from_uac_response(&req, &trying).is_none());
    }

    #[test]
    fn uas_dialog_from_invite() {
        let req = invite();
        let dialog = Dialog::from_uas_request(&req, "srvtag").unwrap();
        assert!(!dialog.is_initiator);
        assert_eq!(dialog.local_tag.as_deref(), Some("srvtag"));
        assert_eq!(dialog.remote_tag.as_deref(), Some("ltag"));
        assert_eq!(dialog.remote_cseq, 10);
        assert_eq!(dialog.remote_target.host, "client.invalid");
    }

    #[test]
    fn create_request_advances_cseq_except_ack_cancel() {
        let req = invite();
        let mut dialog = Dialog::from_uac_response(&req, &ok_response(&req)).unwrap();
        let t1 = dialog.create_request(Method::Invite);
        let t2 = dialog.create_request(Method::Info);
        let ack = dialog.create_request(Method::Ack);
        assert_eq!(t1.cseq, 11);
        assert_eq!(t2.cseq, 12);
        assert_eq!(ack.cseq, 12);
        assert_eq!(t1.local.tag(), Some("ltag"));
        assert_eq!(t1.remote.tag(), Some("rtag"));
        assert_eq!(t1.target.host, "ua2.example.com");
    }

    #[test]
    fn remote_cseq_regression_is_rejected() {
        let req = invite();
        let mut dialog = Dialog::from_uas_request(&req, "srvtag").unwrap();

        let mut bye = RequestBuilder::new(Method::Bye, "sip:alice@client.invalid")
            .unwrap()
            .via("peer", "WS", "z9hG4bKbye")
            .call_id("dlg-call-1")
            .cseq(11)
            .build();
        assert!(dialog.validate_remote_sequence(&bye).is_ok());
        assert_eq!(dialog.remote_cseq, 11);

        bye.set_header(HeaderName::CSeq, "5 BYE");
        assert_eq!(
            dialog.validate_remote_sequence(&bye),
            Err(DialogError::OutOfOrderCSeq { got: 5, last: 11 })
        );
    }

    #[test]
    fn matching_is_partial_while_early() {
        let req = invite();
        let dialog = Dialog::from_uas_request(&req, "srvtag").unwrap();
        assert!(dialog.matches("dlg-call-1", "srvtag", Some("ltag")));
        assert!(dialog.matches("dlg-call-1", "srvtag", None));
        assert!(!dialog.matches("dlg-call-1", "other", Some("ltag")));
        assert!(!dialog.matches("other-call", "srvtag", Some("ltag")));
    }
}
