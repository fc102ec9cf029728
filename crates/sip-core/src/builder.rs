//! Fluent builders for outgoing requests and responses.
//!
//! Every message the stack emits goes through these, so the invariants the
//! wire cares about (branch cookie on Via, Max-Forwards, Content-Length)
//! are enforced in one place.

use crate::error::Result;
use crate::types::address::Address;
use crate::types::contact::Contact;
use crate::types::cseq::CSeq;
use crate::types::header::HeaderName;
use crate::types::message::{HeaderAccess, Request, Response};
use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::uri::Uri;
use crate::types::via::Via;

/// Builder for [`Request`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    request: Request,
    content_type: Option<String>,
}

impl RequestBuilder {
    /// Start a request to a URI given as text.
    pub fn new(method: Method, uri: &str) -> Result<Self> {
        Ok(Self::from_uri(method, uri.parse()?))
    }

    /// Start a request to an already-parsed URI.
    pub fn from_uri(method: Method, uri: Uri) -> Self {
        RequestBuilder {
            request: Request::new(method, uri),
            content_type: None,
        }
    }

    /// Topmost Via with the given branch.
    pub fn via(mut self, sent_by: &str, transport: &str, branch: &str) -> Self {
        self.request.push_header(
            HeaderName::Via,
            Via::new(sent_by, transport, branch).to_string(),
        );
        self
    }

    /// From address.
    pub fn from(mut self, address: Address) -> Self {
        self.request
            .push_header(HeaderName::From, address.to_string());
        self
    }

    /// To address.
    pub fn to(mut self, address: Address) -> Self {
        self.request.push_header(HeaderName::To, address.to_string());
        self
    }

    /// Call-ID.
    pub fn call_id(mut self, call_id: impl Into<String>) -> Self {
        self.request.push_header(HeaderName::CallId, call_id);
        self
    }

    /// CSeq with the request's own method.
    pub fn cseq(mut self, seq: u32) -> Self {
        let cseq = CSeq::new(seq, self.request.method.clone());
        self.request.push_header(HeaderName::CSeq, cseq.to_string());
        self
    }

    /// CSeq with an explicit method (CANCEL and ACK reuse the INVITE number).
    pub fn cseq_with_method(mut self, seq: u32, method: Method) -> Self {
        self.request
            .push_header(HeaderName::CSeq, CSeq::new(seq, method).to_string());
        self
    }

    /// Max-Forwards override; `build` defaults it to 70 when absent.
    pub fn max_forwards(mut self, hops: u32) -> Self {
        self.request
            .push_header(HeaderName::MaxForwards, hops.to_string());
        self
    }

    /// Contact.
    pub fn contact(mut self, contact: Contact) -> Self {
        self.request
            .push_header(HeaderName::Contact, contact.to_string());
        self
    }

    /// Expires.
    pub fn expires(mut self, seconds: u32) -> Self {
        self.request
            .push_header(HeaderName::Expires, seconds.to_string());
        self
    }

    /// User-Agent.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.request.push_header(HeaderName::UserAgent, ua);
        self
    }

    /// Authorization or Proxy-Authorization.
    pub fn authorization(mut self, proxy: bool, value: impl Into<String>) -> Self {
        let name = if proxy {
            HeaderName::ProxyAuthorization
        } else {
            HeaderName::Authorization
        };
        self.request.push_header(name, value);
        self
    }

    /// Append one Route header (call once per route-set entry, in order).
    pub fn route(mut self, address: &Address) -> Self {
        self.request
            .push_header(HeaderName::Route, address.to_string());
        self
    }

    /// Any other header.
    pub fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.request.push_header(name, value);
        self
    }

    /// Body with its content type.
    pub fn body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        self.content_type = Some(content_type.to_string());
        self.request.body = body.into();
        self
    }

    /// Finalize: defaults Max-Forwards, sets Content-Type/Content-Length.
    pub fn build(mut self) -> Request {
        if self.request.method != Method::Ack
            && self
                .request
                .header_value(&HeaderName::MaxForwards)
                .is_none()
        {
            self.request
                .push_header(HeaderName::MaxForwards, "70".to_string());
        }
        if let Some(ct) = self.content_type.take() {
            if !self.request.body.is_empty() {
                self.request.set_header(HeaderName::ContentType, ct);
            }
        }
        let len = self.request.body.len();
        self.request
            .set_header(HeaderName::ContentLength, len.to_string());
        self.request
    }
}

/// Builder for [`Response`].
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    response: Response,
    content_type: Option<String>,
}

impl ResponseBuilder {
    /// Start a response with the default reason phrase.
    pub fn new(status: StatusCode) -> Self {
        ResponseBuilder {
            response: Response::new(status),
            content_type: None,
        }
    }

    /// Start a response to `request`, copying Via, From, To, Call-ID and
    /// CSeq in that order (RFC 3261 §8.2.6.2).
    pub fn reply(status: StatusCode, request: &Request) -> Self {
        let mut builder = ResponseBuilder::new(status);
        for via in request.header_values(&HeaderName::Via) {
            builder.response.push_header(HeaderName::Via, via);
        }
        for name in [HeaderName::From, HeaderName::To, HeaderName::CallId, HeaderName::CSeq] {
            if let Some(value) = request.header_value(&name) {
                builder.response.push_header(name, value);
            }
        }
        builder
    }

    /// Override the reason phrase (for codes without a named variant).
    pub fn reason(mut self, reason: &str) -> Self {
        self.response.reason = reason.to_string();
        self
    }

    /// Ensure the To header carries a tag, setting `tag` if it has none.
    pub fn to_tag(mut self, tag: &str) -> Self {
        if let Ok(mut to) = self.response.to() {
            if to.tag().is_none() {
                to.set_tag(tag);
                self.response.set_header(HeaderName::To, to.to_string());
            }
        }
        self
    }

    /// Contact.
    pub fn contact(mut self, contact: Contact) -> Self {
        self.response
            .push_header(HeaderName::Contact, contact.to_string());
        self
    }

    /// Expires.
    pub fn expires(mut self, seconds: u32) -> Self {
        self.response
            .push_header(HeaderName::Expires, seconds.to_string());
        self
    }

    /// Retry-After.
    pub fn retry_after(mut self, seconds: u32) -> Self {
        self.response
            .push_header(HeaderName::RetryAfter, seconds.to_string());
        self
    }

    /// Any other header.
    pub fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.response.push_header(name, value);
        self
    }

    /// Body with its content type.
    pub fn body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        self.content_type = Some(content_type.to_string());
        self.response.body = body.into();
        self
    }

    /// Finalize: sets Content-Type/Content-Length.
    pub fn build(mut self) -> Response {
        if let Some(ct) = self.content_type.take() {
            if !self.response.body.is_empty() {
                self.response.set_header(HeaderName::ContentType, ct);
            }
        }
        let len = self.response.body.len();
        self.response
            .set_header(HeaderName::ContentLength, len.to_string());
        self.response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_message;
    use crate::types::message::Message;

    fn invite() -> Request {
        RequestBuilder::new(Method::Invite, "sip:bob@example.com")
            .unwrap()
            .via("client.invalid", "WS", "z9hG4bKtest1")
            .from(Address::new(Uri::sip("alice", "example.com")).with_tag("ftag"))
            .to(Address::new(Uri::sip("bob", "example.com")))
            .call_id("cid-1")
            .cseq(1)
            .contact(Contact::new(Address::new(
                Uri::sip("alice", "client.invalid").with_param("transport", "ws"),
            )))
            .body("application/sdp", "v=0\r\n")
            .build()
    }

    #[test]
    fn built_request_round_trips_through_parser() {
        let req = invite();
        let msg = parse_message(&req.to_string()).unwrap();
        assert_eq!(msg, Message::Request(req));
    }

    #[test]
    fn build_defaults_max_forwards_and_content_length() {
        let req = invite();
        assert_eq!(req.header_value(&HeaderName::MaxForwards), Some("70"));
        assert_eq!(req.content_length(), Some(5));
        assert_eq!(req.content_type(), Some("application/sdp"));
    }

    #[test]
    fn ack_gets_no_default_max_forwards_header_duplication() {
        let req = RequestBuilder::new(Method::Ack, "sip:bob@example.com")
            .unwrap()
            .cseq_with_method(1, Method::Ack)
            .build();
        assert_eq!(req.header_value(&HeaderName::MaxForwards), None);
        assert_eq!(req.content_length(), Some(0));
    }

    #[test]
    fn reply_copies_dialog_headers_in_order() {
        let req = invite();
        let resp = ResponseBuilder::reply(StatusCode::Ringing, &req)
            .to_tag("totag")
            .build();
        assert_eq!(resp.via().unwrap().branch(), Some("z9hG4bKtest1"));
        assert_eq!(resp.from().unwrap().tag(), Some("ftag"));
        assert_eq!(resp.to().unwrap().tag(), Some("totag"));
        assert_eq!(resp.call_id().unwrap(), "cid-1");
        assert_eq!(resp.cseq().unwrap().seq, 1);
        // Via precedes From
        let via_pos = resp.headers.iter().position(|h| h.name == HeaderName::Via);
        let from_pos = resp.headers.iter().position(|h| h.name == HeaderName::From);
        assert!(via_pos < from_pos);
    }

    #[test]
    fn to_tag_does_not_clobber_existing_tag() {
        let mut req = invite();
        req.set_header(HeaderName::To, "<sip:bob@example.com>;tag=existing");
        let resp = ResponseBuilder::reply(StatusCode::Ok, &req).to_tag("new").build();
        assert_eq!(resp.to().unwrap().tag(), Some("existing"));
    }

    #[test]
    fn retry_after_on_500() {
        let req = invite();
        let resp = ResponseBuilder::reply(StatusCode::ServerInternalError, &req)
            .retry_after(0)
            .build();
        assert_eq!(resp.header_value(&HeaderName::RetryAfter), Some("0"));
    }
}
