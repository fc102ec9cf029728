//! SIP requests, responses, and the common header-access surface.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::address::Address;
use crate::types::contact::Contact;
use crate::types::cseq::CSeq;
use crate::types::header::{Header, HeaderName};
use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::uri::Uri;
use crate::types::via::Via;

/// Shared header access for [`Request`] and [`Response`].
///
/// Headers are stored raw; the typed accessors parse on demand so that a
/// message with one malformed header can still be routed on the others.
pub trait HeaderAccess {
    /// All headers in wire order.
    fn headers(&self) -> &[Header];

    /// Mutable access to the header list.
    fn headers_mut(&mut self) -> &mut Vec<Header>;

    /// Message body.
    fn body(&self) -> &str;

    /// First value for `name`.
    fn header_value(&self, name: &HeaderName) -> Option<&str> {
        self.headers()
            .iter()
            .find(|h| &h.name == name)
            .map(|h| h.value.as_str())
    }

    /// All values for `name`, in wire order.
    fn header_values(&self, name: &HeaderName) -> Vec<&str> {
        self.headers()
            .iter()
            .filter(|h| &h.name == name)
            .map(|h| h.value.as_str())
            .collect()
    }

    /// Append a header.
    fn push_header(&mut self, name: HeaderName, value: impl Into<String>)
    where
        Self: Sized,
    {
        self.headers_mut().push(Header::new(name, value));
    }

    /// Replace the first occurrence of `name` (or append if absent).
    fn set_header(&mut self, name: HeaderName, value: impl Into<String>)
    where
        Self: Sized,
    {
        let value = value.into();
        if let Some(h) = self.headers_mut().iter_mut().find(|h| h.name == name) {
            h.value = value;
        } else {
            self.headers_mut().push(Header::new(name, value));
        }
    }

    /// Remove every occurrence of `name`.
    fn remove_header(&mut self, name: &HeaderName) {
        self.headers_mut().retain(|h| &h.name != name);
    }

    /// Topmost Via, parsed.
    fn via(&self) -> Result<Via> {
        self.header_value(&HeaderName::Via)
            .ok_or(Error::MissingHeader("Via"))?
            .parse()
    }

    /// From address, parsed.
    fn from(&self) -> Result<Address> {
        self.header_value(&HeaderName::From)
            .ok_or(Error::MissingHeader("From"))?
            .parse()
    }

    /// To address, parsed.
    fn to(&self) -> Result<Address> {
        self.header_value(&HeaderName::To)
            .ok_or(Error::MissingHeader("To"))?
            .parse()
    }

    /// Call-ID value.
    fn call_id(&self) -> Result<&str> {
        self.header_value(&HeaderName::CallId)
            .ok_or(Error::MissingHeader("Call-ID"))
    }

    /// CSeq, parsed.
    fn cseq(&self) -> Result<CSeq> {
        self.header_value(&HeaderName::CSeq)
            .ok_or(Error::MissingHeader("CSeq"))?
            .parse()
    }

    /// First Contact, parsed.
    fn contact(&self) -> Result<Contact> {
        self.header_value(&HeaderName::Contact)
            .ok_or(Error::MissingHeader("Contact"))?
            .parse()
    }

    /// Expires header, parsed.
    fn expires(&self) -> Option<u32> {
        self.header_value(&HeaderName::Expires)
            .and_then(|v| v.trim().parse().ok())
    }

    /// Content-Type value.
    fn content_type(&self) -> Option<&str> {
        self.header_value(&HeaderName::ContentType)
    }

    /// Content-Length, parsed.
    fn content_length(&self) -> Option<usize> {
        self.header_value(&HeaderName::ContentLength)
            .and_then(|v| v.trim().parse().ok())
    }

    /// Record-Route addresses in wire order (top first).
    fn record_routes(&self) -> Result<Vec<Address>> {
        self.header_values(&HeaderName::RecordRoute)
            .into_iter()
            .flat_map(split_comma_values)
            .map(|v| v.parse())
            .collect()
    }

    /// Route addresses in wire order.
    fn routes(&self) -> Result<Vec<Address>> {
        self.header_values(&HeaderName::Route)
            .into_iter()
            .flat_map(split_comma_values)
            .map(|v| v.parse())
            .collect()
    }
}

/// Split a comma-separated header value, ignoring commas inside `<>` or
/// quoted strings.
fn split_comma_values(value: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut start = 0usize;
    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth += 1,
            '>' if !in_quotes => depth = depth.saturating_sub(1),
            ',' if !in_quotes && depth == 0 => {
                out.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(value[start..].trim());
    out.retain(|s| !s.is_empty());
    out
}

/// A SIP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Request method
    pub method: Method,
    /// Request-URI
    pub uri: Uri,
    /// Headers in wire order
    pub headers: Vec<Header>,
    /// Body (empty string when absent)
    pub body: String,
}

impl Request {
    /// New request with no headers or body.
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            headers: Vec::new(),
            body: String::new(),
        }
    }
}

impl HeaderAccess for Request {
    fn headers(&self) -> &[Header] {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Vec<Header> {
        &mut self.headers
    }

    fn body(&self) -> &str {
        &self.body
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0\r\n", self.method, self.uri)?;
        for h in &self.headers {
            write!(f, "{h}\r\n")?;
        }
        write!(f, "\r\n{}", self.body)
    }
}

/// A SIP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Status code
    pub status: StatusCode,
    /// Reason phrase as received or generated
    pub reason: String,
    /// Headers in wire order
    pub headers: Vec<Header>,
    /// Body (empty string when absent)
    pub body: String,
}

impl Response {
    /// New response with the default reason phrase for `status`.
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            reason: status.reason_phrase().to_string(),
            headers: Vec::new(),
            body: String::new(),
        }
    }
}

impl HeaderAccess for Response {
    fn headers(&self) -> &[Header] {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Vec<Header> {
        &mut self.headers
    }

    fn body(&self) -> &str {
        &self.body
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {} {}\r\n", self.status, self.reason)?;
        for h in &self.headers {
            write!(f, "{h}\r\n")?;
        }
        write!(f, "\r\n{}", self.body)
    }
}

/// A parsed SIP message, request or response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// A request
    Request(Request),
    /// A response
    Response(Response),
}

impl Message {
    /// The Call-ID carried by the message.
    pub fn call_id(&self) -> Result<&str> {
        match self {
            Message::Request(r) => r.call_id(),
            Message::Response(r) => r.call_id(),
        }
    }

    /// The CSeq carried by the message.
    pub fn cseq(&self) -> Result<CSeq> {
        match self {
            Message::Request(r) => r.cseq(),
            Message::Response(r) => r.cseq(),
        }
    }

    /// The topmost Via branch, if present and well-formed.
    pub fn branch(&self) -> Option<String> {
        let via = match self {
            Message::Request(r) => r.via(),
            Message::Response(r) => r.via(),
        };
        via.ok().and_then(|v| v.branch().map(str::to_string))
    }

    /// Borrow as a request, if it is one.
    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Message::Request(r) => Some(r),
            Message::Response(_) => None,
        }
    }

    /// Borrow as a response, if it is one.
    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Message::Request(_) => None,
            Message::Response(r) => Some(r),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(r) => r.fmt(f),
            Message::Response(r) => r.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Request {
        let mut req = Request::new(Method::Invite, Uri::sip("bob", "example.com"));
        req.push_header(HeaderName::Via, "SIP/2.0/WS client.invalid;branch=z9hG4bK1");
        req.push_header(HeaderName::From, "<sip:alice@example.com>;tag=abc");
        req.push_header(HeaderName::To, "<sip:bob@example.com>");
        req.push_header(HeaderName::CallId, "callid-1");
        req.push_header(HeaderName::CSeq, "1 INVITE");
        req
    }

    #[test]
    fn typed_accessors() {
        let req = sample_request();
        assert_eq!(req.via().unwrap().branch(), Some("z9hG4bK1"));
        assert_eq!(req.from().unwrap().tag(), Some("abc"));
        assert_eq!(req.to().unwrap().tag(), None);
        assert_eq!(req.call_id().unwrap(), "callid-1");
        assert_eq!(req.cseq().unwrap(), CSeq::new(1, Method::Invite));
    }

    #[test]
    fn set_header_replaces_in_place() {
        let mut req = sample_request();
        req.set_header(HeaderName::CSeq, "2 INVITE");
        assert_eq!(req.cseq().unwrap().seq, 2);
        assert_eq!(req.header_values(&HeaderName::CSeq).len(), 1);
    }

    #[test]
    fn comma_separated_record_routes_split() {
        let mut resp = Response::new(StatusCode::Ok);
        resp.push_header(
            HeaderName::RecordRoute,
            "<sip:p1.example.com;lr>, <sip:p2.example.com;lr>",
        );
        let routes = resp.record_routes().unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].uri.host, "p1.example.com");
        assert_eq!(routes[1].uri.host, "p2.example.com");
    }

    #[test]
    fn display_shape() {
        let req = sample_request();
        let wire = req.to_string();
        assert!(wire.starts_with("INVITE sip:bob@example.com SIP/2.0\r\n"));
        assert!(wire.contains("\r\n\r\n"));
    }
}
