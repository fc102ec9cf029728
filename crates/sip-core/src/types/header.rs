//! Header names and raw header storage.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A SIP header name.
///
/// The named variants are the headers this stack handles with semantic
/// awareness; anything else is carried as [`HeaderName::Other`] with its
/// original spelling. Parsing is case-insensitive and folds the RFC 3261
/// compact forms onto their long names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeaderName {
    Via,
    From,
    To,
    CallId,
    CSeq,
    Contact,
    MaxForwards,
    Route,
    RecordRoute,
    WwwAuthenticate,
    ProxyAuthenticate,
    Authorization,
    ProxyAuthorization,
    Allow,
    Supported,
    Require,
    ReferTo,
    ReferredBy,
    Event,
    SubscriptionState,
    Expires,
    ContentType,
    ContentLength,
    UserAgent,
    RetryAfter,
    /// Any other header, spelling preserved
    Other(String),
}

impl HeaderName {
    /// Canonical wire spelling.
    pub fn as_str(&self) -> &str {
        match self {
            HeaderName::Via => "Via",
            HeaderName::From => "From",
            HeaderName::To => "To",
            HeaderName::CallId => "Call-ID",
            HeaderName::CSeq => "CSeq",
            HeaderName::Contact => "Contact",
            HeaderName::MaxForwards => "Max-Forwards",
            HeaderName::Route => "Route",
            HeaderName::RecordRoute => "Record-Route",
            HeaderName::WwwAuthenticate => "WWW-Authenticate",
            HeaderName::ProxyAuthenticate => "Proxy-Authenticate",
            HeaderName::Authorization => "Authorization",
            HeaderName::ProxyAuthorization => "Proxy-Authorization",
            HeaderName::Allow => "Allow",
            HeaderName::Supported => "Supported",
            HeaderName::Require => "Require",
            HeaderName::ReferTo => "Refer-To",
            HeaderName::ReferredBy => "Referred-By",
            HeaderName::Event => "Event",
            HeaderName::SubscriptionState => "Subscription-State",
            HeaderName::Expires => "Expires",
            HeaderName::ContentType => "Content-Type",
            HeaderName::ContentLength => "Content-Length",
            HeaderName::UserAgent => "User-Agent",
            HeaderName::RetryAfter => "Retry-After",
            HeaderName::Other(s) => s.as_str(),
        }
    }

    /// Parse a header name, folding case and compact forms.
    pub fn parse(s: &str) -> HeaderName {
        match s.to_ascii_lowercase().as_str() {
            "via" | "v" => HeaderName::Via,
            "from" | "f" => HeaderName::From,
            "to" | "t" => HeaderName::To,
            "call-id" | "i" => HeaderName::CallId,
            "cseq" => HeaderName::CSeq,
            "contact" | "m" => HeaderName::Contact,
            "max-forwards" => HeaderName::MaxForwards,
            "route" => HeaderName::Route,
            "record-route" => HeaderName::RecordRoute,
            "www-authenticate" => HeaderName::WwwAuthenticate,
            "proxy-authenticate" => HeaderName::ProxyAuthenticate,
            "authorization" => HeaderName::Authorization,
            "proxy-authorization" => HeaderName::ProxyAuthorization,
            "allow" => HeaderName::Allow,
            "supported" | "k" => HeaderName::Supported,
            "require" => HeaderName::Require,
            "refer-to" | "r" => HeaderName::ReferTo,
            "referred-by" | "b" => HeaderName::ReferredBy,
            "event" | "o" => HeaderName::Event,
            "subscription-state" => HeaderName::SubscriptionState,
            "expires" => HeaderName::Expires,
            "content-type" | "c" => HeaderName::ContentType,
            "content-length" | "l" => HeaderName::ContentLength,
            "user-agent" => HeaderName::UserAgent,
            "retry-after" => HeaderName::RetryAfter,
            _ => HeaderName::Other(s.to_string()),
        }
    }

    /// Headers that may appear at most once per message.
    pub fn is_singleton(&self) -> bool {
        matches!(
            self,
            HeaderName::From
                | HeaderName::To
                | HeaderName::CallId
                | HeaderName::CSeq
                | HeaderName::MaxForwards
                | HeaderName::Expires
                | HeaderName::ContentType
                | HeaderName::ContentLength
                | HeaderName::Event
                | HeaderName::SubscriptionState
                | HeaderName::ReferTo
                | HeaderName::ReferredBy
                | HeaderName::UserAgent
                | HeaderName::RetryAfter
        )
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw header: canonical name plus the unparsed value.
///
/// Typed views (Via, CSeq, addresses, ...) are parsed on demand by the
/// accessors on [`crate::types::message::Request`] and
/// [`crate::types::message::Response`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Canonical header name
    pub name: HeaderName,
    /// Value with surrounding whitespace trimmed
    pub value: String,
}

impl Header {
    /// New header from name and value.
    pub fn new(name: HeaderName, value: impl Into<String>) -> Self {
        Header {
            name,
            value: value.into(),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}
