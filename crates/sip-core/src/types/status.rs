//! SIP response status codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A SIP status code.
///
/// Named variants exist for the codes this stack emits or branches on;
/// everything else round-trips through [`StatusCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// 100 Trying
    Trying,
    /// 180 Ringing
    Ringing,
    /// 183 Session Progress
    SessionProgress,
    /// 200 OK
    Ok,
    /// 202 Accepted
    Accepted,
    /// 302 Moved Temporarily (call deflection)
    MovedTemporarily,
    /// 400 Bad Request
    BadRequest,
    /// 401 Unauthorized
    Unauthorized,
    /// 403 Forbidden
    Forbidden,
    /// 404 Not Found
    NotFound,
    /// 407 Proxy Authentication Required
    ProxyAuthenticationRequired,
    /// 408 Request Timeout
    RequestTimeout,
    /// 480 Temporarily Unavailable
    TemporarilyUnavailable,
    /// 481 Call/Transaction Does Not Exist
    CallOrTransactionDoesNotExist,
    /// 486 Busy Here
    BusyHere,
    /// 487 Request Terminated
    RequestTerminated,
    /// 500 Server Internal Error
    ServerInternalError,
    /// 503 Service Unavailable
    ServiceUnavailable,
    /// 603 Decline
    Decline,
    /// Any other status code
    Other(u16),
}

impl StatusCode {
    /// Numeric code.
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Trying => 100,
            StatusCode::Ringing => 180,
            StatusCode::SessionProgress => 183,
            StatusCode::Ok => 200,
            StatusCode::Accepted => 202,
            StatusCode::MovedTemporarily => 302,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::ProxyAuthenticationRequired => 407,
            StatusCode::RequestTimeout => 408,
            StatusCode::TemporarilyUnavailable => 480,
            StatusCode::CallOrTransactionDoesNotExist => 481,
            StatusCode::BusyHere => 486,
            StatusCode::RequestTerminated => 487,
            StatusCode::ServerInternalError => 500,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::Decline => 603,
            StatusCode::Other(code) => *code,
        }
    }

    /// Map a numeric code onto a named variant where one exists.
    pub fn from_code(code: u16) -> StatusCode {
        match code {
            100 => StatusCode::Trying,
            180 => StatusCode::Ringing,
            183 => StatusCode::SessionProgress,
            200 => StatusCode::Ok,
            202 => StatusCode::Accepted,
            302 => StatusCode::MovedTemporarily,
            400 => StatusCode::BadRequest,
            401 => StatusCode::Unauthorized,
            403 => StatusCode::Forbidden,
            404 => StatusCode::NotFound,
            407 => StatusCode::ProxyAuthenticationRequired,
            408 => StatusCode::RequestTimeout,
            480 => StatusCode::TemporarilyUnavailable,
            481 => StatusCode::CallOrTransactionDoesNotExist,
            486 => StatusCode::BusyHere,
            487 => StatusCode::RequestTerminated,
            500 => StatusCode::ServerInternalError,
            503 => StatusCode::ServiceUnavailable,
            603 => StatusCode::Decline,
            other => StatusCode::Other(other),
        }
    }

    /// Default reason phrase for this code.
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Trying => "Trying",
            StatusCode::Ringing => "Ringing",
            StatusCode::SessionProgress => "Session Progress",
            StatusCode::Ok => "OK",
            StatusCode::Accepted => "Accepted",
            StatusCode::MovedTemporarily => "Moved Temporarily",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::ProxyAuthenticationRequired => "Proxy Authentication Required",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::TemporarilyUnavailable => "Temporarily Unavailable",
            StatusCode::CallOrTransactionDoesNotExist => "Call/Transaction Does Not Exist",
            StatusCode::BusyHere => "Busy Here",
            StatusCode::RequestTerminated => "Request Terminated",
            StatusCode::ServerInternalError => "Server Internal Error",
            StatusCode::ServiceUnavailable => "Service Unavailable",
            StatusCode::Decline => "Decline",
            StatusCode::Other(_) => "",
        }
    }

    /// 1xx
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.code())
    }

    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code())
    }

    /// >= 200
    pub fn is_final(&self) -> bool {
        self.code() >= 200
    }

    /// 401 or 407
    pub fn is_auth_challenge(&self) -> bool {
        matches!(
            self,
            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
