//! SIP request methods.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A SIP request method.
///
/// The variants cover the methods this stack originates or answers; anything
/// else is carried through as [`Method::Extension`] so parsing an unknown
/// method never fails.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// REGISTER (RFC 3261)
    Register,
    /// INVITE (RFC 3261)
    Invite,
    /// ACK (RFC 3261)
    Ack,
    /// BYE (RFC 3261)
    Bye,
    /// CANCEL (RFC 3261)
    Cancel,
    /// OPTIONS (RFC 3261)
    Options,
    /// REFER (RFC 3515) - call transfer
    Refer,
    /// NOTIFY (RFC 6665) - transfer outcome reporting
    Notify,
    /// INFO (RFC 6086) - in-dialog DTMF relay fallback
    Info,
    /// UPDATE (RFC 3311)
    Update,
    /// Any other method, preserved verbatim
    Extension(String),
}

impl Method {
    /// Canonical wire representation of the method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Refer => "REFER",
            Method::Notify => "NOTIFY",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Extension(s) => s.as_str(),
        }
    }

    /// Whether requests with this method create an INVITE transaction.
    pub fn is_invite(&self) -> bool {
        matches!(self, Method::Invite)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(Error::MalformedStart(format!("invalid method token {s:?}")));
        }
        Ok(match s {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            "REFER" => Method::Refer,
            "NOTIFY" => Method::Notify,
            "INFO" => Method::Info,
            "UPDATE" => Method::Update,
            other => Method::Extension(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_methods() {
        assert_eq!("INVITE".parse::<Method>().unwrap(), Method::Invite);
        assert_eq!("REGISTER".parse::<Method>().unwrap(), Method::Register);
        assert_eq!("NOTIFY".parse::<Method>().unwrap(), Method::Notify);
    }

    #[test]
    fn preserves_extension_methods() {
        let m = "PUBLISH".parse::<Method>().unwrap();
        assert_eq!(m, Method::Extension("PUBLISH".to_string()));
        assert_eq!(m.to_string(), "PUBLISH");
    }

    #[test]
    fn rejects_non_token_method() {
        assert!("IN VITE".parse::<Method>().is_err());
        assert!("".parse::<Method>().is_err());
    }
}
