//! CSeq header values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::method::Method;

/// A CSeq header value: sequence number plus method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CSeq {
    /// Sequence number; strictly increasing per direction within a dialog
    pub seq: u32,
    /// Method of the request this sequence number belongs to
    pub method: Method,
}

impl CSeq {
    /// New CSeq value.
    pub fn new(seq: u32, method: Method) -> Self {
        CSeq { seq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

impl FromStr for CSeq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (num, method) = s
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::MalformedHeader(format!("CSeq missing method: {s:?}")))?;
        let seq = num
            .parse::<u32>()
            .map_err(|_| Error::MalformedHeader(format!("CSeq number invalid: {s:?}")))?;
        let method = method.trim().parse::<Method>().map_err(|_| {
            Error::MalformedHeader(format!("CSeq method invalid: {s:?}"))
        })?;
        Ok(CSeq { seq, method })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let cseq: CSeq = "314159 INVITE".parse().unwrap();
        assert_eq!(cseq.seq, 314159);
        assert_eq!(cseq.method, Method::Invite);
        assert_eq!(cseq.to_string(), "314159 INVITE");
    }

    #[test]
    fn rejects_missing_method() {
        assert!("42".parse::<CSeq>().is_err());
        assert!("notanumber INVITE".parse::<CSeq>().is_err());
    }
}
