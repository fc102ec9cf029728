//! Contact header values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::address::Address;

/// A Contact header value.
///
/// Thin wrapper over [`Address`] adding the `expires` accessor the registrar
/// needs when matching the echoed binding in a 2xx.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// The contact address
    pub address: Address,
}

impl Contact {
    /// Wrap an address.
    pub fn new(address: Address) -> Self {
        Contact { address }
    }

    /// The `expires` header parameter, parsed.
    pub fn expires(&self) -> Option<u32> {
        self.address.param("expires").and_then(|v| v.parse().ok())
    }

    /// Builder-style expires setter.
    pub fn with_expires(mut self, expires: u32) -> Self {
        self.address = self.address.with_param("expires", expires.to_string());
        self
    }

    /// Whether this contact's URI matches another's user and host.
    ///
    /// Registrars are free to rewrite ports and add parameters when echoing
    /// a binding, so the comparison is deliberately loose.
    pub fn binding_matches(&self, other: &Contact) -> bool {
        self.address.uri.user == other.address.uri.user
            && self
                .address
                .uri
                .host
                .eq_ignore_ascii_case(&other.address.uri.host)
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.address.fmt(f)
    }
}

impl FromStr for Contact {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Contact {
            address: s.parse()?,
        })
    }
}
