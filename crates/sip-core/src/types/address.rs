//! Name-addr values for From/To/Contact/Route style headers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::uri::{Param, Uri};

/// A SIP address: optional display name, URI, and header parameters.
///
/// Serializes in name-addr form (`"Display" <uri>;params`); the addr-spec
/// form without angle brackets is accepted on input, in which case trailing
/// parameters are header parameters per RFC 3261 §20.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Display name without surrounding quotes
    pub display_name: Option<String>,
    /// The address URI
    pub uri: Uri,
    /// Header parameters (`tag`, `expires`, ...)
    pub params: Vec<Param>,
}

impl Address {
    /// Address with no display name or parameters.
    pub fn new(uri: Uri) -> Self {
        Address {
            display_name: None,
            uri,
            params: Vec::new(),
        }
    }

    /// Address with a display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Append a header parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push(Param::new(name, value));
        self
    }

    /// Look up a header parameter by (case-insensitive) name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .and_then(|p| p.value.as_deref())
    }

    /// The `tag` parameter, if present.
    pub fn tag(&self) -> Option<&str> {
        self.param("tag")
    }

    /// Set or replace the `tag` parameter.
    pub fn set_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        for p in &mut self.params {
            if p.name.eq_ignore_ascii_case("tag") {
                p.value = Some(tag);
                return;
            }
        }
        self.params.push(Param::new("tag", tag));
    }

    /// Builder-style [`Address::set_tag`].
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.set_tag(tag);
        self
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{name}\" ")?;
        }
        write!(f, "<{}>", self.uri)?;
        for p in &self.params {
            write!(f, ";{p}")?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(open) = s.find('<') {
            let close = s
                .find('>')
                .ok_or_else(|| Error::MalformedHeader(format!("unterminated name-addr {s:?}")))?;
            if close < open {
                return Err(Error::MalformedHeader(format!("mismatched brackets in {s:?}")));
            }
            let display = s[..open].trim();
            let display_name = if display.is_empty() {
                None
            } else {
                Some(display.trim_matches('"').to_string())
            };
            let uri: Uri = s[open + 1..close].parse()?;
            let params = s[close + 1..]
                .split(';')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(Param::parse)
                .collect();
            Ok(Address {
                display_name,
                uri,
                params,
            })
        } else {
            // addr-spec form: everything after the first ';' is a header param
            let (uri_part, params_part) = match s.split_once(';') {
                Some((u, p)) => (u, Some(p)),
                None => (s, None),
            };
            let uri: Uri = uri_part.parse()?;
            let params = params_part
                .map(|p| {
                    p.split(';')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(Param::parse)
                        .collect()
                })
                .unwrap_or_default();
            Ok(Address {
                display_name: None,
                uri,
                params,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_addr_with_tag() {
        let addr: Address = "\"Alice\" <sip:alice@example.com>;tag=1928301774"
            .parse()
            .unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Alice"));
        assert_eq!(addr.uri.user.as_deref(), Some("alice"));
        assert_eq!(addr.tag(), Some("1928301774"));
    }

    #[test]
    fn parses_addr_spec_form() {
        let addr: Address = "sip:bob@example.com;tag=a6c85cf".parse().unwrap();
        assert_eq!(addr.display_name, None);
        assert_eq!(addr.tag(), Some("a6c85cf"));
        // URI params stay on the URI when bracketed
        let addr2: Address = "<sip:bob@example.com;transport=ws>;tag=x".parse().unwrap();
        assert_eq!(addr2.uri.transport(), Some("ws"));
        assert_eq!(addr2.tag(), Some("x"));
    }

    #[test]
    fn set_tag_replaces_existing() {
        let mut addr = Address::new(Uri::sip("alice", "example.com")).with_tag("one");
        addr.set_tag("two");
        assert_eq!(addr.tag(), Some("two"));
        assert_eq!(addr.params.len(), 1);
    }

    #[test]
    fn display_round_trips() {
        let s = "\"Bob\" <sip:bob@example.com;transport=ws>;tag=abc;expires=60";
        let addr: Address = s.parse().unwrap();
        assert_eq!(addr.to_string(), s);
    }
}
