//! SIP URIs and generic name/value parameters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A `;name=value` parameter as carried on URIs, addresses and Via headers.
///
/// A parameter without `=` (e.g. `;lr`) has `value == None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name, case-preserved
    pub name: String,
    /// Parameter value, if any
    pub value: Option<String>,
}

impl Param {
    /// Create a valueless parameter.
    pub fn flag(name: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            value: None,
        }
    }

    /// Create a `name=value` parameter.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub(crate) fn parse(s: &str) -> Self {
        match s.split_once('=') {
            Some((name, value)) => Param::new(name.trim(), value.trim()),
            None => Param::flag(s.trim()),
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}={}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

/// URI scheme; only `sip` and `sips` are accepted on this stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    /// `sip:`
    Sip,
    /// `sips:` (secure)
    Sips,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Sip => f.write_str("sip"),
            Scheme::Sips => f.write_str("sips"),
        }
    }
}

/// A SIP or SIPS URI.
///
/// The model keeps what the user-agent layers need: user, host, port and the
/// ordered parameter list. URI headers (`?x=y`) are preserved verbatim so
/// parsing and reserializing a URI is lossless.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uri {
    /// `sip` or `sips`
    pub scheme: Scheme,
    /// User part before `@`, if any
    pub user: Option<String>,
    /// Host (domain name or IP literal; IPv6 without brackets)
    pub host: String,
    /// Explicit port, if any
    pub port: Option<u16>,
    /// URI parameters in source order
    pub params: Vec<Param>,
    /// Raw URI headers after `?`, if any
    pub headers: Option<String>,
}

impl Uri {
    /// `sip:host`
    pub fn sip_host(host: impl Into<String>) -> Self {
        Uri {
            scheme: Scheme::Sip,
            user: None,
            host: host.into(),
            port: None,
            params: Vec::new(),
            headers: None,
        }
    }

    /// `sip:user@host`
    pub fn sip(user: impl Into<String>, host: impl Into<String>) -> Self {
        Uri {
            user: Some(user.into()),
            ..Uri::sip_host(host)
        }
    }

    /// Append a `;name=value` parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push(Param::new(name, value));
        self
    }

    /// Look up a parameter value by (case-insensitive) name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .and_then(|p| p.value.as_deref())
    }

    /// The `transport` URI parameter, if present.
    pub fn transport(&self) -> Option<&str> {
        self.param("transport")
    }

    /// Scheme is `sips`.
    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Sips
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        for p in &self.params {
            write!(f, ";{p}")?;
        }
        if let Some(headers) = &self.headers {
            write!(f, "?{headers}")?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (scheme, rest) = if let Some(rest) = s.strip_prefix("sips:") {
            (Scheme::Sips, rest)
        } else if let Some(rest) = s.strip_prefix("sip:") {
            (Scheme::Sip, rest)
        } else {
            return Err(Error::InvalidUri(format!("unsupported scheme in {s:?}")));
        };

        let (rest, headers) = match rest.split_once('?') {
            Some((r, h)) => (r, Some(h.to_string())),
            None => (rest, None),
        };

        let mut parts = rest.split(';');
        let addr = parts.next().unwrap_or_default();
        let params: Vec<Param> = parts.filter(|p| !p.is_empty()).map(Param::parse).collect();

        let (user, hostport) = match addr.rsplit_once('@') {
            Some((user, hp)) => (Some(user.to_string()), hp),
            None => (None, addr),
        };

        let (host, port) = if let Some(rest) = hostport.strip_prefix('[') {
            // IPv6 literal
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| Error::InvalidUri(format!("unterminated IPv6 literal in {s:?}")))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(
                    p.parse::<u16>()
                        .map_err(|_| Error::InvalidUri(format!("bad port in {s:?}")))?,
                ),
                None if tail.is_empty() => None,
                None => return Err(Error::InvalidUri(format!("trailing garbage in {s:?}"))),
            };
            (host.to_string(), port)
        } else {
            match hostport.split_once(':') {
                Some((host, p)) => (
                    host.to_string(),
                    Some(
                        p.parse::<u16>()
                            .map_err(|_| Error::InvalidUri(format!("bad port in {s:?}")))?,
                    ),
                ),
                None => (hostport.to_string(), None),
            }
        };

        if host.is_empty() {
            return Err(Error::InvalidUri(format!("empty host in {s:?}")));
        }
        if user.as_deref() == Some("") {
            return Err(Error::InvalidUri(format!("empty user part in {s:?}")));
        }

        Ok(Uri {
            scheme,
            user,
            host,
            port,
            params,
            headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri: Uri = "sip:alice@example.com:5060;transport=ws".parse().unwrap();
        assert_eq!(uri.scheme, Scheme::Sip);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(5060));
        assert_eq!(uri.transport(), Some("ws"));
    }

    #[test]
    fn parses_telephone_user() {
        let uri: Uri = "sip:+15550123@example.com".parse().unwrap();
        assert_eq!(uri.user.as_deref(), Some("+15550123"));
        assert_eq!(uri.to_string(), "sip:+15550123@example.com");
    }

    #[test]
    fn round_trips_with_params_and_headers() {
        let s = "sips:bob@host.net;lr;maddr=10.0.0.1?X-Y=z";
        let uri: Uri = s.parse().unwrap();
        assert_eq!(uri.to_string(), s);
    }

    #[test]
    fn parses_ipv6_host() {
        let uri: Uri = "sip:carol@[2001:db8::1]:5061".parse().unwrap();
        assert_eq!(uri.host, "2001:db8::1");
        assert_eq!(uri.port, Some(5061));
        assert_eq!(uri.to_string(), "sip:carol@[2001:db8::1]:5061");
    }

    #[test]
    fn rejects_garbage() {
        assert!("http://example.com".parse::<Uri>().is_err());
        assert!("sip:@".parse::<Uri>().is_err());
        assert!("sip:user@host:notaport".parse::<Uri>().is_err());
    }
}
