//! Via header values and branch generation.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::uri::Param;

/// Magic cookie every RFC 3261 branch starts with.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// A single Via header value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Via {
    /// Transport token from the sent-protocol (`WS`, `WSS`, `UDP`, ...)
    pub transport: String,
    /// sent-by host with optional port
    pub sent_by: String,
    /// Via parameters in source order (`branch`, `received`, `rport`, ...)
    pub params: Vec<Param>,
}

impl Via {
    /// New Via with a branch parameter.
    pub fn new(
        sent_by: impl Into<String>,
        transport: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Via {
            transport: transport.into(),
            sent_by: sent_by.into(),
            params: vec![Param::new("branch", branch.into())],
        }
    }

    /// The branch parameter, if present.
    pub fn branch(&self) -> Option<&str> {
        self.param("branch")
    }

    /// The `received` parameter, if present.
    pub fn received(&self) -> Option<&str> {
        self.param("received")
    }

    fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .and_then(|p| p.value.as_deref())
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.sent_by)?;
        for p in &self.params {
            write!(f, ";{p}")?;
        }
        Ok(())
    }
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let rest = s
            .strip_prefix("SIP/2.0/")
            .ok_or_else(|| Error::MalformedHeader(format!("Via missing protocol: {s:?}")))?;
        let (transport, rest) = rest
            .split_once(' ')
            .ok_or_else(|| Error::MalformedHeader(format!("Via missing sent-by: {s:?}")))?;
        let mut parts = rest.split(';');
        let sent_by = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::MalformedHeader(format!("Via missing sent-by: {s:?}")))?;
        let params = parts
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(Param::parse)
            .collect();
        Ok(Via {
            transport: transport.trim().to_string(),
            sent_by: sent_by.to_string(),
            params,
        })
    }
}

/// Generate a fresh transaction branch: the RFC 3261 magic cookie followed
/// by 64 bits of randomness.
pub fn generate_branch() -> String {
    let mut rng = rand::thread_rng();
    format!("{BRANCH_MAGIC_COOKIE}{:016x}", rng.gen::<u64>())
}

/// Generate a from/to tag: 32 bits of randomness in hex.
pub fn generate_tag() -> String {
    let mut rng = rand::thread_rng();
    format!("{:08x}", rng.gen::<u32>())
}
