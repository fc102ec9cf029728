//! Digest authentication (RFC 2617 as profiled by RFC 3261 §22).
//!
//! MD5 and MD5-sess with `qop=auth` are implemented; SHA-256 variants are
//! accepted when a challenge advertises them. The authenticator keeps one
//! nonce-count per (realm, nonce) pair so a refreshed registration reusing
//! a server nonce keeps its count monotonic.

use std::collections::HashMap;
use std::fmt::Write as _;

use rand::Rng;
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};
use crate::types::method::Method;

/// Digest algorithm advertised in a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    /// `MD5` (default when absent)
    Md5,
    /// `MD5-sess`
    Md5Sess,
    /// `SHA-256`
    Sha256,
    /// `SHA-256-sess`
    Sha256Sess,
}

impl DigestAlgorithm {
    /// Wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha256Sess => "SHA-256-sess",
        }
    }

    fn is_session(&self) -> bool {
        matches!(self, DigestAlgorithm::Md5Sess | DigestAlgorithm::Sha256Sess)
    }

    fn hash(&self, data: &str) -> String {
        match self {
            DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess => {
                format!("{:x}", md5::compute(data.as_bytes()))
            }
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => {
                hex::encode(Sha256::digest(data.as_bytes()))
            }
        }
    }
}

/// A parsed `WWW-Authenticate` / `Proxy-Authenticate` digest challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    /// Protection realm
    pub realm: String,
    /// Server nonce
    pub nonce: String,
    /// Offered qop tokens, empty when the challenge carries none
    pub qop: Vec<String>,
    /// Algorithm (MD5 when absent)
    pub algorithm: DigestAlgorithm,
    /// Opaque blob to echo back, if any
    pub opaque: Option<String>,
    /// Whether the server flagged the previous nonce as stale
    pub stale: bool,
}

impl DigestChallenge {
    /// Parse the value of an authenticate header.
    pub fn parse(value: &str) -> Result<DigestChallenge> {
        let value = value.trim();
        let rest = value
            .get(..6)
            .filter(|s| s.eq_ignore_ascii_case("digest"))
            .map(|_| &value[6..])
            .ok_or_else(|| Error::InvalidChallenge(format!("not a digest challenge: {value:?}")))?;

        let mut realm = None;
        let mut nonce = None;
        let mut qop = Vec::new();
        let mut algorithm = DigestAlgorithm::Md5;
        let mut opaque = None;
        let mut stale = false;

        for (name, val) in split_params(rest) {
            match name.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(val),
                "nonce" => nonce = Some(val),
                "qop" => {
                    qop = val
                        .split(',')
                        .map(|q| q.trim().to_ascii_lowercase())
                        .filter(|q| !q.is_empty())
                        .collect()
                }
                "algorithm" => {
                    algorithm = match val.to_ascii_uppercase().as_str() {
                        "MD5" => DigestAlgorithm::Md5,
                        "MD5-SESS" => DigestAlgorithm::Md5Sess,
                        "SHA-256" => DigestAlgorithm::Sha256,
                        "SHA-256-SESS" => DigestAlgorithm::Sha256Sess,
                        other => return Err(Error::UnsupportedAlgorithm(other.to_string())),
                    }
                }
                "opaque" => opaque = Some(val),
                "stale" => stale = val.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        Ok(DigestChallenge {
            realm: realm
                .ok_or_else(|| Error::InvalidChallenge("challenge missing realm".into()))?,
            nonce: nonce
                .ok_or_else(|| Error::InvalidChallenge("challenge missing nonce".into()))?,
            qop,
            algorithm,
            opaque,
            stale,
        })
    }
}

/// Split `k="v", k2=v2` respecting quoted strings; quotes are stripped.
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                entries.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    entries.push(current);

    entries
        .iter()
        .filter_map(|e| e.split_once('='))
        .map(|(k, v)| {
            (
                k.trim().to_string(),
                v.trim().trim_matches('"').to_string(),
            )
        })
        .collect()
}

/// Computes Authorization header values for digest challenges.
///
/// One instance lives per account; it owns the per-(realm, nonce) nonce
/// counters.
#[derive(Debug, Default)]
pub struct DigestAuthenticator {
    counters: HashMap<(String, String), u32>,
}

impl DigestAuthenticator {
    /// Fresh authenticator with no counters.
    pub fn new() -> Self {
        DigestAuthenticator::default()
    }

    /// Answer `challenge` for `method` on `uri`, generating a fresh cnonce.
    ///
    /// Returns the complete header value for `Authorization` /
    /// `Proxy-Authorization`.
    pub fn respond(
        &mut self,
        challenge: &DigestChallenge,
        method: &Method,
        uri: &str,
        username: &str,
        password: &str,
    ) -> Result<String> {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes);
        let cnonce = hex::encode(bytes);
        self.respond_with_cnonce(challenge, method, uri, username, password, &cnonce)
    }

    /// [`DigestAuthenticator::respond`] with a caller-provided cnonce.
    pub fn respond_with_cnonce(
        &mut self,
        challenge: &DigestChallenge,
        method: &Method,
        uri: &str,
        username: &str,
        password: &str,
        cnonce: &str,
    ) -> Result<String> {
        let alg = challenge.algorithm;
        let use_qop = if challenge.qop.is_empty() {
            false
        } else if challenge.qop.iter().any(|q| q == "auth") {
            true
        } else {
            return Err(Error::InvalidChallenge(format!(
                "no supported qop in {:?}",
                challenge.qop
            )));
        };

        let mut ha1 = alg.hash(&format!("{username}:{}:{password}", challenge.realm));
        if alg.is_session() {
            ha1 = alg.hash(&format!("{ha1}:{}:{cnonce}", challenge.nonce));
        }
        let ha2 = alg.hash(&format!("{}:{uri}", method.as_str()));

        let mut header = format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\"",
            challenge.realm, challenge.nonce
        );

        let response = if use_qop {
            let nc = self.next_nonce_count(&challenge.realm, &challenge.nonce);
            let nc_hex = format!("{nc:08x}");
            let response = alg.hash(&format!(
                "{ha1}:{}:{nc_hex}:{cnonce}:auth:{ha2}",
                challenge.nonce
            ));
            write!(header, ", qop=auth, nc={nc_hex}, cnonce=\"{cnonce}\"").expect("write to string");
            response
        } else if alg.is_session() {
            write!(header, ", cnonce=\"{cnonce}\"").expect("write to string");
            alg.hash(&format!("{ha1}:{}:{ha2}", challenge.nonce))
        } else {
            alg.hash(&format!("{ha1}:{}:{ha2}", challenge.nonce))
        };

        write!(header, ", response=\"{response}\", algorithm={}", alg.as_str())
            .expect("write to string");
        if let Some(opaque) = &challenge.opaque {
            write!(header, ", opaque=\"{opaque}\"").expect("write to string");
        }
        Ok(header)
    }

    fn next_nonce_count(&mut self, realm: &str, nonce: &str) -> u32 {
        let counter = self
            .counters
            .entry((realm.to_string(), nonce.to_string()))
            .or_insert(0);
        *counter += 1;
        *counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(value: &str) -> DigestChallenge {
        DigestChallenge::parse(value).unwrap()
    }

    #[test]
    fn parses_challenge_with_quoted_qop() {
        let c = challenge(
            "Digest realm=\"atlanta.example.com\", nonce=\"f84f1cec41e6cbe5aea9c8e88d359\", \
             qop=\"auth,auth-int\", algorithm=MD5, opaque=\"xyz\", stale=true",
        );
        assert_eq!(c.realm, "atlanta.example.com");
        assert_eq!(c.qop, vec!["auth", "auth-int"]);
        assert_eq!(c.algorithm, DigestAlgorithm::Md5);
        assert_eq!(c.opaque.as_deref(), Some("xyz"));
        assert!(c.stale);
    }

    #[test]
    fn rejects_non_digest_and_unknown_algorithm() {
        assert!(DigestChallenge::parse("Basic realm=\"r\"").is_err());
        assert!(DigestChallenge::parse("Digest realm=\"r\", nonce=\"n\", algorithm=TOKEN").is_err());
        assert!(DigestChallenge::parse("Digest nonce=\"n\"").is_err());
    }

    #[test]
    fn rfc2617_reference_vector() {
        // The worked example from RFC 2617 §3.5.
        let c = challenge(
            "Digest realm=\"testrealm@host.com\", qop=\"auth,auth-int\", \
             nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"",
        );
        let mut auth = DigestAuthenticator::new();
        let header = auth
            .respond_with_cnonce(
                &c,
                &Method::Extension("GET".to_string()),
                "/dir/index.html",
                "Mufasa",
                "Circle Of Life",
                "0a4f113b",
            )
            .unwrap();
        assert!(header.contains("response=\"6629fae49393a05397450978507c4ef1\""));
        assert!(header.contains("nc=00000001"));
        assert!(header.contains("qop=auth"));
        assert!(header.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
    }

    #[test]
    fn register_challenge_composition() {
        // REGISTER response composed exactly as the registrar expects:
        // MD5(MD5(user:realm:pw):nonce:nc:cnonce:qop:MD5(method:uri))
        let c = challenge("Digest realm=\"r\", nonce=\"n\", qop=\"auth\"");
        let mut auth = DigestAuthenticator::new();
        let cnonce = "0123456789abcdef0123456789abcdef";
        let header = auth
            .respond_with_cnonce(&c, &Method::Register, "sip:example.com", "alice", "pw", cnonce)
            .unwrap();

        let ha1 = format!("{:x}", md5::compute("alice:r:pw"));
        let ha2 = format!("{:x}", md5::compute("REGISTER:sip:example.com"));
        let expected = format!(
            "{:x}",
            md5::compute(format!("{ha1}:n:00000001:{cnonce}:auth:{ha2}"))
        );
        assert!(header.contains(&format!("response=\"{expected}\"")));
        assert!(header.contains("username=\"alice\""));
        assert!(header.contains("uri=\"sip:example.com\""));
    }

    #[test]
    fn nonce_count_is_monotonic_per_nonce() {
        let c = challenge("Digest realm=\"r\", nonce=\"n\", qop=\"auth\"");
        let mut auth = DigestAuthenticator::new();
        let h1 = auth
            .respond_with_cnonce(&c, &Method::Register, "sip:d", "u", "p", "c")
            .unwrap();
        let h2 = auth
            .respond_with_cnonce(&c, &Method::Register, "sip:d", "u", "p", "c")
            .unwrap();
        assert!(h1.contains("nc=00000001"));
        assert!(h2.contains("nc=00000002"));

        // A different nonce starts a fresh count.
        let c2 = challenge("Digest realm=\"r\", nonce=\"n2\", qop=\"auth\"");
        let h3 = auth
            .respond_with_cnonce(&c2, &Method::Register, "sip:d", "u", "p", "c")
            .unwrap();
        assert!(h3.contains("nc=00000001"));
    }

    #[test]
    fn md5_sess_uses_session_ha1() {
        let c = challenge("Digest realm=\"r\", nonce=\"n\", qop=\"auth\", algorithm=MD5-sess");
        let mut auth = DigestAuthenticator::new();
        let cnonce = "deadbeefdeadbeefdeadbeefdeadbeef";
        let header = auth
            .respond_with_cnonce(&c, &Method::Register, "sip:d", "u", "p", cnonce)
            .unwrap();

        let ha1 = format!("{:x}", md5::compute("u:r:p"));
        let ha1_sess = format!("{:x}", md5::compute(format!("{ha1}:n:{cnonce}")));
        let ha2 = format!("{:x}", md5::compute("REGISTER:sip:d"));
        let expected = format!(
            "{:x}",
            md5::compute(format!("{ha1_sess}:n:00000001:{cnonce}:auth:{ha2}"))
        );
        assert!(header.contains(&format!("response=\"{expected}\"")));
        assert!(header.contains("algorithm=MD5-sess"));
    }

    #[test]
    fn qop_without_auth_is_rejected() {
        let c = challenge("Digest realm=\"r\", nonce=\"n\", qop=\"auth-int\"");
        let mut auth = DigestAuthenticator::new();
        assert!(auth
            .respond_with_cnonce(&c, &Method::Register, "sip:d", "u", "p", "c")
            .is_err());
    }

    #[test]
    fn random_cnonce_is_128_bits() {
        let c = challenge("Digest realm=\"r\", nonce=\"n\", qop=\"auth\"");
        let mut auth = DigestAuthenticator::new();
        let header = auth
            .respond(&c, &Method::Register, "sip:d", "u", "p")
            .unwrap();
        let cnonce = header
            .split("cnonce=\"")
            .nth(1)
            .and_then(|s| s.split('"').next())
            .unwrap();
        assert_eq!(cnonce.len(), 32);
        assert!(cnonce.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
