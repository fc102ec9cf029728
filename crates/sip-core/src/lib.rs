//! # siprtc-sip-core
//!
//! SIP wire codec for the siprtc stack: message types, parsing and
//! serialization per RFC 3261 framing, a minimal SDP model, and digest
//! authentication (RFC 2617 / RFC 3261 §22).
//!
//! The transports this stack runs over are reliable, message-framed
//! WebSockets (RFC 7118), so the codec works on whole text frames: one
//! frame in, one [`Message`] out.
//!
//! ## Parsing
//!
//! ```rust
//! use siprtc_sip_core::{parse_message, Message, Method, HeaderAccess};
//!
//! let frame = "BYE sip:bob@example.com SIP/2.0\r\n\
//!     Via: SIP/2.0/WS client.invalid;branch=z9hG4bK74bf9\r\n\
//!     From: <sip:alice@example.com>;tag=9fxced76sl\r\n\
//!     To: <sip:bob@example.com>;tag=8321234356\r\n\
//!     Call-ID: 3848276298220188511\r\n\
//!     CSeq: 60 BYE\r\n\
//!     Content-Length: 0\r\n\r\n";
//!
//! let message = parse_message(frame).expect("valid SIP message");
//! let request = message.as_request().expect("a request");
//! assert_eq!(request.method, Method::Bye);
//! assert_eq!(request.cseq().unwrap().seq, 60);
//! ```
//!
//! ## Building
//!
//! ```rust
//! use siprtc_sip_core::{Address, Method, RequestBuilder, Uri};
//!
//! let register = RequestBuilder::new(Method::Register, "sip:example.com").unwrap()
//!     .via("client.invalid", "WS", "z9hG4bKnashds7")
//!     .from(Address::new(Uri::sip("alice", "example.com")).with_tag("a73kszlfl"))
//!     .to(Address::new(Uri::sip("alice", "example.com")))
//!     .call_id("register-1")
//!     .cseq(1)
//!     .expires(600)
//!     .build();
//! assert!(register.to_string().starts_with("REGISTER sip:example.com SIP/2.0\r\n"));
//! ```
//!
//! Round-trip guarantee: parsing any message this crate serialized yields
//! an equal in-memory value.

pub mod auth;
pub mod builder;
pub mod error;
pub mod parser;
pub mod sdp;
pub mod types;

pub use auth::{DigestAlgorithm, DigestAuthenticator, DigestChallenge};
pub use builder::{RequestBuilder, ResponseBuilder};
pub use error::{Error, Result};
pub use parser::parse_message;
pub use sdp::{MediaDescription, MediaDirection, SdpSession};
pub use types::{
    generate_branch, generate_tag, Address, CSeq, Contact, Header, HeaderAccess, HeaderName,
    Message, Method, Param, Request, Response, Scheme, StatusCode, Uri, Via, BRANCH_MAGIC_COOKIE,
};
