//! Typed SIP message model.

pub mod address;
pub mod contact;
pub mod cseq;
pub mod header;
pub mod message;
pub mod method;
pub mod status;
pub mod uri;
pub mod via;

pub use address::Address;
pub use contact::Contact;
pub use cseq::CSeq;
pub use header::{Header, HeaderName};
pub use message::{HeaderAccess, Message, Request, Response};
pub use method::Method;
pub use status::StatusCode;
pub use uri::{Param, Scheme, Uri};
pub use via::{generate_branch, generate_tag, Via, BRANCH_MAGIC_COOKIE};
