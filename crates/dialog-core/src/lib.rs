//! # siprtc-dialog-core
//!
//! Dialog and transaction state for the siprtc stack, per RFC 3261 §12 and
//! §17, specialized for reliable message-framed transports: no
//! retransmission timers, correlation by Via branch, and timer B/F as the
//! only clock.
//!
//! The transaction layer and the dialog table live together because the
//! dialog layer is the transaction user and both share the wire types; the
//! split points are [`TransactionRegistry`] (request/response correlation
//! plus timeout) and [`DialogStore`] (established dialog identity, CSeq
//! bookkeeping, route sets).

pub mod dialog;
pub mod errors;
pub mod store;
pub mod transaction;

pub use dialog::{Dialog, DialogId, DialogRequestTemplate, DialogState};
pub use errors::{DialogError, DialogResult};
pub use store::DialogStore;
pub use transaction::{
    TransactionEvent, TransactionKey, TransactionKind, TransactionRegistry, TransactionState,
    DEFAULT_TRANSACTION_TIMEOUT,
};
