//! Call model: identifiers, lifecycle states, records and statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::account::AccountKey;

/// Unique identifier for a call, stable across its whole lifecycle.
pub type CallId = Uuid;

/// Call lifecycle state.
///
/// The graph is strict: states only flow forward, `Ended` and `Error` are
/// terminal, and the only escape from a terminal state is the global reset
/// used at shutdown. [`CallState::can_transition_to`] encodes the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// No call activity
    Idle,
    /// Outgoing INVITE sent, nothing heard yet
    OutgoingInit,
    /// 100 Trying received
    OutgoingProgress,
    /// 180/183 received
    OutgoingRinging,
    /// Incoming INVITE waiting for a local decision
    IncomingReceived,
    /// 2xx exchanged and acknowledged; media being set up
    Connected,
    /// Media engine reports the stream is up
    StreamsRunning,
    /// Hold re-INVITE in flight
    Pausing,
    /// Call held locally
    Paused,
    /// Resume re-INVITE in flight
    Resuming,
    /// Teardown in progress (BYE/CANCEL sent or received)
    Ending,
    /// Call finished; terminal
    Ended,
    /// Call failed; terminal
    Error,
}

impl CallState {
    /// Whether the state machine permits moving to `next` from here.
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        if *self == next {
            return false;
        }
        match (*self, next) {
            (Idle, OutgoingInit) | (Idle, IncomingReceived) => true,
            (OutgoingInit, OutgoingProgress)
            | (OutgoingInit, OutgoingRinging)
            | (OutgoingInit, Connected)
            | (OutgoingProgress, OutgoingRinging)
            | (OutgoingProgress, Connected)
            | (OutgoingRinging, Connected)
            | (IncomingReceived, Connected) => true,
            (Connected, StreamsRunning) => true,
            (Connected, Pausing) | (StreamsRunning, Pausing) => true,
            (Pausing, Paused) => true,
            (Paused, Resuming) => true,
            (Resuming, StreamsRunning) => true,
            // teardown and failure from any non-terminal state
            (from, Ending) => !from.is_terminal() && from != Idle,
            (Ending, Ended) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Terminal states have no outgoing edges.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Error)
    }

    /// States in which a call occupies the account's call slot.
    pub fn is_active(&self) -> bool {
        !matches!(self, CallState::Idle) && !self.is_terminal()
    }

    /// States in which DTMF may be dispatched.
    pub fn allows_dtmf(&self) -> bool {
        matches!(self, CallState::Connected | CallState::StreamsRunning)
    }

    /// States before the call is confirmed.
    pub fn is_early(&self) -> bool {
        matches!(
            self,
            CallState::OutgoingInit
                | CallState::OutgoingProgress
                | CallState::OutgoingRinging
                | CallState::IncomingReceived
        )
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Direction of a call from this client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// We sent the INVITE
    Outgoing,
    /// The peer sent the INVITE
    Incoming,
}

/// One observable entry in a call's state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStateRecord {
    /// The call this record belongs to
    pub call_id: CallId,
    /// Account carrying the call
    pub account: AccountKey,
    /// State entered
    pub state: CallState,
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
    /// Local failure reason, for `Error`
    pub error_reason: Option<String>,
    /// SIP status code that drove the transition, when one did
    pub sip_code: Option<u16>,
    /// Reason phrase accompanying `sip_code`
    pub sip_reason: Option<String>,
}

/// Terminal classification recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallLogClass {
    /// Connected and ended normally
    Success,
    /// Ended before connecting (local cancel or failure)
    Aborted,
    /// Incoming call declined locally
    Declined,
    /// Incoming call that was never answered
    Missed,
    /// Incoming call redirected with 302
    Deflected,
}

/// Snapshot of a call for the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInfo {
    /// Stable call identifier
    pub call_id: CallId,
    /// SIP Call-ID on the wire
    pub sip_call_id: String,
    /// Current state
    pub state: CallState,
    /// Direction
    pub direction: CallDirection,
    /// Account carrying the call
    pub account: AccountKey,
    /// Local party URI
    pub local_uri: String,
    /// Remote party URI
    pub remote_uri: String,
    /// Remote display name if the peer sent one
    pub remote_display_name: Option<String>,
    /// When the call object was created
    pub created_at: DateTime<Utc>,
    /// When the call connected, if it did
    pub connected_at: Option<DateTime<Utc>>,
    /// When the call ended, if it has
    pub ended_at: Option<DateTime<Utc>>,
    /// Whether the call is locally held
    pub on_hold: bool,
}

/// Aggregate counts over live calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallStats {
    /// Calls occupying a call slot
    pub total_active_calls: usize,
    /// Calls in `Connected` or `StreamsRunning`
    pub connected_calls: usize,
    /// Calls waiting in `IncomingReceived`
    pub incoming_pending_calls: usize,
}
