//! Event surface: broadcast subscriptions plus an optional handler trait.
//!
//! Subscribers get every event over a broadcast channel; an application
//! that prefers callbacks installs a [`ClientEventHandler`]. The handler's
//! answer to an incoming call lets simple apps auto-accept or auto-decline
//! without driving the call API themselves.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::account::{AccountKey, RegistrationState};
use crate::call::{CallId, CallStateRecord};

/// Capacity of the broadcast channel; laggards lose oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Registration change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationStatusInfo {
    /// Account whose registration changed
    pub account: AccountKey,
    /// New state
    pub state: RegistrationState,
    /// Failure or transition reason, when one exists
    pub reason: Option<String>,
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
}

/// Incoming call notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCallInfo {
    /// Account the INVITE arrived on
    pub account: AccountKey,
    /// The new call's id
    pub call_id: CallId,
    /// Caller URI
    pub from: String,
    /// Caller display name, if sent
    pub display_name: Option<String>,
    /// When the INVITE arrived
    pub timestamp: DateTime<Utc>,
}

/// Transport-level notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportStatusInfo {
    /// Session opened
    Connected {
        /// Affected account
        account: AccountKey,
    },
    /// Session closed or failed
    Disconnected {
        /// Affected account
        account: AccountKey,
        /// Close code when the transport reported one
        code: Option<u16>,
        /// Reason text
        reason: String,
    },
    /// A reconnect attempt is scheduled
    Reconnecting {
        /// Affected account
        account: AccountKey,
        /// 1-based attempt number
        attempt: u32,
    },
}

/// Everything observable from the outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// An account's registration state changed
    RegistrationStateChanged(RegistrationStatusInfo),
    /// A call entered a new state
    CallStateChanged(CallStateRecord),
    /// A new incoming call is ringing
    IncomingCall(IncomingCallInfo),
    /// Transport opened/closed/reconnecting
    Transport(TransportStatusInfo),
    /// The active audio device changed
    AudioDeviceChanged {
        /// Identifier of the now-active device
        device: String,
    },
}

/// What to do with an incoming call the handler was asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    /// Answer immediately
    Accept,
    /// Send 603 Decline
    Decline,
    /// Leave it ringing for the call-control API
    Ignore,
}

/// Callback surface for applications that prefer a handler over a
/// subscription.
#[async_trait]
pub trait ClientEventHandler: Send + Sync {
    /// Decide what to do with an incoming call. Default: leave it ringing.
    async fn on_incoming_call(&self, _info: IncomingCallInfo) -> CallAction {
        CallAction::Ignore
    }

    /// A call changed state.
    async fn on_call_state_changed(&self, _record: CallStateRecord) {}

    /// An account's registration changed.
    async fn on_registration_state_changed(&self, _info: RegistrationStatusInfo) {}

    /// The transport opened, closed, or is reconnecting.
    async fn on_transport_event(&self, _info: TransportStatusInfo) {}
}

/// Fan-out point for events: broadcast channel plus optional handler.
#[derive(Clone)]
pub struct EventDispatcher {
    sender: broadcast::Sender<ClientEvent>,
    handler: Arc<RwLock<Option<Arc<dyn ClientEventHandler>>>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventDispatcher {
            sender,
            handler: Arc::new(RwLock::new(None)),
        }
    }
}

impl EventDispatcher {
    /// New dispatcher with no subscribers.
    pub fn new() -> Self {
        EventDispatcher::default()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    /// Install (or replace) the handler.
    pub async fn set_handler(&self, handler: Arc<dyn ClientEventHandler>) {
        *self.handler.write().await = Some(handler);
    }

    /// Currently installed handler, if any.
    pub async fn handler(&self) -> Option<Arc<dyn ClientEventHandler>> {
        self.handler.read().await.clone()
    }

    /// Emit a registration change.
    pub async fn emit_registration(&self, info: RegistrationStatusInfo) {
        debug!(account = %info.account, state = %info.state, "registration state changed");
        let _ = self
            .sender
            .send(ClientEvent::RegistrationStateChanged(info.clone()));
        if let Some(handler) = self.handler().await {
            handler.on_registration_state_changed(info).await;
        }
    }

    /// Emit a call state record.
    pub async fn emit_call_state(&self, record: CallStateRecord) {
        debug!(call_id = %record.call_id, state = %record.state, "call state changed");
        let _ = self.sender.send(ClientEvent::CallStateChanged(record.clone()));
        if let Some(handler) = self.handler().await {
            handler.on_call_state_changed(record).await;
        }
    }

    /// Emit an incoming call and collect the handler's decision.
    pub async fn emit_incoming_call(&self, info: IncomingCallInfo) -> CallAction {
        let _ = self.sender.send(ClientEvent::IncomingCall(info.clone()));
        match self.handler().await {
            Some(handler) => handler.on_incoming_call(info).await,
            None => CallAction::Ignore,
        }
    }

    /// Emit a transport event.
    pub async fn emit_transport(&self, info: TransportStatusInfo) {
        let _ = self.sender.send(ClientEvent::Transport(info.clone()));
        if let Some(handler) = self.handler().await {
            handler.on_transport_event(info).await;
        }
    }

    /// Emit an audio-device change.
    pub async fn emit_audio_device_changed(&self, device: String) {
        let _ = self.sender.send(ClientEvent::AudioDeviceChanged { device });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_delivers_to_subscribers() {
        let dispatcher = EventDispatcher::new();
        let mut rx = dispatcher.subscribe();
        let account = AccountKey::new("alice", "example.com").unwrap();
        dispatcher
            .emit_registration(RegistrationStatusInfo {
                account: account.clone(),
                state: RegistrationState::Ok,
                reason: None,
                timestamp: Utc::now(),
            })
            .await;
        match rx.recv().await.unwrap() {
            ClientEvent::RegistrationStateChanged(info) => {
                assert_eq!(info.account, account);
                assert_eq!(info.state, RegistrationState::Ok);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_decides_incoming_calls() {
        struct Decliner;
        #[async_trait]
        impl ClientEventHandler for Decliner {
            async fn on_incoming_call(&self, _info: IncomingCallInfo) -> CallAction {
                CallAction::Decline
            }
        }

        let dispatcher = EventDispatcher::new();
        let info = IncomingCallInfo {
            account: AccountKey::new("bob", "example.com").unwrap(),
            call_id: CallId::new_v4(),
            from: "sip:alice@example.com".into(),
            display_name: None,
            timestamp: Utc::now(),
        };
        assert_eq!(
            dispatcher.emit_incoming_call(info.clone()).await,
            CallAction::Ignore
        );
        dispatcher.set_handler(Arc::new(Decliner)).await;
        assert_eq!(
            dispatcher.emit_incoming_call(info).await,
            CallAction::Decline
        );
    }
}
