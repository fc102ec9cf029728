//! # siprtc-client-core
//!
//! SIP user-agent coordination layer for the siprtc stack: multiplexes one
//! or more SIP accounts over WebSocket transports, drives WebRTC-backed
//! audio sessions through a narrow media contract, and presents a small
//! call-control surface (register, place, answer, hold, transfer, DTMF,
//! hang up).
//!
//! # Architecture
//!
//! ```text
//! client-core -> dialog-core (dialogs + transactions) -> sip-core (codec)
//! ```
//!
//! Each account gets one signaling task that owns every piece of mutable
//! account state; the public [`ClientManager`] API talks to those tasks
//! over bounded command channels. The transport (WebSocket) and the media
//! engine (WebRTC) are injected behind the [`transport::TransportFactory`]
//! and [`media::MediaEngine`] contracts, which keeps the core free of
//! sockets and audio devices.
//!
//! # Getting started
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn example(
//! #     transport: Arc<dyn siprtc_client_core::transport::TransportFactory>,
//! #     media: Arc<dyn siprtc_client_core::media::MediaEngine>,
//! # ) -> siprtc_client_core::ClientResult<()> {
//! use siprtc_client_core::ClientBuilder;
//!
//! let client = ClientBuilder::new()
//!     .websocket_url("wss://edge.example.com/ws")
//!     .user_agent("MyPhone/2.1")
//!     .transport_factory(transport)
//!     .media_engine(media)
//!     .build()?;
//!
//! client.register("alice", "secret", "example.com", None, None).await?;
//! let call = client.make_call("+15550123").await?;
//! client.send_dtmf('5').await?;
//! client.end_call(Some(call)).await?;
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod call;
pub mod client;
pub mod error;
pub mod events;
pub mod media;
pub mod storage;
pub mod transport;

mod calls;
mod reconnect;
mod registrar;
mod signaling;

pub use account::{
    AccountKey, AppMode, Credentials, RegistrationInfo, RegistrationState, RegistrationStats,
};
pub use call::{
    CallDirection, CallId, CallInfo, CallLogClass, CallState, CallStateRecord, CallStats,
};
pub use client::{ClientBuilder, ClientConfig, ClientManager, ReconnectPolicy};
pub use error::{ClientError, ClientResult};
pub use events::{
    CallAction, ClientEvent, ClientEventHandler, IncomingCallInfo, RegistrationStatusInfo,
    TransportStatusInfo,
};
pub use media::{MediaEngine, MediaEvent};
pub use storage::{AccountStore, CallLogEntry, CallLogSink, StoredAccount};
pub use transport::{SignalingTransport, TransportEvent, TransportFactory};
