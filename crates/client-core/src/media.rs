//! Media engine contract.
//!
//! The media engine (WebRTC in production) is a single-instance resource
//! shared by all accounts: initialized lazily when the first call needs it,
//! disposed when no active call remains. SDP crosses this boundary as
//! opaque text; the signaling side never edits it.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::ClientResult;

/// Events the media engine reports back to call control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// The peer connection reached its connected state
    Connected,
    /// The peer connection closed or failed
    Closed,
    /// Remote audio became available
    RemoteAudioAvailable,
    /// The active audio device changed
    AudioDeviceChanged {
        /// Identifier of the now-active device
        device: String,
    },
}

/// Contract to the external media engine.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Bring the engine up. Idempotent.
    async fn initialize(&self) -> ClientResult<()>;

    /// Whether the engine is currently initialized.
    fn is_initialized(&self) -> bool;

    /// Produce a local SDP offer.
    async fn create_offer(&self) -> ClientResult<String>;

    /// Produce a local SDP answer to `remote_sdp`.
    async fn create_answer(&self, remote_sdp: &str) -> ClientResult<String>;

    /// Apply the peer's SDP.
    async fn set_remote_description(&self, sdp: &str) -> ClientResult<()>;

    /// Mute or unmute the local microphone.
    async fn set_muted(&self, muted: bool) -> ClientResult<()>;

    /// Enable or disable audio playout.
    async fn set_audio_enabled(&self, enabled: bool) -> ClientResult<()>;

    /// Inject DTMF tones. Returns `false` when the engine cannot send them
    /// (the caller then falls back to SIP INFO).
    async fn send_dtmf(&self, digits: &str, duration_ms: u32, gap_ms: u32) -> ClientResult<bool>;

    /// Produce a re-offer with audio paused (`sendonly` or `inactive`).
    async fn hold_local(&self) -> ClientResult<String>;

    /// Produce a re-offer restoring `sendrecv`.
    async fn resume_local(&self) -> ClientResult<String>;

    /// Tear the engine down. Idempotent.
    async fn dispose(&self) -> ClientResult<()>;

    /// Subscribe to engine events.
    fn subscribe(&self) -> broadcast::Receiver<MediaEvent>;
}
