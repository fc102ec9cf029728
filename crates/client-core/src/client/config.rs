//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::account::AppMode;

/// Reconnection policy knobs (see the reconnection controller).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// First backoff delay
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
    /// Attempts before escalating to `Failed`
    pub max_attempts: u32,
    /// Wait after the network comes back before reconnecting
    pub stabilization_window: Duration,
    /// Reconnects allowed to dial concurrently across all accounts
    pub max_concurrent: usize,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            stabilization_window: Duration::from_secs(2),
            max_concurrent: 4,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the n-th attempt (1-based): `min(base * 2^(n-1), cap)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }
}

/// Configuration for the client core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Default WebSocket URL accounts connect to
    pub websocket_url: String,
    /// Base User-Agent string; background mode appends ` Push`
    pub user_agent: String,
    /// Domain for the `Origin` header: `https://telephony.<domain>`
    pub origin_domain: String,
    /// Keepalive ping interval the transport adapter honors
    pub ping_interval: Duration,
    /// Expiry requested in REGISTER
    pub register_expires: u32,
    /// Ceiling applied to the expiry granted by the registrar
    pub max_register_expires: u32,
    /// Refresh this long before the granted expiry
    pub register_safety_margin: Duration,
    /// Deadline for one registration attempt
    pub register_timeout: Duration,
    /// Reconnection policy
    pub reconnect: ReconnectPolicy,
    /// Ringtone URIs passed through to the platform layer
    pub ringtone_uris: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            websocket_url: String::new(),
            user_agent: "siprtc/0.1".to_string(),
            origin_domain: "example.com".to_string(),
            ping_interval: Duration::from_secs(30),
            register_expires: 600,
            max_register_expires: 600,
            register_safety_margin: Duration::from_secs(60),
            register_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            ringtone_uris: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// The `Origin` header value the transport adapter should send.
    pub fn origin(&self) -> String {
        format!("https://telephony.{}", self.origin_domain)
    }

    /// User-Agent for the given app mode; background advertises push
    /// routing with the literal ` Push` suffix.
    pub fn user_agent_for(&self, mode: AppMode) -> String {
        match mode {
            AppMode::Foreground => self.user_agent.clone(),
            AppMode::Background => format!("{} Push", self.user_agent),
        }
    }

    /// Refresh interval for a granted expiry: `min(expires, max) - margin`,
    /// floored at one second.
    pub fn refresh_after(&self, granted_expires: u32) -> Duration {
        let capped = granted_expires.min(self.max_register_expires) as u64;
        let margin = self.register_safety_margin.as_secs();
        Duration::from_secs(capped.saturating_sub(margin).max(1))
    }
}
