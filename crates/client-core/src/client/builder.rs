//! Builder for [`ClientManager`].

use std::sync::Arc;
use std::time::Duration;

use crate::client::config::{ClientConfig, ReconnectPolicy};
use crate::client::{make_env, ClientManager};
use crate::error::{ClientError, ClientResult};
use crate::media::MediaEngine;
use crate::storage::{AccountStore, CallLogSink, NullAccountStore, NullCallLog};
use crate::transport::TransportFactory;

/// Fluent construction of a [`ClientManager`].
///
/// ```no_run
/// # use std::sync::Arc;
/// # use siprtc_client_core::{ClientBuilder, ClientResult};
/// # async fn example(
/// #     transport: Arc<dyn siprtc_client_core::transport::TransportFactory>,
/// #     media: Arc<dyn siprtc_client_core::media::MediaEngine>,
/// # ) -> ClientResult<()> {
/// let client = ClientBuilder::new()
///     .websocket_url("wss://edge.example.com/ws")
///     .user_agent("MyPhone/2.1")
///     .origin_domain("example.com")
///     .transport_factory(transport)
///     .media_engine(media)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    config: ClientConfig,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    media: Option<Arc<dyn MediaEngine>>,
    account_store: Option<Arc<dyn AccountStore>>,
    call_log: Option<Arc<dyn CallLogSink>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            config: ClientConfig::default(),
            transport_factory: None,
            media: None,
            account_store: None,
            call_log: None,
        }
    }
}

impl ClientBuilder {
    /// Builder with default configuration.
    pub fn new() -> Self {
        ClientBuilder::default()
    }

    /// WebSocket URL accounts connect to.
    pub fn websocket_url(mut self, url: impl Into<String>) -> Self {
        self.config.websocket_url = url.into();
        self
    }

    /// Base User-Agent string.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Domain used for the `Origin` header.
    pub fn origin_domain(mut self, domain: impl Into<String>) -> Self {
        self.config.origin_domain = domain.into();
        self
    }

    /// Keepalive ping interval.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    /// Requested registration expiry in seconds.
    pub fn register_expires(mut self, expires: u32) -> Self {
        self.config.register_expires = expires;
        self
    }

    /// Deadline for one registration attempt.
    pub fn register_timeout(mut self, timeout: Duration) -> Self {
        self.config.register_timeout = timeout;
        self
    }

    /// Reconnection policy.
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Ringtone URIs to pass through to the platform layer.
    pub fn ringtone_uris(mut self, uris: Vec<String>) -> Self {
        self.config.ringtone_uris = uris;
        self
    }

    /// The transport adapter (required).
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// The media engine (required).
    pub fn media_engine(mut self, media: Arc<dyn MediaEngine>) -> Self {
        self.media = Some(media);
        self
    }

    /// Durable account storage; defaults to a no-op store.
    pub fn account_store(mut self, store: Arc<dyn AccountStore>) -> Self {
        self.account_store = Some(store);
        self
    }

    /// Call log sink; defaults to a no-op sink.
    pub fn call_log(mut self, sink: Arc<dyn CallLogSink>) -> Self {
        self.call_log = Some(sink);
        self
    }

    /// Build the manager.
    pub fn build(self) -> ClientResult<Arc<ClientManager>> {
        let transport_factory =
            self.transport_factory
                .ok_or(ClientError::InvalidConfiguration {
                    field: "transport_factory",
                    reason: "a transport factory is required".into(),
                })?;
        let media = self.media.ok_or(ClientError::InvalidConfiguration {
            field: "media_engine",
            reason: "a media engine is required".into(),
        })?;
        if self.config.register_expires == 0 {
            return Err(ClientError::InvalidConfiguration {
                field: "register_expires",
                reason: "must be positive".into(),
            });
        }

        let call_log = self.call_log.unwrap_or_else(|| Arc::new(NullCallLog));
        let account_store = self
            .account_store
            .unwrap_or_else(|| Arc::new(NullAccountStore));
        let env = make_env(self.config, transport_factory, media, call_log);
        Ok(ClientManager::new(env, account_store))
    }
}
