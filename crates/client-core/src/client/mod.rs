//! The client manager: the public call-control surface.
//!
//! [`ClientManager`] owns the account registry (a thread-safe map of
//! account key to signaling-task handle) and translates the public API
//! into commands on the owning task's inbox. State errors come back
//! synchronously; everything asynchronous is observable through the event
//! subscription.

pub mod builder;
pub mod config;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::account::{
    AccountKey, AppMode, Credentials, RegistrationInfo, RegistrationState, RegistrationStats,
};
use crate::call::{CallId, CallInfo, CallState, CallStats};
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, ClientEventHandler, EventDispatcher};
use crate::signaling::{spawn_account_task, AccountCommand, AccountEnv, AccountHandle};
use crate::storage::{AccountStore, StoredAccount};

pub use builder::ClientBuilder;
pub use config::{ClientConfig, ReconnectPolicy};

/// Multiplexes SIP accounts over WebSocket transports and drives their
/// calls.
pub struct ClientManager {
    env: AccountEnv,
    accounts: DashMap<AccountKey, AccountHandle>,
    current: std::sync::RwLock<Option<AccountKey>>,
    account_store: Arc<dyn AccountStore>,
    shut_down: AtomicBool,
}

impl ClientManager {
    pub(crate) fn new(env: AccountEnv, account_store: Arc<dyn AccountStore>) -> Arc<Self> {
        Arc::new(ClientManager {
            env,
            accounts: DashMap::new(),
            current: std::sync::RwLock::new(None),
            account_store,
            shut_down: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> ClientResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ClientError::ShutDown);
        }
        Ok(())
    }

    async fn send_command<T>(
        &self,
        key: &AccountKey,
        make: impl FnOnce(oneshot::Sender<ClientResult<T>>) -> AccountCommand,
    ) -> ClientResult<T> {
        // Clone the sender before awaiting; a DashMap guard must not be
        // held across a suspension point.
        let commands = self
            .accounts
            .get(key)
            .map(|handle| handle.commands.clone())
            .ok_or_else(|| ClientError::AccountNotFound {
                key: key.to_string(),
            })?;
        let (tx, rx) = oneshot::channel();
        commands
            .send(make(tx))
            .await
            .map_err(|_| ClientError::ShutDown)?;
        rx.await.map_err(|_| ClientError::ShutDown)?
    }

    // --- registration ---

    /// Create an account and register it. Resolves once the registrar
    /// reaches a terminal outcome for this attempt.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        domain: &str,
        push_provider: Option<String>,
        push_token: Option<String>,
    ) -> ClientResult<()> {
        self.ensure_running()?;
        let key = AccountKey::new(username, domain)?;
        if self.accounts.contains_key(&key) {
            return Err(ClientError::AccountAlreadyExists {
                key: key.to_string(),
            });
        }

        let credentials = Credentials {
            password: password.to_string(),
            push_token: push_token.clone(),
            push_provider: push_provider.clone(),
        };
        let handle = spawn_account_task(key.clone(), credentials, self.env.clone());
        self.accounts.insert(key.clone(), handle);

        if let Err(e) = self
            .account_store
            .save_account(&StoredAccount {
                username: username.to_string(),
                password: password.to_string(),
                domain: domain.to_string(),
                display_name: None,
                push_token,
                push_provider,
                last_registration_ok: false,
                last_expiry: None,
            })
            .await
        {
            warn!(account = %key, error = %e, "account persist failed");
        }

        let result = self
            .send_command(&key, |reply| AccountCommand::Register { reply })
            .await;
        if result.is_ok() {
            let mut current = self.current.write().expect("current lock");
            if current.is_none() {
                *current = Some(key.clone());
            }
        }
        result
    }

    /// Unregister and destroy an account.
    pub async fn unregister(&self, username: &str, domain: &str) -> ClientResult<()> {
        let key = AccountKey::new(username, domain)?;
        let result = self
            .send_command(&key, |reply| AccountCommand::Unregister { reply })
            .await;

        if let Some((_, handle)) = self.accounts.remove(&key) {
            let _ = handle.commands.send(AccountCommand::Shutdown).await;
            handle.join.abort();
        }
        if let Err(e) = self.account_store.remove_account(&key).await {
            warn!(account = %key, error = %e, "account removal from store failed");
        }

        // Losing the current account re-elects the first registered one.
        {
            let mut current = self.current.write().expect("current lock");
            if current.as_ref() == Some(&key) {
                *current = None;
            }
        }
        let _ = self.current_account();
        result
    }

    /// Re-hydrate accounts from durable storage. Each restored account
    /// starts unregistered and goes through the reconnection path.
    pub async fn restore_accounts(&self) -> ClientResult<usize> {
        self.ensure_running()?;
        let stored = self.account_store.load_accounts().await?;
        let mut restored = 0;
        for record in stored {
            let Ok(key) = AccountKey::new(&record.username, &record.domain) else {
                warn!(username = %record.username, domain = %record.domain, "skipping invalid stored account");
                continue;
            };
            if self.accounts.contains_key(&key) {
                continue;
            }
            let credentials = Credentials {
                password: record.password.clone(),
                push_token: record.push_token.clone(),
                push_provider: record.push_provider.clone(),
            };
            let handle = spawn_account_task(key.clone(), credentials, self.env.clone());
            let commands = handle.commands.clone();
            self.accounts.insert(key.clone(), handle);
            let _ = commands
                .send(AccountCommand::Reconnect { generation: 0 })
                .await;
            info!(account = %key, "account restored from storage");
            restored += 1;
        }
        Ok(restored)
    }

    /// Registration state of one account.
    pub fn registration_state(&self, username: &str, domain: &str) -> ClientResult<RegistrationState> {
        let key = AccountKey::new(username, domain)?;
        self.accounts
            .get(&key)
            .map(|handle| *handle.registration.borrow())
            .ok_or_else(|| ClientError::AccountNotFound {
                key: key.to_string(),
            })
    }

    /// Snapshot of all registrations.
    pub fn registration_infos(&self) -> Vec<RegistrationInfo> {
        self.accounts
            .iter()
            .map(|entry| RegistrationInfo {
                account: entry.key.clone(),
                state: *entry.registration.borrow(),
                expires: None,
                registered_at: None,
                last_error: None,
            })
            .collect()
    }

    /// Aggregate registration counts.
    pub fn registration_stats(&self) -> RegistrationStats {
        let mut stats = RegistrationStats::default();
        for entry in self.accounts.iter() {
            stats.total_accounts += 1;
            match *entry.registration.borrow() {
                RegistrationState::Ok => stats.registered_accounts += 1,
                RegistrationState::Failed => stats.failed_accounts += 1,
                _ => {}
            }
        }
        stats
    }

    /// The account single-account convenience APIs operate on.
    ///
    /// Re-elected as the first registered account when the previous one
    /// went away.
    pub fn current_account(&self) -> Option<AccountKey> {
        {
            let current = self.current.read().expect("current lock");
            if let Some(key) = current.as_ref() {
                if self.accounts.contains_key(key) {
                    return Some(key.clone());
                }
            }
        }
        let elected = self
            .accounts
            .iter()
            .find(|entry| entry.registration.borrow().is_registered())
            .map(|entry| entry.key.clone());
        let mut current = self.current.write().expect("current lock");
        *current = elected.clone();
        elected
    }

    fn require_current(&self) -> ClientResult<AccountKey> {
        self.current_account()
            .ok_or_else(|| ClientError::AccountNotFound {
                key: "<no current account>".to_string(),
            })
    }

    // --- calls ---

    /// Place a call from the current account.
    pub async fn make_call(&self, to: &str) -> ClientResult<CallId> {
        let key = self.require_current()?;
        self.make_call_as(&key, to).await
    }

    /// Place a call from a specific account.
    pub async fn make_call_as(&self, key: &AccountKey, to: &str) -> ClientResult<CallId> {
        self.ensure_running()?;
        let to = to.to_string();
        self.send_command(key, move |reply| AccountCommand::MakeCall { to, reply })
            .await
    }

    /// Which account carries `call_id` (or the current account when
    /// unspecified).
    async fn account_for_call(&self, call_id: Option<CallId>) -> ClientResult<AccountKey> {
        match call_id {
            None => self.require_current(),
            Some(id) => {
                let keys: Vec<AccountKey> =
                    self.accounts.iter().map(|e| e.key.clone()).collect();
                for key in keys {
                    if let Ok(Some(info)) = self.call_info_on(&key).await {
                        if info.call_id == id {
                            return Ok(key);
                        }
                    }
                }
                Err(ClientError::CallNotFound { call_id: id })
            }
        }
    }

    async fn call_info_on(&self, key: &AccountKey) -> ClientResult<Option<CallInfo>> {
        let commands = self
            .accounts
            .get(key)
            .map(|handle| handle.commands.clone())
            .ok_or_else(|| ClientError::AccountNotFound {
                key: key.to_string(),
            })?;
        let (tx, rx) = oneshot::channel();
        commands
            .send(AccountCommand::CallInfo { reply: tx })
            .await
            .map_err(|_| ClientError::ShutDown)?;
        rx.await.map_err(|_| ClientError::ShutDown)
    }

    /// Answer an incoming call.
    pub async fn accept_call(&self, call_id: Option<CallId>) -> ClientResult<()> {
        let key = self.account_for_call(call_id).await?;
        self.send_command(&key, move |reply| AccountCommand::Accept { call_id, reply })
            .await
    }

    /// Decline an incoming call with 603.
    pub async fn decline_call(&self, call_id: Option<CallId>) -> ClientResult<()> {
        let key = self.account_for_call(call_id).await?;
        self.send_command(&key, move |reply| AccountCommand::Decline { call_id, reply })
            .await
    }

    /// Hang up (CANCEL, 603 or BYE depending on phase).
    pub async fn end_call(&self, call_id: Option<CallId>) -> ClientResult<()> {
        let key = self.account_for_call(call_id).await?;
        self.send_command(&key, move |reply| AccountCommand::End { call_id, reply })
            .await
    }

    /// Put the active call on hold.
    pub async fn hold(&self, call_id: Option<CallId>) -> ClientResult<()> {
        let key = self.account_for_call(call_id).await?;
        self.send_command(&key, |reply| AccountCommand::Hold { reply })
            .await
    }

    /// Resume a held call.
    pub async fn resume(&self, call_id: Option<CallId>) -> ClientResult<()> {
        let key = self.account_for_call(call_id).await?;
        self.send_command(&key, |reply| AccountCommand::Resume { reply })
            .await
    }

    /// Mute or unmute the microphone for the active call.
    pub async fn set_muted(&self, muted: bool) -> ClientResult<()> {
        let key = self.account_for_call(None).await?;
        self.send_command(&key, move |reply| AccountCommand::SetMuted { muted, reply })
            .await
    }

    /// Send one DTMF digit with the default duration.
    pub async fn send_dtmf(&self, digit: char) -> ClientResult<()> {
        self.send_dtmf_with_duration(digit, crate::calls::DEFAULT_DTMF_DURATION_MS)
            .await
    }

    /// Send one DTMF digit with an explicit duration.
    pub async fn send_dtmf_with_duration(&self, digit: char, duration_ms: u32) -> ClientResult<()> {
        let key = self.account_for_call(None).await?;
        let digits = digit.to_string();
        self.send_command(&key, move |reply| AccountCommand::Dtmf {
            digits,
            duration_ms,
            reply,
        })
        .await
    }

    /// Send a DTMF digit sequence.
    pub async fn send_dtmf_sequence(&self, digits: &str) -> ClientResult<()> {
        let key = self.account_for_call(None).await?;
        let digits = digits.to_string();
        self.send_command(&key, move |reply| AccountCommand::Dtmf {
            digits,
            duration_ms: crate::calls::DEFAULT_DTMF_DURATION_MS,
            reply,
        })
        .await
    }

    /// Blind transfer of the active call (REFER).
    pub async fn transfer(&self, to: &str, call_id: Option<CallId>) -> ClientResult<()> {
        let key = self.account_for_call(call_id).await?;
        let to = to.to_string();
        self.send_command(&key, move |reply| AccountCommand::Transfer { to, reply })
            .await
    }

    /// Deflect a ringing incoming call with 302.
    pub async fn deflect(&self, to: &str, call_id: Option<CallId>) -> ClientResult<()> {
        let key = self.account_for_call(call_id).await?;
        let to = to.to_string();
        self.send_command(&key, move |reply| AccountCommand::Deflect { to, reply })
            .await
    }

    /// Snapshot of the call on the current (or given) account.
    pub async fn call_info(&self, call_id: Option<CallId>) -> ClientResult<Option<CallInfo>> {
        let key = self.account_for_call(call_id).await.ok();
        match key {
            Some(key) => self.call_info_on(&key).await,
            None => Ok(None),
        }
    }

    /// Aggregate call counts across accounts.
    pub async fn call_stats(&self) -> CallStats {
        let mut stats = CallStats::default();
        let keys: Vec<AccountKey> = self.accounts.iter().map(|e| e.key.clone()).collect();
        for key in keys {
            if let Ok(Some(info)) = self.call_info_on(&key).await {
                if info.state.is_active() {
                    stats.total_active_calls += 1;
                }
                match info.state {
                    CallState::Connected | CallState::StreamsRunning => stats.connected_calls += 1,
                    CallState::IncomingReceived => stats.incoming_pending_calls += 1,
                    _ => {}
                }
            }
        }
        stats
    }

    // --- platform signals ---

    /// Foreground/background switch; re-registers with the push-mode
    /// User-Agent where transports are healthy.
    pub async fn set_app_mode(&self, mode: AppMode) {
        for commands in self.account_senders() {
            let _ = commands.send(AccountCommand::SetMode(mode)).await;
        }
    }

    /// Network availability signal from the platform. `false` parks all
    /// accounts; `true` starts the reconnection path.
    ///
    /// The platform maps its own notion of a default route (dual-SIM, VPN)
    /// onto this boolean.
    pub async fn network_available(&self, up: bool) {
        debug!(up, "network availability changed");
        for commands in self.account_senders() {
            let _ = commands.send(AccountCommand::NetworkChanged(up)).await;
        }
    }

    fn account_senders(&self) -> Vec<tokio::sync::mpsc::Sender<AccountCommand>> {
        self.accounts
            .iter()
            .map(|entry| entry.commands.clone())
            .collect()
    }

    // --- events ---

    /// Subscribe to all client events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.env.events.subscribe()
    }

    /// Install the callback handler.
    pub async fn set_event_handler(&self, handler: Arc<dyn ClientEventHandler>) {
        self.env.events.set_handler(handler).await;
    }

    // --- lifecycle ---

    /// Stop every account task and release the media engine. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("client shutting down");
        let keys: Vec<AccountKey> = self.accounts.iter().map(|e| e.key.clone()).collect();
        for key in keys {
            if let Some((_, handle)) = self.accounts.remove(&key) {
                let _ = handle.commands.send(AccountCommand::Shutdown).await;
                let _ = handle.join.await;
            }
        }
        let _ = self.env.media.dispose().await;
    }
}

/// Shared dispatcher access for the builder.
pub(crate) fn make_env(
    config: ClientConfig,
    transport_factory: Arc<dyn crate::transport::TransportFactory>,
    media: Arc<dyn crate::media::MediaEngine>,
    call_log: Arc<dyn crate::storage::CallLogSink>,
) -> AccountEnv {
    let max_concurrent = config.reconnect.max_concurrent.max(1);
    AccountEnv {
        config: Arc::new(config),
        transport_factory,
        media,
        events: EventDispatcher::new(),
        call_log,
        reconnect_limiter: Arc::new(tokio::sync::Semaphore::new(max_concurrent)),
    }
}
