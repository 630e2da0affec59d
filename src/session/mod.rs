//! Session lifecycle across all instances.
//!
//! [`SessionManager`] is the context object built once at startup and cloned
//! into every task. It owns one [`InstanceClient`] per instance, the breaker,
//! the volatile session store and the transition guard.
//!
//! Flow Overview:
//! - `connect` resets the breaker (manual only), logs out any live session,
//!   authenticates, then fetches a stats snapshot.
//! - `submit_totp` answers a pending second-factor challenge exactly once.
//! - `keepalive_tick` renews sessions inside the aggressive threshold and
//!   pings the rest; an unauthorized ping falls through to renewal.
//! - `disconnect` clears local state first, then retries the logout call.
//!
//! Results of in-flight work are discarded when the instance transitions
//! (activated, disconnected, deleted) before the work completes.

pub mod guard;
pub mod keepalive;
pub mod store;

use crate::{
    breaker::CircuitBreaker,
    client::{AuthOutcome, InstanceClient, Reauthenticate, Session, TotpCode, TransportOptions},
    error::ApiError,
    registry::{Instance, InstanceId, InstancePatch, InstanceRegistry, NewInstance},
    state::{AggregateState, ConnectionState, ConnectionStateStore, LinkState, StateChange},
};
use async_trait::async_trait;
use guard::{Ticket, TransitionGuard};
use secrecy::SecretString;
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Arc, Mutex, PoisonError, RwLock, Weak},
    time::Duration,
};
use store::SessionStore;
use tokio::{
    sync::{broadcast, Mutex as AsyncMutex, Semaphore},
    task::JoinSet,
    time::sleep,
};
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_SAFE_THRESHOLD_SECONDS: u64 = 60;
pub const DEFAULT_KEEPALIVE_INTERVAL_SECONDS: u64 = 120;
pub const DEFAULT_REFRESH_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_LOGOUT_ATTEMPTS: u32 = 3;
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

const SESSION_EXPIRED: &str = "session expired";

#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    pub transport: TransportOptions,
    /// Sessions with less lifetime than this are at risk.
    pub safe_threshold: Duration,
    pub keepalive_interval: Duration,
    pub refresh_interval: Duration,
    pub breaker_threshold: u32,
    pub logout_attempts: u32,
    pub logout_backoff: Duration,
    /// Upper bound on concurrent per-instance keepalive or refresh work.
    pub max_concurrency: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            transport: TransportOptions::default(),
            safe_threshold: Duration::from_secs(DEFAULT_SAFE_THRESHOLD_SECONDS),
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL_SECONDS),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECONDS),
            breaker_threshold: crate::breaker::DEFAULT_THRESHOLD,
            logout_attempts: DEFAULT_LOGOUT_ATTEMPTS,
            logout_backoff: Duration::from_millis(250),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl LifecycleConfig {
    /// Renewal starts at twice the safe threshold.
    #[must_use]
    pub fn aggressive_threshold(&self) -> Duration {
        self.safe_threshold.saturating_mul(2)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectMode {
    /// User initiated: resets the breaker and is never skipped.
    Manual,
    /// Scheduled or 401-triggered: skipped while the breaker is open.
    Automatic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    TotpRequired,
    /// Automatic attempt not made because the breaker is open.
    Skipped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeepaliveAction {
    Skipped,
    Pinged,
    Renewed,
    Reconnected,
    Failed,
}

struct Inner {
    config: LifecycleConfig,
    registry: InstanceRegistry,
    state: ConnectionStateStore,
    breaker: CircuitBreaker,
    sessions: SessionStore,
    guard: Arc<TransitionGuard>,
    clients: RwLock<HashMap<InstanceId, Arc<InstanceClient>>>,
    auth_locks: Mutex<HashMap<InstanceId, Arc<AsyncMutex<()>>>>,
    reconnect: Mutex<HashSet<InstanceId>>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

/// 401 handler given to every client. Holds the manager weakly: the manager
/// owns the clients.
struct ReauthHook {
    inner: Weak<Inner>,
}

#[async_trait]
impl Reauthenticate for ReauthHook {
    async fn reauthenticate(&self, instance_id: &InstanceId) -> anyhow::Result<bool> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(false);
        };
        let manager = SessionManager { inner };
        Ok(manager.reauthenticate_automatic(instance_id).await)
    }
}

fn storage_error(err: anyhow::Error) -> ApiError {
    match err.downcast::<ApiError>() {
        Ok(api) => api,
        Err(other) => ApiError::Storage(format!("{other:#}")),
    }
}

impl SessionManager {
    pub async fn new(registry: InstanceRegistry, config: LifecycleConfig) -> Self {
        let state = ConnectionStateStore::new();
        for instance in registry.list().await {
            state.ensure(&instance.id);
        }

        Self {
            inner: Arc::new(Inner {
                breaker: CircuitBreaker::new(config.breaker_threshold),
                config,
                registry,
                state,
                sessions: SessionStore::new(),
                guard: TransitionGuard::new(),
                clients: RwLock::new(HashMap::new()),
                auth_locks: Mutex::new(HashMap::new()),
                reconnect: Mutex::new(HashSet::new()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn registry(&self) -> &InstanceRegistry {
        &self.inner.registry
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn state(&self, id: &InstanceId) -> Option<ConnectionState> {
        self.inner.state.get(id)
    }

    #[must_use]
    pub fn states(&self) -> HashMap<InstanceId, ConnectionState> {
        self.inner.state.snapshot()
    }

    #[must_use]
    pub fn aggregate(&self) -> AggregateState {
        self.inner.state.aggregate()
    }

    /// Current session of an instance, if any.
    #[must_use]
    pub fn session(&self, id: &InstanceId) -> Option<Session> {
        self.cached_client(id)
            .and_then(|client| client.session())
            .or_else(|| self.inner.sessions.get(id))
    }

    /// Whether a password can be produced without asking the user.
    pub async fn has_password(&self, id: &InstanceId) -> bool {
        self.inner.registry.has_password(id).await
    }

    /// The client for `id`, built on first use with any stored session restored.
    ///
    /// # Errors
    /// Returns an error if the instance is unknown or its endpoint is invalid.
    pub async fn client(&self, id: &InstanceId) -> Result<Arc<InstanceClient>, ApiError> {
        if let Some(client) = self.cached_client(id) {
            return Ok(client);
        }

        let instance = self
            .inner
            .registry
            .get(id)
            .await
            .ok_or_else(|| ApiError::UnknownInstance(id.to_string()))?;

        let hook: Arc<dyn Reauthenticate> = Arc::new(ReauthHook {
            inner: Arc::downgrade(&self.inner),
        });
        let client = Arc::new(InstanceClient::new(
            id.clone(),
            &instance.url,
            &self.inner.config.transport,
            Some(hook),
        )?);

        if let Some(session) = self.inner.sessions.get(id) {
            client.set_session(Some(session));
        }

        let mut clients = self
            .inner
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(clients.entry(id.clone()).or_insert(client)))
    }

    /// Stores `password` for the instance, then connects manually.
    ///
    /// # Errors
    /// Returns storage errors and everything [`SessionManager::connect`] returns.
    pub async fn connect_with_password(
        &self,
        id: &InstanceId,
        password: &SecretString,
        remember: bool,
    ) -> Result<ConnectOutcome, ApiError> {
        self.inner
            .registry
            .set_password(id, password, remember)
            .await
            .map_err(storage_error)?;

        self.authenticate_with(id, password, None, ConnectMode::Manual)
            .await
    }

    /// Connects with the stored password.
    ///
    /// # Errors
    /// Returns [`ApiError::PasswordRequired`] when no password can be decrypted,
    /// [`ApiError::Cancelled`] when the instance transitioned mid-flight, and
    /// classified authentication or transport errors.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub async fn connect(
        &self,
        id: &InstanceId,
        mode: ConnectMode,
    ) -> Result<ConnectOutcome, ApiError> {
        if mode == ConnectMode::Automatic && self.inner.breaker.is_open(id) {
            info!("circuit breaker open, skipping automatic connect");
            return Ok(ConnectOutcome::Skipped);
        }

        let Some(password) = self.inner.registry.get_decrypted_password(id).await else {
            if self.inner.registry.get(id).await.is_none() {
                return Err(ApiError::UnknownInstance(id.to_string()));
            }
            let message = ApiError::PasswordRequired.user_message();
            self.inner.state.update(id, |s| {
                s.link = LinkState::Disconnected;
                s.connection_error = Some(message);
                s.totp_required = false;
            });
            return Err(ApiError::PasswordRequired);
        };

        self.authenticate_with(id, &password, None, mode).await
    }

    /// Retries a login that is waiting for a second factor.
    ///
    /// # Errors
    /// Returns [`ApiError::InvalidTotp`] for a malformed code, an auth failure
    /// when no challenge is pending, and whatever the login attempt returns.
    #[instrument(skip(self, code, password), fields(instance_id = %id))]
    pub async fn submit_totp(
        &self,
        id: &InstanceId,
        code: &str,
        password: Option<SecretString>,
    ) -> Result<ConnectOutcome, ApiError> {
        let code = TotpCode::parse(code)?;

        let password = match password {
            Some(password) => password,
            None => self
                .inner
                .registry
                .get_decrypted_password(id)
                .await
                .ok_or(ApiError::PasswordRequired)?,
        };

        // one code per challenge: the first submission takes it
        let claimed = self
            .inner
            .state
            .modify(id, |s| {
                let pending = s.totp_required;
                if pending {
                    s.totp_required = false;
                    s.link = LinkState::Authenticating;
                }
                pending
            })
            .unwrap_or(false);
        if !claimed {
            return Err(ApiError::AuthFailed(
                "no login is waiting for a TOTP code".to_string(),
            ));
        }

        self.authenticate_with(id, &password, Some(&code), ConnectMode::Manual)
            .await
    }

    async fn authenticate_with(
        &self,
        id: &InstanceId,
        password: &SecretString,
        totp: Option<&TotpCode>,
        mode: ConnectMode,
    ) -> Result<ConnectOutcome, ApiError> {
        let ticket = self.inner.guard.ticket(id);
        let client = self.client(id).await?;

        let outcome = {
            let lock = self.auth_lock(id);
            let _held = lock.lock().await;

            match mode {
                ConnectMode::Manual => self.inner.breaker.reset(id),
                ConnectMode::Automatic if self.inner.breaker.is_open(id) => {
                    info!(instance_id = %id, "circuit breaker open, skipping automatic connect");
                    return Ok(ConnectOutcome::Skipped);
                }
                ConnectMode::Automatic => {}
            }

            if !ticket.is_current() {
                return Err(ApiError::Cancelled);
            }

            self.publish_if_current(&ticket, |s| {
                s.link = LinkState::Authenticating;
                s.connection_error = None;
            });

            // a second login would leave the first session alive on the server
            self.end_session(&client).await;

            let result = client.authenticate(password, totp).await;
            self.settle_auth(&ticket, &client, result).await?
        };

        if outcome == ConnectOutcome::Connected {
            if let Err(e) = self.refresh(id).await {
                debug!(instance_id = %id, "initial stats fetch failed: {}", e);
            }
        }

        Ok(outcome)
    }

    async fn settle_auth(
        &self,
        ticket: &Ticket,
        client: &InstanceClient,
        result: Result<AuthOutcome, ApiError>,
    ) -> Result<ConnectOutcome, ApiError> {
        let id = ticket.id();

        if !ticket.is_current() {
            debug!(instance_id = %id, "instance changed mid-flight, discarding login result");
            if let Some(session) = client.take_session() {
                if let Err(e) = client.logout_session(&session).await {
                    debug!(instance_id = %id, "logout of discarded session failed: {}", e);
                }
            }
            self.inner.state.update(id, |s| {
                if matches!(s.link, LinkState::Authenticating | LinkState::Renewing) {
                    s.link = LinkState::Disconnected;
                }
            });
            return Err(ApiError::Cancelled);
        }

        match result {
            Ok(AuthOutcome::Authenticated(session)) => {
                if let Err(e) = self.inner.sessions.put(id, &session) {
                    warn!(instance_id = %id, "failed to store session: {}", e);
                }
                if !ticket.is_current() {
                    self.inner.sessions.remove(id);
                    return Err(ApiError::Cancelled);
                }

                self.inner.breaker.record_success(id);
                self.forget_reconnect(id);
                self.publish_if_current(ticket, |s| {
                    s.link = LinkState::Connected;
                    s.connection_error = None;
                    s.totp_required = false;
                });

                info!(instance_id = %id, validity = session.validity, "connected");
                Ok(ConnectOutcome::Connected)
            }
            Ok(AuthOutcome::TotpRequired) => {
                self.publish_if_current(ticket, |s| {
                    s.link = LinkState::TotpPending;
                    s.connection_error = None;
                    s.totp_required = true;
                });

                info!(instance_id = %id, "waiting for TOTP code");
                Ok(ConnectOutcome::TotpRequired)
            }
            Err(e) => {
                if e.is_auth_failure() {
                    self.inner.breaker.record_failure(id);
                }

                let message = e.user_message();
                self.publish_if_current(ticket, |s| {
                    s.link = LinkState::Disconnected;
                    s.connection_error = Some(message);
                    s.totp_required = false;
                });

                warn!(instance_id = %id, "authentication failed: {}", e);
                Err(e)
            }
        }
    }

    /// Replaces the session of a connected instance: logout, then a fresh login
    /// with the stored password. Returns whether the instance is connected again.
    ///
    /// # Errors
    /// Returns the login failure; the instance is then marked disconnected with
    /// "session expired" and retried on later keepalive ticks.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub async fn renew(&self, id: &InstanceId) -> Result<bool, ApiError> {
        let ticket = self.inner.guard.ticket(id);
        let client = self.client(id).await?;

        let lock = self.auth_lock(id);
        let _held = lock.lock().await;

        if self.inner.breaker.is_open(id) {
            info!("circuit breaker open, skipping renewal");
            return Ok(false);
        }
        if !ticket.is_current() {
            return Err(ApiError::Cancelled);
        }

        self.publish_if_current(&ticket, |s| s.link = LinkState::Renewing);

        let Some(password) = self.inner.registry.get_decrypted_password(id).await else {
            self.end_session(&client).await;
            self.expire(&ticket);
            return Err(ApiError::PasswordRequired);
        };

        self.end_session(&client).await;

        let result = client.authenticate(&password, None).await;
        match self.settle_auth(&ticket, &client, result).await {
            Ok(outcome) => Ok(outcome == ConnectOutcome::Connected),
            Err(ApiError::Cancelled) => Err(ApiError::Cancelled),
            Err(e) => {
                self.expire(&ticket);
                Err(e)
            }
        }
    }

    /// Automatic re-authentication after a rejected request.
    async fn reauthenticate_automatic(&self, id: &InstanceId) -> bool {
        if self.inner.guard.is_transitioning(id) {
            debug!(instance_id = %id, "instance in transition, not re-authenticating");
            return false;
        }

        if self.inner.breaker.is_open(id) {
            info!(instance_id = %id, "circuit breaker open, skipping re-authentication");
            self.inner.sessions.remove(id);
            self.expire(&self.inner.guard.ticket(id));
            return false;
        }

        match self.renew(id).await {
            Ok(connected) => connected,
            Err(e) => {
                debug!(instance_id = %id, "re-authentication failed: {}", e);
                false
            }
        }
    }

    /// One keepalive pass over every instance, at most `max_concurrency` at a time.
    pub async fn keepalive_tick(&self, now: u64) -> Vec<(InstanceId, KeepaliveAction)> {
        let ids = self
            .inner
            .registry
            .list()
            .await
            .into_iter()
            .map(|i| i.id)
            .collect();

        self.fan_out(ids, move |manager, id| async move {
            manager.keepalive_instance(&id, now).await
        })
        .await
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    async fn keepalive_instance(&self, id: &InstanceId, now: u64) -> KeepaliveAction {
        if self.inner.guard.is_transitioning(id) {
            debug!("in transition, skipping keepalive");
            return KeepaliveAction::Skipped;
        }
        if self.inner.breaker.is_open(id) {
            debug!("circuit breaker open, skipping keepalive");
            return KeepaliveAction::Skipped;
        }

        let client = match self.client(id).await {
            Ok(client) => client,
            Err(e) => {
                debug!("no client: {}", e);
                return KeepaliveAction::Skipped;
            }
        };

        let Some(session) = client.session() else {
            if !self.reconnect_pending(id) {
                return KeepaliveAction::Skipped;
            }
            return match self.connect(id, ConnectMode::Automatic).await {
                Ok(ConnectOutcome::Connected) => KeepaliveAction::Reconnected,
                Ok(ConnectOutcome::Skipped) => KeepaliveAction::Skipped,
                Ok(ConnectOutcome::TotpRequired) => KeepaliveAction::Failed,
                Err(e) => {
                    debug!("automatic reconnect failed: {}", e);
                    KeepaliveAction::Failed
                }
            };
        };

        let remaining = session.remaining(now);
        if remaining <= self.inner.config.aggressive_threshold().as_secs() {
            debug!(remaining, "session close to expiry, renewing");
            return self.renew_action(id).await;
        }

        match client.ping().await {
            Ok(session) => {
                if let Err(e) = self.inner.sessions.put(id, &session) {
                    warn!("failed to store session: {}", e);
                }
                debug!(remaining = session.remaining(now), "session extended");
                KeepaliveAction::Pinged
            }
            Err(e) if e.is_auth_failure() => {
                debug!("ping rejected, renewing");
                self.renew_action(id).await
            }
            Err(e) => {
                warn!("keepalive ping failed: {}", e);
                KeepaliveAction::Failed
            }
        }
    }

    async fn renew_action(&self, id: &InstanceId) -> KeepaliveAction {
        match self.renew(id).await {
            Ok(true) => KeepaliveAction::Renewed,
            Ok(false) => KeepaliveAction::Skipped,
            Err(e) => {
                warn!(instance_id = %id, "session renewal failed: {}", e);
                KeepaliveAction::Failed
            }
        }
    }

    /// User disconnect. Local state is cleared before the server is told, and
    /// the outcome of the logout call does not change the result.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub async fn disconnect(&self, id: &InstanceId) {
        let _permit = self.inner.guard.begin(id);
        self.forget_reconnect(id);

        let client = match self.client(id).await {
            Ok(client) => Some(client),
            Err(_) => self.cached_client(id),
        };
        let session = client
            .as_ref()
            .and_then(|c| c.take_session())
            .or_else(|| self.inner.sessions.get(id));
        self.inner.sessions.remove(id);

        self.inner.state.update(id, |s| {
            s.link = LinkState::Disconnected;
            s.connection_error = None;
            s.totp_required = false;
            s.stats = None;
        });
        info!("disconnected");

        if let (Some(client), Some(session)) = (client, session) {
            self.logout_with_retry(&client, &session).await;
        }
    }

    async fn logout_with_retry(&self, client: &InstanceClient, session: &Session) {
        let attempts = self.inner.config.logout_attempts.max(1);

        for attempt in 1..=attempts {
            if attempt > 1 {
                let backoff = self
                    .inner
                    .config
                    .logout_backoff
                    .saturating_mul(2u32.saturating_pow(attempt - 2));
                debug!("Backing off for {} ms", backoff.as_millis());
                sleep(backoff).await;
            }

            match client.logout_session(session).await {
                Ok(()) => {
                    debug!(attempt, "server session invalidated");
                    return;
                }
                Err(e) => warn!(attempt, "logout failed: {}", e),
            }
        }

        warn!("giving up on server-side logout after {} attempts", attempts);
    }

    /// Changes the active instance. Scheduled work for the previous and the
    /// new instance is suppressed until the switch is stored.
    ///
    /// # Errors
    /// Returns an error if the instance is unknown or the registry cannot be saved.
    #[instrument(skip(self))]
    pub async fn set_active_instance(&self, id: Option<&InstanceId>) -> Result<(), ApiError> {
        let previous = self.inner.registry.active().await;

        let _previous_permit = previous.as_ref().map(|p| self.inner.guard.begin(p));
        let _next_permit = id
            .filter(|next| previous.as_ref() != Some(*next))
            .map(|next| self.inner.guard.begin(next));

        self.inner
            .registry
            .set_active(id)
            .await
            .map_err(storage_error)?;

        info!(active = ?id.map(ToString::to_string), "active instance changed");
        Ok(())
    }

    /// Fetches and publishes a stats snapshot. `None` when the instance has no
    /// session or is in transition.
    ///
    /// # Errors
    /// Returns classified request errors, and [`ApiError::Cancelled`] when the
    /// instance changed while the request was in flight.
    pub async fn refresh(&self, id: &InstanceId) -> Result<Option<Value>, ApiError> {
        if self.inner.guard.is_transitioning(id) {
            debug!(instance_id = %id, "in transition, skipping refresh");
            return Ok(None);
        }

        let ticket = self.inner.guard.ticket(id);
        let client = self.client(id).await?;
        if !client.has_session() {
            return Ok(None);
        }

        let stats = client.stats_summary().await?;
        if !ticket.is_current() {
            debug!(instance_id = %id, "instance changed mid-flight, dropping stats");
            return Err(ApiError::Cancelled);
        }
        self.publish_if_current(&ticket, |s| s.stats = Some(stats.clone()));

        Ok(Some(stats))
    }

    /// Refreshes every connected instance; returns how many snapshots were published.
    pub async fn refresh_all(&self) -> usize {
        let ids = self
            .inner
            .state
            .snapshot()
            .into_iter()
            .filter(|(_, state)| state.is_connected())
            .map(|(id, _)| id)
            .collect();

        self.fan_out(ids, |manager, id| async move {
            match manager.refresh(&id).await {
                Ok(stats) => stats.is_some(),
                Err(e) => {
                    debug!(instance_id = %id, "stats refresh failed: {}", e);
                    false
                }
            }
        })
        .await
        .into_iter()
        .filter(|(_, refreshed)| *refreshed)
        .count()
    }

    /// # Errors
    /// Returns an error if the endpoint is invalid or the registry cannot be saved.
    pub async fn add_instance(
        &self,
        new: NewInstance,
        password: Option<(SecretString, bool)>,
    ) -> Result<Instance, ApiError> {
        let instance = self
            .inner
            .registry
            .add(new)
            .await
            .map_err(storage_error)?;

        if let Some((password, remember)) = password {
            self.inner
                .registry
                .set_password(&instance.id, &password, remember)
                .await
                .map_err(storage_error)?;
        }

        self.inner.state.ensure(&instance.id);
        Ok(instance)
    }

    /// Applies `patch`. Changing the endpoint or the passwordless flag
    /// disconnects the instance first.
    ///
    /// # Errors
    /// Returns an error if the instance is unknown, the endpoint is invalid or
    /// the registry cannot be saved.
    pub async fn update_instance(
        &self,
        id: &InstanceId,
        patch: InstancePatch,
    ) -> Result<Instance, ApiError> {
        if patch.url.is_some() || patch.passwordless.is_some() {
            self.disconnect(id).await;
            self.drop_client(id);
        }

        self.inner
            .registry
            .update(id, patch)
            .await
            .map_err(storage_error)
    }

    /// Disconnects and removes the instance along with all per-instance state.
    ///
    /// # Errors
    /// Returns an error if the instance is unknown or the registry cannot be saved.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub async fn delete_instance(&self, id: &InstanceId) -> Result<Instance, ApiError> {
        let _permit = self.inner.guard.begin(id);

        self.disconnect(id).await;
        let removed = self
            .inner
            .registry
            .delete(id)
            .await
            .map_err(storage_error)?;

        self.drop_client(id);
        self.inner.breaker.forget(id);
        self.inner.sessions.remove(id);
        self.inner.state.remove(id);
        self.forget_reconnect(id);
        self.inner
            .auth_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);

        Ok(removed)
    }

    async fn fan_out<F, Fut, T>(&self, ids: Vec<InstanceId>, task: F) -> Vec<(InstanceId, T)>
    where
        F: Fn(SessionManager, InstanceId) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.inner.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for id in ids {
            let work = task(self.clone(), id.clone());
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (id, work.await)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!("instance task failed: {}", e),
            }
        }
        results
    }

    /// Drops the current session locally and on the server, once, best effort.
    async fn end_session(&self, client: &InstanceClient) {
        let id = client.id();
        let session = client.take_session().or_else(|| self.inner.sessions.get(id));
        self.inner.sessions.remove(id);

        if let Some(session) = session {
            if let Err(e) = client.logout_session(&session).await {
                debug!(instance_id = %id, "logout of previous session failed: {}", e);
            }
        }
    }

    fn expire(&self, ticket: &Ticket) {
        let id = ticket.id();
        if !ticket.is_current() {
            return;
        }

        self.inner.sessions.remove(id);
        self.inner
            .reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
        self.publish_if_current(ticket, |s| {
            s.link = LinkState::Disconnected;
            s.connection_error = Some(SESSION_EXPIRED.to_string());
        });
    }

    /// Writes state only while `ticket` is current; the check runs under the
    /// state lock so it cannot interleave with a transition's own write.
    fn publish_if_current<F>(&self, ticket: &Ticket, apply: F)
    where
        F: FnOnce(&mut ConnectionState),
    {
        self.inner.state.update(ticket.id(), |s| {
            if ticket.is_current() {
                apply(s);
            }
        });
    }

    fn reconnect_pending(&self, id: &InstanceId) -> bool {
        self.inner
            .reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    fn forget_reconnect(&self, id: &InstanceId) {
        self.inner
            .reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn auth_lock(&self, id: &InstanceId) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .inner
            .auth_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    fn cached_client(&self, id: &InstanceId) -> Option<Arc<InstanceClient>> {
        self.inner
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn drop_client(&self, id: &InstanceId) {
        self.inner
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::storage::FILE_NAME;
    use anyhow::Result;

    async fn manager(dir: &tempfile::TempDir) -> Result<SessionManager> {
        let registry = InstanceRegistry::open(dir.path().join(FILE_NAME)).await?;
        Ok(SessionManager::new(registry, LifecycleConfig::default()).await)
    }

    #[test]
    fn aggressive_threshold_is_twice_safe() {
        let config = LifecycleConfig::default();
        assert_eq!(config.aggressive_threshold(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn connect_unknown_instance_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = manager(&dir).await?;

        let result = manager.connect(&InstanceId::new(), ConnectMode::Manual).await;
        assert!(matches!(result, Err(ApiError::UnknownInstance(_))));
        Ok(())
    }

    #[tokio::test]
    async fn connect_without_password_publishes_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = manager(&dir).await?;
        let instance = manager
            .add_instance(
                NewInstance {
                    name: Some("home".to_string()),
                    url: "http://127.0.0.1:9".to_string(),
                    passwordless: false,
                },
                None,
            )
            .await?;

        let result = manager.connect(&instance.id, ConnectMode::Manual).await;
        assert!(matches!(result, Err(ApiError::PasswordRequired)));

        let state = manager
            .state(&instance.id)
            .ok_or_else(|| anyhow::anyhow!("state missing"))?;
        assert!(!state.is_connected());
        assert!(state.connection_error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn automatic_connect_skipped_while_breaker_open() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = manager(&dir).await?;
        let instance = manager
            .add_instance(
                NewInstance {
                    name: None,
                    url: "http://127.0.0.1:9".to_string(),
                    passwordless: true,
                },
                None,
            )
            .await?;

        for _ in 0..manager.breaker().threshold() {
            manager.breaker().record_failure(&instance.id);
        }

        let outcome = manager.connect(&instance.id, ConnectMode::Automatic).await?;
        assert_eq!(outcome, ConnectOutcome::Skipped);
        Ok(())
    }

    #[tokio::test]
    async fn submit_totp_requires_pending_challenge() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = manager(&dir).await?;
        let instance = manager
            .add_instance(
                NewInstance {
                    name: None,
                    url: "http://127.0.0.1:9".to_string(),
                    passwordless: true,
                },
                None,
            )
            .await?;

        assert!(matches!(
            manager.submit_totp(&instance.id, "12345", None).await,
            Err(ApiError::InvalidTotp)
        ));
        assert!(matches!(
            manager.submit_totp(&instance.id, "123456", None).await,
            Err(ApiError::AuthFailed(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn delete_clears_per_instance_state() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = manager(&dir).await?;
        let instance = manager
            .add_instance(
                NewInstance {
                    name: None,
                    url: "http://127.0.0.1:9".to_string(),
                    passwordless: true,
                },
                None,
            )
            .await?;
        manager.breaker().record_failure(&instance.id);
        assert_eq!(manager.aggregate().total, 1);

        manager.delete_instance(&instance.id).await?;
        assert!(manager.state(&instance.id).is_none());
        assert_eq!(manager.breaker().failure_count(&instance.id), 0);
        assert_eq!(manager.aggregate().total, 0);
        assert!(manager.registry().list().await.is_empty());
        Ok(())
    }
}
