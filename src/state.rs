//! Published connection state.
//!
//! The store keeps the public view of every instance (`is_connected`,
//! `connection_error`, `totp_required`, last stats snapshot) and broadcasts
//! each change. Mutation goes through [`ConnectionStateStore::update`], which
//! applies a closure under the lock so a change for one id is atomic.

use crate::{now_unix, registry::InstanceId};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Disconnected,
    Authenticating,
    TotpPending,
    Connected,
    Renewing,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Authenticating => "authenticating",
            LinkState::TotpPending => "totp pending",
            LinkState::Connected => "connected",
            LinkState::Renewing => "renewing",
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConnectionState {
    pub link: LinkState,
    pub connection_error: Option<String>,
    pub totp_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Value>,
    pub updated_at: u64,
}

impl ConnectionState {
    /// A renewing session is still usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.link, LinkState::Connected | LinkState::Renewing)
    }

    fn same_public_view(&self, other: &Self) -> bool {
        self.link == other.link
            && self.connection_error == other.connection_error
            && self.totp_required == other.totp_required
            && self.stats == other.stats
    }
}

/// One change on the stream; `state` is `None` once the instance is removed.
#[derive(Clone, Debug)]
pub struct StateChange {
    pub id: InstanceId,
    pub state: Option<ConnectionState>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AggregateState {
    pub total: usize,
    pub connected: usize,
    pub errored: usize,
    pub totp_pending: bool,
}

#[derive(Clone)]
pub struct ConnectionStateStore {
    states: Arc<RwLock<HashMap<InstanceId, ConnectionState>>>,
    tx: broadcast::Sender<StateChange>,
}

impl Default for ConnectionStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateStore {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
            tx,
        }
    }

    /// Change stream; slow receivers see `Lagged` and should re-read [`Self::snapshot`].
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn get(&self, id: &InstanceId) -> Option<ConnectionState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<InstanceId, ConnectionState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Creates a disconnected entry when the id has none yet.
    pub fn ensure(&self, id: &InstanceId) {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        if !states.contains_key(id) {
            let state = ConnectionState {
                updated_at: now_unix(),
                ..ConnectionState::default()
            };
            states.insert(id.clone(), state.clone());
            drop(states);
            self.publish(id, Some(state));
        }
    }

    /// Applies `apply` to the state of `id` and publishes the result if the
    /// public view changed. Ids without an entry are left alone, so a late
    /// write cannot bring back a removed instance.
    pub fn update<F>(&self, id: &InstanceId, apply: F) -> Option<ConnectionState>
    where
        F: FnOnce(&mut ConnectionState),
    {
        self.modify(id, |state| {
            apply(state);
            state.clone()
        })
    }

    /// Like [`ConnectionStateStore::update`], returning whatever `apply`
    /// returns. `None` when the id has no entry.
    pub fn modify<F, R>(&self, id: &InstanceId, apply: F) -> Option<R>
    where
        F: FnOnce(&mut ConnectionState) -> R,
    {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        let state = states.get_mut(id)?;
        let before = state.clone();

        let result = apply(state);

        let changed = !state.same_public_view(&before);
        if changed {
            state.updated_at = now_unix();
        }
        let after = state.clone();
        drop(states);

        if changed {
            self.publish(id, Some(after));
        }
        Some(result)
    }

    pub fn remove(&self, id: &InstanceId) {
        let removed = self
            .states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if removed.is_some() {
            self.publish(id, None);
        }
    }

    #[must_use]
    pub fn aggregate(&self) -> AggregateState {
        let states = self.states.read().unwrap_or_else(PoisonError::into_inner);
        states
            .values()
            .fold(AggregateState::default(), |mut acc, state| {
                acc.total += 1;
                if state.is_connected() {
                    acc.connected += 1;
                }
                if state.connection_error.is_some() {
                    acc.errored += 1;
                }
                acc.totp_pending |= state.totp_required;
                acc
            })
    }

    fn publish(&self, id: &InstanceId, state: Option<ConnectionState>) {
        // no subscribers is fine
        if self
            .tx
            .send(StateChange {
                id: id.clone(),
                state,
            })
            .is_err()
        {
            trace!(instance_id = %id, "state change without subscribers");
        }
    }
}

impl std::fmt::Debug for ConnectionStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStateStore")
            .field("instances", &self.snapshot().len())
            .finish_non_exhaustive()
    }
}
