//! Per-instance transition guard.
//!
//! Every instance has a generation counter. Work that may outlive a user action
//! (authenticate, renew, refresh) takes a [`Ticket`] up front and checks
//! [`Ticket::is_current`] before it writes anything. Activating, deactivating,
//! disconnecting or deleting an instance calls [`TransitionGuard::begin`],
//! which bumps the generation and marks the instance as transitioning until the
//! returned [`TransitionPermit`] is dropped. Scheduled work skips instances
//! that are transitioning.

use crate::registry::InstanceId;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::trace;

#[derive(Debug, Default)]
struct Entry {
    generation: u64,
    active_transitions: usize,
}

#[derive(Debug, Default)]
pub struct TransitionGuard {
    entries: Mutex<HashMap<InstanceId, Entry>>,
}

impl TransitionGuard {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of the current generation for `id`.
    #[must_use]
    pub fn ticket(self: &Arc<Self>, id: &InstanceId) -> Ticket {
        let generation = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map_or(0, |e| e.generation);

        Ticket {
            guard: Arc::clone(self),
            id: id.clone(),
            generation,
        }
    }

    /// Invalidates outstanding tickets and marks `id` as transitioning.
    #[must_use]
    pub fn begin(self: &Arc<Self>, id: &InstanceId) -> TransitionPermit {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(id.clone()).or_default();
        entry.generation = entry.generation.wrapping_add(1);
        entry.active_transitions += 1;
        trace!(instance_id = %id, generation = entry.generation, "transition started");

        TransitionPermit {
            guard: Arc::clone(self),
            id: id.clone(),
        }
    }

    #[must_use]
    pub fn is_transitioning(&self, id: &InstanceId) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .is_some_and(|e| e.active_transitions > 0)
    }

    fn generation(&self, id: &InstanceId) -> u64 {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map_or(0, |e| e.generation)
    }

    fn finish(&self, id: &InstanceId) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(id) {
            entry.active_transitions = entry.active_transitions.saturating_sub(1);
            trace!(instance_id = %id, "transition finished");
        }
    }
}

/// Proof that work started under the current generation of an instance.
#[derive(Debug, Clone)]
pub struct Ticket {
    guard: Arc<TransitionGuard>,
    id: InstanceId,
    generation: u64,
}

impl Ticket {
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.guard.generation(&self.id) == self.generation
    }

    #[must_use]
    pub fn id(&self) -> &InstanceId {
        &self.id
    }
}

/// Held for the duration of a transition.
#[derive(Debug)]
pub struct TransitionPermit {
    guard: Arc<TransitionGuard>,
    id: InstanceId,
}

impl Drop for TransitionPermit {
    fn drop(&mut self) {
        self.guard.finish(&self.id);
    }
}
