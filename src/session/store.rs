//! Volatile session storage.
//!
//! Session tokens never touch disk. They are kept in process memory, sealed
//! under an [`EphemeralKey`] with the instance id as associated data, so a
//! sealed entry cannot be replayed under another instance.

use crate::{
    client::Session,
    crypto::{CipherError, EphemeralKey},
    registry::InstanceId,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};
use tracing::warn;

#[derive(Serialize, Deserialize)]
struct SealedSession {
    sid: String,
    csrf: String,
    validity: u64,
    expires_at: u64,
}

#[derive(Debug)]
pub struct SessionStore {
    key: EphemeralKey,
    entries: RwLock<HashMap<InstanceId, Vec<u8>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            key: EphemeralKey::generate(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// # Errors
    /// Returns an error if the session cannot be sealed.
    pub fn put(&self, id: &InstanceId, session: &Session) -> Result<(), CipherError> {
        let plain = serde_json::to_vec(&SealedSession {
            sid: session.sid.expose_secret().to_string(),
            csrf: session.csrf.expose_secret().to_string(),
            validity: session.validity,
            expires_at: session.expires_at,
        })
        .map_err(|_| CipherError::Encrypt)?;

        let sealed = self.key.seal(&plain, &id.to_string())?;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), sealed);

        Ok(())
    }

    /// The stored session, or `None` when absent or unreadable.
    #[must_use]
    pub fn get(&self, id: &InstanceId) -> Option<Session> {
        let sealed = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()?;

        let opened = match self.key.open(&sealed, &id.to_string()) {
            Ok(opened) => opened,
            Err(e) => {
                warn!(instance_id = %id, "dropping unreadable session: {}", e);
                self.remove(id);
                return None;
            }
        };

        let stored: SealedSession = serde_json::from_slice(&opened).ok()?;
        Some(Session {
            sid: SecretString::from(stored.sid),
            csrf: SecretString::from(stored.csrf),
            validity: stored.validity,
            expires_at: stored.expires_at,
        })
    }

    pub fn remove(&self, id: &InstanceId) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    #[must_use]
    pub fn contains(&self, id: &InstanceId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};

    fn session() -> Session {
        Session::new(
            SecretString::from("sid-1".to_string()),
            SecretString::from("csrf-1".to_string()),
            300,
            1_000,
        )
    }

    #[test]
    fn put_get_remove() -> Result<()> {
        let store = SessionStore::new();
        let id = InstanceId::new();

        store.put(&id, &session())?;
        let restored = store.get(&id).ok_or_else(|| anyhow!("missing session"))?;
        assert_eq!(restored.sid.expose_secret(), "sid-1");
        assert_eq!(restored.expires_at, 1_300);

        assert!(store.remove(&id));
        assert!(store.get(&id).is_none());
        Ok(())
    }

    #[test]
    fn entries_are_bound_to_their_instance() -> Result<()> {
        let store = SessionStore::new();
        let a = InstanceId::new();
        let b = InstanceId::new();
        store.put(&a, &session())?;

        let sealed = store
            .entries
            .read()
            .map_err(|_| anyhow!("poisoned"))?
            .get(&a)
            .cloned()
            .ok_or_else(|| anyhow!("missing"))?;
        store
            .entries
            .write()
            .map_err(|_| anyhow!("poisoned"))?
            .insert(b.clone(), sealed);

        assert!(store.get(&b).is_none());
        assert!(!store.contains(&b));
        Ok(())
    }

    #[test]
    fn stored_bytes_do_not_contain_tokens() -> Result<()> {
        let store = SessionStore::new();
        let id = InstanceId::new();
        store.put(&id, &session())?;

        let sealed = store
            .entries
            .read()
            .map_err(|_| anyhow!("poisoned"))?
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("missing"))?;
        let needle = b"sid-1";
        assert!(!sealed.windows(needle.len()).any(|w| w == needle));
        Ok(())
    }
}
