//! Session-scoped master keys.
//!
//! One random master key is generated per process and used to encrypt every
//! password entered during that process. Keys recovered from a remembered blob
//! are cached per instance, since an instance saved in an earlier process was
//! encrypted under that process's key.
//!
//! "Remember password" wraps the master key under [`REMEMBER_ENTROPY`], a fixed
//! value compiled into the binary. Anyone holding the binary and the data file
//! can recover the password. It keeps the plaintext out of the file and nothing
//! more; it is opt-in for that reason.

use crate::{
    crypto::{generate_master_password, MASTER_PASSWORD_LEN},
    registry::InstanceId,
};
use secrecy::SecretString;
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

/// Public, embedded wrapping value for remembered master keys. Not a secret.
pub const REMEMBER_ENTROPY: &str = "holeguard/remember-password/v1/6f1d0c9a4be2e7d3";

#[must_use]
pub fn remember_entropy() -> SecretString {
    SecretString::from(REMEMBER_ENTROPY.to_string())
}

#[derive(Clone, Default)]
pub struct MasterKeyCache {
    session_key: Arc<RwLock<Option<SecretString>>>,
    resolved: Arc<RwLock<HashMap<InstanceId, SecretString>>>,
}

impl MasterKeyCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The master key of this process, generated on first use.
    #[must_use]
    pub fn session_key(&self) -> SecretString {
        if let Some(key) = self
            .session_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return key.clone();
        }

        let mut slot = self
            .session_key
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert_with(|| generate_master_password(MASTER_PASSWORD_LEN))
            .clone()
    }

    #[must_use]
    pub fn get(&self, id: &InstanceId) -> Option<SecretString> {
        self.resolved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn insert(&self, id: InstanceId, key: SecretString) {
        self.resolved
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, key);
    }

    pub fn remove(&self, id: &InstanceId) {
        self.resolved
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

impl std::fmt::Debug for MasterKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKeyCache(***)")
    }
}
