//! Instance registry.
//!
//! CRUD over the configured instances and their encrypted credentials. The
//! registry is the only owner of [`Instance`] records and the only place that
//! decrypts a stored password.
//!
//! Password lookup order:
//! 1. a master key already resident in this process for the instance,
//! 2. a remembered master key blob, unwrapped with the embedded entropy value,
//! 3. then the password blob itself, decrypted with whichever key was found.
//!
//! A failure at any step means "no password available", never an error.

pub mod master_key;
pub mod migration;
pub mod storage;

use crate::{
    client::transport::normalize_base_url,
    crypto::{self, EncryptedBlob},
    error::ApiError,
};
use anyhow::{anyhow, Context, Result};
use master_key::{remember_entropy, MasterKeyCache};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use storage::RegistryFile;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Stable opaque instance identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub url: String,
    #[serde(default)]
    pub passwordless: bool,
    #[serde(default)]
    pub remember_password: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<EncryptedBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key: Option<EncryptedBlob>,
}

impl Instance {
    /// Name when set, otherwise the endpoint.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

#[derive(Clone, Debug, Default)]
pub struct NewInstance {
    pub name: Option<String>,
    pub url: String,
    pub passwordless: bool,
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Clone, Debug, Default)]
pub struct InstancePatch {
    pub name: Option<Option<String>>,
    pub url: Option<String>,
    pub passwordless: Option<bool>,
}

fn clean_name(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

fn validate_url(url: &str) -> Result<String> {
    let url = url.trim();
    normalize_base_url(url)?;
    Ok(url.to_string())
}

async fn encrypt_blocking(plaintext: SecretString, key: SecretString) -> Result<EncryptedBlob> {
    tokio::task::spawn_blocking(move || crypto::encrypt(plaintext.expose_secret(), &key))
        .await
        .context("encryption task failed")?
        .context("Failed to encrypt credential")
}

async fn decrypt_blocking(blob: EncryptedBlob, key: SecretString) -> Result<SecretString> {
    tokio::task::spawn_blocking(move || crypto::decrypt(&blob, &key))
        .await
        .context("decryption task failed")?
        .context("Failed to decrypt credential")
}

#[derive(Clone)]
pub struct InstanceRegistry {
    file: Arc<RwLock<RegistryFile>>,
    path: Arc<PathBuf>,
    keys: MasterKeyCache,
}

impl InstanceRegistry {
    /// Loads the registry at `path`, promoting a legacy single-instance file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or migrated.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = match storage::load(&path).await? {
            None => RegistryFile::default(),
            Some(value) if migration::is_legacy(&value) => {
                let backup = storage::backup_legacy(&path).await?;
                let file = migration::promote(value)?;
                storage::save(&path, &file).await?;
                info!(
                    backup = %backup.display(),
                    instances = file.instances.len(),
                    "migrated legacy configuration"
                );
                file
            }
            Some(value) => serde_json::from_value(value)
                .with_context(|| format!("Invalid registry file {}", path.display()))?,
        };

        debug!(instances = file.instances.len(), "registry loaded");

        Ok(Self {
            file: Arc::new(RwLock::new(file)),
            path: Arc::new(path),
            keys: MasterKeyCache::new(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn list(&self) -> Vec<Instance> {
        self.file.read().await.instances.clone()
    }

    pub async fn get(&self, id: &InstanceId) -> Option<Instance> {
        self.file
            .read()
            .await
            .instances
            .iter()
            .find(|i| &i.id == id)
            .cloned()
    }

    /// Looks up by id, then by exact name, then by endpoint.
    pub async fn find(&self, key: &str) -> Option<Instance> {
        if let Ok(id) = key.parse::<InstanceId>() {
            return self.get(&id).await;
        }

        let file = self.file.read().await;
        file.instances
            .iter()
            .find(|i| i.name.as_deref() == Some(key))
            .or_else(|| file.instances.iter().find(|i| i.url == key))
            .cloned()
    }

    /// # Errors
    /// Returns an error if the endpoint is empty or the registry cannot be saved.
    #[instrument(skip(self, new), fields(url = %new.url))]
    pub async fn add(&self, new: NewInstance) -> Result<Instance> {
        let instance = Instance {
            id: InstanceId::new(),
            name: clean_name(new.name),
            url: validate_url(&new.url)?,
            passwordless: new.passwordless,
            remember_password: false,
            password: None,
            master_key: None,
        };

        let mut file = self.file.write().await;
        file.instances.push(instance.clone());
        if file.active.is_none() {
            file.active = Some(instance.id.clone());
        }
        storage::save(&self.path, &file).await?;

        info!(instance_id = %instance.id, "instance added");
        Ok(instance)
    }

    /// # Errors
    /// Returns an error if the instance is unknown, the endpoint is invalid or
    /// the registry cannot be saved.
    pub async fn update(&self, id: &InstanceId, patch: InstancePatch) -> Result<Instance> {
        let url = patch.url.as_deref().map(validate_url).transpose()?;

        self.modify(id, |instance| {
            if let Some(name) = patch.name {
                instance.name = clean_name(name);
            }
            if let Some(url) = url {
                instance.url = url;
            }
            if let Some(passwordless) = patch.passwordless {
                instance.passwordless = passwordless;
                if passwordless {
                    instance.password = None;
                    instance.master_key = None;
                }
            }
        })
        .await
    }

    /// # Errors
    /// Returns an error if the instance is unknown or the registry cannot be saved.
    pub async fn rename(&self, id: &InstanceId, name: Option<String>) -> Result<Instance> {
        self.update(
            id,
            InstancePatch {
                name: Some(name),
                ..InstancePatch::default()
            },
        )
        .await
    }

    /// Encrypts `password` under this process's master key. With `remember`,
    /// the master key is stored too, wrapped under the embedded entropy value.
    ///
    /// # Errors
    /// Returns an error if encryption fails, the instance is unknown or the
    /// registry cannot be saved.
    #[instrument(skip(self, password), fields(instance_id = %id))]
    pub async fn set_password(
        &self,
        id: &InstanceId,
        password: &SecretString,
        remember: bool,
    ) -> Result<()> {
        if self.get(id).await.is_none() {
            return Err(ApiError::UnknownInstance(id.to_string()).into());
        }

        let master = self.keys.session_key();
        let blob = encrypt_blocking(password.clone(), master.clone()).await?;
        let wrapped = if remember {
            Some(encrypt_blocking(master.clone(), remember_entropy()).await?)
        } else {
            None
        };

        self.modify(id, |instance| {
            instance.password = Some(blob);
            instance.master_key = wrapped;
            instance.remember_password = remember;
        })
        .await?;
        self.keys.insert(id.clone(), master);

        debug!(remember, "password stored");
        Ok(())
    }

    /// Toggles "remember password" for an already stored password.
    ///
    /// Turning it on needs the master key in memory; when it is not resident
    /// the flag is still recorded and takes effect at the next `set_password`.
    ///
    /// # Errors
    /// Returns an error if the instance is unknown or the registry cannot be saved.
    pub async fn set_remember_password(&self, id: &InstanceId, remember: bool) -> Result<()> {
        let wrapped = match (remember, self.keys.get(id)) {
            (true, Some(master)) => Some(encrypt_blocking(master, remember_entropy()).await?),
            _ => None,
        };

        self.modify(id, |instance| {
            instance.remember_password = remember;
            if !remember {
                instance.master_key = None;
            } else if wrapped.is_some() {
                instance.master_key = wrapped;
            }
        })
        .await
        .map(|_| ())
    }

    /// # Errors
    /// Returns an error if the instance is unknown or the registry cannot be saved.
    pub async fn forget_password(&self, id: &InstanceId) -> Result<()> {
        self.modify(id, |instance| {
            instance.password = None;
            instance.master_key = None;
            instance.remember_password = false;
        })
        .await?;
        self.keys.remove(id);
        Ok(())
    }

    /// Removes the instance; the active selection moves to the first remaining one.
    ///
    /// # Errors
    /// Returns an error if the instance is unknown or the registry cannot be saved.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub async fn delete(&self, id: &InstanceId) -> Result<Instance> {
        let mut file = self.file.write().await;
        let index = file
            .instances
            .iter()
            .position(|i| &i.id == id)
            .ok_or_else(|| ApiError::UnknownInstance(id.to_string()))?;

        let removed = file.instances.remove(index);
        if file.active.as_ref() == Some(id) {
            file.active = file.instances.first().map(|i| i.id.clone());
        }
        storage::save(&self.path, &file).await?;
        drop(file);

        self.keys.remove(id);
        info!("instance removed");
        Ok(removed)
    }

    pub async fn active(&self) -> Option<InstanceId> {
        self.file.read().await.active.clone()
    }

    /// # Errors
    /// Returns an error if the instance is unknown or the registry cannot be saved.
    pub async fn set_active(&self, id: Option<&InstanceId>) -> Result<()> {
        let mut file = self.file.write().await;
        if let Some(id) = id {
            if !file.instances.iter().any(|i| &i.id == id) {
                return Err(ApiError::UnknownInstance(id.to_string()).into());
            }
        }
        file.active = id.cloned();
        storage::save(&self.path, &file).await
    }

    /// Whether a password can be produced for the instance without prompting.
    pub async fn has_password(&self, id: &InstanceId) -> bool {
        self.get_decrypted_password(id).await.is_some()
    }

    /// Decrypted password, or `None` when no key or blob is available.
    /// Passwordless instances yield an empty password.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub async fn get_decrypted_password(&self, id: &InstanceId) -> Option<SecretString> {
        let instance = self.get(id).await?;

        if instance.passwordless {
            return Some(SecretString::from(String::new()));
        }

        let blob = instance.password?;

        let master = match self.keys.get(id) {
            Some(key) => key,
            None => {
                let wrapped = instance
                    .master_key
                    .filter(|_| instance.remember_password)?;
                match decrypt_blocking(wrapped, remember_entropy()).await {
                    Ok(key) => {
                        self.keys.insert(id.clone(), key.clone());
                        key
                    }
                    Err(e) => {
                        warn!("remembered master key unusable: {:#}", e);
                        return None;
                    }
                }
            }
        };

        match decrypt_blocking(blob, master).await {
            Ok(password) => Some(password),
            Err(e) => {
                warn!("stored password unusable: {:#}", e);
                None
            }
        }
    }

    async fn modify<F>(&self, id: &InstanceId, apply: F) -> Result<Instance>
    where
        F: FnOnce(&mut Instance),
    {
        let mut file = self.file.write().await;
        let instance = file
            .instances
            .iter_mut()
            .find(|i| &i.id == id)
            .ok_or_else(|| anyhow!(ApiError::UnknownInstance(id.to_string())))?;

        apply(instance);
        let updated = instance.clone();

        storage::save(&self.path, &file).await?;
        Ok(updated)
    }
}

impl fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    fn new_instance(name: &str, url: &str) -> NewInstance {
        NewInstance {
            name: Some(name.to_string()),
            url: url.to_string(),
            passwordless: false,
        }
    }

    #[tokio::test]
    async fn add_persists_and_selects_first_active() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(storage::FILE_NAME);

        let registry = InstanceRegistry::open(&path).await?;
        let a = registry.add(new_instance("home", "http://pi.hole")).await?;
        let b = registry.add(new_instance("lab", "https://10.0.0.2")).await?;
        assert_eq!(registry.active().await, Some(a.id.clone()));

        let reopened = InstanceRegistry::open(&path).await?;
        assert_eq!(reopened.list().await.len(), 2);
        assert_eq!(
            reopened.find("lab").await.map(|i| i.id),
            Some(b.id.clone())
        );
        assert_eq!(
            reopened.find(&b.id.to_string()).await.map(|i| i.id),
            Some(b.id)
        );
        Ok(())
    }

    #[tokio::test]
    async fn empty_url_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = InstanceRegistry::open(dir.path().join("r.json")).await?;
        assert!(registry.add(new_instance("x", "  ")).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn password_roundtrip_in_same_process() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = InstanceRegistry::open(dir.path().join("r.json")).await?;
        let instance = registry.add(new_instance("home", "http://pi.hole")).await?;

        assert!(registry.get_decrypted_password(&instance.id).await.is_none());

        registry
            .set_password(&instance.id, &secret("hunter2"), false)
            .await?;
        let password = registry
            .get_decrypted_password(&instance.id)
            .await
            .ok_or_else(|| anyhow!("password should be available"))?;
        assert_eq!(password.expose_secret(), "hunter2");

        let stored = registry
            .get(&instance.id)
            .await
            .ok_or_else(|| anyhow!("missing"))?;
        assert!(stored.password.is_some());
        assert!(stored.master_key.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn password_unavailable_without_resolvable_master_key() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("r.json");

        let registry = InstanceRegistry::open(&path).await?;
        let instance = registry.add(new_instance("home", "http://pi.hole")).await?;
        registry
            .set_password(&instance.id, &secret("hunter2"), false)
            .await?;

        // a new process has a new master key and nothing remembered
        let reopened = InstanceRegistry::open(&path).await?;
        assert!(reopened.get_decrypted_password(&instance.id).await.is_none());
        assert!(!reopened.has_password(&instance.id).await);
        Ok(())
    }

    #[tokio::test]
    async fn remembered_password_survives_restart() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("r.json");

        let registry = InstanceRegistry::open(&path).await?;
        let instance = registry.add(new_instance("home", "http://pi.hole")).await?;
        registry
            .set_password(&instance.id, &secret("hunter2"), true)
            .await?;

        let reopened = InstanceRegistry::open(&path).await?;
        let password = reopened
            .get_decrypted_password(&instance.id)
            .await
            .ok_or_else(|| anyhow!("remembered password should decrypt"))?;
        assert_eq!(password.expose_secret(), "hunter2");

        // plaintext never hits the file
        let raw = std::fs::read_to_string(&path)?;
        assert!(!raw.contains("hunter2"));
        Ok(())
    }

    #[tokio::test]
    async fn forgetting_remember_drops_wrapped_key() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("r.json");

        let registry = InstanceRegistry::open(&path).await?;
        let instance = registry.add(new_instance("home", "http://pi.hole")).await?;
        registry
            .set_password(&instance.id, &secret("hunter2"), true)
            .await?;
        registry.set_remember_password(&instance.id, false).await?;

        // still available in this process
        assert!(registry.has_password(&instance.id).await);

        let reopened = InstanceRegistry::open(&path).await?;
        assert!(!reopened.has_password(&instance.id).await);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_password_blob_is_unavailable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("r.json");

        let registry = InstanceRegistry::open(&path).await?;
        let instance = registry.add(new_instance("home", "http://pi.hole")).await?;
        registry
            .set_password(&instance.id, &secret("hunter2"), true)
            .await?;

        let mut value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        value["instances"][0]["password"]["ciphertext"] = json!("AAAAAAAAAAAAAAAAAAAAAAAAAAAA");
        std::fs::write(&path, serde_json::to_vec(&value)?)?;

        let reopened = InstanceRegistry::open(&path).await?;
        assert!(reopened.get_decrypted_password(&instance.id).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn passwordless_yields_empty_password() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = InstanceRegistry::open(dir.path().join("r.json")).await?;
        let instance = registry
            .add(NewInstance {
                name: None,
                url: "http://pi.hole".to_string(),
                passwordless: true,
            })
            .await?;

        let password = registry
            .get_decrypted_password(&instance.id)
            .await
            .ok_or_else(|| anyhow!("passwordless yields a password"))?;
        assert!(password.expose_secret().is_empty());
        assert_eq!(instance.display_name(), "http://pi.hole");
        Ok(())
    }

    #[tokio::test]
    async fn delete_moves_active_selection() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = InstanceRegistry::open(dir.path().join("r.json")).await?;
        let a = registry.add(new_instance("a", "http://a")).await?;
        let b = registry.add(new_instance("b", "http://b")).await?;

        registry.delete(&a.id).await?;
        assert_eq!(registry.active().await, Some(b.id.clone()));
        assert!(registry.get(&a.id).await.is_none());

        let err = registry
            .delete(&a.id)
            .await
            .err()
            .ok_or_else(|| anyhow!("expected error"))?;
        assert!(matches!(
            err.downcast_ref::<ApiError>(),
            Some(ApiError::UnknownInstance(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn rename_and_update() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = InstanceRegistry::open(dir.path().join("r.json")).await?;
        let a = registry.add(new_instance("a", "http://a")).await?;

        let renamed = registry.rename(&a.id, Some("  kitchen ".to_string())).await?;
        assert_eq!(renamed.name.as_deref(), Some("kitchen"));

        let updated = registry
            .update(
                &a.id,
                InstancePatch {
                    url: Some("https://pi.lan/admin".to_string()),
                    ..InstancePatch::default()
                },
            )
            .await?;
        assert_eq!(updated.url, "https://pi.lan/admin");
        assert_eq!(updated.display_name(), "kitchen");
        Ok(())
    }

    #[tokio::test]
    async fn legacy_file_is_migrated_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(storage::FILE_NAME);

        let key = master_key::remember_entropy();
        let master = crypto::generate_master_password(crypto::MASTER_PASSWORD_LEN);
        let legacy = json!({
            "pihole_url": "http://pi.hole",
            "password": crypto::encrypt("hunter2", &master)?,
            "master_key": crypto::encrypt(master.expose_secret(), &key)?,
            "remember_password": true,
            "passwordless": false
        });
        std::fs::write(&path, serde_json::to_vec(&legacy)?)?;

        let registry = InstanceRegistry::open(&path).await?;
        let instances = registry.list().await;
        assert_eq!(instances.len(), 1);
        let id = instances[0].id.clone();
        assert_eq!(registry.active().await, Some(id.clone()));

        let password = registry
            .get_decrypted_password(&id)
            .await
            .ok_or_else(|| anyhow!("migrated password should decrypt"))?;
        assert_eq!(password.expose_secret(), "hunter2");
        assert!(storage::legacy_backup_path(&path).exists());

        // second load keeps the same instance rather than migrating again
        let reopened = InstanceRegistry::open(&path).await?;
        let again = reopened.list().await;
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, id);
        Ok(())
    }
}
