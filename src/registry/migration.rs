//! Legacy single-instance configuration support.
//!
//! Before multi-instance support the data file held exactly one server:
//!
//! ```json
//! { "pihole_url": "http://pi.hole", "password": {..}, "master_key": {..},
//!   "remember_password": true, "passwordless": false }
//! ```
//!
//! It is promoted into a one-element collection the first time it is loaded.
//! Encrypted blobs are carried over byte for byte; nothing is re-encrypted.

use super::{storage::RegistryFile, Instance, InstanceId};
use crate::crypto::EncryptedBlob;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize)]
struct LegacyConfig {
    #[serde(default)]
    pihole_url: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    password: Option<EncryptedBlob>,
    #[serde(default)]
    master_key: Option<EncryptedBlob>,
    #[serde(default)]
    remember_password: bool,
    #[serde(default)]
    passwordless: bool,
}

/// Legacy documents have a top-level `pihole_url` and no `instances` array.
#[must_use]
pub fn is_legacy(value: &Value) -> bool {
    value.get("instances").is_none() && value.get("pihole_url").is_some()
}

/// Promote a legacy document into the current format.
///
/// # Errors
/// Returns an error if the legacy document cannot be parsed.
pub fn promote(value: Value) -> Result<RegistryFile> {
    let legacy: LegacyConfig =
        serde_json::from_value(value).context("Failed to parse legacy configuration")?;

    let mut file = RegistryFile::default();

    let url = legacy.pihole_url.trim().to_string();
    if url.is_empty() && legacy.password.is_none() {
        return Ok(file);
    }

    let id = InstanceId::new();
    file.instances.push(Instance {
        id: id.clone(),
        name: legacy.name.filter(|n| !n.trim().is_empty()),
        url,
        passwordless: legacy.passwordless,
        remember_password: legacy.remember_password,
        password: legacy.password,
        master_key: legacy.master_key,
    });
    file.active = Some(id);

    Ok(file)
}
