//! Durable storage of the instance collection.
//!
//! The collection is one JSON document. Writes go to a sibling temp file that
//! is renamed over the original, so a crash never leaves a half-written file.
//! On unix the file is created `0600`: it holds encrypted credentials.

use super::{Instance, InstanceId};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub const FORMAT_VERSION: u32 = 2;
pub const FILE_NAME: &str = "instances.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryFile {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<InstanceId>,
    #[serde(default)]
    pub instances: Vec<Instance>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            active: None,
            instances: Vec::new(),
        }
    }
}

/// Path of the backup written before a legacy file is rewritten.
#[must_use]
pub fn legacy_backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".legacy");
    path.with_file_name(name)
}

/// Reads the raw document; `None` when the file does not exist yet.
///
/// # Errors
/// Returns an error if the file exists but cannot be read or is not JSON.
pub async fn load(path: &Path) -> Result<Option<Value>> {
    let json = match fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    let value = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    Ok(Some(value))
}

/// Atomically replaces the document at `path`.
///
/// # Errors
/// Returns an error if the directory cannot be created or the file cannot be written.
pub async fn save(path: &Path, file: &RegistryFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let json = serde_json::to_vec_pretty(file)?;

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    fs::write(&tmp, json)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }

    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;

    debug!(path = %path.display(), instances = file.instances.len(), "registry saved");

    Ok(())
}

/// Copies the current file aside, keeping an existing backup untouched.
///
/// # Errors
/// Returns an error if the copy fails.
pub async fn backup_legacy(path: &Path) -> Result<PathBuf> {
    let backup = legacy_backup_path(path);
    if fs::try_exists(&backup).await.unwrap_or(false) {
        return Ok(backup);
    }

    fs::copy(path, &backup)
        .await
        .with_context(|| format!("Failed to back up {}", path.display()))?;

    Ok(backup)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join(FILE_NAME)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(FILE_NAME);

        save(&path, &RegistryFile::default()).await.unwrap();

        let value = load(&path).await.unwrap().unwrap();
        assert_eq!(value["version"], FORMAT_VERSION);
        assert!(value["instances"].as_array().unwrap().is_empty());
        assert!(!path.with_file_name("instances.json.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn saved_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FILE_NAME);
        save(&path, &RegistryFile::default()).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FILE_NAME);
        std::fs::write(&path, "{not json").unwrap();
        assert!(load(&path).await.is_err());
    }

    #[test]
    fn backup_path_appends_suffix() {
        let path = Path::new("/data/instances.json");
        assert_eq!(
            legacy_backup_path(path),
            PathBuf::from("/data/instances.json.legacy")
        );
    }
}
