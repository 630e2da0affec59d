use crate::{
    client::TransportOptions,
    registry::storage::FILE_NAME,
    session::LifecycleConfig,
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub data_dir: PathBuf,
    pub timeout: Duration,
    pub keepalive_interval: Duration,
    pub safe_threshold: Duration,
    pub breaker_threshold: u32,
    pub accept_invalid_certs: bool,
}

/// `<platform data dir>/holeguard`, or `.holeguard` when the platform has none.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from(".holeguard"),
        |dir| dir.join(env!("CARGO_PKG_NAME")),
    )
}

impl GlobalArgs {
    #[must_use]
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let defaults = LifecycleConfig::default();
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            timeout: defaults.transport.timeout,
            keepalive_interval: defaults.keepalive_interval,
            safe_threshold: defaults.safe_threshold,
            breaker_threshold: defaults.breaker_threshold,
            accept_invalid_certs: defaults.transport.accept_invalid_certs,
        }
    }

    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join(FILE_NAME)
    }

    #[must_use]
    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            transport: TransportOptions {
                timeout: self.timeout,
                accept_invalid_certs: self.accept_invalid_certs,
                ..TransportOptions::default()
            },
            safe_threshold: self.safe_threshold,
            keepalive_interval: self.keepalive_interval,
            breaker_threshold: self.breaker_threshold,
            ..LifecycleConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_args() {
        let args = GlobalArgs::new("/tmp/holeguard");
        assert_eq!(
            args.registry_path(),
            PathBuf::from("/tmp/holeguard/instances.json")
        );
        assert_eq!(args.timeout, Duration::from_secs(10));
        assert!(!args.accept_invalid_certs);
    }

    #[test]
    fn test_lifecycle_config() {
        let mut args = GlobalArgs::new("/tmp/holeguard");
        args.safe_threshold = Duration::from_secs(30);
        args.timeout = Duration::from_secs(2);
        args.accept_invalid_certs = true;

        let config = args.lifecycle_config();
        assert_eq!(config.aggressive_threshold(), Duration::from_secs(60));
        assert_eq!(config.transport.timeout, Duration::from_secs(2));
        assert!(config.transport.accept_invalid_certs);
        assert_eq!(config.transport.user_agent, crate::APP_USER_AGENT);
    }
}
