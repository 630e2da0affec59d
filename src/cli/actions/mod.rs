pub mod instance;
pub mod session;
pub mod watch;

use crate::{
    cli::globals::GlobalArgs,
    error::ApiError,
    registry::{Instance, InstanceRegistry},
    session::SessionManager,
};
use anyhow::{anyhow, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingChange {
    pub enabled: bool,
    /// Seconds until the server reverts the change.
    pub timer: Option<u64>,
}

#[derive(Debug)]
pub enum Action {
    InstanceAdd {
        url: String,
        name: Option<String>,
        passwordless: bool,
        remember: bool,
    },
    InstanceList,
    InstanceRename {
        instance: String,
        name: Option<String>,
    },
    InstanceRemove {
        instance: String,
    },
    InstanceActivate {
        instance: String,
    },
    Connect {
        instance: Option<String>,
        totp: Option<String>,
        remember: bool,
    },
    Disconnect {
        instance: Option<String>,
    },
    Status,
    Stats {
        instance: Option<String>,
    },
    Blocking {
        instance: Option<String>,
        change: Option<BlockingChange>,
    },
    Watch,
}

impl Action {
    /// # Errors
    /// Returns the error of the action that ran.
    pub async fn execute(self, globals: &GlobalArgs) -> Result<()> {
        match self {
            Action::InstanceAdd { .. }
            | Action::InstanceList
            | Action::InstanceRename { .. }
            | Action::InstanceRemove { .. }
            | Action::InstanceActivate { .. } => instance::handle(self, globals).await,
            Action::Connect { .. }
            | Action::Disconnect { .. }
            | Action::Status
            | Action::Stats { .. }
            | Action::Blocking { .. } => session::handle(self, globals).await,
            Action::Watch => watch::handle(globals).await,
        }
    }
}

/// Opens the registry under the data dir and builds the manager around it.
pub(crate) async fn open_manager(globals: &GlobalArgs) -> Result<SessionManager> {
    let registry = InstanceRegistry::open(globals.registry_path()).await?;
    Ok(SessionManager::new(registry, globals.lifecycle_config()).await)
}

/// Resolves an id, name or URL; `None` selects the active instance.
pub(crate) async fn resolve(manager: &SessionManager, key: Option<&str>) -> Result<Instance> {
    let registry = manager.registry();
    match key {
        Some(key) => registry
            .find(key)
            .await
            .ok_or_else(|| anyhow!("no instance matches '{key}'")),
        None => {
            let id = registry
                .active()
                .await
                .ok_or_else(|| anyhow!("no active instance, pass --instance or run `instance activate`"))?;
            registry
                .get(&id)
                .await
                .ok_or_else(|| anyhow!("active instance {id} no longer exists"))
        }
    }
}

/// Keeps the classified error as the cause under its user-facing sentence.
pub(crate) fn explain(e: ApiError) -> anyhow::Error {
    let message = e.user_message();
    anyhow::Error::new(e).context(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NewInstance;

    #[tokio::test]
    async fn resolve_by_key_and_active() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let globals = GlobalArgs::new(dir.path());
        let manager = open_manager(&globals).await?;

        let err = resolve(&manager, None).await.err();
        assert!(err.is_some());

        let added = manager
            .add_instance(
                NewInstance {
                    name: Some("den".to_string()),
                    url: "http://10.0.0.9".to_string(),
                    passwordless: true,
                },
                None,
            )
            .await?;

        assert_eq!(resolve(&manager, None).await?.id, added.id);
        assert_eq!(resolve(&manager, Some("den")).await?.id, added.id);
        assert!(resolve(&manager, Some("attic")).await.is_err());
        Ok(())
    }

    #[test]
    fn explain_keeps_cause() {
        let e = explain(ApiError::Timeout);
        assert_eq!(
            e.to_string(),
            "The Pi-hole did not answer in time. It may be busy or offline."
        );
        assert!(e.downcast_ref::<ApiError>().is_some());
    }
}
