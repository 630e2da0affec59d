use super::{explain, open_manager, resolve, Action};
use crate::{cli::globals::GlobalArgs, registry::NewInstance};
use anyhow::{anyhow, Result};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

fn prompt_optional_password(url: &str) -> Result<Option<SecretString>> {
    let password =
        rpassword::prompt_password(format!("Password for {url} (empty to enter it later): "))?;
    let password = SecretString::from(password);
    Ok((!password.expose_secret().is_empty()).then_some(password))
}

/// Handle the instance actions
///
/// # Errors
/// Returns an error if the registry cannot be read or saved, or the instance is unknown.
pub async fn handle(action: Action, globals: &GlobalArgs) -> Result<()> {
    let manager = open_manager(globals).await?;

    match action {
        Action::InstanceAdd {
            url,
            name,
            passwordless,
            remember,
        } => {
            let password = if passwordless {
                None
            } else {
                prompt_optional_password(&url)?
            };

            let instance = manager
                .add_instance(
                    NewInstance {
                        name,
                        url,
                        passwordless,
                    },
                    password.map(|p| (p, remember)),
                )
                .await
                .map_err(explain)?;

            info!(instance_id = %instance.id, "instance added");
            println!("added {} ({})", instance.display_name(), instance.id);
        }

        Action::InstanceList => {
            let active = manager.registry().active().await;
            for instance in manager.registry().list().await {
                let marker = if active.as_ref() == Some(&instance.id) { "*" } else { " " };
                let password = if instance.passwordless {
                    "passwordless"
                } else if manager.has_password(&instance.id).await {
                    "password remembered"
                } else {
                    "no password"
                };
                println!(
                    "{marker} {}  {}  {}  ({password})",
                    instance.id,
                    instance.display_name(),
                    instance.url
                );
            }
        }

        Action::InstanceRename { instance, name } => {
            let instance = resolve(&manager, Some(&instance)).await?;
            let renamed = manager.registry().rename(&instance.id, name).await?;
            println!("renamed {} to {}", instance.display_name(), renamed.display_name());
        }

        Action::InstanceRemove { instance } => {
            let instance = resolve(&manager, Some(&instance)).await?;
            let removed = manager
                .delete_instance(&instance.id)
                .await
                .map_err(explain)?;
            println!("removed {}", removed.display_name());
        }

        Action::InstanceActivate { instance } => {
            let instance = resolve(&manager, Some(&instance)).await?;
            manager
                .set_active_instance(Some(&instance.id))
                .await
                .map_err(explain)?;
            println!("{} is now active", instance.display_name());
        }

        other => return Err(anyhow!("not an instance action: {other:?}")),
    }

    Ok(())
}
