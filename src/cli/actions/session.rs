//! One-shot session commands.
//!
//! Sessions live only as long as the process, so every command here logs in,
//! does its work and logs out again. Only remembered passwords survive between
//! runs; anything else is prompted for.

use super::{explain, open_manager, resolve, Action, BlockingChange};
use crate::{
    cli::globals::GlobalArgs,
    error::ApiError,
    now_unix,
    registry::Instance,
    session::{ConnectMode, ConnectOutcome, SessionManager},
};
use anyhow::{anyhow, Context, Result};
use secrecy::SecretString;
use tracing::{debug, info};

fn prompt_password(instance: &Instance) -> Result<SecretString> {
    let password =
        rpassword::prompt_password(format!("Password for {}: ", instance.display_name()))
            .context("failed to read password")?;
    Ok(SecretString::from(password))
}

fn prompt_totp() -> Result<String> {
    rpassword::prompt_password("TOTP code: ").context("failed to read TOTP code")
}

/// Logs in manually, prompting for whatever is missing.
pub(crate) async fn login(
    manager: &SessionManager,
    instance: &Instance,
    totp: Option<&str>,
    remember: bool,
) -> Result<()> {
    let id = &instance.id;

    let mut entered = None;
    let outcome = match manager.connect(id, ConnectMode::Manual).await {
        Err(ApiError::PasswordRequired) => {
            let password = prompt_password(instance)?;
            let outcome = manager
                .connect_with_password(id, &password, remember)
                .await
                .map_err(explain)?;
            entered = Some(password);
            outcome
        }
        other => other.map_err(explain)?,
    };

    if remember && entered.is_none() && !instance.passwordless {
        manager.registry().set_remember_password(id, true).await?;
    }

    match outcome {
        ConnectOutcome::Connected => Ok(()),
        ConnectOutcome::TotpRequired => {
            let code = match totp {
                Some(code) => code.to_string(),
                None => prompt_totp()?,
            };
            match manager
                .submit_totp(id, &code, entered)
                .await
                .map_err(explain)?
            {
                ConnectOutcome::Connected => Ok(()),
                other => Err(anyhow!("login did not complete: {other:?}")),
            }
        }
        ConnectOutcome::Skipped => Err(anyhow!("login was not attempted")),
    }
}

async fn show_status(manager: &SessionManager) -> Result<()> {
    let active = manager.registry().active().await;
    let instances = manager.registry().list().await;

    for instance in &instances {
        if !manager.has_password(&instance.id).await {
            continue;
        }
        match manager.connect(&instance.id, ConnectMode::Automatic).await {
            Ok(outcome) => debug!(instance_id = %instance.id, ?outcome, "status probe"),
            Err(e) => debug!(instance_id = %instance.id, "status probe failed: {}", e),
        }
    }

    for instance in &instances {
        let marker = if active.as_ref() == Some(&instance.id) { "*" } else { " " };
        let state = manager.state(&instance.id).unwrap_or_default();
        let detail = state
            .connection_error
            .as_deref()
            .map(|e| format!("  {e}"))
            .unwrap_or_default();
        println!(
            "{marker} {:<24} {:<14}{detail}",
            instance.display_name(),
            state.link.to_string()
        );
    }

    let aggregate = manager.aggregate();
    println!(
        "{}/{} connected, {} with errors{}",
        aggregate.connected,
        aggregate.total,
        aggregate.errored,
        if aggregate.totp_pending { ", TOTP pending" } else { "" }
    );

    for instance in &instances {
        if manager.state(&instance.id).is_some_and(|s| s.is_connected()) {
            manager.disconnect(&instance.id).await;
        }
    }

    Ok(())
}

async fn show_blocking(
    manager: &SessionManager,
    instance: &Instance,
    change: Option<BlockingChange>,
) -> Result<()> {
    let client = manager.client(&instance.id).await.map_err(explain)?;
    let status = match change {
        Some(change) => {
            info!(
                instance_id = %instance.id,
                enabled = change.enabled,
                timer = ?change.timer,
                "changing blocking"
            );
            client.set_blocking(change.enabled, change.timer).await
        }
        None => client.blocking_status().await,
    }
    .map_err(explain)?;

    match status.timer {
        Some(timer) => println!(
            "{}: blocking {} (reverts in {:.0}s)",
            instance.display_name(),
            status.blocking,
            timer
        ),
        None => println!("{}: blocking {}", instance.display_name(), status.blocking),
    }
    Ok(())
}

/// Handle the session actions
///
/// # Errors
/// Returns an error if the instance is unknown, the login fails or the request fails.
pub async fn handle(action: Action, globals: &GlobalArgs) -> Result<()> {
    let manager = open_manager(globals).await?;

    match action {
        Action::Connect {
            instance,
            totp,
            remember,
        } => {
            let instance = resolve(&manager, instance.as_deref()).await?;
            login(&manager, &instance, totp.as_deref(), remember).await?;

            let validity = manager
                .session(&instance.id)
                .map(|s| s.remaining(now_unix()))
                .unwrap_or_default();
            println!(
                "logged in to {} (session valid for {validity}s)",
                instance.display_name()
            );
            manager.disconnect(&instance.id).await;
        }

        Action::Disconnect { instance } => {
            let instance = resolve(&manager, instance.as_deref()).await?;
            manager.disconnect(&instance.id).await;
            manager.registry().forget_password(&instance.id).await?;
            println!("forgot the password of {}", instance.display_name());
        }

        Action::Status => show_status(&manager).await?,

        Action::Stats { instance } => {
            let instance = resolve(&manager, instance.as_deref()).await?;
            login(&manager, &instance, None, false).await?;

            let result = manager.refresh(&instance.id).await;
            manager.disconnect(&instance.id).await;

            let stats = result
                .map_err(explain)?
                .ok_or_else(|| anyhow!("no stats available"))?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Action::Blocking { instance, change } => {
            let instance = resolve(&manager, instance.as_deref()).await?;
            login(&manager, &instance, None, false).await?;

            let result = show_blocking(&manager, &instance, change).await;
            manager.disconnect(&instance.id).await;
            result?;
        }

        other => return Err(anyhow!("not a session action: {other:?}")),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NewInstance;
    use serde_json::json;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn can_bind_localhost() -> bool {
        std::net::TcpListener::bind("127.0.0.1:0").is_ok()
    }

    async fn passwordless_instance(
        globals: &GlobalArgs,
        url: String,
    ) -> Result<(SessionManager, Instance)> {
        let manager = open_manager(globals).await?;
        let instance = manager
            .add_instance(
                NewInstance {
                    name: Some("lab".to_string()),
                    url,
                    passwordless: true,
                },
                None,
            )
            .await
            .map_err(explain)?;
        Ok((manager, instance))
    }

    async fn mount_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/auth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "session": {
                    "valid": true,
                    "totp": false,
                    "sid": "cli-sid",
                    "csrf": "cli-csrf",
                    "validity": 300
                }
            })))
            .mount(server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/auth"))
            .respond_with(ResponseTemplate::new(204))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/stats/summary"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "queries": { "total": 7 } })),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn blocking_change_logs_in_and_out() -> Result<()> {
        if !can_bind_localhost() {
            return Ok(());
        }
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/dns/blocking"))
            .and(header("X-FTL-SID", "cli-sid"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "blocking": "disabled", "timer": 60.0 })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir()?;
        let globals = GlobalArgs::new(dir.path());
        passwordless_instance(&globals, server.uri()).await?;

        handle(
            Action::Blocking {
                instance: Some("lab".to_string()),
                change: Some(BlockingChange {
                    enabled: false,
                    timer: Some(60),
                }),
            },
            &globals,
        )
        .await?;

        let requests = server.received_requests().await.unwrap_or_default();
        let last = requests
            .last()
            .ok_or_else(|| anyhow!("no requests recorded"))?;
        assert_eq!(last.method.as_str(), "DELETE");
        Ok(())
    }

    #[tokio::test]
    async fn login_connects_passwordless_instance() -> Result<()> {
        if !can_bind_localhost() {
            return Ok(());
        }
        let server = MockServer::start().await;
        mount_login(&server).await;

        let dir = tempfile::tempdir()?;
        let globals = GlobalArgs::new(dir.path());
        let (manager, instance) = passwordless_instance(&globals, server.uri()).await?;

        login(&manager, &instance, None, false).await?;
        assert!(manager
            .state(&instance.id)
            .is_some_and(|s| s.is_connected()));

        manager.disconnect(&instance.id).await;
        assert!(manager.session(&instance.id).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn rejected_login_is_explained() -> Result<()> {
        if !can_bind_localhost() {
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "session": { "valid": false, "totp": false, "message": "password incorrect" }
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir()?;
        let globals = GlobalArgs::new(dir.path());
        let (manager, instance) = passwordless_instance(&globals, server.uri()).await?;

        let err = login(&manager, &instance, None, false)
            .await
            .err()
            .ok_or_else(|| anyhow!("expected error"))?;
        assert_eq!(err.to_string(), "Wrong password or 2FA code.");
        assert!(matches!(
            err.downcast_ref::<ApiError>(),
            Some(ApiError::AuthFailed(_))
        ));
        Ok(())
    }
}
