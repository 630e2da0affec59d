use super::open_manager;
use crate::{
    cli::globals::GlobalArgs,
    session::{
        keepalive::{spawn_keepalive, spawn_refresher},
        ConnectMode, ConnectOutcome, SessionManager,
    },
    state::StateChange,
};
use anyhow::Result;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{info, warn};

async fn connect_all(manager: &SessionManager) {
    for instance in manager.registry().list().await {
        if !manager.has_password(&instance.id).await {
            warn!(
                instance_id = %instance.id,
                "no remembered password for {}, run `holeguard connect --remember`",
                instance.display_name()
            );
            continue;
        }

        match manager.connect(&instance.id, ConnectMode::Automatic).await {
            Ok(ConnectOutcome::TotpRequired) => warn!(
                instance_id = %instance.id,
                "{} needs a TOTP code, it will stay disconnected",
                instance.display_name()
            ),
            Ok(outcome) => info!(instance_id = %instance.id, ?outcome, "initial connect"),
            Err(e) => warn!(instance_id = %instance.id, "initial connect failed: {}", e),
        }
    }
}

fn report(change: &StateChange) {
    match &change.state {
        Some(state) => {
            info!(
                instance_id = %change.id,
                link = %state.link,
                error = ?state.connection_error,
                totp_required = state.totp_required,
                "state changed"
            );
            match &state.connection_error {
                Some(error) => println!("{} {} ({error})", change.id, state.link),
                None => println!("{} {}", change.id, state.link),
            }
        }
        None => println!("{} removed", change.id),
    }
}

/// Connects every instance with a remembered password and keeps the sessions
/// alive until Ctrl-C.
///
/// # Errors
/// Returns an error if the registry cannot be opened.
pub async fn handle(globals: &GlobalArgs) -> Result<()> {
    let manager = open_manager(globals).await?;
    let mut changes = manager.subscribe();

    connect_all(&manager).await;

    let (keepalive_tx, keepalive_rx) = mpsc::channel(1);
    let (refresh_tx, refresh_rx) = mpsc::channel(1);
    let keepalive = spawn_keepalive(manager.clone(), keepalive_rx);
    let refresher = spawn_refresher(manager.clone(), refresh_rx);

    let aggregate = manager.aggregate();
    info!(
        total = aggregate.total,
        connected = aggregate.connected,
        "watching instances"
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            change = changes.recv() => match change {
                Ok(change) => report(&change),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "state stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    info!("shutting down");
    let _ = keepalive_tx.send(()).await;
    let _ = refresh_tx.send(()).await;
    for task in [keepalive, refresher] {
        if let Err(e) = task.await {
            warn!("background task ended abnormally: {}", e);
        }
    }

    for (id, state) in manager.states() {
        if state.is_connected() {
            manager.disconnect(&id).await;
        }
    }

    Ok(())
}
