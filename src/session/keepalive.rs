//! Background keepalive and stats refresh loops.
//!
//! Both loops sleep for a jittered interval (90-110% of the configured one) so
//! several processes watching the same servers do not fire in lockstep. Each
//! loop stops when its shutdown channel yields or is dropped.

use super::{KeepaliveAction, SessionManager};
use crate::now_unix;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};

fn jittered(interval: Duration, rng: &mut StdRng) -> Duration {
    let factor: u32 = rng.gen_range(90..110);
    interval.saturating_mul(factor) / 100
}

/// Spawns the keepalive loop.
pub fn spawn_keepalive(manager: SessionManager, mut shutdown: mpsc::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        let interval = manager.config().keepalive_interval;

        info!(
            interval_seconds = interval.as_secs(),
            "keepalive started"
        );

        loop {
            let wait = jittered(interval, &mut rng);

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("keepalive stopped");
                    break;
                }
                () = sleep(wait) => {
                    let results = manager.keepalive_tick(now_unix()).await;

                    let count = |action: KeepaliveAction| {
                        results.iter().filter(|(_, a)| *a == action).count()
                    };
                    let failed = count(KeepaliveAction::Failed);
                    if failed > 0 {
                        warn!(failed, "keepalive tick had failures");
                    }

                    debug!(
                        instances = results.len(),
                        pinged = count(KeepaliveAction::Pinged),
                        renewed = count(KeepaliveAction::Renewed),
                        reconnected = count(KeepaliveAction::Reconnected),
                        next_tick_seconds = wait.as_secs(),
                        "keepalive tick complete"
                    );
                }
            }
        }
    })
}

/// Spawns the stats refresh loop.
pub fn spawn_refresher(manager: SessionManager, mut shutdown: mpsc::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        let interval = manager.config().refresh_interval;

        loop {
            let wait = jittered(interval, &mut rng);

            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("refresher stopped");
                    break;
                }
                () = sleep(wait) => {
                    let refreshed = manager.refresh_all().await;
                    debug!(refreshed, "stats refreshed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registry::{storage::FILE_NAME, InstanceRegistry},
        session::LifecycleConfig,
    };
    use anyhow::Result;

    #[test]
    fn jitter_stays_in_band() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let wait = jittered(Duration::from_secs(100), &mut rng);
            assert!(wait >= Duration::from_secs(90));
            assert!(wait < Duration::from_secs(110));
        }
    }

    #[tokio::test]
    async fn loops_stop_on_shutdown() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = InstanceRegistry::open(dir.path().join(FILE_NAME)).await?;
        let config = LifecycleConfig {
            keepalive_interval: Duration::from_millis(10),
            refresh_interval: Duration::from_millis(10),
            ..LifecycleConfig::default()
        };
        let manager = SessionManager::new(registry, config).await;

        let (keepalive_tx, keepalive_rx) = mpsc::channel(1);
        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        let keepalive = spawn_keepalive(manager.clone(), keepalive_rx);
        let refresher = spawn_refresher(manager, refresh_rx);

        // let a few empty ticks run
        sleep(Duration::from_millis(50)).await;

        keepalive_tx.send(()).await?;
        drop(refresh_tx);

        tokio::time::timeout(Duration::from_secs(2), keepalive).await??;
        tokio::time::timeout(Duration::from_secs(2), refresher).await??;
        Ok(())
    }
}
