//! Background maintenance tasks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::domain::GracePeriodStore;

/// Configuration for the grace-period pruner
#[derive(Debug, Clone)]
pub struct GracePrunerConfig {
    /// How often expired entries are purged
    pub interval: Duration,
    /// Entries older than this no longer affect admission
    pub grace_period: Duration,
}

impl Default for GracePrunerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            grace_period: Duration::ZERO,
        }
    }
}

/// Periodically purges grace-period entries that can no longer block a sender
pub struct GracePruner {
    store: Arc<dyn GracePeriodStore>,
    config: GracePrunerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl GracePruner {
    #[must_use]
    pub fn new(
        store: Arc<dyn GracePeriodStore>,
        config: GracePrunerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            config,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Grace-period pruner started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.prune_once().await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Grace-period pruner shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Purge once, returning the number of removed entries
    pub async fn prune_once(&self) -> usize {
        let Ok(period) = chrono::Duration::from_std(self.config.grace_period) else {
            error!("Grace period out of range, skipping prune");
            return 0;
        };
        let cutoff = Utc::now() - period;

        match self.store.purge_older_than(cutoff).await {
            Ok(removed) => {
                debug!(removed = removed, cutoff = %cutoff, "Pruned grace-period entries");
                removed
            }
            Err(e) => {
                error!(error = %e, "Failed to prune grace-period entries");
                0
            }
        }
    }
}

/// Spawn the pruner, returning its handle and a shutdown sender
pub fn spawn_grace_pruner(
    store: Arc<dyn GracePeriodStore>,
    config: GracePrunerConfig,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pruner = GracePruner::new(store, config, shutdown_rx);
    let handle = tokio::spawn(pruner.run());
    (handle, shutdown_tx)
}
