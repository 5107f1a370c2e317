//! Periodic background work of a registry node.
//!
//! Each loop re-reads its interval from the live configuration before
//! sleeping, so interval changes take effect on the next round.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{RegistryConfig, SharedConfig};
use crate::registry::Registry;
use crate::replication::Replicator;

/// Eviction sweep, followed by tombstone cleanup.
pub fn spawn_eviction(registry: Arc<Registry>, tracker: &TaskTracker, shutdown: CancellationToken) {
    tracker.spawn(async move {
        loop {
            let every = Duration::from_secs(registry.config().eviction_interval_secs.max(1));
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(every) => {
                    registry.evict();
                    registry.purge_tombstones();
                }
            }
        }
        debug!("Eviction task stopped");
    });
}

pub fn spawn_self_preservation(
    registry: Arc<Registry>,
    tracker: &TaskTracker,
    shutdown: CancellationToken,
) {
    tracker.spawn(async move {
        let mut last = Instant::now();
        loop {
            let every = Duration::from_secs(registry.config().threshold_update_interval_secs.max(1));
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(every) => {
                    let now = Instant::now();
                    registry.tick_self_preservation(now - last);
                    last = now;
                }
            }
        }
        debug!("Self-preservation task stopped");
    });
}

/// Polls the configuration service. Failures keep the last good values and
/// are retried on the next round.
pub fn spawn_config_refresh(
    config: Arc<SharedConfig>,
    tracker: &TaskTracker,
    shutdown: CancellationToken,
) {
    if !config.has_remote() {
        return;
    }
    tracker.spawn(async move {
        loop {
            let every = Duration::from_secs(config.current().config_refresh_interval_secs.max(1));
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(every) => {
                    if let Err(e) = config.refresh().await {
                        warn!("Configuration refresh failed, keeping current values: {}", e);
                    }
                }
            }
        }
        debug!("Config refresh task stopped");
    });
}

/// Pushes configuration changes into the parts that do not read the live
/// configuration on every use.
pub fn spawn_config_watch(
    registry: Arc<Registry>,
    replicator: Replicator,
    mut updates: watch::Receiver<RegistryConfig>,
    tracker: &TaskTracker,
    shutdown: CancellationToken,
) {
    tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let config = updates.borrow_and_update().clone();
                    apply_config(&registry, &replicator, &config);
                }
            }
        }
        debug!("Config watch task stopped");
    });
}

pub fn apply_config(registry: &Registry, replicator: &Replicator, config: &RegistryConfig) {
    registry.store().set_limits(config.log_limits());
    replicator.sync_peers(&config.peer_urls());
    info!(
        "Applied configuration: {} peers, eviction after {}s, threshold {}",
        replicator.peers().urls().len(),
        config.eviction_duration_secs,
        config.renewal_threshold
    );
}
