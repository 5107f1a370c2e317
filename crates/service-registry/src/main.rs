use anyhow::Context;
use service_registry::api::{self, AppState};
use service_registry::clock::SystemClock;
use service_registry::config::{RegistryConfig, SharedConfig};
use service_registry::registry::Registry;
use service_registry::replication::{self, PeerSet, Replicator};
use service_registry::store::LeaseStore;
use service_registry::tasks;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let base = RegistryConfig::from_env().context("Invalid registry configuration")?;
    let shared = Arc::new(SharedConfig::new(base));
    if let Err(e) = shared.refresh().await {
        tracing::warn!("Starting with local configuration: {}", e);
    }
    let config = shared.current();
    tracing::info!("Starting registry node {}", config.node_id);

    let clock = Arc::new(SystemClock);
    let shutdown = CancellationToken::new();

    let store = Arc::new(LeaseStore::new(config.log_limits()));
    let peers = Arc::new(PeerSet::new());
    let (sender, queue) = replication::channel(config.replication_queue_capacity);
    let registry = Arc::new(
        Registry::new(store, shared.subscribe(), sender, clock.clone()).with_peers(peers.clone()),
    );
    let replicator = Replicator::new(
        config.node_id.clone(),
        peers,
        shared.subscribe(),
        clock,
        shutdown.clone(),
    );

    // load the registry from a peer before taking client traffic
    registry.bootstrap_from_peers(&replicator).await;
    replicator.sync_peers(&config.peer_urls());
    replicator.spawn_dispatcher(queue);

    let tracker = TaskTracker::new();
    tasks::spawn_eviction(registry.clone(), &tracker, shutdown.clone());
    tasks::spawn_self_preservation(registry.clone(), &tracker, shutdown.clone());
    tasks::spawn_config_refresh(shared.clone(), &tracker, shutdown.clone());
    tasks::spawn_config_watch(
        registry.clone(),
        replicator.clone(),
        shared.subscribe(),
        &tracker,
        shutdown.clone(),
    );

    let app = api::router(AppState::new(registry, shared));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("Service registry listening on {}", listener.local_addr()?);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
            signal.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    tracker.close();
    tracker.wait().await;
    replicator.wait_for_shutdown(SHUTDOWN_GRACE).await;

    Ok(())
}
