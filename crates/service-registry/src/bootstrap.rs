use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::RegistryClient;
use crate::error::{RegistryError, Result};
use crate::instance::InstanceInfo;
use crate::lease::LeaseDefaults;

const DEFAULT_REGISTRY_URL: &str = "http://service-registry:8761";
const REGISTER_ATTEMPTS: u32 = 30;
const REGISTER_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Registry nodes from `SERVICE_REGISTRY_URL` (comma separated).
pub fn registry_urls() -> Vec<String> {
    env::var("SERVICE_REGISTRY_URL")
        .unwrap_or_else(|_| DEFAULT_REGISTRY_URL.to_string())
        .split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect()
}

/// A live registration. Dropping it leaves the heartbeat running; call
/// [`Registration::deregister`] on shutdown.
pub struct Registration {
    info: InstanceInfo,
    client: Arc<RegistryClient>,
    shutdown: CancellationToken,
    heartbeat: JoinHandle<()>,
}

impl Registration {
    pub fn info(&self) -> &InstanceInfo {
        &self.info
    }

    pub fn client(&self) -> &Arc<RegistryClient> {
        &self.client
    }

    /// Stops the heartbeat and cancels the lease.
    pub async fn deregister(self) -> Result<()> {
        self.shutdown.cancel();
        if let Err(e) = self.heartbeat.await {
            debug!("Heartbeat task ended abnormally: {}", e);
        }
        self.client
            .cancel(&self.info.app, &self.info.instance_id)
            .await?;
        info!("Deregistered {}", self.info.key());
        Ok(())
    }
}

/// Registers this process with the service registry and keeps the lease
/// alive.
///
/// - registry nodes come from `SERVICE_REGISTRY_URL`
/// - the instance id is `hostname:port`
/// - registration is retried while the registry is unreachable
pub async fn bootstrap_service(
    service_name: impl Into<String>,
    address: impl Into<String>,
    port: u16,
) -> Result<Registration> {
    let hostname = hostname::get()
        .unwrap_or_else(|_| std::ffi::OsString::from("unknown"))
        .to_string_lossy()
        .to_string();
    let info = InstanceInfo::new(service_name.into(), format!("{}:{}", hostname, port), address, port);

    let client = Arc::new(RegistryClient::new(registry_urls()));
    register_instance(client, info, REGISTER_ATTEMPTS, REGISTER_RETRY_DELAY).await
}

/// Registers `info` through `client` and spawns the heartbeat loop.
pub async fn register_instance(
    client: Arc<RegistryClient>,
    info: InstanceInfo,
    attempts: u32,
    retry_delay: Duration,
) -> Result<Registration> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.register(&info).await {
            Ok(()) => break,
            Err(e @ RegistryError::InvalidInstance(_)) => return Err(e),
            Err(e) if attempt >= attempts => {
                warn!("Giving up registering {} after {} attempts", info.key(), attempt);
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "Failed to register {} (attempt {}/{}): {}",
                    info.key(),
                    attempt,
                    attempts,
                    e
                );
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
    info!("Service {} registered as {}", info.app, info.instance_id);

    let every = Duration::from_secs(
        info.lease
            .renewal_interval_secs
            .unwrap_or(LeaseDefaults::default().renewal_interval_secs),
    );
    let shutdown = CancellationToken::new();
    let heartbeat = tokio::spawn(heartbeat_loop(
        client.clone(),
        info.clone(),
        every,
        shutdown.clone(),
    ));

    Ok(Registration {
        info,
        client,
        shutdown,
        heartbeat,
    })
}

async fn heartbeat_loop(
    client: Arc<RegistryClient>,
    info: InstanceInfo,
    every: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(every) => {
                if let Err(e) = client.heartbeat(&info).await {
                    warn!("Heartbeat for {} failed: {}", info.key(), e);
                }
            }
        }
    }
}

/// Base URL of the first UP instance of `service_name`, or `None` when the
/// registry has none or cannot be reached.
pub async fn get_service_endpoint(service_name: &str) -> Option<String> {
    let client = RegistryClient::new(registry_urls());
    find_endpoint(&client, service_name).await
}

pub async fn find_endpoint(client: &RegistryClient, service_name: &str) -> Option<String> {
    debug!("Looking up service: {}", service_name);

    match client.fetch_application(service_name, false).await {
        Ok(leases) => match leases.first() {
            Some(lease) => {
                let endpoint = lease.instance.endpoint();
                debug!("Found service {} at {}", service_name, endpoint);
                Some(endpoint)
            }
            None => {
                warn!("No instances found for service: {}", service_name);
                None
            }
        },
        Err(e) => {
            warn!("Failed to query service registry for {}: {}", service_name, e);
            None
        }
    }
}
