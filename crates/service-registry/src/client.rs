//! HTTP client for registry nodes, with a locally cached view of the
//! registry for discovery lookups.
//!
//! Every call tries the last node that answered first and fails over to the
//! others in order. The cache is refreshed with deltas and falls back to a
//! full fetch whenever a delta cannot be trusted. When no node is reachable
//! the last good view keeps being served until it is older than
//! `max_staleness`.

use parking_lot::RwLock;
use reqwest::{RequestBuilder, Response, StatusCode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::normalize_url;
use crate::discovery::DeltaResponse;
use crate::error::{RegistryError, Result};
use crate::instance::{normalize_app, InstanceInfo, InstanceStatus};
use crate::lease::{Lease, Mutation, RegistrySnapshot};
use crate::registry::NodeStatus;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_STALENESS: Duration = Duration::from_secs(600);

#[derive(Debug, Default)]
struct Cache {
    snapshot: Option<RegistrySnapshot>,
    refreshed_at: Option<Instant>,
}

pub struct RegistryClient {
    urls: Vec<String>,
    http: reqwest::Client,
    preferred: AtomicUsize,
    cache: RwLock<Cache>,
    max_staleness: Option<Duration>,
}

impl RegistryClient {
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let urls = urls
            .into_iter()
            .map(|u| normalize_url(u.as_ref()))
            .filter(|u| !u.is_empty())
            .collect();

        Self {
            urls,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            preferred: AtomicUsize::new(0),
            cache: RwLock::new(Cache::default()),
            max_staleness: Some(DEFAULT_MAX_STALENESS),
        }
    }

    /// `None` keeps serving the cache forever.
    pub fn with_max_staleness(mut self, max_staleness: Option<Duration>) -> Self {
        self.max_staleness = max_staleness;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        self
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Sends the request built by `build` for `path` to each node in turn
    /// until one gives an answer that is not a transport error or a 5xx.
    async fn send<F>(&self, path: &[&str], build: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client, Url) -> RequestBuilder,
    {
        if self.urls.is_empty() {
            return Err(RegistryError::PeerUnreachable("no registry URL configured".into()));
        }

        let start = self.preferred.load(Ordering::Relaxed) % self.urls.len();
        let mut last_error = String::new();

        for offset in 0..self.urls.len() {
            let index = (start + offset) % self.urls.len();
            let url = &self.urls[index];
            let target = match endpoint(url, path) {
                Ok(target) => target,
                Err(e) => {
                    last_error = format!("{}: {}", url, e);
                    debug!("Skipping registry URL: {}", last_error);
                    continue;
                }
            };

            match build(&self.http, target).send().await {
                Ok(response) if !response.status().is_server_error() => {
                    if index != start {
                        info!("Failed over to registry {}", url);
                    }
                    self.preferred.store(index, Ordering::Relaxed);
                    return Ok(response);
                }
                Ok(response) => {
                    last_error = format!("{} answered {}", url, response.status());
                }
                Err(e) => {
                    last_error = format!("{}: {}", url, e);
                }
            }
            debug!("Registry request failed: {}", last_error);
        }

        Err(RegistryError::PeerUnreachable(last_error))
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => RegistryError::NotFound(body),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                RegistryError::InvalidInstance(body)
            }
            other => RegistryError::PeerUnreachable(format!("registry answered {}: {}", other, body)),
        })
    }

    pub async fn register(&self, info: &InstanceInfo) -> Result<()> {
        let app = normalize_app(&info.app);
        let response = self
            .send(&["apps", app.as_str()], |http, url| http.post(url).json(info))
            .await?;
        Self::check(response).await?;
        debug!("Registered {} with the registry", info.key());
        Ok(())
    }

    pub async fn renew(&self, app: &str, instance_id: &str) -> Result<Lease> {
        let response = self
            .send(&["apps", app, instance_id], |http, url| http.put(url))
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Renews the lease, registering again if the registry no longer knows
    /// the instance.
    pub async fn heartbeat(&self, info: &InstanceInfo) -> Result<()> {
        match self.renew(&info.app, &info.instance_id).await {
            Ok(_) => Ok(()),
            Err(RegistryError::NotFound(_)) => {
                info!("Registry lost {}, registering again", info.key());
                self.register(info).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn cancel(&self, app: &str, instance_id: &str) -> Result<()> {
        let response = self
            .send(&["apps", app, instance_id], |http, url| http.delete(url))
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn set_status(&self, app: &str, instance_id: &str, status: InstanceStatus) -> Result<Lease> {
        let body = serde_json::json!({ "status": status });
        let response = self
            .send(&["apps", app, instance_id, "status"], |http, url| {
                http.put(url).json(&body)
            })
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn fetch_all(&self, include_all: bool) -> Result<RegistrySnapshot> {
        let response = self
            .send(&["apps"], |http, url| {
                http.get(url).query(&[("includeAll", include_all)])
            })
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn fetch_application(&self, app: &str, include_all: bool) -> Result<Vec<Lease>> {
        let response = self
            .send(&["apps", app], |http, url| {
                http.get(url).query(&[("includeAll", include_all)])
            })
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn fetch_delta(&self, since: u64) -> Result<DeltaResponse> {
        let response = self
            .send(&["apps"], |http, url| {
                http.get(url).query(&[("sinceVersion", since)])
            })
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn node_status(&self) -> Result<NodeStatus> {
        let response = self
            .send(&["admin", "status"], |http, url| http.get(url))
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn refresh_config(&self) -> Result<serde_json::Value> {
        let response = self
            .send(&["admin", "refresh"], |http, url| http.post(url))
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Brings the cache up to date and returns its version. On failure the
    /// cache is left as it was.
    pub async fn refresh(&self) -> Result<u64> {
        let cached = self
            .cache
            .read()
            .snapshot
            .as_ref()
            .map(|s| (s.log_id.clone(), s.version));

        let snapshot = match cached {
            None => self.fetch_all(false).await?,
            Some((log_id, version)) => match self.fetch_delta(version).await? {
                // another node answered, its versions mean nothing here
                delta if delta.log_id() != log_id => {
                    info!(
                        "Registry log changed from {} to {}, fetching everything",
                        log_id,
                        delta.log_id()
                    );
                    self.fetch_all(false).await?
                }
                DeltaResponse::Delta {
                    current_version,
                    mutations,
                    ..
                } if current_version >= version => {
                    let mut cache = self.cache.write();
                    let Some(snapshot) = cache.snapshot.as_mut() else {
                        return Ok(current_version);
                    };
                    if snapshot.version == version && snapshot.log_id == log_id {
                        apply_mutations(snapshot, &mutations);
                        snapshot.version = current_version;
                    }
                    cache.refreshed_at = Some(Instant::now());
                    debug!("Applied {} registry changes", mutations.len());
                    return Ok(current_version);
                }
                DeltaResponse::Delta { current_version, .. } => {
                    info!(
                        "Registry version went backwards ({} < {}), fetching everything",
                        current_version, version
                    );
                    self.fetch_all(false).await?
                }
                stale @ DeltaResponse::TooStale { .. } => {
                    debug!(
                        "Cached registry version {} too old (registry at {}), fetching everything",
                        version,
                        stale.current_version()
                    );
                    self.fetch_all(false).await?
                }
            },
        };

        let version = snapshot.version;
        let mut cache = self.cache.write();
        cache.snapshot = Some(snapshot);
        cache.refreshed_at = Some(Instant::now());
        Ok(version)
    }

    /// UP instances of `app` from the cache.
    pub fn instances(&self, app: &str) -> Vec<Lease> {
        let cache = self.cache.read();
        let Some(snapshot) = cache.snapshot.as_ref() else {
            return Vec::new();
        };

        if let (Some(max), Some(at)) = (self.max_staleness, cache.refreshed_at) {
            if at.elapsed() > max {
                warn!(
                    "Registry cache is {:?} old, not serving lookups for {}",
                    at.elapsed(),
                    app
                );
                return Vec::new();
            }
        }
        snapshot.application(app).to_vec()
    }

    pub fn cached_version(&self) -> Option<u64> {
        self.cache.read().snapshot.as_ref().map(|s| s.version)
    }

    pub fn spawn_poller(self: Arc<Self>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh().await {
                            warn!("Registry refresh failed, serving cached view: {}", e);
                        }
                    }
                }
            }
        })
    }
}

/// `base` with `segments` appended, each percent-encoded as one path segment.
fn endpoint(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| RegistryError::PeerUnreachable(format!("invalid registry URL: {}", e)))?;
    url.path_segments_mut()
        .map_err(|_| RegistryError::PeerUnreachable(format!("{} cannot take a path", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Folds delta entries into a cached UP-only snapshot.
fn apply_mutations(snapshot: &mut RegistrySnapshot, mutations: &[Mutation]) {
    for mutation in mutations {
        let app = normalize_app(&mutation.app);
        let leases = snapshot.applications.entry(app.clone()).or_default();
        leases.retain(|l| l.instance.instance_id != mutation.instance_id);

        if let Some(lease) = mutation.lease.as_ref().filter(|l| l.is_up()) {
            if !mutation.kind.is_removal() {
                let at = leases
                    .binary_search_by(|l| l.instance.instance_id.cmp(&lease.instance.instance_id))
                    .unwrap_or_else(|i| i);
                leases.insert(at, lease.clone());
            }
        }

        if leases.is_empty() {
            snapshot.applications.remove(&app);
        }
    }
}
