//! Best-effort propagation of registry mutations to peer nodes.
//!
//! Mutations leave the request path through a bounded channel
//! ([`ReplicationSender::submit`] never waits). A dispatcher task batches
//! them and hands every batch to each healthy peer's own queue. Every peer
//! has one worker task that delivers batches with bounded exponential
//! backoff and, while the peer is marked unhealthy, retries it on a fixed
//! interval until it answers again.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};
use crate::lease::{RegistrySnapshot, ReplicatedMutation};

const PEER_QUEUE_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationBatch {
    /// Node id of the node that accepted these mutations from clients.
    pub origin: String,
    pub mutations: Vec<ReplicatedMutation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationAck {
    pub applied: usize,
    pub stale: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            max_attempts: config.replication_max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.replication_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.replication_max_backoff_ms),
            request_timeout: Duration::from_millis(config.replication_timeout_ms),
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Handle used by the registry core to queue outgoing mutations.
#[derive(Debug, Clone)]
pub struct ReplicationSender {
    tx: mpsc::Sender<ReplicatedMutation>,
}

/// Receiving end of [`ReplicationSender`], consumed by the dispatcher.
#[derive(Debug)]
pub struct ReplicationQueue {
    rx: mpsc::Receiver<ReplicatedMutation>,
}

pub fn channel(capacity: usize) -> (ReplicationSender, ReplicationQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ReplicationSender { tx }, ReplicationQueue { rx })
}

impl ReplicationSender {
    pub fn submit(&self, mutation: ReplicatedMutation) {
        match self.tx.try_send(mutation) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(m)) => {
                warn!("Replication queue full, dropping {:?} for {}/{}", m.kind, m.app, m.instance_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Replication dispatcher stopped, mutation not replicated");
            }
        }
    }
}

impl ReplicationQueue {
    /// Takes whatever is queued right now without waiting.
    pub fn drain(&mut self) -> Vec<ReplicatedMutation> {
        let mut out = Vec::new();
        while let Ok(m) = self.rx.try_recv() {
            out.push(m);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub url: String,
    pub healthy: bool,
    pub last_success: Option<u64>,
}

/// One replication target.
#[derive(Debug)]
pub struct PeerNode {
    url: String,
    healthy: AtomicBool,
    last_success: AtomicU64,
    queue: mpsc::Sender<Arc<ReplicationBatch>>,
    cancel: CancellationToken,
}

impl PeerNode {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn mark_success(&self, now: u64) {
        self.last_success.store(now, Ordering::Release);
        if !self.healthy.swap(true, Ordering::AcqRel) {
            info!("Peer {} is reachable again", self.url);
        }
    }

    fn mark_unhealthy(&self) {
        if self.healthy.swap(false, Ordering::AcqRel) {
            warn!("Peer {} marked unhealthy", self.url);
        }
    }

    pub fn status(&self) -> PeerStatus {
        let last = self.last_success.load(Ordering::Acquire);
        PeerStatus {
            url: self.url.clone(),
            healthy: self.is_healthy(),
            last_success: (last > 0).then_some(last),
        }
    }
}

/// The current set of peers. Each peer's flags are independent atomics, the
/// list itself only changes on configuration reloads.
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: RwLock<Vec<Arc<PeerNode>>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<Arc<PeerNode>> {
        self.peers.read().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.peers.read().iter().map(|p| p.url.clone()).collect()
    }

    pub fn statuses(&self) -> Vec<PeerStatus> {
        self.peers.read().iter().map(|p| p.status()).collect()
    }
}

/// Owns the dispatcher and the per-peer workers.
#[derive(Clone)]
pub struct Replicator {
    node_id: String,
    peers: Arc<PeerSet>,
    http: reqwest::Client,
    config: watch::Receiver<RegistryConfig>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    workers: CancellationToken,
    tracker: TaskTracker,
}

impl Replicator {
    pub fn new(
        node_id: impl Into<String>,
        peers: Arc<PeerSet>,
        config: watch::Receiver<RegistryConfig>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            peers,
            http: reqwest::Client::new(),
            config,
            clock,
            shutdown,
            workers: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config.borrow())
    }

    /// Reconciles the peer list with `urls`: new peers get a worker, removed
    /// peers' workers are stopped.
    pub fn sync_peers(&self, urls: &[String]) {
        let mut peers = self.peers.peers.write();

        peers.retain(|peer| {
            let keep = urls.contains(&peer.url);
            if !keep {
                info!("Removing peer {}", peer.url);
                peer.cancel.cancel();
            }
            keep
        });

        for url in urls {
            if peers.iter().any(|p| &p.url == url) {
                continue;
            }
            let (tx, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
            let cancel = self.workers.child_token();
            let peer = Arc::new(PeerNode {
                url: url.clone(),
                healthy: AtomicBool::new(true),
                last_success: AtomicU64::new(0),
                queue: tx,
                cancel: cancel.clone(),
            });
            info!("Added replication peer {}", url);
            self.tracker
                .spawn(self.clone().run_peer(peer.clone(), rx, cancel));
            peers.push(peer);
        }
    }

    pub fn spawn_dispatcher(&self, queue: ReplicationQueue) {
        self.tracker.spawn(self.clone().run_dispatcher(queue));
    }

    /// Waits up to `grace` for queued batches to be flushed after shutdown
    /// has been signalled.
    pub async fn wait_for_shutdown(&self, grace: Duration) {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!("Replication did not drain within {:?}", grace);
        }
    }

    async fn run_dispatcher(self, mut queue: ReplicationQueue) {
        loop {
            let first = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = queue.rx.recv() => match next {
                    Some(m) => m,
                    None => break,
                },
            };

            let batch_size = self.config.borrow().replication_batch_size.max(1);
            let mut mutations = vec![first];
            while mutations.len() < batch_size {
                match queue.rx.try_recv() {
                    Ok(m) => mutations.push(m),
                    Err(_) => break,
                }
            }
            self.fan_out(mutations);
        }

        let rest = queue.drain();
        if !rest.is_empty() {
            debug!("Flushing {} queued mutations before shutdown", rest.len());
            self.fan_out(rest);
        }
        self.workers.cancel();
    }

    fn fan_out(&self, mutations: Vec<ReplicatedMutation>) {
        let batch = Arc::new(ReplicationBatch {
            origin: self.node_id.clone(),
            mutations,
        });

        for peer in self.peers.list() {
            if !peer.is_healthy() {
                debug!("Skipping unhealthy peer {}", peer.url);
                continue;
            }
            if peer.queue.try_send(batch.clone()).is_err() {
                warn!(
                    "Queue for peer {} is full, dropping {} mutations",
                    peer.url,
                    batch.mutations.len()
                );
            }
        }
    }

    async fn run_peer(
        self,
        peer: Arc<PeerNode>,
        mut rx: mpsc::Receiver<Arc<ReplicationBatch>>,
        cancel: CancellationToken,
    ) {
        let every = Duration::from_secs(self.config.borrow().peer_health_interval_secs.max(1));
        let mut health = tokio::time::interval(every);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(batch) => {
                        if peer.is_healthy() {
                            self.deliver(&peer, &batch, &cancel).await;
                        }
                    }
                    None => break,
                },
                _ = health.tick() => {
                    if !peer.is_healthy() {
                        self.check_health(&peer).await;
                    }
                }
            }
        }

        // one attempt per leftover batch
        let policy = self.policy();
        while let Ok(batch) = rx.try_recv() {
            if let Err(e) = self.post_batch(&peer, &batch, policy.request_timeout).await {
                debug!("Final flush to {} failed: {}", peer.url, e);
                break;
            }
        }
        debug!("Replication worker for {} stopped", peer.url);
    }

    /// Delivers one batch, retrying with backoff. Gives up after the
    /// configured attempts, marks the peer unhealthy and drops the batch.
    pub async fn deliver(
        &self,
        peer: &PeerNode,
        batch: &ReplicationBatch,
        cancel: &CancellationToken,
    ) -> bool {
        let policy = self.policy();

        for attempt in 1..=policy.max_attempts {
            match self.post_batch(peer, batch, policy.request_timeout).await {
                Ok(ack) => {
                    peer.mark_success(self.clock.now_millis());
                    debug!(
                        "Replicated {} mutations to {} ({} applied, {} stale)",
                        batch.mutations.len(),
                        peer.url,
                        ack.applied,
                        ack.stale
                    );
                    return true;
                }
                Err(e) => {
                    debug!(
                        "Replication to {} failed (attempt {}/{}): {}",
                        peer.url, attempt, policy.max_attempts, e
                    );
                    if attempt == policy.max_attempts {
                        break;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(policy.backoff(attempt)) => {}
                    }
                }
            }
        }

        peer.mark_unhealthy();
        warn!(
            "Dropping {} mutations for peer {} after {} attempts",
            batch.mutations.len(),
            peer.url,
            policy.max_attempts
        );
        false
    }

    async fn post_batch(
        &self,
        peer: &PeerNode,
        batch: &ReplicationBatch,
        timeout: Duration,
    ) -> Result<ReplicationAck> {
        let response = self
            .http
            .post(format!("{}/peer/replicate", peer.url))
            .timeout(timeout)
            .json(batch)
            .send()
            .await
            .map_err(|e| RegistryError::PeerUnreachable(format!("{}: {}", peer.url, e)))?;

        if !response.status().is_success() {
            return Err(RegistryError::PeerUnreachable(format!(
                "{} answered {}",
                peer.url,
                response.status()
            )));
        }

        Ok(response.json::<ReplicationAck>().await?)
    }

    async fn check_health(&self, peer: &PeerNode) {
        let timeout = self.policy().request_timeout;
        let result = self
            .http
            .get(format!("{}/health", peer.url))
            .timeout(timeout)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                peer.mark_success(self.clock.now_millis());
            }
            Ok(response) => debug!("Peer {} health check returned {}", peer.url, response.status()),
            Err(e) => debug!("Peer {} still unreachable: {}", peer.url, e),
        }
    }

    pub async fn fetch_snapshot(&self, urls: &[String]) -> Result<(String, RegistrySnapshot)> {
        fetch_snapshot(&self.http, urls, self.policy().request_timeout).await
    }
}

/// Asks each peer in turn for its full registry. The first answer wins.
pub async fn fetch_snapshot(
    http: &reqwest::Client,
    urls: &[String],
    timeout: Duration,
) -> Result<(String, RegistrySnapshot)> {
    for url in urls {
        let result = http
            .get(format!("{}/peer/snapshot", url))
            .timeout(timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(response) => match response.json::<RegistrySnapshot>().await {
                Ok(snapshot) => return Ok((url.clone(), snapshot)),
                Err(e) => warn!("Peer {} sent an unreadable snapshot: {}", url, e),
            },
            Err(e) => warn!("Could not fetch registry from peer {}: {}", url, e),
        }
    }

    Err(RegistryError::PeerUnreachable(format!(
        "none of {} peers answered",
        urls.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::instance::InstanceInfo;
    use crate::lease::{Lease, MutationKind};

    fn config() -> RegistryConfig {
        RegistryConfig {
            node_id: "node-a".into(),
            replication_max_attempts: 2,
            replication_initial_backoff_ms: 10,
            replication_max_backoff_ms: 20,
            replication_timeout_ms: 1_000,
            peer_health_interval_secs: 1,
            ..RegistryConfig::default()
        }
    }

    fn replicator(config: RegistryConfig) -> (Replicator, CancellationToken) {
        let (_tx, rx) = watch::channel(config.clone());
        let shutdown = CancellationToken::new();
        let replicator = Replicator::new(
            config.node_id.clone(),
            Arc::new(PeerSet::new()),
            rx,
            Arc::new(SystemClock),
            shutdown.clone(),
        );
        (replicator, shutdown)
    }

    fn mutation() -> ReplicatedMutation {
        let lease = Lease {
            instance: InstanceInfo::new("catalog", "h:1", "h", 1),
            registered_at: 0,
            last_renewal: 0,
            renewal_interval_secs: 30,
            eviction_duration_secs: 90,
            version: 1,
            last_dirty: 0,
        };
        ReplicatedMutation::upsert(MutationKind::Register, &lease)
    }

    fn detached_peer(url: String) -> PeerNode {
        let (tx, _rx) = mpsc::channel(1);
        PeerNode {
            url,
            healthy: AtomicBool::new(true),
            last_success: AtomicU64::new(0),
            queue: tx,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_secs(1));
        assert_eq!(policy.backoff(64), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_submit_on_full_queue_drops() {
        let (sender, mut queue) = channel(1);
        sender.submit(mutation());
        sender.submit(mutation());
        assert_eq!(queue.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_marks_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/peer/replicate")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"applied":1,"stale":0}"#)
            .create_async()
            .await;

        let (replicator, _) = replicator(config());
        let peer = detached_peer(server.url());
        let batch = ReplicationBatch {
            origin: "node-a".into(),
            mutations: vec![mutation()],
        };

        assert!(replicator.deliver(&peer, &batch, &CancellationToken::new()).await);
        mock.assert_async().await;
        assert!(peer.status().last_success.is_some());
    }

    #[tokio::test]
    async fn test_deliver_gives_up_and_marks_unhealthy() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/peer/replicate")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let (replicator, _) = replicator(config());
        let peer = detached_peer(server.url());
        let batch = ReplicationBatch {
            origin: "node-a".into(),
            mutations: vec![mutation()],
        };

        assert!(!replicator.deliver(&peer, &batch, &CancellationToken::new()).await);
        mock.assert_async().await;
        assert!(!peer.is_healthy());
    }

    #[tokio::test]
    async fn test_fetch_snapshot_first_success_wins() {
        let mut good = mockito::Server::new_async().await;
        let mock = good
            .mock("GET", "/peer/snapshot")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"version":7,"applications":{}}"#)
            .create_async()
            .await;
        let mut bad = mockito::Server::new_async().await;
        let _down = bad
            .mock("GET", "/peer/snapshot")
            .with_status(500)
            .create_async()
            .await;

        let urls = vec![bad.url(), good.url()];
        let (from, snapshot) = fetch_snapshot(&reqwest::Client::new(), &urls, Duration::from_secs(2))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(from, good.url());
        assert_eq!(snapshot.version, 7);
    }

    #[tokio::test]
    async fn test_fetch_snapshot_all_down() {
        let result = fetch_snapshot(
            &reqwest::Client::new(),
            &["http://127.0.0.1:1".to_string()],
            Duration::from_millis(500),
        )
        .await;
        assert!(matches!(result, Err(RegistryError::PeerUnreachable(_))));
    }

    #[tokio::test]
    async fn test_dispatcher_fans_out_to_peers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/peer/replicate")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"origin":"node-a"}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"applied":1,"stale":0}"#)
            .create_async()
            .await;

        let (replicator, shutdown) = replicator(config());
        let (sender, queue) = channel(16);
        replicator.sync_peers(&[server.url()]);
        replicator.spawn_dispatcher(queue);

        sender.submit(mutation());

        let mut delivered = false;
        for _ in 0..50 {
            if mock.matched_async().await {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(delivered);

        shutdown.cancel();
        replicator.wait_for_shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_sync_peers_adds_and_removes() {
        let (replicator, shutdown) = replicator(config());
        replicator.sync_peers(&["http://a:1".to_string(), "http://b:1".to_string()]);
        assert_eq!(replicator.peers().urls(), vec!["http://a:1", "http://b:1"]);

        replicator.sync_peers(&["http://b:1".to_string()]);
        assert_eq!(replicator.peers().urls(), vec!["http://b:1"]);
        assert!(replicator.peers().statuses()[0].healthy);

        shutdown.cancel();
        replicator.workers.cancel();
        replicator.wait_for_shutdown(Duration::from_secs(1)).await;
    }
}
