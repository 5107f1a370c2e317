use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::RegistryConfig;
use crate::discovery::DiscoveryEngine;
use crate::error::{RegistryError, Result};
use crate::instance::{InstanceInfo, InstanceKey, InstanceStatus};
use crate::lease::{ApplyOutcome, Lease, MutationKind, ReplicatedMutation};
use crate::preservation::{PreservationMode, RenewalRates, SelfPreservation};
use crate::replication::{PeerSet, PeerStatus, ReplicationAck, ReplicationBatch, ReplicationSender, Replicator};
use crate::store::LeaseStore;

/// Snapshot of a node's health, served on the admin endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: String,
    pub version: u64,
    pub instances: usize,
    pub self_preservation_enabled: bool,
    pub renewals: RenewalRates,
    pub peers: Vec<PeerStatus>,
}

/// The registry core: the only writer to the lease store.
///
/// Local mutations are applied to the store and queued for replication
/// without waiting for peers. Mutations received from peers go through the
/// store's version guard and are never forwarded again.
pub struct Registry {
    node_id: String,
    log_id: String,
    store: Arc<LeaseStore>,
    preservation: SelfPreservation,
    replication: ReplicationSender,
    peers: Arc<PeerSet>,
    config: watch::Receiver<RegistryConfig>,
    clock: Arc<dyn Clock>,
}

impl Registry {
    pub fn new(
        store: Arc<LeaseStore>,
        config: watch::Receiver<RegistryConfig>,
        replication: ReplicationSender,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let node_id = config.borrow().node_id.clone();
        // a restarted node starts a fresh mutation log
        let log_id = format!("{}-{}", node_id, clock.now_millis());
        Self {
            node_id,
            log_id,
            store,
            preservation: SelfPreservation::new(),
            replication,
            peers: Arc::new(PeerSet::new()),
            config,
            clock,
        }
    }

    pub fn with_peers(mut self, peers: Arc<PeerSet>) -> Self {
        self.peers = peers;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Names this node's mutation log in discovery responses.
    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    pub fn store(&self) -> &Arc<LeaseStore> {
        &self.store
    }

    pub fn discovery(&self) -> DiscoveryEngine {
        DiscoveryEngine::new(self.store.clone(), self.log_id.clone())
    }

    pub fn config(&self) -> RegistryConfig {
        self.config.borrow().clone()
    }

    pub fn preservation_mode(&self) -> PreservationMode {
        self.preservation.mode()
    }

    pub fn register(&self, mut info: InstanceInfo) -> Result<Lease> {
        let (max_attributes, defaults) = {
            let config = self.config.borrow();
            (config.max_attributes, config.lease_defaults())
        };
        info.validate(max_attributes)?;

        let registered = self.store.put(info, defaults, self.clock.now_millis());
        let lease = registered.lease.clone();

        if registered.is_conflict() {
            if let Some(previous) = &registered.previous {
                warn!(
                    "Instance {} re-registered from {} (was {})",
                    lease.key(),
                    lease.instance.endpoint(),
                    previous.instance.endpoint()
                );
            }
        }
        info!(
            "Registered instance {} at {} with status {}",
            lease.key(),
            lease.instance.endpoint(),
            lease.status()
        );

        self.replication
            .submit(ReplicatedMutation::upsert(MutationKind::Register, &lease));
        Ok(lease)
    }

    pub fn renew(&self, app: &str, instance_id: &str) -> Result<Lease> {
        let key = InstanceKey::new(app, instance_id);
        let lease = self
            .store
            .renew(&key, self.clock.now_millis())
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;

        self.preservation.record_renewal();
        debug!("Renewed lease for {} (version {})", key, lease.version);

        self.replication
            .submit(ReplicatedMutation::upsert(MutationKind::Renew, &lease));
        Ok(lease)
    }

    /// Returns whether a lease was actually removed. Cancelling an unknown
    /// instance is not an error.
    pub fn cancel(&self, app: &str, instance_id: &str) -> bool {
        let key = InstanceKey::new(app, instance_id);
        match self.store.cancel(&key, self.clock.now_millis()) {
            Some(lease) => {
                info!("Cancelled instance {}", key);
                self.replication.submit(ReplicatedMutation::removal(
                    MutationKind::Cancel,
                    &key,
                    lease.version,
                    lease.last_dirty,
                ));
                true
            }
            None => {
                debug!("Cancel for unknown instance {}", key);
                false
            }
        }
    }

    pub fn update_status(&self, app: &str, instance_id: &str, status: InstanceStatus) -> Result<Lease> {
        let key = InstanceKey::new(app, instance_id);
        let lease = self
            .store
            .set_status(&key, status, self.clock.now_millis())
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;

        info!("Status of {} set to {}", key, status);
        self.replication
            .submit(ReplicatedMutation::upsert(MutationKind::StatusChange, &lease));
        Ok(lease)
    }

    /// Runs one eviction sweep unless self-preservation forbids it. Evictions
    /// are local decisions and are not replicated.
    pub fn evict(&self) -> Vec<Lease> {
        let enabled = self.config.borrow().self_preservation_enabled;
        if enabled && self.preservation.is_active() {
            debug!("Self-preservation active, skipping eviction");
            return Vec::new();
        }

        let evicted = self.store.sweep_expired(self.clock.now_millis());
        for lease in &evicted {
            warn!(
                "Evicted {} (no renewal for more than {}s)",
                lease.key(),
                lease.eviction_duration_secs
            );
        }
        if !evicted.is_empty() {
            info!("Eviction sweep removed {} instances", evicted.len());
        }
        evicted
    }

    pub fn purge_tombstones(&self) -> usize {
        let purged = self.store.purge_tombstones(self.clock.now_millis());
        if purged > 0 {
            debug!("Purged {} tombstones", purged);
        }
        purged
    }

    /// Closes one renewal-rate window of length `elapsed`.
    pub fn tick_self_preservation(&self, elapsed: Duration) -> PreservationMode {
        let params = self.config.borrow().preservation_params();
        self.preservation.evaluate(self.store.len(), elapsed, &params)
    }

    pub fn apply_replicated(&self, batch: &ReplicationBatch) -> ReplicationAck {
        if batch.origin == self.node_id {
            debug!("Ignoring replication batch from this node");
            return ReplicationAck {
                applied: 0,
                stale: batch.mutations.len(),
            };
        }

        let now = self.clock.now_millis();
        let mut ack = ReplicationAck::default();
        for mutation in &batch.mutations {
            match self.store.apply(mutation, now) {
                ApplyOutcome::Applied => {
                    ack.applied += 1;
                    if mutation.kind == MutationKind::Renew {
                        self.preservation.record_renewal();
                    }
                }
                ApplyOutcome::Stale => ack.stale += 1,
            }
        }

        debug!(
            "Applied {} of {} mutations from {}",
            ack.applied,
            batch.mutations.len(),
            batch.origin
        );
        ack
    }

    /// Loads the registry of the first configured peer that answers. Returns
    /// the number of leases loaded; failure to reach any peer is not fatal.
    pub async fn bootstrap_from_peers(&self, replicator: &Replicator) -> usize {
        let urls = self.config.borrow().peer_urls();
        if urls.is_empty() {
            debug!("No peers configured, starting with an empty registry");
            return 0;
        }

        match replicator.fetch_snapshot(&urls).await {
            Ok((from, snapshot)) => {
                let loaded = self.store.load_snapshot(&snapshot, self.clock.now_millis());
                info!(
                    "Loaded {} instances from peer {} (peer version {})",
                    loaded, from, snapshot.version
                );
                loaded
            }
            Err(e) => {
                warn!("Starting with an empty registry: {}", e);
                0
            }
        }
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node_id.clone(),
            version: self.store.version(),
            instances: self.store.len(),
            self_preservation_enabled: self.config.borrow().self_preservation_enabled,
            renewals: self.preservation.rates(),
            peers: self.peers.statuses(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::replication::{self, ReplicationQueue};

    struct Harness {
        registry: Registry,
        clock: Arc<ManualClock>,
        queue: ReplicationQueue,
        config: watch::Sender<RegistryConfig>,
    }

    fn harness() -> Harness {
        let config = RegistryConfig {
            node_id: "node-a".into(),
            ..RegistryConfig::default()
        };
        let (tx, rx) = watch::channel(config);
        let (sender, queue) = replication::channel(1_024);
        let clock = Arc::new(ManualClock::new(1_000_000));
        let registry = Registry::new(Arc::new(LeaseStore::default()), rx, sender, clock.clone());
        Harness {
            registry,
            clock,
            queue,
            config: tx,
        }
    }

    fn instance(id: &str) -> InstanceInfo {
        InstanceInfo::new("catalog", id, "10.0.0.1", 8080)
    }

    #[test]
    fn test_register_renew_then_evict() {
        let mut h = harness();
        let first = tokio_test::assert_ok!(h.registry.register(instance("a")));

        let mut versions = vec![first.version];
        for _ in 0..3 {
            h.clock.advance(Duration::from_secs(30));
            versions.push(h.registry.renew("catalog", "a").unwrap().version);
        }
        assert!(versions.windows(2).all(|w| w[0] < w[1]));

        let up = h.registry.discovery().get_application("catalog", false);
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].instance.instance_id, "a");
        assert!(up[0].is_up());

        h.clock.advance(Duration::from_secs(90));
        assert!(h.registry.evict().is_empty());

        h.clock.advance(Duration::from_millis(1));
        let evicted = h.registry.evict();
        assert_eq!(evicted.len(), 1);
        assert!(h.registry.discovery().get_application("catalog", true).is_empty());

        // register plus three renewals went out, the eviction did not
        let sent: Vec<_> = h.queue.drain().into_iter().map(|m| m.kind).collect();
        assert_eq!(
            sent,
            vec![
                MutationKind::Register,
                MutationKind::Renew,
                MutationKind::Renew,
                MutationKind::Renew
            ]
        );
    }

    #[test]
    fn test_renew_unknown_is_not_found() {
        let h = harness();
        let err = tokio_test::assert_err!(h.registry.renew("catalog", "ghost"));
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[test]
    fn test_invalid_registration_is_rejected() {
        let h = harness();
        h.config.send_modify(|c| c.max_attributes = 1);
        let info = instance("a").with_attribute("zone", "a").with_attribute("rack", "1");
        assert!(matches!(
            h.registry.register(info),
            Err(RegistryError::InvalidInstance(_))
        ));
        assert_eq!(h.registry.store().len(), 0);
    }

    #[test]
    fn test_cancel_twice_replicates_once() {
        let mut h = harness();
        h.registry.register(instance("a")).unwrap();
        assert!(h.registry.cancel("CATALOG", "a"));
        assert!(!h.registry.cancel("catalog", "a"));

        let sent = h.queue.drain();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].kind, MutationKind::Cancel);
        assert!(sent[1].lease.is_none());
    }

    #[test]
    fn test_update_status_hides_instance_from_default_view() {
        let h = harness();
        h.registry.register(instance("a")).unwrap();
        let lease = h
            .registry
            .update_status("catalog", "a", InstanceStatus::OutOfService)
            .unwrap();
        assert_eq!(lease.status(), InstanceStatus::OutOfService);
        assert!(h.registry.discovery().get_application("catalog", false).is_empty());
        assert!(h
            .registry
            .update_status("catalog", "ghost", InstanceStatus::Up)
            .is_err());
    }

    #[test]
    fn test_self_preservation_retains_expired_leases() {
        let h = harness();
        for i in 0..10 {
            h.registry.register(instance(&format!("i{}", i))).unwrap();
        }

        // a full minute of heartbeats, then a partition lets only a few through
        for i in 0..20 {
            h.registry.renew("catalog", &format!("i{}", i % 10)).unwrap();
        }
        assert_eq!(h.registry.tick_self_preservation(Duration::from_secs(60)), PreservationMode::Normal);
        for i in 0..2 {
            h.registry.renew("catalog", &format!("i{}", i)).unwrap();
        }
        assert_eq!(
            h.registry.tick_self_preservation(Duration::from_secs(60)),
            PreservationMode::SelfPreserving
        );

        h.clock.advance(Duration::from_secs(300));
        assert!(h.registry.evict().is_empty());
        assert_eq!(h.registry.store().len(), 10);

        // with the guard switched off the sweep runs
        h.config.send_modify(|c| c.self_preservation_enabled = false);
        assert_eq!(h.registry.evict().len(), 10);
    }

    #[test]
    fn test_apply_replicated_counts_and_skips_own_origin() {
        let mut origin = harness();
        let replica = harness();

        origin.registry.register(instance("a")).unwrap();
        origin.registry.renew("catalog", "a").unwrap();
        let mutations = origin.queue.drain();

        let own = ReplicationBatch {
            origin: "node-a".into(),
            mutations: mutations.clone(),
        };
        assert_eq!(replica.registry.apply_replicated(&own).applied, 0);

        let batch = ReplicationBatch {
            origin: "node-b".into(),
            mutations,
        };
        let ack = replica.registry.apply_replicated(&batch);
        assert_eq!(ack, ReplicationAck { applied: 2, stale: 0 });
        let again = replica.registry.apply_replicated(&batch);
        assert_eq!(again, ReplicationAck { applied: 0, stale: 2 });

        assert_eq!(replica.registry.store().get(&InstanceKey::new("catalog", "a")).unwrap().version, 2);
        assert_eq!(replica.registry.status().renewals.mode, PreservationMode::Normal);
    }

    #[test]
    fn test_status_reports_counts() {
        let h = harness();
        h.registry.register(instance("a")).unwrap();
        let status = h.registry.status();
        assert_eq!(status.node_id, "node-a");
        assert_eq!(status.instances, 1);
        assert_eq!(status.version, 1);
        assert!(status.peers.is_empty());
    }
}
