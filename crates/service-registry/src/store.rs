use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::{RegistryError, Result};
use crate::instance::{normalize_app, InstanceInfo, InstanceKey, InstanceStatus};
use crate::lease::{
    ApplyOutcome, Lease, LeaseDefaults, Mutation, MutationKind, Precedence, RegistrySnapshot,
    ReplicatedMutation,
};

/// How much mutation history is kept for delta queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLimits {
    pub retention: Duration,
    pub max_entries: usize,
}

impl Default for LogLimits {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(180),
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    version: u64,
    /// Origin time of the removal, for ordering.
    dirty_at: u64,
    /// Local time of the removal, for purging.
    removed_at: u64,
}

impl Tombstone {
    fn precedence(&self) -> Precedence<'static> {
        Precedence::removal(self.version, self.dirty_at)
    }
}

#[derive(Debug)]
struct MutationLog {
    entries: VecDeque<Mutation>,
    limits: LogLimits,
    /// Highest global version that has been dropped from the log.
    floor: u64,
}

impl MutationLog {
    fn push(&mut self, mutation: Mutation) {
        let cutoff = mutation
            .timestamp
            .saturating_sub(self.limits.retention.as_millis() as u64);
        self.entries.push_back(mutation);

        while let Some(front) = self.entries.front() {
            if self.entries.len() > self.limits.max_entries || front.timestamp < cutoff {
                self.floor = front.global_version;
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}

/// In-memory lease table.
///
/// Leases live in a sharded map so readers never block each other and writers
/// to different identities rarely contend. Every mutation takes a global
/// version from one atomic counter and appends to the mutation log; that
/// short critical section is the only point where writers serialize. Lock
/// order is always lease shard, then tombstone shard, then log.
pub struct LeaseStore {
    leases: DashMap<InstanceKey, Lease>,
    tombstones: DashMap<InstanceKey, Tombstone>,
    log: Mutex<MutationLog>,
    version: AtomicU64,
}

/// Result of a registration.
#[derive(Debug, Clone)]
pub struct Registered {
    pub lease: Lease,
    pub previous: Option<Lease>,
}

impl Registered {
    /// A re-registration that moved the instance to a different location.
    pub fn is_conflict(&self) -> bool {
        self.previous
            .as_ref()
            .map(|p| p.instance.location_differs(&self.lease.instance))
            .unwrap_or(false)
    }
}

impl Default for LeaseStore {
    fn default() -> Self {
        Self::new(LogLimits::default())
    }
}

impl LeaseStore {
    pub fn new(limits: LogLimits) -> Self {
        Self {
            leases: DashMap::new(),
            tombstones: DashMap::new(),
            log: Mutex::new(MutationLog {
                entries: VecDeque::new(),
                limits,
                floor: 0,
            }),
            version: AtomicU64::new(0),
        }
    }

    pub fn set_limits(&self, limits: LogLimits) {
        self.log.lock().limits = limits;
    }

    /// Current global version. Bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn get(&self, key: &InstanceKey) -> Option<Lease> {
        self.leases.get(key).map(|l| l.value().clone())
    }

    /// Inserts or replaces the lease for `info`. The registration time of an
    /// existing lease is kept.
    pub fn put(&self, info: InstanceInfo, defaults: LeaseDefaults, now: u64) -> Registered {
        let key = info.key();
        let renewal_interval_secs = info
            .lease
            .renewal_interval_secs
            .unwrap_or(defaults.renewal_interval_secs);
        let eviction_duration_secs = info
            .lease
            .eviction_duration_secs
            .unwrap_or(defaults.eviction_duration_secs);

        match self.leases.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let previous = slot.get().clone();
                let lease = Lease {
                    instance: info,
                    registered_at: previous.registered_at,
                    last_renewal: now,
                    renewal_interval_secs,
                    eviction_duration_secs,
                    version: previous.version + 1,
                    last_dirty: now,
                };
                self.record(MutationKind::Register, &key, lease.version, Some(&lease), now);
                slot.insert(lease.clone());
                Registered {
                    lease,
                    previous: Some(previous),
                }
            }
            Entry::Vacant(slot) => {
                let base = self
                    .tombstones
                    .remove(&key)
                    .map(|(_, t)| t.version)
                    .unwrap_or(0);
                let lease = Lease {
                    instance: info,
                    registered_at: now,
                    last_renewal: now,
                    renewal_interval_secs,
                    eviction_duration_secs,
                    version: base + 1,
                    last_dirty: now,
                };
                self.record(MutationKind::Register, &key, lease.version, Some(&lease), now);
                slot.insert(lease.clone());
                Registered {
                    lease,
                    previous: None,
                }
            }
        }
    }

    /// Refreshes the last-renewal time. `None` means the instance is unknown
    /// and has to register again.
    pub fn renew(&self, key: &InstanceKey, now: u64) -> Option<Lease> {
        let mut lease = self.leases.get_mut(key)?;
        lease.last_renewal = now;
        lease.last_dirty = now;
        lease.version += 1;
        self.record(MutationKind::Renew, key, lease.version, Some(lease.value()), now);
        Some(lease.value().clone())
    }

    pub fn set_status(&self, key: &InstanceKey, status: InstanceStatus, now: u64) -> Option<Lease> {
        let mut lease = self.leases.get_mut(key)?;
        lease.instance.status = status;
        lease.last_dirty = now;
        lease.version += 1;
        self.record(MutationKind::StatusChange, key, lease.version, Some(lease.value()), now);
        Some(lease.value().clone())
    }

    /// Removes the lease. Returns the removed lease with its final (cancel)
    /// version, or `None` if there was nothing to cancel.
    pub fn cancel(&self, key: &InstanceKey, now: u64) -> Option<Lease> {
        match self.leases.entry(key.clone()) {
            Entry::Occupied(slot) => {
                let version = slot.get().version + 1;
                self.tombstones.insert(
                    key.clone(),
                    Tombstone {
                        version,
                        dirty_at: now,
                        removed_at: now,
                    },
                );
                self.record(MutationKind::Cancel, key, version, None, now);
                let mut lease = slot.remove();
                lease.version = version;
                lease.last_dirty = now;
                Some(lease)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Removes and returns every lease whose last renewal is older than its
    /// eviction duration. The tombstone keeps the lease's last version and
    /// write time so a registration made at another peer still supersedes it.
    pub fn sweep_expired(&self, now: u64) -> Vec<Lease> {
        let candidates: Vec<InstanceKey> = self
            .leases
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::with_capacity(candidates.len());
        for key in candidates {
            if let Entry::Occupied(slot) = self.leases.entry(key.clone()) {
                // a renewal may have landed since the scan
                if !slot.get().is_expired(now) {
                    continue;
                }
                let version = slot.get().version;
                self.tombstones.insert(
                    key.clone(),
                    Tombstone {
                        version,
                        dirty_at: slot.get().last_dirty,
                        removed_at: now,
                    },
                );
                self.record(MutationKind::Evict, &key, version, None, now);
                evicted.push(slot.remove());
            }
        }
        evicted
    }

    /// Forgets tombstones older than the log retention window.
    pub fn purge_tombstones(&self, now: u64) -> usize {
        let retention = self.log.lock().limits.retention.as_millis() as u64;
        let before = self.tombstones.len();
        self.tombstones
            .retain(|_, t| now.saturating_sub(t.removed_at) <= retention);
        before - self.tombstones.len()
    }

    /// Applies a mutation received from a peer. Anything that does not take
    /// precedence over what is stored for the identity is ignored.
    pub fn apply(&self, mutation: &ReplicatedMutation, now: u64) -> ApplyOutcome {
        let key = mutation.key();

        let matching = mutation.kind.is_removal()
            || mutation.lease.as_ref().map(|l| l.key() == key).unwrap_or(false);
        let precedence = match mutation.precedence() {
            Some(p) if matching => p,
            _ => {
                debug!("Ignoring replicated {:?} for {} without a matching lease", mutation.kind, key);
                return ApplyOutcome::Stale;
            }
        };
        let incoming = mutation
            .lease
            .as_ref()
            .filter(|_| !mutation.kind.is_removal())
            .map(|lease| {
                let mut lease = lease.clone();
                lease.version = mutation.version;
                lease.last_dirty = mutation.timestamp;
                lease
            });
        let tombstone = Tombstone {
            version: mutation.version,
            dirty_at: mutation.timestamp,
            removed_at: now,
        };

        match self.leases.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                if precedence <= slot.get().precedence() {
                    return ApplyOutcome::Stale;
                }
                match incoming {
                    Some(lease) => {
                        self.record(mutation.kind, &key, lease.version, Some(&lease), now);
                        slot.insert(lease);
                    }
                    None => {
                        self.tombstones.insert(key.clone(), tombstone);
                        self.record(mutation.kind, &key, mutation.version, None, now);
                        slot.remove();
                    }
                }
                ApplyOutcome::Applied
            }
            Entry::Vacant(slot) => {
                let superseded = self
                    .tombstones
                    .get(&key)
                    .map(|t| precedence <= t.precedence())
                    .unwrap_or(false);
                if superseded {
                    return ApplyOutcome::Stale;
                }
                match incoming {
                    Some(lease) => {
                        self.tombstones.remove(&key);
                        self.record(mutation.kind, &key, lease.version, Some(&lease), now);
                        slot.insert(lease);
                    }
                    None => {
                        self.tombstones.insert(key, tombstone);
                    }
                }
                ApplyOutcome::Applied
            }
        }
    }

    /// Loads a peer snapshot through the same version guard as replication.
    pub fn load_snapshot(&self, snapshot: &RegistrySnapshot, now: u64) -> usize {
        snapshot
            .leases()
            .map(|lease| ReplicatedMutation::upsert(MutationKind::Register, lease))
            .filter(|m| self.apply(m, now) == ApplyOutcome::Applied)
            .count()
    }

    /// Copy-on-read view. The version is read before the copy, so a client
    /// resuming deltas from it may see a mutation twice but never misses one.
    pub fn snapshot(&self, include_all: bool) -> RegistrySnapshot {
        let version = self.version();
        let mut applications: BTreeMap<String, Vec<Lease>> = BTreeMap::new();

        for entry in self.leases.iter() {
            let lease = entry.value();
            if include_all || lease.is_up() {
                applications
                    .entry(entry.key().app.clone())
                    .or_default()
                    .push(lease.clone());
            }
        }
        for leases in applications.values_mut() {
            leases.sort_by(|a, b| a.instance.instance_id.cmp(&b.instance.instance_id));
        }

        RegistrySnapshot {
            log_id: String::new(),
            version,
            applications,
        }
    }

    pub fn application(&self, app: &str, include_all: bool) -> Vec<Lease> {
        let app = normalize_app(app);
        let mut leases: Vec<Lease> = self
            .leases
            .iter()
            .filter(|entry| entry.key().app == app)
            .filter(|entry| include_all || entry.value().is_up())
            .map(|entry| entry.value().clone())
            .collect();
        leases.sort_by(|a, b| a.instance.instance_id.cmp(&b.instance.instance_id));
        leases
    }

    /// Mutations with a global version above `since`.
    pub fn delta(&self, since: u64) -> Result<Vec<Mutation>> {
        let log = self.log.lock();
        let current = self.version();

        if since < log.floor || since > current {
            return Err(RegistryError::TooStale { since, current });
        }

        Ok(log
            .entries
            .iter()
            .filter(|m| m.global_version > since)
            .cloned()
            .collect())
    }

    fn record(
        &self,
        kind: MutationKind,
        key: &InstanceKey,
        version: u64,
        lease: Option<&Lease>,
        now: u64,
    ) -> u64 {
        let mut log = self.log.lock();
        let global_version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        log.push(Mutation {
            global_version,
            kind,
            app: key.app.clone(),
            instance_id: key.instance_id.clone(),
            version,
            lease: lease.cloned(),
            timestamp: now,
        });
        global_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(app: &str, id: &str) -> InstanceInfo {
        InstanceInfo::new(app, id, "10.0.0.1", 8080)
    }

    fn key(app: &str, id: &str) -> InstanceKey {
        InstanceKey::new(app, id)
    }

    #[test]
    fn test_put_creates_then_replaces() {
        let store = LeaseStore::default();
        let first = store.put(info("catalog", "a"), LeaseDefaults::default(), 1_000);
        assert!(first.previous.is_none());
        assert_eq!(first.lease.version, 1);
        assert_eq!(first.lease.registered_at, 1_000);

        let mut moved = info("Catalog", "a");
        moved.port = 9090;
        let second = store.put(moved, LeaseDefaults::default(), 5_000);
        assert_eq!(second.lease.version, 2);
        assert_eq!(second.lease.registered_at, 1_000);
        assert_eq!(second.lease.last_renewal, 5_000);
        assert!(second.is_conflict());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_put_uses_requested_lease_terms() {
        let store = LeaseStore::default();
        let r = store.put(info("catalog", "a").with_lease_terms(5, 15), LeaseDefaults::default(), 0);
        assert_eq!(r.lease.renewal_interval_secs, 5);
        assert_eq!(r.lease.eviction_duration_secs, 15);

        let r = store.put(info("catalog", "b"), LeaseDefaults::default(), 0);
        assert_eq!(r.lease.renewal_interval_secs, 30);
        assert_eq!(r.lease.eviction_duration_secs, 90);
    }

    #[test]
    fn test_versions_strictly_increase_across_lifecycle() {
        let store = LeaseStore::default();
        let k = key("catalog", "a");
        let mut seen = Vec::new();

        seen.push(store.put(info("catalog", "a"), LeaseDefaults::default(), 0).lease.version);
        seen.push(store.renew(&k, 1).unwrap().version);
        seen.push(store.set_status(&k, InstanceStatus::OutOfService, 2).unwrap().version);
        seen.push(store.renew(&k, 3).unwrap().version);
        seen.push(store.cancel(&k, 4).unwrap().version);
        seen.push(store.put(info("catalog", "a"), LeaseDefaults::default(), 5).lease.version);
        seen.push(store.renew(&k, 6).unwrap().version);

        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{:?}", seen);
        assert_eq!(store.version(), 7);
    }

    #[test]
    fn test_renew_unknown_is_not_found() {
        let store = LeaseStore::default();
        assert!(store.renew(&key("catalog", "ghost"), 0).is_none());
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let store = LeaseStore::default();
        store.put(info("catalog", "a"), LeaseDefaults::default(), 0);
        assert!(store.cancel(&key("catalog", "a"), 1).is_some());
        assert!(store.cancel(&key("catalog", "a"), 2).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let store = LeaseStore::default();
        store.put(info("catalog", "old"), LeaseDefaults::default(), 0);
        store.put(info("catalog", "fresh"), LeaseDefaults::default(), 50_000);

        assert!(store.sweep_expired(90_000).is_empty());

        let evicted = store.sweep_expired(90_001);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].instance.instance_id, "old");
        assert!(store.get(&key("catalog", "fresh")).is_some());
    }

    #[test]
    fn test_snapshot_filters_non_up_by_default() {
        let store = LeaseStore::default();
        store.put(info("catalog", "b"), LeaseDefaults::default(), 0);
        store.put(info("catalog", "a"), LeaseDefaults::default(), 0);
        store.put(info("orders", "x").with_status(InstanceStatus::Starting), LeaseDefaults::default(), 0);

        let up = store.snapshot(false);
        assert_eq!(up.version, 3);
        let ids: Vec<_> = up.application("catalog").iter().map(|l| l.instance.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(up.application("orders").is_empty());

        let all = store.snapshot(true);
        assert_eq!(all.application("orders").len(), 1);
        assert_eq!(store.application("ORDERS", true).len(), 1);
        assert!(store.application("orders", false).is_empty());
    }

    #[test]
    fn test_apply_is_idempotent_and_never_regresses() {
        let origin = LeaseStore::default();
        let replica = LeaseStore::default();
        let k = key("catalog", "a");

        let v1 = ReplicatedMutation::upsert(
            MutationKind::Register,
            &origin.put(info("catalog", "a"), LeaseDefaults::default(), 0).lease,
        );
        let v2 = ReplicatedMutation::upsert(MutationKind::Renew, &origin.renew(&k, 10).unwrap());

        assert_eq!(replica.apply(&v1, 0), ApplyOutcome::Applied);
        assert_eq!(replica.apply(&v1, 0), ApplyOutcome::Stale);
        assert_eq!(replica.apply(&v2, 0), ApplyOutcome::Applied);
        assert_eq!(replica.apply(&v1, 0), ApplyOutcome::Stale);
        assert_eq!(replica.get(&k).unwrap().version, 2);
        assert_eq!(replica.get(&k).unwrap().last_renewal, 10);
    }

    #[test]
    fn test_apply_rejects_upsert_older_than_cancel() {
        let origin = LeaseStore::default();
        let replica = LeaseStore::default();
        let k = key("catalog", "a");

        let reg = ReplicatedMutation::upsert(
            MutationKind::Register,
            &origin.put(info("catalog", "a"), LeaseDefaults::default(), 0).lease,
        );
        let cancelled = origin.cancel(&k, 1).unwrap();
        let cancel =
            ReplicatedMutation::removal(MutationKind::Cancel, &k, cancelled.version, cancelled.last_dirty);

        // cancel overtakes the registration on the wire
        assert_eq!(replica.apply(&cancel, 0), ApplyOutcome::Applied);
        assert_eq!(replica.apply(&reg, 0), ApplyOutcome::Stale);
        assert!(replica.get(&k).is_none());
        assert_eq!(replica.apply(&cancel, 0), ApplyOutcome::Stale);
    }

    #[test]
    fn test_registration_after_eviction_wins_on_other_peer() {
        let a = LeaseStore::default();
        let b = LeaseStore::default();
        let k = key("catalog", "a");

        let reg = a.put(info("catalog", "a"), LeaseDefaults::default(), 0).lease;
        b.apply(&ReplicatedMutation::upsert(MutationKind::Register, &reg), 0);

        // a evicts locally, the instance re-registers at b
        assert_eq!(a.sweep_expired(100_000).len(), 1);
        let again = b.put(info("catalog", "a"), LeaseDefaults::default(), 100_000).lease;

        let outcome = a.apply(&ReplicatedMutation::upsert(MutationKind::Register, &again), 100_000);
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(a.get(&k).unwrap().version, again.version);
    }

    #[test]
    fn test_equal_versions_from_two_peers_converge() {
        let a = LeaseStore::default();
        let b = LeaseStore::default();
        let k = key("catalog", "h:1");

        // the same identity registers at both peers before either replicates
        let at_a = a.put(InstanceInfo::new("catalog", "h:1", "h", 8080), LeaseDefaults::default(), 1_000).lease;
        let at_b = b.put(InstanceInfo::new("catalog", "h:1", "h", 9090), LeaseDefaults::default(), 1_000).lease;
        assert_eq!(at_a.version, at_b.version);

        let from_a = ReplicatedMutation::upsert(MutationKind::Register, &at_a);
        let from_b = ReplicatedMutation::upsert(MutationKind::Register, &at_b);
        assert_eq!(a.apply(&from_b, 1_001), ApplyOutcome::Applied);
        assert_eq!(b.apply(&from_a, 1_001), ApplyOutcome::Stale);

        assert_eq!(a.get(&k).unwrap().instance.port, 9090);
        assert_eq!(a.snapshot(true).applications, b.snapshot(true).applications);

        // redelivery changes nothing on either side
        assert_eq!(a.apply(&from_a, 1_002), ApplyOutcome::Stale);
        assert_eq!(b.apply(&from_b, 1_002), ApplyOutcome::Stale);
    }

    #[test]
    fn test_later_write_wins_version_tie() {
        let a = LeaseStore::default();
        let b = LeaseStore::default();
        let k = key("catalog", "h:1");

        let early = a.put(info("catalog", "h:1"), LeaseDefaults::default(), 1_000).lease;
        let late = b.put(info("catalog", "h:1").with_attribute("zone", "eu"), LeaseDefaults::default(), 2_000).lease;

        // whichever arrives first, both end with the later registration
        assert_eq!(a.apply(&ReplicatedMutation::upsert(MutationKind::Register, &late), 2_001), ApplyOutcome::Applied);
        assert_eq!(b.apply(&ReplicatedMutation::upsert(MutationKind::Register, &early), 2_001), ApplyOutcome::Stale);
        assert_eq!(a.get(&k).unwrap().last_dirty, 2_000);
        assert_eq!(a.snapshot(true).applications, b.snapshot(true).applications);
    }

    #[test]
    fn test_cancel_and_register_with_equal_versions_converge() {
        let a = LeaseStore::default();
        let b = LeaseStore::default();
        let k = key("catalog", "h:1");

        // a: register (v1) then cancel (v2). b: register (v1), renew (v2) at the same instant.
        a.put(info("catalog", "h:1"), LeaseDefaults::default(), 0);
        let cancelled = a.cancel(&k, 5_000).unwrap();
        b.put(info("catalog", "h:1"), LeaseDefaults::default(), 0);
        let renewed = b.renew(&k, 5_000).unwrap();
        assert_eq!(cancelled.version, renewed.version);

        let cancel =
            ReplicatedMutation::removal(MutationKind::Cancel, &k, cancelled.version, cancelled.last_dirty);
        let renew = ReplicatedMutation::upsert(MutationKind::Renew, &renewed);
        assert_eq!(a.apply(&renew, 5_001), ApplyOutcome::Stale);
        assert_eq!(b.apply(&cancel, 5_001), ApplyOutcome::Applied);

        assert!(a.get(&k).is_none());
        assert!(b.get(&k).is_none());
    }

    #[test]
    fn test_delta_and_too_stale() {
        let store = LeaseStore::new(LogLimits {
            retention: Duration::from_secs(180),
            max_entries: 3,
        });
        let k = key("catalog", "a");
        store.put(info("catalog", "a"), LeaseDefaults::default(), 0);
        let since = store.version();
        store.renew(&k, 1);
        store.cancel(&k, 2);

        let delta = store.delta(since).unwrap();
        let kinds: Vec<_> = delta.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MutationKind::Renew, MutationKind::Cancel]);
        assert!(store.delta(store.version()).unwrap().is_empty());

        // push the first entries out of the window
        store.put(info("catalog", "b"), LeaseDefaults::default(), 3);
        store.put(info("catalog", "c"), LeaseDefaults::default(), 4);
        assert!(matches!(store.delta(0), Err(RegistryError::TooStale { .. })));
        assert!(matches!(store.delta(999), Err(RegistryError::TooStale { .. })));
        assert_eq!(store.delta(2).unwrap().len(), 3);
    }

    #[test]
    fn test_log_prunes_by_age() {
        let store = LeaseStore::new(LogLimits {
            retention: Duration::from_secs(10),
            max_entries: 100,
        });
        store.put(info("catalog", "a"), LeaseDefaults::default(), 0);
        store.put(info("catalog", "b"), LeaseDefaults::default(), 20_000);
        assert!(store.delta(0).is_err());
        assert_eq!(store.delta(1).unwrap().len(), 1);
    }

    #[test]
    fn test_purge_tombstones_after_retention() {
        let store = LeaseStore::new(LogLimits {
            retention: Duration::from_secs(10),
            max_entries: 100,
        });
        store.put(info("catalog", "a"), LeaseDefaults::default(), 0);
        store.cancel(&key("catalog", "a"), 1_000);
        assert_eq!(store.purge_tombstones(5_000), 0);
        assert_eq!(store.purge_tombstones(20_000), 1);
    }

    #[test]
    fn test_load_snapshot_counts_applied() {
        let source = LeaseStore::default();
        source.put(info("catalog", "a"), LeaseDefaults::default(), 0);
        source.put(info("orders", "b").with_status(InstanceStatus::Down), LeaseDefaults::default(), 0);

        let target = LeaseStore::default();
        assert_eq!(target.load_snapshot(&source.snapshot(true), 0), 2);
        assert_eq!(target.load_snapshot(&source.snapshot(true), 0), 0);
        assert_eq!(target.snapshot(true).applications, source.snapshot(true).applications);
    }

    #[test]
    fn test_concurrent_renewals_keep_per_identity_order() {
        use std::sync::Arc;

        let store = Arc::new(LeaseStore::default());
        for i in 0..8 {
            store.put(info("catalog", &format!("i{}", i)), LeaseDefaults::default(), 0);
        }

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let k = key("catalog", &format!("i{}", i));
                    for t in 0..100 {
                        store.renew(&k, t);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.version(), 8 + 8 * 100);
        for i in 0..8 {
            assert_eq!(store.get(&key("catalog", &format!("i{}", i))).unwrap().version, 101);
        }
        let log = store.delta(0).unwrap();
        assert!(log.windows(2).all(|w| w[0].global_version + 1 == w[1].global_version));
    }
}
