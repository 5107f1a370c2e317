use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::instance::{InstanceInfo, InstanceKey, InstanceStatus};

/// Total order over competing writes to one identity.
///
/// Versions are counted per node, so two peers can hand out the same version
/// for different writes. Ties fall to the later write at its origin, then to
/// a removal, then to the written content, so every peer keeps the same
/// winner whatever order the writes arrive in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Precedence<'a> {
    version: u64,
    dirty_at: u64,
    removal: bool,
    content: Option<(&'a str, u16, Option<u16>, InstanceStatus, &'a BTreeMap<String, String>)>,
}

impl<'a> Precedence<'a> {
    pub fn removal(version: u64, dirty_at: u64) -> Self {
        Self {
            version,
            dirty_at,
            removal: true,
            content: None,
        }
    }

    fn upsert(version: u64, dirty_at: u64, instance: &'a InstanceInfo) -> Self {
        Self {
            version,
            dirty_at,
            removal: false,
            content: Some((
                instance.host.as_str(),
                instance.port,
                instance.secure_port,
                instance.status,
                &instance.attributes,
            )),
        }
    }
}

/// A time-bounded claim that an instance is alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub instance: InstanceInfo,
    pub registered_at: u64,
    pub last_renewal: u64,
    pub renewal_interval_secs: u64,
    pub eviction_duration_secs: u64,
    pub version: u64,
    /// When the lease was last written at the node that made the change.
    #[serde(default)]
    pub last_dirty: u64,
}

impl Lease {
    pub fn key(&self) -> InstanceKey {
        self.instance.key()
    }

    pub fn status(&self) -> InstanceStatus {
        self.instance.status
    }

    pub fn is_up(&self) -> bool {
        self.instance.status == InstanceStatus::Up
    }

    pub fn precedence(&self) -> Precedence<'_> {
        Precedence::upsert(self.version, self.last_dirty, &self.instance)
    }

    /// Expired once strictly more than the eviction duration has passed
    /// since the last renewal.
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.last_renewal) > self.eviction_duration_secs.saturating_mul(1_000)
    }
}

/// Registry default lease timings, applied when an instance does not ask
/// for its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseDefaults {
    pub renewal_interval_secs: u64,
    pub eviction_duration_secs: u64,
}

impl Default for LeaseDefaults {
    fn default() -> Self {
        Self {
            renewal_interval_secs: 30,
            eviction_duration_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationKind {
    Register,
    Renew,
    StatusChange,
    Cancel,
    Evict,
}

impl MutationKind {
    pub fn is_removal(self) -> bool {
        matches!(self, MutationKind::Cancel | MutationKind::Evict)
    }
}

/// One entry of the registry mutation log, as served in deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub global_version: u64,
    pub kind: MutationKind,
    pub app: String,
    pub instance_id: String,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    pub timestamp: u64,
}

impl Mutation {
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.app, self.instance_id.clone())
    }
}

/// A mutation as shipped to peers. Upserts carry the full lease so a peer
/// that missed the registration can still converge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedMutation {
    pub kind: MutationKind,
    pub app: String,
    pub instance_id: String,
    pub version: u64,
    /// Origin time of the write.
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

impl ReplicatedMutation {
    pub fn upsert(kind: MutationKind, lease: &Lease) -> Self {
        Self {
            kind,
            app: lease.instance.app.clone(),
            instance_id: lease.instance.instance_id.clone(),
            version: lease.version,
            timestamp: lease.last_dirty,
            lease: Some(lease.clone()),
        }
    }

    pub fn removal(kind: MutationKind, key: &InstanceKey, version: u64, timestamp: u64) -> Self {
        Self {
            kind,
            app: key.app.clone(),
            instance_id: key.instance_id.clone(),
            version,
            timestamp,
            lease: None,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.app, self.instance_id.clone())
    }

    /// `None` for an upsert that carries no lease.
    pub fn precedence(&self) -> Option<Precedence<'_>> {
        if self.kind.is_removal() {
            return Some(Precedence::removal(self.version, self.timestamp));
        }
        self.lease
            .as_ref()
            .map(|lease| Precedence::upsert(self.version, self.timestamp, &lease.instance))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Stale,
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    /// Names the mutation log `version` counts in. Versions from different
    /// logs cannot be compared.
    #[serde(default)]
    pub log_id: String,
    pub version: u64,
    pub applications: BTreeMap<String, Vec<Lease>>,
}

impl RegistrySnapshot {
    pub fn application(&self, app: &str) -> &[Lease] {
        self.applications
            .get(&crate::instance::normalize_app(app))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn instance_count(&self) -> usize {
        self.applications.values().map(Vec::len).sum()
    }

    pub fn leases(&self) -> impl Iterator<Item = &Lease> {
        self.applications.values().flatten()
    }
}
