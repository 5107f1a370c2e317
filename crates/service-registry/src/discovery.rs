use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::RegistryError;
use crate::lease::{Lease, Mutation, RegistrySnapshot};
use crate::store::LeaseStore;

/// Answer to an incremental sync request.
///
/// Versions count in the log named by `log_id`. Each node keeps its own
/// log, so a client that changes node must not resume from its old version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeltaResponse {
    #[serde(rename_all = "camelCase")]
    Delta {
        #[serde(default)]
        log_id: String,
        since_version: u64,
        current_version: u64,
        mutations: Vec<Mutation>,
    },
    /// The requested version is no longer covered by the mutation log, the
    /// client has to fetch the full registry.
    #[serde(rename_all = "camelCase")]
    TooStale {
        #[serde(default)]
        log_id: String,
        current_version: u64,
    },
}

impl DeltaResponse {
    pub fn current_version(&self) -> u64 {
        match self {
            DeltaResponse::Delta { current_version, .. } => *current_version,
            DeltaResponse::TooStale { current_version, .. } => *current_version,
        }
    }

    pub fn log_id(&self) -> &str {
        match self {
            DeltaResponse::Delta { log_id, .. } | DeltaResponse::TooStale { log_id, .. } => log_id.as_str(),
        }
    }
}

/// Read side of the registry. Never mutates the store.
#[derive(Clone)]
pub struct DiscoveryEngine {
    store: Arc<LeaseStore>,
    log_id: String,
}

impl DiscoveryEngine {
    pub fn new(store: Arc<LeaseStore>, log_id: impl Into<String>) -> Self {
        Self {
            store,
            log_id: log_id.into(),
        }
    }

    pub fn get_application(&self, app: &str, include_all: bool) -> Vec<Lease> {
        self.store.application(app, include_all)
    }

    pub fn get_all(&self, include_all: bool) -> RegistrySnapshot {
        let mut snapshot = self.store.snapshot(include_all);
        snapshot.log_id = self.log_id.clone();
        snapshot
    }

    pub fn get_delta(&self, since: u64) -> DeltaResponse {
        match self.store.delta(since) {
            Ok(mutations) => {
                // log entries are contiguous up to the current version
                let current_version = mutations
                    .last()
                    .map(|m| m.global_version)
                    .unwrap_or(since)
                    .max(since);
                DeltaResponse::Delta {
                    log_id: self.log_id.clone(),
                    since_version: since,
                    current_version,
                    mutations,
                }
            }
            Err(RegistryError::TooStale { current, .. }) => DeltaResponse::TooStale {
                log_id: self.log_id.clone(),
                current_version: current,
            },
            Err(_) => DeltaResponse::TooStale {
                log_id: self.log_id.clone(),
                current_version: self.store.version(),
            },
        }
    }
}
