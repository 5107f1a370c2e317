pub mod api;
pub mod bootstrap;
pub mod client;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod error;
pub mod instance;
pub mod lease;
pub mod preservation;
pub mod registry;
pub mod replication;
pub mod store;
pub mod tasks;

pub use bootstrap::{bootstrap_service, get_service_endpoint, Registration};
pub use client::RegistryClient;
pub use config::{RegistryConfig, SharedConfig};
pub use discovery::{DeltaResponse, DiscoveryEngine};
pub use error::{RegistryError, Result};
pub use instance::{InstanceInfo, InstanceKey, InstanceStatus};
pub use lease::{Lease, RegistrySnapshot};
pub use registry::Registry;
pub use store::LeaseStore;

// Re-export the macro
pub use service_registry_macros::register_service;
