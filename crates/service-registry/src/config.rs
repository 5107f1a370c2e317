use figment::providers::{Env, Serialized};
use figment::value::Value;
use figment::Figment;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, Result};
use crate::lease::LeaseDefaults;
use crate::preservation::PreservationParams;
use crate::store::LogLimits;

const PROPERTY_PREFIX: &str = "registry.";
const ENV_PREFIX: &str = "REGISTRY_";

/// Runtime settings of one registry node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RegistryConfig {
    pub node_id: String,
    pub bind_addr: String,
    /// URL peers use to reach this node; filtered out of `peers`.
    pub node_url: Option<String>,
    #[serde(deserialize_with = "comma_list")]
    pub peers: Vec<String>,

    pub renewal_interval_secs: u64,
    pub eviction_duration_secs: u64,
    pub eviction_interval_secs: u64,

    pub self_preservation_enabled: bool,
    pub renewal_threshold: f64,
    pub threshold_update_interval_secs: u64,
    pub rate_smoothing: f64,

    pub peer_health_interval_secs: u64,
    pub replication_max_attempts: u32,
    pub replication_initial_backoff_ms: u64,
    pub replication_max_backoff_ms: u64,
    pub replication_timeout_ms: u64,
    pub replication_batch_size: usize,
    pub replication_queue_capacity: usize,

    pub request_timeout_ms: u64,
    pub delta_retention_secs: u64,
    pub delta_max_entries: usize,
    pub max_attributes: usize,

    pub config_server_url: Option<String>,
    pub config_application: String,
    pub config_profile: String,
    pub config_refresh_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let node_id = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "registry".to_string());

        Self {
            node_id,
            bind_addr: "0.0.0.0:8761".to_string(),
            node_url: None,
            peers: Vec::new(),
            renewal_interval_secs: 30,
            eviction_duration_secs: 90,
            eviction_interval_secs: 60,
            self_preservation_enabled: true,
            renewal_threshold: 0.85,
            threshold_update_interval_secs: 60,
            rate_smoothing: 0.5,
            peer_health_interval_secs: 15,
            replication_max_attempts: 5,
            replication_initial_backoff_ms: 200,
            replication_max_backoff_ms: 5_000,
            replication_timeout_ms: 2_000,
            replication_batch_size: 250,
            replication_queue_capacity: 10_000,
            request_timeout_ms: 5_000,
            delta_retention_secs: 180,
            delta_max_entries: 10_000,
            max_attributes: 32,
            config_server_url: None,
            config_application: "service-registry".to_string(),
            config_profile: "default".to_string(),
            config_refresh_interval_secs: 60,
        }
    }
}

impl RegistryConfig {
    /// Defaults, then `.env`, then `REGISTRY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let env = Env::prefixed(ENV_PREFIX)
            .map(|key| key.as_str().to_ascii_lowercase().replace('_', "-").into());
        Self::extract(Figment::new().merge(Serialized::defaults(Self::default())).merge(env))
    }

    /// This configuration overlaid with the `registry.*` entries of `props`.
    /// Other keys are ignored. String settings take the value verbatim,
    /// everything else is parsed.
    pub fn with_properties(&self, props: &HashMap<String, String>) -> Result<Self> {
        let current = serde_json::to_value(self)?;
        let mut overlay: BTreeMap<String, Value> = BTreeMap::new();

        for (key, value) in props {
            let Some(field) = key.strip_prefix(PROPERTY_PREFIX) else {
                continue;
            };
            let value = value.trim();
            match current.get(field) {
                None => warn!("Ignoring unknown setting {}", key),
                Some(serde_json::Value::String(_)) | Some(serde_json::Value::Null) => {
                    overlay.insert(field.to_string(), Value::from(value.to_string()));
                }
                Some(_) => {
                    let parsed = value
                        .parse::<Value>()
                        .unwrap_or_else(|_| Value::from(value.to_string()));
                    overlay.insert(field.to_string(), parsed);
                }
            }
        }

        Self::extract(
            Figment::new()
                .merge(Serialized::defaults(self))
                .merge(Serialized::defaults(overlay)),
        )
    }

    fn extract(figment: Figment) -> Result<Self> {
        let mut config: Self = figment
            .extract()
            .map_err(|e| RegistryError::InvalidConfig(e.to_string()))?;
        config.node_url = config.node_url.filter(|u| !u.trim().is_empty());
        config.config_server_url = config.config_server_url.filter(|u| !u.trim().is_empty());
        config.validate()?;
        Ok(config)
    }

    /// Range checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        for (name, value) in [
            ("node-id", &self.node_id),
            ("bind-addr", &self.bind_addr),
            ("config-application", &self.config_application),
            ("config-profile", &self.config_profile),
        ] {
            if value.trim().is_empty() {
                problems.push(format!("{} is empty", name));
            }
        }

        for (name, value) in [
            ("renewal-interval-secs", self.renewal_interval_secs),
            ("eviction-duration-secs", self.eviction_duration_secs),
            ("eviction-interval-secs", self.eviction_interval_secs),
            ("threshold-update-interval-secs", self.threshold_update_interval_secs),
            ("peer-health-interval-secs", self.peer_health_interval_secs),
            ("replication-max-attempts", u64::from(self.replication_max_attempts)),
            ("replication-timeout-ms", self.replication_timeout_ms),
            ("replication-batch-size", self.replication_batch_size as u64),
            ("replication-queue-capacity", self.replication_queue_capacity as u64),
            ("request-timeout-ms", self.request_timeout_ms),
            ("delta-retention-secs", self.delta_retention_secs),
            ("delta-max-entries", self.delta_max_entries as u64),
            ("config-refresh-interval-secs", self.config_refresh_interval_secs),
        ] {
            if value == 0 {
                problems.push(format!("{} must be positive", name));
            }
        }

        for (name, value) in [
            ("renewal-threshold", self.renewal_threshold),
            ("rate-smoothing", self.rate_smoothing),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                problems.push(format!("{} must be in (0, 1], got {}", name, value));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::InvalidConfig(problems.join("; ")))
        }
    }

    pub fn lease_defaults(&self) -> LeaseDefaults {
        LeaseDefaults {
            renewal_interval_secs: self.renewal_interval_secs,
            eviction_duration_secs: self.eviction_duration_secs,
        }
    }

    pub fn preservation_params(&self) -> PreservationParams {
        PreservationParams {
            renewal_interval_secs: self.renewal_interval_secs,
            renewal_threshold: self.renewal_threshold,
            smoothing: self.rate_smoothing,
        }
    }

    pub fn log_limits(&self) -> LogLimits {
        LogLimits {
            retention: Duration::from_secs(self.delta_retention_secs),
            max_entries: self.delta_max_entries,
        }
    }

    /// Peer URLs with trailing slashes removed, invalid URLs and this node's
    /// own URL dropped.
    pub fn peer_urls(&self) -> Vec<String> {
        let own = self.node_url.as_deref().map(normalize_url);
        let mut urls = Vec::new();

        for peer in &self.peers {
            if url::Url::parse(peer).is_err() {
                warn!("Ignoring invalid peer URL: {}", peer);
                continue;
            }
            let peer = normalize_url(peer);
            if own.as_deref() == Some(peer.as_str()) || urls.contains(&peer) {
                continue;
            }
            urls.push(peer);
        }
        urls
    }
}

pub fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Accepts a list or a comma separated string.
fn comma_list<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Joined(String),
    }

    let items = match Raw::deserialize(deserializer)? {
        Raw::List(items) => items,
        Raw::Joined(joined) => joined.split(',').map(str::to_string).collect(),
    };
    Ok(items
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PropertySource {
    #[serde(default)]
    name: String,
    #[serde(default)]
    source: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvironmentDocument {
    #[serde(default)]
    property_sources: Vec<PropertySource>,
}

/// Flattens a config-server environment document. Earlier property sources
/// take precedence over later ones.
pub fn parse_environment(body: &str) -> Result<HashMap<String, String>> {
    let doc: EnvironmentDocument = serde_json::from_str(body)?;
    let mut props = HashMap::new();

    for source in doc.property_sources.iter().rev() {
        debug!("Reading property source {}", source.name);
        for (key, value) in &source.source {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => continue,
                serde_json::Value::Array(items) => items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect::<Vec<_>>()
                    .join(","),
                other => other.to_string(),
            };
            props.insert(key.clone(), value);
        }
    }

    Ok(props)
}

/// Fetches properties from the configuration distribution service.
#[derive(Debug, Clone)]
pub struct ConfigClient {
    url: String,
    client: reqwest::Client,
}

impl ConfigClient {
    pub fn new(base_url: &str, application: &str, profile: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            url: format!("{}/{}/{}", normalize_url(base_url), application, profile),
            client,
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Option<Self> {
        config.config_server_url.as_deref().map(|url| {
            Self::new(
                url,
                &config.config_application,
                &config.config_profile,
                Duration::from_millis(config.request_timeout_ms),
            )
        })
    }

    pub async fn fetch(&self) -> Result<HashMap<String, String>> {
        debug!("Fetching configuration from {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| RegistryError::ConfigUnavailable(format!("{}: {}", self.url, e)))?;

        if !response.status().is_success() {
            return Err(RegistryError::ConfigUnavailable(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RegistryError::ConfigUnavailable(e.to_string()))?;
        parse_environment(&body)
    }
}

/// The node's live configuration.
///
/// `base` is what the process started with (defaults and environment); every
/// refresh re-applies the remote properties on top of it and publishes the
/// result to all subscribers.
pub struct SharedConfig {
    base: RegistryConfig,
    remote: Option<ConfigClient>,
    tx: watch::Sender<RegistryConfig>,
}

impl SharedConfig {
    pub fn new(base: RegistryConfig) -> Self {
        let remote = ConfigClient::from_config(&base);
        let (tx, _) = watch::channel(base.clone());
        Self { base, remote, tx }
    }

    pub fn current(&self) -> RegistryConfig {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistryConfig> {
        self.tx.subscribe()
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Re-reads the remote properties. Returns whether anything changed.
    pub async fn refresh(&self) -> Result<bool> {
        let Some(remote) = &self.remote else {
            return Ok(false);
        };
        let props = remote.fetch().await?;
        self.apply(&props)
    }

    /// Publishes `base` overlaid with `props`. Startup-only settings keep
    /// the values the process started with. An invalid overlay is rejected
    /// as a whole and nothing is published.
    pub fn apply(&self, props: &HashMap<String, String>) -> Result<bool> {
        let mut next = self.base.with_properties(props)?;
        next.node_id = self.base.node_id.clone();
        next.bind_addr = self.base.bind_addr.clone();
        next.config_server_url = self.base.config_server_url.clone();

        Ok(self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                info!("Configuration updated from {} properties", props.len());
                *current = next;
                true
            }
        }))
    }
}
