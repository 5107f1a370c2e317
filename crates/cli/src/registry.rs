use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::TlsMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub app: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_port: Option<u16>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

fn default_status() -> String {
    "UP".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub instance: Instance,
    #[serde(default)]
    pub last_renewal: u64,
    pub version: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    #[serde(default)]
    pub applications: BTreeMap<String, Vec<Lease>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEntry {
    pub global_version: u64,
    pub kind: String,
    pub app: String,
    pub instance_id: String,
    pub version: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Delta {
    #[serde(rename_all = "camelCase")]
    Delta {
        current_version: u64,
        mutations: Vec<MutationEntry>,
    },
    #[serde(rename_all = "camelCase")]
    TooStale { current_version: u64 },
}

pub struct RegistryClient {
    base_url: String,
    client: reqwest::Client,
}

impl RegistryClient {
    pub fn new(base_url: String) -> Self {
        Self::with_tls(base_url, TlsMode::None)
    }

    pub fn with_tls(base_url: String, tls: TlsMode) -> Self {
        let client = match tls {
            TlsMode::None => reqwest::Client::new(),
            TlsMode::SelfSigned => reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .unwrap_or_default(),
        };
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Base URL plus `segments`, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .with_context(|| format!("Invalid registry URL {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Registry URL {} cannot take a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn ensure_success(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        anyhow::bail!("Failed to {} ({}): {}", what, status, error_text);
    }

    pub async fn list_apps(&self, include_all: bool) -> Result<Snapshot> {
        let response = self
            .client
            .get(self.endpoint(&["apps"])?)
            .query(&[("includeAll", include_all)])
            .send()
            .await
            .context("Failed to send list applications request")?;

        Self::ensure_success(response, "list applications")
            .await?
            .json()
            .await
            .context("Failed to parse registry snapshot")
    }

    pub async fn get_app(&self, app: &str, include_all: bool) -> Result<Vec<Lease>> {
        let response = self
            .client
            .get(self.endpoint(&["apps", app])?)
            .query(&[("includeAll", include_all)])
            .send()
            .await
            .context("Failed to send application lookup request")?;

        Self::ensure_success(response, "look up application")
            .await?
            .json()
            .await
            .context("Failed to parse application instances")
    }

    pub async fn delta(&self, since: u64) -> Result<Delta> {
        let response = self
            .client
            .get(self.endpoint(&["apps"])?)
            .query(&[("sinceVersion", since)])
            .send()
            .await
            .context("Failed to send delta request")?;

        Self::ensure_success(response, "fetch delta")
            .await?
            .json()
            .await
            .context("Failed to parse delta response")
    }

    pub async fn register(&self, instance: &Instance) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(&["apps", instance.app.as_str()])?)
            .json(instance)
            .send()
            .await
            .context("Failed to send register request")?;

        Self::ensure_success(response, "register instance").await?;
        Ok(())
    }

    pub async fn renew(&self, app: &str, instance_id: &str) -> Result<Lease> {
        let response = self
            .client
            .put(self.endpoint(&["apps", app, instance_id])?)
            .send()
            .await
            .context("Failed to send renew request")?;

        Self::ensure_success(response, "renew lease")
            .await?
            .json()
            .await
            .context("Failed to parse renewed lease")
    }

    pub async fn cancel(&self, app: &str, instance_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.endpoint(&["apps", app, instance_id])?)
            .send()
            .await
            .context("Failed to send cancel request")?;

        Self::ensure_success(response, "cancel instance").await?;
        Ok(())
    }

    pub async fn set_status(&self, app: &str, instance_id: &str, status: &str) -> Result<Lease> {
        let response = self
            .client
            .put(self.endpoint(&["apps", app, instance_id, "status"])?)
            .json(&serde_json::json!({ "status": status.to_ascii_uppercase().replace('-', "_") }))
            .send()
            .await
            .context("Failed to send status request")?;

        Self::ensure_success(response, "set status")
            .await?
            .json()
            .await
            .context("Failed to parse updated lease")
    }

    pub async fn node_status(&self) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(self.endpoint(&["admin", "status"])?)
            .send()
            .await
            .context("Failed to send status request")?;

        Self::ensure_success(response, "read node status")
            .await?
            .json()
            .await
            .context("Failed to parse node status")
    }

    pub async fn refresh(&self) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(self.endpoint(&["admin", "refresh"])?)
            .send()
            .await
            .context("Failed to send refresh request")?;

        Self::ensure_success(response, "refresh configuration")
            .await?
            .json()
            .await
            .context("Failed to parse refresh response")
    }
}
