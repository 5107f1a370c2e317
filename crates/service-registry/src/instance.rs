use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{RegistryError, Result};

pub const MAX_ATTRIBUTE_KEY_LEN: usize = 64;
pub const MAX_ATTRIBUTE_VALUE_LEN: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    #[default]
    Up,
    Down,
    Starting,
    OutOfService,
    Unknown,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::OutOfService => "OUT_OF_SERVICE",
            InstanceStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "UP" => Ok(InstanceStatus::Up),
            "DOWN" => Ok(InstanceStatus::Down),
            "STARTING" => Ok(InstanceStatus::Starting),
            "OUT_OF_SERVICE" => Ok(InstanceStatus::OutOfService),
            "UNKNOWN" => Ok(InstanceStatus::Unknown),
            other => Err(RegistryError::InvalidInstance(format!(
                "unknown status: {}",
                other
            ))),
        }
    }
}

/// Identity of one registered instance. The application part is always
/// stored lower-cased so lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub app: String,
    pub instance_id: String,
}

impl InstanceKey {
    pub fn new(app: impl AsRef<str>, instance_id: impl Into<String>) -> Self {
        Self {
            app: normalize_app(app.as_ref()),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.instance_id)
    }
}

pub fn normalize_app(app: &str) -> String {
    app.trim().to_ascii_lowercase()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

/// Lease timings an instance may ask for at registration time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseTerms {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewal_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_duration_secs: Option<u64>,
}

/// What an instance sends when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub app: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_port: Option<u16>,
    #[serde(default)]
    pub scheme: Scheme,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub lease: LeaseTerms,
}

impl InstanceInfo {
    pub fn new(
        app: impl AsRef<str>,
        instance_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            app: normalize_app(app.as_ref()),
            instance_id: instance_id.into(),
            host: host.into(),
            port,
            secure_port: None,
            scheme: Scheme::Http,
            status: InstanceStatus::Up,
            attributes: BTreeMap::new(),
            lease: LeaseTerms::default(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_secure_port(mut self, port: u16) -> Self {
        self.secure_port = Some(port);
        self.scheme = Scheme::Https;
        self
    }

    pub fn with_lease_terms(mut self, renewal_interval_secs: u64, eviction_duration_secs: u64) -> Self {
        self.lease = LeaseTerms {
            renewal_interval_secs: Some(renewal_interval_secs),
            eviction_duration_secs: Some(eviction_duration_secs),
        };
        self
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.app, self.instance_id.clone())
    }

    /// Base URL other services use to reach this instance.
    pub fn endpoint(&self) -> String {
        match (self.scheme, self.secure_port) {
            (Scheme::Https, Some(port)) => format!("https://{}:{}", self.host, port),
            (Scheme::Https, None) => format!("https://{}:{}", self.host, self.port),
            (Scheme::Http, _) => format!("http://{}:{}", self.host, self.port),
        }
    }

    /// True when the network location differs from `other`.
    pub fn location_differs(&self, other: &InstanceInfo) -> bool {
        self.host != other.host
            || self.port != other.port
            || self.secure_port != other.secure_port
            || self.scheme != other.scheme
    }

    /// Normalises the application name and enforces the attribute bounds.
    pub fn validate(&mut self, max_attributes: usize) -> Result<()> {
        self.app = normalize_app(&self.app);

        if self.app.is_empty() {
            return Err(RegistryError::InvalidInstance("application name is empty".into()));
        }
        if self.instance_id.trim().is_empty() {
            return Err(RegistryError::InvalidInstance("instance id is empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(RegistryError::InvalidInstance("host is empty".into()));
        }
        if self.attributes.len() > max_attributes {
            return Err(RegistryError::InvalidInstance(format!(
                "{} attributes exceed the limit of {}",
                self.attributes.len(),
                max_attributes
            )));
        }
        for (key, value) in &self.attributes {
            if key.is_empty() || key.len() > MAX_ATTRIBUTE_KEY_LEN {
                return Err(RegistryError::InvalidInstance(format!(
                    "attribute key {:?} must be 1..={} bytes",
                    key, MAX_ATTRIBUTE_KEY_LEN
                )));
            }
            if value.len() > MAX_ATTRIBUTE_VALUE_LEN {
                return Err(RegistryError::InvalidInstance(format!(
                    "attribute {:?} value exceeds {} bytes",
                    key, MAX_ATTRIBUTE_VALUE_LEN
                )));
            }
        }
        if matches!(self.lease.renewal_interval_secs, Some(0))
            || matches!(self.lease.eviction_duration_secs, Some(0))
        {
            return Err(RegistryError::InvalidInstance("lease timings must be positive".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_case_insensitive_on_app() {
        assert_eq!(InstanceKey::new("Catalog", "a:1"), InstanceKey::new("CATALOG ", "a:1"));
        assert_ne!(InstanceKey::new("catalog", "a:1"), InstanceKey::new("catalog", "A:1"));
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        assert_eq!("out_of_service".parse::<InstanceStatus>().unwrap(), InstanceStatus::OutOfService);
        assert_eq!("Out-Of-Service".parse::<InstanceStatus>().unwrap(), InstanceStatus::OutOfService);
        assert_eq!(InstanceStatus::OutOfService.to_string(), "OUT_OF_SERVICE");
        assert!("sleepy".parse::<InstanceStatus>().is_err());

        let json = serde_json::to_string(&InstanceStatus::OutOfService).unwrap();
        assert_eq!(json, "\"OUT_OF_SERVICE\"");
    }

    #[test]
    fn test_validate_normalizes_app() {
        let mut info = InstanceInfo::new("x", "10.0.0.1:8080", "10.0.0.1", 8080);
        info.app = "  Product-Service ".to_string();
        info.validate(4).unwrap();
        assert_eq!(info.app, "product-service");
    }

    #[test]
    fn test_validate_rejects_too_many_attributes() {
        let mut info = InstanceInfo::new("catalog", "h:1", "h", 1)
            .with_attribute("a", "1")
            .with_attribute("b", "2")
            .with_attribute("c", "3");
        assert!(matches!(info.validate(2), Err(RegistryError::InvalidInstance(_))));
        assert!(info.validate(3).is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_values() {
        let mut info = InstanceInfo::new("catalog", "h:1", "h", 1)
            .with_attribute("zone", "x".repeat(MAX_ATTRIBUTE_VALUE_LEN + 1));
        assert!(info.validate(8).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_lease_terms() {
        let mut info = InstanceInfo::new("catalog", "h:1", "h", 1).with_lease_terms(0, 90);
        assert!(info.validate(8).is_err());
    }

    #[test]
    fn test_endpoint() {
        let plain = InstanceInfo::new("catalog", "h:8080", "h", 8080);
        assert_eq!(plain.endpoint(), "http://h:8080");

        let secure = plain.clone().with_secure_port(8443);
        assert_eq!(secure.endpoint(), "https://h:8443");
        assert!(secure.location_differs(&plain));
    }

    #[test]
    fn test_registration_body_defaults() {
        let info: InstanceInfo = serde_json::from_str(
            r#"{"app":"catalog","instanceId":"h:1","host":"h","port":1}"#,
        )
        .unwrap();
        assert_eq!(info.status, InstanceStatus::Up);
        assert_eq!(info.scheme, Scheme::Http);
        assert!(info.attributes.is_empty());
        assert_eq!(info.lease, LeaseTerms::default());
    }
}
