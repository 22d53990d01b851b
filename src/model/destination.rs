//! # Destinations
//!
//! A destination is a configured external system receiving synced secrets,
//! identified by its type tag and name.

use crate::constants::{DEFAULT_SECRET_KEY_TEMPLATE, DEFAULT_SECRET_PATH_TEMPLATE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Destination type tag
///
/// Selects the adapter implementation in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DestinationType {
    /// AWS Secrets Manager
    #[serde(rename = "aws-sm")]
    AwsSm,
    /// GCP Secret Manager
    #[serde(rename = "gcp-sm")]
    GcpSm,
    /// Azure Key Vault
    #[serde(rename = "azure-kv")]
    AzureKv,
    /// Process-local store
    #[serde(rename = "in-mem")]
    InMem,
}

impl DestinationType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationType::AwsSm => "aws-sm",
            DestinationType::GcpSm => "gcp-sm",
            DestinationType::AzureKv => "azure-kv",
            DestinationType::InMem => "in-mem",
        }
    }
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DestinationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws-sm" => Ok(DestinationType::AwsSm),
            "gcp-sm" => Ok(DestinationType::GcpSm),
            "azure-kv" => Ok(DestinationType::AzureKv),
            "in-mem" => Ok(DestinationType::InMem),
            other => Err(format!("unknown destination type: {other}")),
        }
    }
}

/// How a multi-value secret is laid out at the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Granularity {
    /// One external secret holding the whole key/value map
    #[default]
    SecretPath,
    /// One external secret per key
    SecretKey,
}

impl Granularity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::SecretPath => "secret-path",
            Granularity::SecretKey => "secret-key",
        }
    }

    /// Template used when a destination has none configured
    #[must_use]
    pub fn default_template(&self) -> &'static str {
        match self {
            Granularity::SecretPath => DEFAULT_SECRET_PATH_TEMPLATE,
            Granularity::SecretKey => DEFAULT_SECRET_KEY_TEMPLATE,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination identity: `(type, name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationId {
    #[serde(rename = "type")]
    pub kind: DestinationType,
    pub name: String,
}

impl DestinationId {
    pub fn new(kind: DestinationType, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A configured destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Destination {
    pub id: DestinationId,
    /// Connection settings, opaque to everything but the adapter
    #[serde(default)]
    pub config: serde_json::Value,
    /// Name template; the granularity default applies when unset
    #[serde(default)]
    pub secret_name_template: Option<String>,
    #[serde(default)]
    pub granularity: Granularity,
    /// Extra tags attached by adapters that support tagging
    #[serde(default)]
    pub custom_tags: BTreeMap<String, String>,
    /// Bumped whenever `config` changes so cached clients get rebuilt
    #[serde(default)]
    pub config_version: u64,
    /// Set while a cascading delete is in progress
    #[serde(default)]
    pub deleting: bool,
}

impl Destination {
    pub fn new(kind: DestinationType, name: impl Into<String>) -> Self {
        Self {
            id: DestinationId::new(kind, name),
            config: serde_json::Value::Object(serde_json::Map::new()),
            secret_name_template: None,
            granularity: Granularity::SecretPath,
            custom_tags: BTreeMap::new(),
            config_version: 0,
            deleting: false,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.secret_name_template = Some(template.into());
        self
    }

    #[must_use]
    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_tags.insert(key.into(), value.into());
        self
    }

    /// Template in effect for the given granularity
    #[must_use]
    pub fn effective_template(&self, granularity: Granularity) -> &str {
        self.secret_name_template
            .as_deref()
            .unwrap_or_else(|| granularity.default_template())
    }
}

/// Mutable destination fields; `None` leaves a field untouched
#[derive(Debug, Clone, Default)]
pub struct DestinationUpdate {
    pub config: Option<serde_json::Value>,
    /// `Some(None)` clears the template back to the default
    pub secret_name_template: Option<Option<String>>,
    pub granularity: Option<Granularity>,
    pub custom_tags: Option<BTreeMap<String, String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_id_display() {
        let id = DestinationId::new(DestinationType::AwsSm, "prod");
        assert_eq!(id.to_string(), "aws-sm/prod");
    }

    #[test]
    fn test_type_tags_parse() {
        for kind in [
            DestinationType::AwsSm,
            DestinationType::GcpSm,
            DestinationType::AzureKv,
            DestinationType::InMem,
        ] {
            assert_eq!(kind.as_str().parse::<DestinationType>().unwrap(), kind);
        }
        assert!("gh".parse::<DestinationType>().is_err());
    }

    #[test]
    fn test_effective_template_falls_back_per_granularity() {
        let destination = Destination::new(DestinationType::AwsSm, "prod");
        assert_eq!(
            destination.effective_template(Granularity::SecretPath),
            DEFAULT_SECRET_PATH_TEMPLATE
        );
        assert_eq!(
            destination.effective_template(Granularity::SecretKey),
            DEFAULT_SECRET_KEY_TEMPLATE
        );

        let custom = destination.with_template("{{ .SecretBaseName }}");
        assert_eq!(
            custom.effective_template(Granularity::SecretKey),
            "{{ .SecretBaseName }}"
        );
    }

    #[test]
    fn test_destination_deserializes_with_defaults() {
        let destination: Destination = serde_json::from_value(serde_json::json!({
            "id": { "type": "gcp-sm", "name": "shared" },
            "config": { "project_id": "acme" },
            "granularity": "secret-key"
        }))
        .unwrap();

        assert_eq!(destination.id.kind, DestinationType::GcpSm);
        assert_eq!(destination.granularity, Granularity::SecretKey);
        assert!(destination.secret_name_template.is_none());
        assert!(!destination.deleting);
    }
}
