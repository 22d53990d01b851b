//! # Secret Data and Rendered Payloads
//!
//! `SecretData` is what the source store returns for one secret version.
//! `RenderedSecret` is what an adapter writes: one per association under
//! `secret-path` granularity, one per key under `secret-key` granularity.

use crate::model::Granularity;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

/// One version of a key/value secret
#[derive(Clone, PartialEq)]
pub struct SecretData {
    pub version: u64,
    pub data: Map<String, Value>,
}

impl fmt::Debug for SecretData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretData")
            .field("version", &self.version)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretData {
    #[must_use]
    pub fn new(version: u64, data: Map<String, Value>) -> Self {
        Self { version, data }
    }

    /// Payloads for the given granularity as `(secret_key, value)` pairs
    ///
    /// `secret-path` yields a single pair holding the JSON-encoded map.
    /// `secret-key` yields one pair per key, in key order; strings are written
    /// verbatim and every other value as its JSON text.
    #[must_use]
    pub fn payloads(&self, granularity: Granularity) -> Vec<(Option<String>, Zeroizing<String>)> {
        match granularity {
            Granularity::SecretPath => {
                let encoded = Value::Object(self.data.clone()).to_string();
                vec![(None, Zeroizing::new(encoded))]
            }
            Granularity::SecretKey => {
                let mut keys: Vec<&String> = self.data.keys().collect();
                keys.sort();
                keys.into_iter()
                    .map(|key| {
                        let value = encode_key_value(&self.data[key]);
                        (Some(key.clone()), Zeroizing::new(value))
                    })
                    .collect()
            }
        }
    }
}

fn encode_key_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Payload written to one external secret
#[derive(Clone)]
pub struct RenderedSecret {
    /// Sanitized external name
    pub name: String,
    /// Source key under `secret-key` granularity
    pub secret_key: Option<String>,
    pub value: Zeroizing<String>,
    /// The value is a JSON object the destination stores as structured data
    pub structured: bool,
}

impl fmt::Debug for RenderedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderedSecret")
            .field("name", &self.name)
            .field("secret_key", &self.secret_key)
            .field("structured", &self.structured)
            .field("value", &"***")
            .finish()
    }
}

impl RenderedSecret {
    /// SHA-256 over name, layout and value; recorded to detect drift without
    /// keeping the value around
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0u8, u8::from(self.structured)]);
        hasher.update(self.value.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> SecretData {
        match value {
            Value::Object(map) => SecretData::new(3, map),
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_secret_path_payload_is_whole_map() {
        let secret = data(json!({"foo": "bar", "baz": "qux"}));
        let payloads = secret.payloads(Granularity::SecretPath);
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].0.is_none());
        let parsed: Value = serde_json::from_str(&payloads[0].1).unwrap();
        assert_eq!(parsed, json!({"foo": "bar", "baz": "qux"}));
    }

    #[test]
    fn test_secret_key_payloads_encode_nested_values() {
        let secret = data(json!({
            "user": "admin",
            "ports": [5432, 5433],
            "opts": {"ssl": true},
            "retries": 3
        }));
        let payloads: Vec<(Option<String>, String)> = secret
            .payloads(Granularity::SecretKey)
            .into_iter()
            .map(|(k, v)| (k, v.to_string()))
            .collect();

        assert_eq!(
            payloads,
            vec![
                (Some("opts".to_string()), r#"{"ssl":true}"#.to_string()),
                (Some("ports".to_string()), "[5432,5433]".to_string()),
                (Some("retries".to_string()), "3".to_string()),
                (Some("user".to_string()), "admin".to_string()),
            ]
        );
    }

    #[test]
    fn test_digest_tracks_name_and_value() {
        let base = RenderedSecret {
            name: "vault/kv/app".to_string(),
            secret_key: None,
            value: Zeroizing::new("{\"a\":\"1\"}".to_string()),
            structured: true,
        };
        let same = base.clone();
        let mut renamed = base.clone();
        renamed.name = "vault/kv/other".to_string();
        let mut flat = base.clone();
        flat.structured = false;

        assert_eq!(base.digest(), same.digest());
        assert_ne!(base.digest(), renamed.digest());
        assert_ne!(base.digest(), flat.digest());
    }

    #[test]
    fn test_debug_hides_values() {
        let rendered = RenderedSecret {
            name: "n".to_string(),
            secret_key: None,
            value: Zeroizing::new("hunter2".to_string()),
            structured: false,
        };
        assert!(!format!("{rendered:?}").contains("hunter2"));
    }
}
