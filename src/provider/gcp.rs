//! # GCP Secret Manager
//!
//! REST client for GCP Secret Manager API v1.
//!
//! - `put` adds a new version with `:addVersion`; on 404 the secret is created
//!   with automatic replication and the version added again
//! - `delete` removes the secret and all versions
//! - `tag_synced_secret` patches the secret's labels
//!
//! Access tokens come from the destination config or from the metadata server
//! (Workload Identity on GKE/GCE).
//!
//! References:
//! - [GCP Secret Manager REST API v1](https://cloud.google.com/secret-manager/docs/reference/rest)

use crate::constants::SYNCED_SECRET_TAG_KEY;
use crate::error::DestinationError;
use crate::model::{Destination, DestinationType, RenderedSecret};
use crate::provider::common::{
    bearer, check_response, classify_http_status, classify_transport_error, parse_config,
    track_request, TokenCache, TokenResponse,
};
use crate::provider::validation::validate_gcp_project_id;
use crate::provider::{AdapterFactory, AdapterResult, DestinationAdapter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT_ENDPOINT: &str = "https://secretmanager.googleapis.com";
const DEFAULT_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// `gcp-sm` destination config
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GcpSettings {
    pub project_id: String,
    /// Static OAuth2 access token; the metadata server is used when unset
    pub access_token: Option<String>,
    /// API base URL override
    pub endpoint: Option<String>,
    /// Metadata server token URL override
    pub metadata_token_url: Option<String>,
}

impl GcpSettings {
    fn validate(&self) -> Result<()> {
        validate_gcp_project_id(&self.project_id)
    }
}

#[derive(Debug, Serialize)]
struct Replication {
    automatic: AutomaticReplication,
}

#[derive(Debug, Serialize)]
struct AutomaticReplication {}

/// Body of `POST /v1/projects/{project}/secrets?secretId={id}`
#[derive(Debug, Serialize)]
struct CreateSecretRequest {
    replication: Replication,
    labels: BTreeMap<String, String>,
}

/// Body of `POST /v1/projects/{project}/secrets/{secret}:addVersion`
#[derive(Debug, Serialize)]
struct AddVersionRequest {
    payload: SecretPayload,
}

#[derive(Debug, Serialize)]
struct SecretPayload {
    /// Base64-encoded secret data
    data: String,
}

/// Body of `PATCH /v1/projects/{project}/secrets/{secret}?updateMask=labels`
#[derive(Debug, Serialize)]
struct UpdateLabelsRequest {
    labels: BTreeMap<String, String>,
}

/// GCP Secret Manager adapter
pub struct GcpSecretManager {
    http_client: Client,
    base_url: String,
    project_id: String,
    static_token: Option<String>,
    metadata_token_url: String,
    tokens: TokenCache,
    labels: BTreeMap<String, String>,
}

impl std::fmt::Debug for GcpSecretManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpSecretManager")
            .field("project_id", &self.project_id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GcpSecretManager {
    pub fn new(settings: &GcpSettings, custom_tags: &BTreeMap<String, String>) -> Result<Self> {
        settings.validate()?;

        let http_client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        let base_url = settings
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
            .trim_end_matches('/')
            .to_string();

        info!("Initializing GCP REST client for project: {}", settings.project_id);

        let mut labels: BTreeMap<String, String> = custom_tags
            .iter()
            .map(|(key, value)| (label_key(key), label_value(value)))
            .collect();
        labels.insert(label_key(SYNCED_SECRET_TAG_KEY), String::new());

        Ok(Self {
            http_client,
            base_url,
            project_id: settings.project_id.clone(),
            static_token: settings.access_token.clone(),
            metadata_token_url: settings
                .metadata_token_url
                .clone()
                .unwrap_or_else(|| DEFAULT_METADATA_TOKEN_URL.to_string()),
            tokens: TokenCache::default(),
            labels,
        })
    }

    fn secret_url(&self, name: &str) -> String {
        format!(
            "{}/v1/projects/{}/secrets/{}",
            self.base_url, self.project_id, name
        )
    }

    async fn access_token(&self) -> AdapterResult<String> {
        if let Some(token) = &self.static_token {
            return Ok(token.clone());
        }
        self.tokens
            .get_or_fetch(|| async {
                debug!("Requesting access token from metadata server");
                let response = self
                    .http_client
                    .get(&self.metadata_token_url)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|e| classify_transport_error(&e))?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(classify_http_status(status.as_u16(), &body));
                }
                response
                    .json::<TokenResponse>()
                    .await
                    .map_err(|e| classify_transport_error(&e))
            })
            .await
    }

    async fn request(&self, method: Method, url: &str) -> AdapterResult<RequestBuilder> {
        let token = self.access_token().await?;
        Ok(self
            .http_client
            .request(method, url)
            .header("Authorization", bearer(&token)))
    }

    async fn send(&self, request: RequestBuilder) -> AdapterResult<reqwest::Response> {
        request
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))
    }

    async fn add_version(&self, name: &str, secret: &RenderedSecret) -> AdapterResult<StatusCode> {
        let body = AddVersionRequest {
            payload: SecretPayload {
                data: general_purpose::STANDARD.encode(secret.value.as_bytes()),
            },
        };
        let url = format!("{}:addVersion", self.secret_url(name));
        let response = self
            .send(self.request(Method::POST, &url).await?.json(&body))
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(status);
        }
        check_response(response).await?;
        Ok(status)
    }

    async fn create_secret(&self, name: &str) -> AdapterResult<()> {
        info!("Creating new GCP secret: {}", name);
        let body = CreateSecretRequest {
            replication: Replication {
                automatic: AutomaticReplication {},
            },
            labels: self.labels.clone(),
        };
        let url = format!(
            "{}/v1/projects/{}/secrets",
            self.base_url, self.project_id
        );
        let response = self
            .send(
                self.request(Method::POST, &url)
                    .await?
                    .query(&[("secretId", name)])
                    .json(&body),
            )
            .await?;
        if response.status() == StatusCode::CONFLICT {
            debug!("GCP secret {} was created concurrently", name);
            return Ok(());
        }
        check_response(response).await
    }
}

#[async_trait]
impl DestinationAdapter for GcpSecretManager {
    fn destination_type(&self) -> DestinationType {
        DestinationType::GcpSm
    }

    fn supports_multi_value(&self) -> bool {
        true
    }

    async fn put(&self, name: &str, secret: &RenderedSecret) -> AdapterResult<()> {
        track_request(DestinationType::GcpSm, "put", name, async {
            if self.add_version(name, secret).await? != StatusCode::NOT_FOUND {
                return Ok(());
            }
            self.create_secret(name).await?;
            match self.add_version(name, secret).await? {
                StatusCode::NOT_FOUND => Err(DestinationError::external(
                    "http_404",
                    format!("secret {name} not visible after creation"),
                )),
                _ => Ok(()),
            }
        })
        .await
    }

    async fn delete(&self, name: &str) -> AdapterResult<()> {
        track_request(DestinationType::GcpSm, "delete", name, async {
            info!("Deleting GCP secret: {}", name);
            let response = self
                .send(self.request(Method::DELETE, &self.secret_url(name)).await?)
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                debug!("GCP secret {} already absent", name);
                return Ok(());
            }
            check_response(response).await
        })
        .await
    }

    async fn tag_synced_secret(&self, name: &str) -> AdapterResult<()> {
        track_request(DestinationType::GcpSm, "tag", name, async {
            let body = UpdateLabelsRequest {
                labels: self.labels.clone(),
            };
            let response = self
                .send(
                    self.request(Method::PATCH, &self.secret_url(name))
                        .await?
                        .query(&[("updateMask", "labels")])
                        .json(&body),
                )
                .await?;
            check_response(response).await
        })
        .await
    }
}

/// GCP label keys: lowercase letters, digits, `_` and `-`, starting with a letter
fn label_key(key: &str) -> String {
    let mut sanitized = label_value(key);
    if !sanitized.starts_with(|c: char| c.is_ascii_lowercase()) {
        sanitized.insert(0, 'k');
    }
    sanitized
}

fn label_value(value: &str) -> String {
    let mut sanitized: String = value
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    sanitized.truncate(63);
    sanitized
}

/// Builds [`GcpSecretManager`] adapters
#[derive(Debug, Default)]
pub struct GcpFactory;

#[async_trait]
impl AdapterFactory for GcpFactory {
    fn destination_type(&self) -> DestinationType {
        DestinationType::GcpSm
    }

    fn validate(&self, destination: &Destination) -> Result<()> {
        parse_config::<GcpSettings>(destination)?.validate()
    }

    async fn build(&self, destination: &Destination) -> Result<Arc<dyn DestinationAdapter>> {
        let settings: GcpSettings = parse_config(destination)?;
        Ok(Arc::new(GcpSecretManager::new(
            &settings,
            &destination.custom_tags,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_sanitization() {
        assert_eq!(label_key(SYNCED_SECRET_TAG_KEY), "hashicorp_vault");
        assert_eq!(label_key("Team"), "team");
        assert_eq!(label_key("1st"), "k1st");
        assert_eq!(label_value("Prod.EU"), "prod_eu");
    }

    #[test]
    fn test_project_id_required() {
        let destination = Destination::new(DestinationType::GcpSm, "shared");
        assert!(GcpFactory.validate(&destination).is_err());

        let destination = destination.with_config(serde_json::json!({"project_id": "acme"}));
        assert!(GcpFactory.validate(&destination).is_err());

        let destination = destination.with_config(serde_json::json!({"project_id": "acme-prod"}));
        assert!(GcpFactory.validate(&destination).is_ok());
    }

    #[test]
    fn test_endpoint_trailing_slash_trimmed() {
        let settings = GcpSettings {
            project_id: "acme-prod".to_string(),
            endpoint: Some("http://localhost:1234/".to_string()),
            ..GcpSettings::default()
        };
        let adapter = GcpSecretManager::new(&settings, &BTreeMap::new()).unwrap();
        assert_eq!(
            adapter.secret_url("db"),
            "http://localhost:1234/v1/projects/acme-prod/secrets/db"
        );
    }
}
