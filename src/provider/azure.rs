//! # Azure Key Vault
//!
//! REST client for the Key Vault secrets API (api-version 7.4).
//!
//! Key Vault secrets hold a single string, so multi-value secrets are written
//! as JSON text. Tags travel with every `PUT`, which makes
//! `tag_synced_secret` a no-op. Deleted secrets are purged when the vault
//! allows it so a later recreate under the same name does not conflict with
//! the soft-deleted copy.
//!
//! Access tokens come from the destination config or from the client
//! credentials flow against Azure AD.

use crate::constants::{SYNCED_SECRET_TAG_KEY, SYNCED_SECRET_TAG_VALUE};
use crate::error::DestinationError;
use crate::model::{Destination, DestinationType, RenderedSecret};
use crate::provider::common::{
    bearer, check_response, classify_http_status, classify_transport_error, parse_config,
    track_request, truncate_message, TokenCache, TokenResponse,
};
use crate::provider::validation::validate_azure_vault_name;
use crate::provider::{AdapterFactory, AdapterResult, DestinationAdapter};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

const API_VERSION: &str = "7.4";
const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
const VAULT_SCOPE: &str = "https://vault.azure.net/.default";

/// `azure-kv` destination config
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AzureSettings {
    /// Full vault URL, or a bare vault name expanded to `https://{name}.vault.azure.net`
    pub key_vault_uri: String,
    /// Static access token; the client credentials flow is used when unset
    pub access_token: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Azure AD authority override
    pub authority_host: Option<String>,
}

impl AzureSettings {
    fn validate(&self) -> Result<()> {
        let uri = self.key_vault_uri.trim();
        if uri.is_empty() {
            bail!("key_vault_uri is required");
        }
        if !is_url(uri) {
            validate_azure_vault_name(uri)?;
        }
        if self.access_token.is_none()
            && (self.tenant_id.is_none() || self.client_id.is_none() || self.client_secret.is_none())
        {
            bail!("either access_token or tenant_id, client_id and client_secret are required");
        }
        Ok(())
    }

    fn vault_url(&self) -> String {
        let uri = self.key_vault_uri.trim().trim_end_matches('/');
        if is_url(uri) {
            uri.to_string()
        } else {
            format!("https://{uri}.vault.azure.net")
        }
    }
}

fn is_url(uri: &str) -> bool {
    uri.starts_with("https://") || uri.starts_with("http://")
}

/// Body of `PUT /secrets/{name}`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetSecretRequest<'a> {
    value: &'a str,
    content_type: &'static str,
    tags: &'a BTreeMap<String, String>,
}

/// Azure Key Vault adapter
pub struct AzureKeyVault {
    http_client: Client,
    vault_url: String,
    settings: AzureSettings,
    tokens: TokenCache,
    tags: BTreeMap<String, String>,
}

impl std::fmt::Debug for AzureKeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureKeyVault")
            .field("vault_url", &self.vault_url)
            .finish_non_exhaustive()
    }
}

impl AzureKeyVault {
    pub fn new(settings: &AzureSettings, custom_tags: &BTreeMap<String, String>) -> Result<Self> {
        settings.validate()?;
        let http_client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        let mut tags = custom_tags.clone();
        tags.insert(
            SYNCED_SECRET_TAG_KEY.to_string(),
            SYNCED_SECRET_TAG_VALUE.to_string(),
        );

        let vault_url = settings.vault_url();
        info!("Initializing Azure Key Vault client for {}", vault_url);

        Ok(Self {
            http_client,
            vault_url,
            settings: settings.clone(),
            tokens: TokenCache::default(),
            tags,
        })
    }

    async fn access_token(&self) -> AdapterResult<String> {
        if let Some(token) = &self.settings.access_token {
            return Ok(token.clone());
        }
        self.tokens
            .get_or_fetch(|| async {
                let authority = self
                    .settings
                    .authority_host
                    .as_deref()
                    .unwrap_or(DEFAULT_AUTHORITY_HOST)
                    .trim_end_matches('/');
                let tenant = self.settings.tenant_id.as_deref().unwrap_or_default();
                let url = format!("{authority}/{tenant}/oauth2/v2.0/token");
                debug!("Requesting Azure AD token for tenant {}", tenant);

                let form = [
                    ("grant_type", "client_credentials"),
                    ("client_id", self.settings.client_id.as_deref().unwrap_or_default()),
                    (
                        "client_secret",
                        self.settings.client_secret.as_deref().unwrap_or_default(),
                    ),
                    ("scope", VAULT_SCOPE),
                ];
                let response = self
                    .http_client
                    .post(&url)
                    .form(&form)
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

    async fn request(&self, method: Method, path: &str) -> AdapterResult<RequestBuilder> {
        let token = self.access_token().await?;
        Ok(self
            .http_client
            .request(method, format!("{}/{}", self.vault_url, path))
            .query(&[("api-version", API_VERSION)])
            .header("Authorization", bearer(&token)))
    }

    async fn send(&self, request: RequestBuilder) -> AdapterResult<reqwest::Response> {
        request
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))
    }

    /// Purge a soft-deleted secret; vaults without purge permission keep the copy
    ///
    /// The vault answers 409 while the soft delete is still being processed;
    /// that is retryable so a later attempt can finish the purge.
    async fn purge(&self, name: &str) -> AdapterResult<()> {
        let response = self
            .send(
                self.request(Method::DELETE, &format!("deletedsecrets/{name}"))
                    .await?,
            )
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => {
                debug!("Azure secret {} not purged ({})", name, response.status());
                Ok(())
            }
            StatusCode::CONFLICT => {
                let body = response.text().await.unwrap_or_default();
                debug!("Azure secret {} still being deleted, purge deferred", name);
                Err(DestinationError::external("purge_pending", truncate_message(&body)))
            }
            _ => check_response(response).await,
        }
    }
}

#[async_trait]
impl DestinationAdapter for AzureKeyVault {
    fn destination_type(&self) -> DestinationType {
        DestinationType::AzureKv
    }

    fn supports_multi_value(&self) -> bool {
        false
    }

    async fn put(&self, name: &str, secret: &RenderedSecret) -> AdapterResult<()> {
        track_request(DestinationType::AzureKv, "put", name, async {
            let body = SetSecretRequest {
                value: secret.value.as_str(),
                content_type: if secret.secret_key.is_none() {
                    "application/json"
                } else {
                    "text/plain"
                },
                tags: &self.tags,
            };
            let response = self
                .send(
                    self.request(Method::PUT, &format!("secrets/{name}"))
                        .await?
                        .json(&body),
                )
                .await?;
            check_response(response).await
        })
        .await
    }

    async fn delete(&self, name: &str) -> AdapterResult<()> {
        track_request(DestinationType::AzureKv, "delete", name, async {
            info!("Deleting Azure secret: {}", name);
            let response = self
                .send(self.request(Method::DELETE, &format!("secrets/{name}")).await?)
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                // Absent or already soft-deleted by an earlier attempt
                debug!("Azure secret {} already deleted", name);
            } else {
                check_response(response).await?;
            }
            self.purge(name).await
        })
        .await
    }

    async fn tag_synced_secret(&self, _name: &str) -> AdapterResult<()> {
        Ok(())
    }
}

/// Builds [`AzureKeyVault`] adapters
#[derive(Debug, Default)]
pub struct AzureFactory;

#[async_trait]
impl AdapterFactory for AzureFactory {
    fn destination_type(&self) -> DestinationType {
        DestinationType::AzureKv
    }

    fn validate(&self, destination: &Destination) -> Result<()> {
        parse_config::<AzureSettings>(destination)?.validate()
    }

    async fn build(&self, destination: &Destination) -> Result<Arc<dyn DestinationAdapter>> {
        let settings: AzureSettings = parse_config(destination)?;
        Ok(Arc::new(AzureKeyVault::new(
            &settings,
            &destination.custom_tags,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_url_from_name() {
        let settings = AzureSettings {
            key_vault_uri: "acme-prod".to_string(),
            ..AzureSettings::default()
        };
        assert_eq!(settings.vault_url(), "https://acme-prod.vault.azure.net");

        let settings = AzureSettings {
            key_vault_uri: "https://acme-prod.vault.azure.net/".to_string(),
            ..AzureSettings::default()
        };
        assert_eq!(settings.vault_url(), "https://acme-prod.vault.azure.net");
    }

    #[test]
    fn test_credentials_required() {
        let destination = Destination::new(DestinationType::AzureKv, "kv")
            .with_config(serde_json::json!({"key_vault_uri": "acme"}));
        assert!(AzureFactory.validate(&destination).is_err());

        let destination = destination.with_config(serde_json::json!({
            "key_vault_uri": "acme",
            "tenant_id": "t",
            "client_id": "c",
            "client_secret": "s"
        }));
        assert!(AzureFactory.validate(&destination).is_ok());
    }

    #[test]
    fn test_adapter_is_single_value() {
        let settings = AzureSettings {
            key_vault_uri: "acme".to_string(),
            access_token: Some("token".to_string()),
            ..AzureSettings::default()
        };
        let adapter = AzureKeyVault::new(&settings, &BTreeMap::new()).unwrap();
        assert!(!adapter.supports_multi_value());
        assert_eq!(adapter.tags.get(SYNCED_SECRET_TAG_KEY).map(String::as_str), Some(""));
    }
}
