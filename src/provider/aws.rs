//! # AWS Secrets Manager
//!
//! Writes synced secrets to AWS Secrets Manager.
//!
//! - `put` calls `PutSecretValue` and falls back to `CreateSecret` when the
//!   secret does not exist yet
//! - `delete` force-deletes without a recovery window so a recreated name is
//!   immediately reusable
//! - `tag_synced_secret` attaches the sync marker tag plus the destination's
//!   custom tags
//!
//! Credentials come from the default provider chain (environment, profile,
//! IRSA, instance metadata) unless static keys are set in the destination config.

use crate::constants::{SYNCED_SECRET_TAG_KEY, SYNCED_SECRET_TAG_VALUE};
use crate::error::DestinationError;
use crate::model::{Destination, DestinationType, RenderedSecret};
use crate::provider::common::{parse_config, track_request};
use crate::provider::validation::validate_aws_region;
use crate::provider::{AdapterFactory, AdapterResult, DestinationAdapter};
use anyhow::{bail, Result};
use async_trait::async_trait;
use aws_sdk_secretsmanager::config::Credentials;
use aws_sdk_secretsmanager::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_secretsmanager::types::Tag;
use aws_sdk_secretsmanager::Client as SecretsManagerClient;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

const NOT_FOUND: &str = "ResourceNotFoundException";
const ALREADY_EXISTS: &str = "ResourceExistsException";

/// `aws-sm` destination config
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AwsSettings {
    pub region: Option<String>,
    /// Override the service endpoint (e.g. LocalStack)
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

impl AwsSettings {
    fn validate(&self) -> Result<()> {
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            bail!("access_key_id and secret_access_key must be set together");
        }
        if let Some(region) = &self.region {
            validate_aws_region(region)?;
        }
        Ok(())
    }
}

/// AWS Secrets Manager adapter
pub struct AwsSecretsManager {
    client: SecretsManagerClient,
    region: Option<String>,
    tags: BTreeMap<String, String>,
}

impl std::fmt::Debug for AwsSecretsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsSecretsManager")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl AwsSecretsManager {
    /// Build a client from destination settings
    pub async fn new(settings: &AwsSettings, custom_tags: BTreeMap<String, String>) -> Result<Self> {
        settings.validate()?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &settings.endpoint_url {
            info!("Using AWS Secrets Manager endpoint override: {}", endpoint);
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(key_id), Some(secret)) = (&settings.access_key_id, &settings.secret_access_key)
        {
            debug!("Using static AWS credentials from destination config");
            loader = loader.credentials_provider(Credentials::new(
                key_id,
                secret,
                settings.session_token.clone(),
                None,
                "secrets-sync-destination",
            ));
        }
        let sdk_config = loader.load().await;

        Ok(Self {
            client: SecretsManagerClient::new(&sdk_config),
            region: settings.region.clone(),
            tags: custom_tags,
        })
    }

    async fn create(&self, name: &str, secret: &RenderedSecret) -> AdapterResult<()> {
        info!("Creating AWS secret: {}", name);
        self.client
            .create_secret()
            .name(name)
            .secret_string(secret.value.as_str())
            .send()
            .await
            .map(|_| ())
            .map_err(|e| classify_sdk_error(&e))
    }

    async fn put_value(&self, name: &str, secret: &RenderedSecret) -> Result<(), DestinationError> {
        self.client
            .put_secret_value()
            .secret_id(name)
            .secret_string(secret.value.as_str())
            .send()
            .await
            .map(|_| ())
            .map_err(|e| classify_sdk_error(&e))
    }
}

#[async_trait]
impl DestinationAdapter for AwsSecretsManager {
    fn destination_type(&self) -> DestinationType {
        DestinationType::AwsSm
    }

    fn supports_multi_value(&self) -> bool {
        true
    }

    async fn put(&self, name: &str, secret: &RenderedSecret) -> AdapterResult<()> {
        track_request(DestinationType::AwsSm, "put", name, async {
            match self.put_value(name, secret).await {
                Err(e) if e.code == NOT_FOUND => match self.create(name, secret).await {
                    // Lost a creation race; the secret exists now
                    Err(e) if e.code == ALREADY_EXISTS => self.put_value(name, secret).await,
                    other => other,
                },
                other => other,
            }
        })
        .await
    }

    async fn delete(&self, name: &str) -> AdapterResult<()> {
        track_request(DestinationType::AwsSm, "delete", name, async {
            info!("Deleting AWS secret: {}", name);
            match self
                .client
                .delete_secret()
                .secret_id(name)
                .force_delete_without_recovery(true)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(e) => {
                    let err = classify_sdk_error(&e);
                    if err.code == NOT_FOUND {
                        debug!("AWS secret {} already absent", name);
                        Ok(())
                    } else {
                        Err(err)
                    }
                }
            }
        })
        .await
    }

    async fn tag_synced_secret(&self, name: &str) -> AdapterResult<()> {
        track_request(DestinationType::AwsSm, "tag", name, async {
            let mut request = self.client.tag_resource().secret_id(name).tags(
                Tag::builder()
                    .key(SYNCED_SECRET_TAG_KEY)
                    .value(SYNCED_SECRET_TAG_VALUE)
                    .build(),
            );
            for (key, value) in &self.tags {
                request = request.tags(Tag::builder().key(key).value(value).build());
            }
            request
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk_error(&e))
        })
        .await
    }
}

/// Classify an SDK error by variant and, for service errors, by AWS error code
fn classify_sdk_error<E, R>(err: &SdkError<E, R>) -> DestinationError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(err).to_string();
    match err {
        SdkError::ServiceError(context) => classify_service_code(context.err().code(), message),
        SdkError::TimeoutError(_) => DestinationError::external("timeout", message),
        SdkError::DispatchFailure(_) => DestinationError::external("dispatch_failure", message),
        SdkError::ResponseError(_) => DestinationError::external("response_error", message),
        SdkError::ConstructionFailure(_) => {
            DestinationError::internal("construction_failure", message)
        }
        _ => DestinationError::internal("sdk_error", message),
    }
}

fn classify_service_code(code: Option<&str>, message: String) -> DestinationError {
    match code {
        Some(
            code @ ("AccessDeniedException"
            | "UnrecognizedClientException"
            | "InvalidSignatureException"
            | "ExpiredTokenException"
            | "IncompleteSignature"
            | "ValidationException"
            | "InvalidParameterException"
            | "InvalidRequestException"
            | "MalformedPolicyDocumentException"
            | "LimitExceededException"
            | "EncryptionFailure"
            | "DecryptionFailure"
            | "PreconditionNotMetException"
            | NOT_FOUND
            | ALREADY_EXISTS),
        ) => DestinationError::client_side(code, message),
        Some(
            code @ ("ThrottlingException"
            | "TooManyRequestsException"
            | "RequestLimitExceeded"
            | "InternalServiceError"
            | "InternalFailure"
            | "ServiceUnavailable"
            | "RequestTimeout"),
        ) => DestinationError::external(code, message),
        Some(code) => DestinationError::internal(code, message),
        None => DestinationError::internal("unknown", message),
    }
}

/// Builds [`AwsSecretsManager`] adapters
#[derive(Debug, Default)]
pub struct AwsFactory;

#[async_trait]
impl AdapterFactory for AwsFactory {
    fn destination_type(&self) -> DestinationType {
        DestinationType::AwsSm
    }

    fn validate(&self, destination: &Destination) -> Result<()> {
        parse_config::<AwsSettings>(destination)?.validate()
    }

    async fn build(&self, destination: &Destination) -> Result<Arc<dyn DestinationAdapter>> {
        let settings: AwsSettings = parse_config(destination)?;
        let adapter = AwsSecretsManager::new(&settings, destination.custom_tags.clone()).await?;
        Ok(Arc::new(adapter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;

    #[test]
    fn test_access_errors_are_client_side() {
        for code in [
            "AccessDeniedException",
            "ValidationException",
            "InvalidParameterException",
            "UnrecognizedClientException",
        ] {
            let err = classify_service_code(Some(code), "denied".to_string());
            assert_eq!(err.class, FailureClass::ClientSide, "{code}");
            assert_eq!(err.code, code);
        }
    }

    #[test]
    fn test_throttling_and_service_errors_are_external() {
        for code in ["ThrottlingException", "InternalServiceError", "ServiceUnavailable"] {
            assert_eq!(
                classify_service_code(Some(code), String::new()).class,
                FailureClass::ExternalService,
                "{code}"
            );
        }
    }

    #[test]
    fn test_unknown_codes_are_internal() {
        assert_eq!(
            classify_service_code(Some("SomethingNew"), String::new()).class,
            FailureClass::Internal
        );
        assert_eq!(
            classify_service_code(None, String::new()).code,
            "unknown"
        );
    }

    #[test]
    fn test_settings_validation() {
        let destination = Destination::new(DestinationType::AwsSm, "prod")
            .with_config(serde_json::json!({"region": "us-east-1"}));
        assert!(AwsFactory.validate(&destination).is_ok());

        let partial_keys = Destination::new(DestinationType::AwsSm, "prod")
            .with_config(serde_json::json!({"access_key_id": "AKIA..."}));
        assert!(AwsFactory.validate(&partial_keys).is_err());

        let bad_region = Destination::new(DestinationType::AwsSm, "prod")
            .with_config(serde_json::json!({"region": "us-east"}));
        assert!(AwsFactory.validate(&bad_region).is_err());

        let empty = Destination::new(DestinationType::AwsSm, "prod");
        assert!(AwsFactory.validate(&empty).is_ok());
    }
}
