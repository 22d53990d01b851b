//! # Common Adapter Utilities
//!
//! Shared helpers for the destination adapters: failure classification of
//! HTTP responses and transport errors, typed config parsing, and request
//! tracking (span fields plus metrics).

use crate::error::DestinationError;
use crate::model::{Destination, DestinationType};
use crate::observability::metrics;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, field, info_span, Instrument};

/// Tokens are refreshed this long before they expire
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
/// Lifetime assumed when a token endpoint does not report one
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

/// Classify a non-success HTTP status returned by a destination API
///
/// Rejections of the request itself (bad input, credentials, permissions,
/// missing parents, conflicts) are client-side; throttling, timeouts and server
/// errors are transient. Anything else is unexpected.
#[must_use]
pub fn classify_http_status(status: u16, body: &str) -> DestinationError {
    let code = format!("http_{status}");
    let message = truncate_message(body);
    match status {
        400 | 401 | 403 | 404 | 409 | 412 | 422 => DestinationError::client_side(code, message),
        408 | 429 | 500..=599 => DestinationError::external(code, message),
        _ => DestinationError::internal(code, message),
    }
}

/// Classify a `reqwest` transport error
#[must_use]
pub fn classify_transport_error(err: &reqwest::Error) -> DestinationError {
    if err.is_timeout() {
        DestinationError::external("timeout", err.to_string())
    } else if err.is_connect() {
        DestinationError::external("connect", err.to_string())
    } else if let Some(status) = err.status() {
        classify_http_status(status.as_u16(), &err.to_string())
    } else if err.is_decode() || err.is_body() {
        DestinationError::external("bad_response", err.to_string())
    } else {
        DestinationError::internal("transport", err.to_string())
    }
}

/// Turn a finished response into `Ok(())` or a classified error
pub async fn check_response(response: reqwest::Response) -> Result<(), DestinationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_http_status(status.as_u16(), &body))
}

/// Error bodies can be large HTML pages; keep the first line-ish part
pub(crate) fn truncate_message(body: &str) -> String {
    const MAX: usize = 512;
    let body = body.trim();
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// Parse a destination's opaque config into the adapter's typed settings
///
/// A missing config is treated as an empty object.
pub fn parse_config<T: DeserializeOwned>(destination: &Destination) -> Result<T> {
    let config = match &destination.config {
        serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(config).with_context(|| {
        format!(
            "Invalid {} configuration for destination {}",
            destination.id.kind, destination.id
        )
    })
}

/// Format a bearer `Authorization` header value
#[must_use]
pub fn bearer(token: &str) -> String {
    if token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bearer {token}")
    }
}

/// OAuth2 token endpoint response (GCP metadata server, Azure AD)
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    #[must_use]
    pub fn lifetime(&self) -> Duration {
        self.expires_in
            .map_or(DEFAULT_TOKEN_LIFETIME, Duration::from_secs)
    }
}

#[derive(Debug)]
struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Caches a fetched access token until shortly before it expires
///
/// The lock is held while fetching so concurrent requests share one refresh.
#[derive(Debug, Default)]
pub struct TokenCache {
    inner: AsyncMutex<Option<CachedToken>>,
}

impl TokenCache {
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<String, DestinationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TokenResponse, DestinationError>>,
    {
        let mut cached = self.inner.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.token.clone());
            }
        }

        let response = fetch().await?;
        let lifetime = response.lifetime();
        debug!("Fetched destination access token valid for {:?}", lifetime);
        let token = response.access_token;
        *cached = Some(CachedToken {
            token: token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        });
        Ok(token)
    }
}

/// Run one destination request inside a span, recording duration, outcome and metrics
pub async fn track_request<T, F>(
    destination_type: DestinationType,
    request: &'static str,
    secret_name: &str,
    fut: F,
) -> Result<T, DestinationError>
where
    F: Future<Output = Result<T, DestinationError>>,
{
    let span = info_span!(
        "destination.request",
        destination_type = destination_type.as_str(),
        request = request,
        secret.name = secret_name,
        operation.success = field::Empty,
        operation.duration_ms = field::Empty,
        error.class = field::Empty,
        error.code = field::Empty,
    );
    let start = Instant::now();
    let result = fut.instrument(span.clone()).await;

    let elapsed = start.elapsed();
    span.record("operation.duration_ms", elapsed.as_millis() as u64);
    metrics::record_destination_request(destination_type.as_str(), request, elapsed.as_secs_f64());

    match &result {
        Ok(_) => {
            span.record("operation.success", true);
        }
        Err(e) => {
            span.record("operation.success", false);
            span.record("error.class", e.class.as_str());
            span.record("error.code", e.code.as_str());
            metrics::increment_destination_errors(destination_type.as_str(), e.class.as_str());
        }
    }
    result
}
