//! # Secrets Sync
//!
//! Standalone engine process: mirrors secrets onto AWS Secrets Manager, GCP
//! Secret Manager and Azure Key Vault destinations, exposing `/metrics`,
//! `/healthz` and `/readyz`.
//!
//! Configuration comes from `SYNC_CONFIG_FILE` (YAML) or environment variables;
//! see `secrets_sync::config::SyncConfig`.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    secrets_sync::runtime::run_from_env().await
}
