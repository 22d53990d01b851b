//! # Destination Settings Validation
//!
//! Identifier checks against the cloud providers' published naming rules,
//! applied when a destination is created or updated so that a typo fails
//! fast instead of on the first sync.
//!
//! - GCP: <https://cloud.google.com/resource-manager/docs/creating-managing-projects>
//! - AWS: <https://docs.aws.amazon.com/general/latest/gr/rande.html>
//! - Azure: <https://learn.microsoft.com/en-us/azure/key-vault/general/about-keys-secrets-certificates#vault-name>

use anyhow::{anyhow, bail, Result};
use regex::Regex;

/// GCP project ID: 6-30 characters, lowercase letters, digits and hyphens,
/// starting with a letter and not ending with a hyphen
pub fn validate_gcp_project_id(project_id: &str) -> Result<()> {
    if project_id.trim().is_empty() {
        bail!("project_id is required");
    }
    let project_id_regex = Regex::new(r"^[a-z][a-z0-9-]{4,28}[a-z0-9]$")
        .map_err(|e| anyhow!("Failed to compile regex: {e}"))?;
    if !project_id_regex.is_match(project_id) {
        bail!(
            "project_id '{project_id}' must be a valid GCP project ID (6-30 characters, lowercase letters/numbers/hyphens, must start with letter, cannot end with hyphen)"
        );
    }
    Ok(())
}

/// Azure Key Vault name: 3-24 alphanumerics and hyphens, starting with a
/// letter, no trailing or consecutive hyphens
pub fn validate_azure_vault_name(vault_name: &str) -> Result<()> {
    let vault_name_regex = Regex::new(r"^[a-zA-Z][a-zA-Z0-9-]{1,22}[a-zA-Z0-9]$")
        .map_err(|e| anyhow!("Failed to compile regex: {e}"))?;
    if !vault_name_regex.is_match(vault_name) {
        bail!(
            "key_vault_uri '{vault_name}' must be a vault URL or a valid Key Vault name (3-24 characters, alphanumeric/hyphens, must start with letter, cannot end with hyphen)"
        );
    }
    if vault_name.contains("--") {
        bail!("key_vault_uri '{vault_name}' cannot contain consecutive hyphens");
    }
    Ok(())
}

/// AWS region code: standard (`us-east-1`), GovCloud (`us-gov-west-1`),
/// ISO (`us-iso-east-1`), China (`cn-north-1`), or `local` for LocalStack
pub fn validate_aws_region(region: &str) -> Result<()> {
    let region = region.trim().to_lowercase();
    if region.is_empty() {
        bail!("region must not be empty");
    }

    let patterns = [
        r"^[a-z]{2}-[a-z]+-\d+$",
        r"^[a-z]{2}-gov-[a-z]+-\d+$",
        r"^[a-z]{2}-iso[a-z]?-[a-z]+-\d+$",
        r"^cn-[a-z]+-\d+$",
        r"^local$",
    ];
    for pattern in patterns {
        let re = Regex::new(pattern).map_err(|e| anyhow!("Failed to compile regex: {e}"))?;
        if re.is_match(&region) {
            return Ok(());
        }
    }
    bail!("region '{region}' is not a valid AWS region code (e.g. us-east-1, us-gov-west-1, cn-north-1)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gcp_project_ids() {
        assert!(validate_gcp_project_id("acme-prod").is_ok());
        assert!(validate_gcp_project_id("test-project").is_ok());
        assert!(validate_gcp_project_id("").is_err());
        assert!(validate_gcp_project_id("acme").is_err());
        assert!(validate_gcp_project_id("Acme-Prod").is_err());
        assert!(validate_gcp_project_id("acme-prod-").is_err());
        assert!(validate_gcp_project_id("1acme-prod").is_err());
    }

    #[test]
    fn test_azure_vault_names() {
        assert!(validate_azure_vault_name("acme").is_ok());
        assert!(validate_azure_vault_name("acme-prod-kv1").is_ok());
        assert!(validate_azure_vault_name("kv").is_err());
        assert!(validate_azure_vault_name("acme-").is_err());
        assert!(validate_azure_vault_name("acme--prod").is_err());
        assert!(validate_azure_vault_name("my_vault").is_err());
        assert!(validate_azure_vault_name(&"a".repeat(25)).is_err());
    }

    #[test]
    fn test_aws_regions() {
        for region in [
            "us-east-1",
            "eu-west-3",
            "us-gov-west-1",
            "us-isob-east-1",
            "cn-north-1",
            "local",
            " US-EAST-1 ",
        ] {
            assert!(validate_aws_region(region).is_ok(), "{region}");
        }
        for region in ["", "useast1", "us-east", "moon-base-1"] {
            assert!(validate_aws_region(region).is_err(), "{region}");
        }
    }
}
