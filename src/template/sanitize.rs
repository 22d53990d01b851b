//! # Name Sanitization
//!
//! Rendered names are made safe for each destination's naming rules after
//! template expansion. Sanitization is deterministic so the same rendered name
//! always maps to the same external secret.

use crate::model::DestinationType;

/// AWS Secrets Manager name limit
pub const AWS_MAX_NAME_LEN: usize = 512;
/// GCP Secret Manager secret id limit
pub const GCP_MAX_NAME_LEN: usize = 255;
/// Azure Key Vault secret name limit
pub const AZURE_MAX_NAME_LEN: usize = 127;

/// Sanitize a rendered name for the given destination type
#[must_use]
pub fn sanitize_name(kind: DestinationType, name: &str) -> String {
    match kind {
        DestinationType::AwsSm => {
            let sanitized = replace_invalid(name, '_', |c| {
                c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '+' | '=' | '.' | '@' | '-')
            });
            truncate(sanitized, AWS_MAX_NAME_LEN)
        }
        DestinationType::GcpSm => {
            // GCP Secret Manager allows: [a-zA-Z0-9_-]+
            let sanitized =
                replace_invalid(name, '_', |c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            truncate(sanitized, GCP_MAX_NAME_LEN)
        }
        DestinationType::AzureKv => {
            let sanitized = replace_invalid(name, '-', |c| c.is_ascii_alphanumeric() || c == '-');
            let collapsed = collapse_dashes(&sanitized);
            let truncated = truncate(collapsed, AZURE_MAX_NAME_LEN);
            truncated.trim_matches('-').to_string()
        }
        DestinationType::InMem => name.to_string(),
    }
}

fn replace_invalid(name: &str, replacement: char, valid: impl Fn(char) -> bool) -> String {
    name.chars()
        .map(|c| if valid(c) { c } else { replacement })
        .collect()
}

/// Remove consecutive dashes and leading/trailing dashes
fn collapse_dashes(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    let mut prev_was_dash = false;

    for c in name.chars() {
        if c == '-' {
            if !prev_was_dash {
                result.push(c);
                prev_was_dash = true;
            }
        } else {
            result.push(c);
            prev_was_dash = false;
        }
    }

    result.trim_matches('-').to_string()
}

// Sanitized names are ASCII, so byte truncation stays on a char boundary.
fn truncate(mut name: String, max: usize) -> String {
    name.truncate(max);
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aws_keeps_path_separators() {
        assert_eq!(
            sanitize_name(DestinationType::AwsSm, "vault/kv_1234/path/to/secret1_foo"),
            "vault/kv_1234/path/to/secret1_foo"
        );
        assert_eq!(
            sanitize_name(DestinationType::AwsSm, "vault/kv/my secret#1"),
            "vault/kv/my_secret_1"
        );
        assert_eq!(
            sanitize_name(DestinationType::AwsSm, "a+b=c.d@e-f"),
            "a+b=c.d@e-f"
        );
    }

    #[test]
    fn test_gcp_replaces_dots_and_slashes() {
        assert_eq!(
            sanitize_name(DestinationType::GcpSm, "vault/kv_1234/app.db"),
            "vault_kv_1234_app_db"
        );
        assert_eq!(
            sanitize_name(DestinationType::GcpSm, "my-secret_name"),
            "my-secret_name"
        );
    }

    #[test]
    fn test_azure_collapses_dashes() {
        assert_eq!(
            sanitize_name(DestinationType::AzureKv, "vault/kv_1234/path//to_secret"),
            "vault-kv-1234-path-to-secret"
        );
        assert_eq!(sanitize_name(DestinationType::AzureKv, "/leading/"), "leading");
    }

    #[test]
    fn test_non_ascii_is_replaced() {
        assert_eq!(sanitize_name(DestinationType::GcpSm, "café"), "caf_");
        assert_eq!(sanitize_name(DestinationType::AwsSm, "naïve"), "na_ve");
    }

    #[test]
    fn test_length_limits() {
        let long = "a".repeat(600);
        assert_eq!(sanitize_name(DestinationType::AwsSm, &long).len(), AWS_MAX_NAME_LEN);
        assert_eq!(sanitize_name(DestinationType::GcpSm, &long).len(), GCP_MAX_NAME_LEN);
        assert_eq!(
            sanitize_name(DestinationType::AzureKv, &long).len(),
            AZURE_MAX_NAME_LEN
        );
    }

    #[test]
    fn test_in_mem_is_unchanged() {
        assert_eq!(
            sanitize_name(DestinationType::InMem, "vault/kv.x/ anything "),
            "vault/kv.x/ anything "
        );
    }
}
