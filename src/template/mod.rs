//! # Name Templates
//!
//! Resolves the external name of a synced secret from a destination's name
//! template, e.g. `vault/{{ .MountAccessor }}/{{ .SecretPath | replace "/" "-" }}`.
//!
//! Resolution is pure: the same template, destination, secret and key always
//! produce the same name. The rendered text is sanitized per destination type
//! (see [`sanitize`]).

pub mod functions;
mod parser;
pub mod sanitize;

use crate::model::{DestinationId, Granularity, SecretRef, TemplateSnapshot};
use parser::Segment;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use sanitize::sanitize_name;

/// Template parse, validation and render errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unterminated expression starting at byte {position}")]
    Unterminated { position: usize },

    #[error("empty expression at byte {position}")]
    EmptyExpression { position: usize },

    #[error("unknown placeholder .{0}")]
    UnknownPlaceholder(String),

    #[error("unknown function {0}")]
    UnknownFunction(String),

    #[error("function {function} takes {expected} argument(s), got {found}")]
    Arity {
        function: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("unterminated quoted argument in {{{{ {0} }}}}")]
    UnterminatedString(String),

    #[error("expression must start with a placeholder: {{{{ {0} }}}}")]
    ExpectedPlaceholder(String),

    #[error(".SecretKey cannot be used with secret-path granularity")]
    SecretKeyNotAllowed,

    #[error("secret-key granularity requires .SecretKey in the template")]
    SecretKeyRequired,

    #[error(".SecretKey has no value for this secret")]
    MissingSecretKey,

    #[error("template rendered an empty name")]
    EmptyName,

    #[error("keys {first:?} and {second:?} both resolve to {name}")]
    NameCollision {
        name: String,
        first: String,
        second: String,
    },
}

impl TemplateError {
    /// Error code recorded on the association
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            TemplateError::NameCollision { .. } => "name_collision",
            _ => "invalid_template",
        }
    }
}

/// Values a template may reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    DestinationType,
    DestinationName,
    NamespacePath,
    NamespaceBaseName,
    NamespaceId,
    MountPath,
    MountBaseName,
    MountAccessor,
    SecretPath,
    SecretBaseName,
    SecretKey,
}

impl Placeholder {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Placeholder::DestinationType => "DestinationType",
            Placeholder::DestinationName => "DestinationName",
            Placeholder::NamespacePath => "NamespacePath",
            Placeholder::NamespaceBaseName => "NamespaceBaseName",
            Placeholder::NamespaceId => "NamespaceID",
            Placeholder::MountPath => "MountPath",
            Placeholder::MountBaseName => "MountBaseName",
            Placeholder::MountAccessor => "MountAccessor",
            Placeholder::SecretPath => "SecretPath",
            Placeholder::SecretBaseName => "SecretBaseName",
            Placeholder::SecretKey => "SecretKey",
        }
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ".{}", self.as_str())
    }
}

impl FromStr for Placeholder {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "DestinationType" => Placeholder::DestinationType,
            "DestinationName" => Placeholder::DestinationName,
            "NamespacePath" => Placeholder::NamespacePath,
            "NamespaceBaseName" => Placeholder::NamespaceBaseName,
            "NamespaceID" => Placeholder::NamespaceId,
            "MountPath" => Placeholder::MountPath,
            "MountBaseName" => Placeholder::MountBaseName,
            "MountAccessor" => Placeholder::MountAccessor,
            "SecretPath" => Placeholder::SecretPath,
            "SecretBaseName" => Placeholder::SecretBaseName,
            "SecretKey" => Placeholder::SecretKey,
            other => return Err(TemplateError::UnknownPlaceholder(other.to_string())),
        })
    }
}

/// Concrete placeholder values for one render
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateValues {
    pub destination_type: String,
    pub destination_name: String,
    pub namespace_path: String,
    pub namespace_id: String,
    pub mount_path: String,
    pub mount_accessor: String,
    pub secret_path: String,
    pub secret_key: Option<String>,
}

impl TemplateValues {
    #[must_use]
    pub fn new(destination: &DestinationId, secret: &SecretRef, secret_key: Option<&str>) -> Self {
        Self {
            destination_type: destination.kind.as_str().to_string(),
            destination_name: destination.name.clone(),
            namespace_path: secret.namespace_path.clone(),
            namespace_id: secret.namespace_id.clone(),
            mount_path: secret.mount_path.clone(),
            mount_accessor: secret.mount_accessor.clone(),
            secret_path: secret.secret_path.clone(),
            secret_key: secret_key.map(ToString::to_string),
        }
    }

    fn get(&self, placeholder: Placeholder) -> Result<&str, TemplateError> {
        Ok(match placeholder {
            Placeholder::DestinationType => &self.destination_type,
            Placeholder::DestinationName => &self.destination_name,
            Placeholder::NamespacePath => &self.namespace_path,
            Placeholder::NamespaceBaseName => base_name(&self.namespace_path),
            Placeholder::NamespaceId => &self.namespace_id,
            Placeholder::MountPath => &self.mount_path,
            Placeholder::MountBaseName => base_name(&self.mount_path),
            Placeholder::MountAccessor => &self.mount_accessor,
            Placeholder::SecretPath => &self.secret_path,
            Placeholder::SecretBaseName => base_name(&self.secret_path),
            Placeholder::SecretKey => self
                .secret_key
                .as_deref()
                .ok_or(TemplateError::MissingSecretKey)?,
        })
    }
}

/// Last non-empty `/`-separated segment
fn base_name(path: &str) -> &str {
    path.split('/')
        .rev()
        .find(|segment| !segment.is_empty())
        .unwrap_or("")
}

/// A parsed name template
#[derive(Debug, Clone)]
pub struct NameTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl NameTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            source: source.to_string(),
            segments: parser::parse(source)?,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn references(&self, placeholder: Placeholder) -> bool {
        self.segments.iter().any(|segment| {
            matches!(segment, Segment::Expression(expression) if expression.placeholder == placeholder)
        })
    }

    /// Check the template can be used with `granularity`
    pub fn validate(&self, granularity: Granularity) -> Result<(), TemplateError> {
        let uses_key = self.references(Placeholder::SecretKey);
        match granularity {
            Granularity::SecretPath if uses_key => Err(TemplateError::SecretKeyNotAllowed),
            Granularity::SecretKey if !uses_key => Err(TemplateError::SecretKeyRequired),
            _ => Ok(()),
        }
    }

    /// Expand placeholders and pipelines; the result is not sanitized
    pub fn render(&self, values: &TemplateValues) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expression(expression) => {
                    let mut value = values.get(expression.placeholder)?.to_string();
                    for call in &expression.pipeline {
                        value = call.function.apply(&value, &call.args);
                    }
                    out.push_str(&value);
                }
            }
        }
        Ok(out)
    }
}

/// Parse and validate a template for a granularity
pub fn validate_template(source: &str, granularity: Granularity) -> Result<NameTemplate, TemplateError> {
    let template = NameTemplate::parse(source)?;
    template.validate(granularity)?;
    Ok(template)
}

/// Resolve the sanitized external name for one entry of an association
pub fn resolve_name(
    snapshot: &TemplateSnapshot,
    destination: &DestinationId,
    secret: &SecretRef,
    secret_key: Option<&str>,
) -> Result<String, TemplateError> {
    let template = validate_template(&snapshot.template, snapshot.granularity)?;
    let rendered = template.render(&TemplateValues::new(destination, secret, secret_key))?;
    let name = sanitize_name(destination.kind, &rendered);
    if name.is_empty() {
        return Err(TemplateError::EmptyName);
    }
    Ok(name)
}
