//! Typed errors for policy loading, validation and merging

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use super::types::PolicyLevel;

/// Errors from loading policy documents
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("org policy required")]
    OrgPolicyRequired,

    #[error("policy file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read policy {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid policy:\n{}", format_field_errors(.0))]
    Invalid(Vec<FieldError>),

    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// A single validation failure with a dotted field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub value: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, value: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            message: message.into(),
        }
    }

    /// Prefix the field path with a level name (`team.network.mode`)
    pub fn with_level(mut self, level: PolicyLevel) -> Self {
        self.field = format!("{}.{}", level, self.field);
        self
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (got {:?})", self.field, self.message, self.value)
    }
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A more specific level tried to loosen a restriction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub level: PolicyLevel,
    pub inherited: String,
    pub attempted: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} policy loosens {}: inherited {}, attempted {}",
            self.level, self.field, self.inherited, self.attempted
        )
    }
}

/// Merge failed closed; no effective policy is produced
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("policy merge rejected:\n{}", format_violations(.0))]
    Violations(Vec<Violation>),

    #[error("{level} policy has invalid {field}: {message}")]
    InvalidValue {
        level: PolicyLevel,
        field: String,
        message: String,
    },
}

impl MergeError {
    pub fn violations(&self) -> &[Violation] {
        match self {
            MergeError::Violations(v) => v,
            MergeError::InvalidValue { .. } => &[],
        }
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("  - {}", v))
        .collect::<Vec<_>>()
        .join("\n")
}
