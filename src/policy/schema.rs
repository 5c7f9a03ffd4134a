//! Schema validation for policy documents.
//!
//! `validate` is a pure function: it never mutates the document and reports
//! one `FieldError` per violation so callers can show all problems at once.

use once_cell::sync::Lazy;
use regex::Regex;

use super::error::FieldError;
use super::types::{NetworkMode, PolicyDocument, RiskClass, POLICY_VERSION};
use super::units::{parse_cpu, parse_size, parse_ttl};

/// Container engines the sandbox launcher understands
pub const RUNTIME_ENGINES: &[&str] = &["podman", "docker", "auto"];

static HOST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\*\.)?([A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$")
        .expect("host regex is valid")
});

/// Validate one policy document
pub fn validate(doc: &PolicyDocument) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if doc.version != POLICY_VERSION {
        errors.push(FieldError::new(
            "version",
            doc.version.to_string(),
            format!("unsupported version, expected {}", POLICY_VERSION),
        ));
    }

    if let Some(network) = &doc.network {
        if let Some(mode) = &network.mode {
            if mode.parse::<NetworkMode>().is_err() {
                errors.push(FieldError::new(
                    "network.mode",
                    mode,
                    "must be one of allow-all, deny-by-default",
                ));
            }
        }

        for (i, rule) in network.allow.iter().flatten().enumerate() {
            let prefix = format!("network.allow[{}]", i);
            if rule.id.trim().is_empty() {
                errors.push(FieldError::new(
                    format!("{}.id", prefix),
                    &rule.id,
                    "must not be empty",
                ));
            }
            if rule.hosts.is_empty() {
                errors.push(FieldError::new(
                    format!("{}.hosts", prefix),
                    "[]",
                    "at least one host is required",
                ));
            }
            for (j, host) in rule.hosts.iter().enumerate() {
                if !HOST_RE.is_match(host) {
                    errors.push(FieldError::new(
                        format!("{}.hosts[{}]", prefix, j),
                        host,
                        "must be a hostname or *.suffix wildcard",
                    ));
                }
            }
            for (j, port) in rule.ports.iter().enumerate() {
                if !(1..=65535).contains(port) {
                    errors.push(FieldError::new(
                        format!("{}.ports[{}]", prefix, j),
                        port.to_string(),
                        "must be between 1 and 65535",
                    ));
                }
            }
        }
    }

    if let Some(fs) = &doc.filesystem {
        if let Some(root) = &fs.workspace_root {
            if root.trim().is_empty() {
                errors.push(FieldError::new(
                    "filesystem.workspace_root",
                    root,
                    "must not be empty",
                ));
            }
        }
        for (i, path) in fs.deny.iter().enumerate() {
            if path.trim().is_empty() {
                errors.push(FieldError::new(
                    format!("filesystem.deny[{}]", i),
                    path,
                    "must not be empty",
                ));
            }
        }
    }

    if let Some(tools) = &doc.tools {
        for (i, rule) in tools.rules.iter().enumerate() {
            let prefix = format!("tools.rules[{}]", i);
            if rule.pattern.is_empty() {
                errors.push(FieldError::new(
                    format!("{}.match", prefix),
                    "[]",
                    "must contain at least one token",
                ));
            }
            for (j, token) in rule.pattern.iter().enumerate() {
                if token.trim().is_empty() {
                    errors.push(FieldError::new(
                        format!("{}.match[{}]", prefix, j),
                        token,
                        "token must not be empty",
                    ));
                }
            }
            if rule.risk.parse::<RiskClass>().is_err() {
                errors.push(FieldError::new(
                    format!("{}.risk", prefix),
                    &rule.risk,
                    "must be one of safe, review-required, blocked-by-default",
                ));
            }
        }
    }

    if let Some(resources) = &doc.resources {
        if let Some(cpu) = &resources.cpu {
            if let Err(e) = parse_cpu(cpu) {
                errors.push(FieldError::new("resources.cpu", cpu, e));
            }
        }
        for (name, value) in [("memory", &resources.memory), ("disk", &resources.disk)] {
            if let Some(value) = value {
                if let Err(e) = parse_size(value) {
                    errors.push(FieldError::new(format!("resources.{}", name), value, e));
                }
            }
        }
    }

    if let Some(runtime) = &doc.runtime {
        if let Some(engine) = &runtime.engine {
            if !RUNTIME_ENGINES.contains(&engine.as_str()) {
                errors.push(FieldError::new(
                    "runtime.engine",
                    engine,
                    format!("must be one of {}", RUNTIME_ENGINES.join(", ")),
                ));
            }
        }
    }

    if let Some(credentials) = &doc.credentials {
        for (name, value) in credentials.ttls() {
            if let Some(value) = value {
                if let Err(e) = parse_ttl(value) {
                    errors.push(FieldError::new(format!("credentials.{}", name), value, e));
                }
            }
        }
    }

    errors
}
