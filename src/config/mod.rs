//! Configuration management for aibox

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audit::DEFAULT_FLUSH_INTERVAL;
use crate::gate::DEFAULT_WEBHOOK_TIMEOUT;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "AIBOX_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub policy: PolicyPaths,
    pub audit: AuditConfig,
    pub approvals: ApprovalsConfig,
    pub push: PushConfig,
}

/// Where each policy level lives. Only `org` is required to enforce.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct PolicyPaths {
    pub org: Option<PathBuf>,
    pub team: Option<PathBuf>,
    /// Defaults to `.aibox/policy.toml` in the workspace
    pub project: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    pub dir: Option<PathBuf>,
    pub flush_interval_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: None,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL.as_millis() as u64,
        }
    }
}

impl AuditConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ApprovalsConfig {
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PushConfig {
    /// Reviewer webhook; no notification when unset
    pub webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout_secs: DEFAULT_WEBHOOK_TIMEOUT.as_secs(),
        }
    }
}

impl PushConfig {
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

impl Config {
    /// Load from `$AIBOX_CONFIG` or the default location; a missing file
    /// yields defaults
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Config::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Get the configuration file path
    pub fn config_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("aibox").join("config.toml"))
    }

    /// Root for audit logs and approvals when not configured
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("aibox")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.audit
            .dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("audit"))
    }

    pub fn approvals_dir(&self) -> PathBuf {
        self.approvals
            .dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("approvals"))
    }

    /// Configured project policy, else the workspace's own file if present
    pub fn project_policy(&self, workspace: &Path) -> Option<PathBuf> {
        self.policy
            .project
            .clone()
            .or_else(|| crate::policy::PolicyStore::project_policy_for(workspace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.policy.org.is_none());
        assert_eq!(config.audit.flush_interval(), DEFAULT_FLUSH_INTERVAL);
        assert_eq!(config.push.webhook_timeout(), Duration::from_secs(5));
        assert!(config.audit_dir().ends_with("aibox/audit"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[policy]\norg = \"/etc/aibox/org.toml\"\n\n[push]\nwebhook_url = \"https://hooks.example.com/x\"\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.policy.org, Some(PathBuf::from("/etc/aibox/org.toml")));
        assert_eq!(config.push.webhook_url.as_deref(), Some("https://hooks.example.com/x"));
        assert_eq!(config.push.webhook_timeout_secs, 5);
        assert_eq!(config.audit, AuditConfig::default());
    }

    #[test]
    fn test_project_policy_default() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();
        assert!(config.project_policy(dir.path()).is_none());

        std::fs::create_dir_all(dir.path().join(".aibox")).unwrap();
        std::fs::write(dir.path().join(".aibox/policy.toml"), "version = 1\n").unwrap();
        assert_eq!(
            config.project_policy(dir.path()),
            Some(dir.path().join(".aibox/policy.toml"))
        );
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[audit]\nflush_interval_ms = \"soon\"\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
