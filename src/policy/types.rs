use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported policy document version
pub const POLICY_VERSION: u32 = 1;

/// Wildcard token in a rule's match pattern
pub const WILDCARD: &str = "*";

/// Ordered risk classification of a command.
///
/// The derive order is load-bearing: `Safe < ReviewRequired < BlockedByDefault`
/// so "at least as strict" is a plain comparison.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum RiskClass {
    #[default]
    Safe,
    ReviewRequired,
    BlockedByDefault,
}

impl RiskClass {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskClass::Safe => "safe",
            RiskClass::ReviewRequired => "review-required",
            RiskClass::BlockedByDefault => "blocked-by-default",
        }
    }

    /// Get all risk classes, least severe first
    pub fn all() -> &'static [RiskClass] {
        &[
            RiskClass::Safe,
            RiskClass::ReviewRequired,
            RiskClass::BlockedByDefault,
        ]
    }
}

impl FromStr for RiskClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "safe" => Ok(RiskClass::Safe),
            "review-required" => Ok(RiskClass::ReviewRequired),
            "blocked-by-default" => Ok(RiskClass::BlockedByDefault),
            _ => Err(format!("Invalid risk class: {}", s)),
        }
    }
}

impl fmt::Display for RiskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Network egress mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    AllowAll,
    #[default]
    DenyByDefault,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::AllowAll => "allow-all",
            NetworkMode::DenyByDefault => "deny-by-default",
        }
    }
}

impl FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow-all" => Ok(NetworkMode::AllowAll),
            "deny-by-default" => Ok(NetworkMode::DenyByDefault),
            _ => Err(format!("Invalid network mode: {}", s)),
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Level of a policy document in the hierarchy, least specific first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyLevel {
    Org,
    Team,
    Project,
}

impl PolicyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyLevel::Org => "org",
            PolicyLevel::Team => "team",
            PolicyLevel::Project => "project",
        }
    }
}

impl fmt::Display for PolicyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One policy document as written by an administrator.
///
/// Every section is optional: a level that omits a section inherits the
/// nearest ancestor's value unchanged. Enum-valued fields are kept as raw
/// strings here so validation can report the offending value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyDocument {
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimePolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialsPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow: Option<Vec<AllowRule>>,
}

/// A named group of reachable hosts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllowRule {
    pub id: String,
    pub hosts: Vec<String>,
    /// Empty means any port
    pub ports: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilesystemPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsPolicy {
    pub rules: Vec<ToolRuleConfig>,
}

/// Rule as written in a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolRuleConfig {
    #[serde(rename = "match")]
    pub pattern: Vec<String>,
    #[serde(default = "default_true")]
    pub allow: bool,
    pub risk: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourcesPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimePolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootless: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialsPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_token_ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_api_key_ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_token_ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoke_on_stop: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_persist_to_workspace: Option<bool>,
}

impl CredentialsPolicy {
    /// Named TTL fields, in a stable order
    pub fn ttls(&self) -> [(&'static str, Option<&String>); 3] {
        [
            ("git_token_ttl", self.git_token_ttl.as_ref()),
            ("llm_api_key_ttl", self.llm_api_key_ttl.as_ref()),
            ("mirror_token_ttl", self.mirror_token_ttl.as_ref()),
        ]
    }
}

/// Typed rule used by the classifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRule {
    #[serde(rename = "match")]
    pub pattern: Vec<String>,
    pub allow: bool,
    pub risk: RiskClass,
}

impl ToolRule {
    pub fn new(pattern: &[&str], allow: bool, risk: RiskClass) -> Self {
        Self {
            pattern: pattern.iter().map(|t| t.to_string()).collect(),
            allow,
            risk,
        }
    }

    /// Pattern joined with spaces, used as the rule name in verdicts
    pub fn key(&self) -> String {
        self.pattern.join(" ")
    }
}

impl TryFrom<&ToolRuleConfig> for ToolRule {
    type Error = String;

    fn try_from(config: &ToolRuleConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            pattern: config.pattern.clone(),
            allow: config.allow,
            risk: config.risk.parse()?,
        })
    }
}
