//! Tighten-only merge of org, team and project policy documents.
//!
//! Levels are folded from least to most specific. A more specific level may
//! only add restrictions: ceilings may go down, deny-sets grow, allow-sets
//! shrink, rule severities rise and restrictive flags stay on. Every attempt
//! to loosen is collected as a `Violation`; if any exist the merge fails and
//! no effective policy is returned.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::classifier;
use super::error::{MergeError, Violation};
use super::integrity;
use super::network::host_matches;
use super::store::PolicyHierarchy;
use super::types::{
    AllowRule, CredentialsPolicy, NetworkMode, PolicyDocument, PolicyLevel, ResourcesPolicy,
    RiskClass, RuntimePolicy, ToolRule, WILDCARD,
};
use super::units::{parse_cpu, parse_size, parse_ttl};

/// Composed policy all gate decisions are made against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivePolicy {
    /// Content hash (`sha256:<16 hex>`), recorded as the policy version in decisions
    pub version: String,
    pub network: EffectiveNetwork,
    pub filesystem: EffectiveFilesystem,
    pub rules: Vec<ToolRule>,
    pub resources: ResourceLimits,
    pub runtime: EffectiveRuntime,
    pub credentials: EffectiveCredentials,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveNetwork {
    pub mode: NetworkMode,
    pub allow: Vec<AllowRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveFilesystem {
    pub workspace_root: Option<String>,
    pub deny: Vec<String>,
}

/// Resource ceilings; `None` means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_millis: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveRuntime {
    pub engine: Option<String>,
    pub rootless: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveCredentials {
    pub git_token_ttl: Option<Duration>,
    pub llm_api_key_ttl: Option<Duration>,
    pub mirror_token_ttl: Option<Duration>,
    pub revoke_on_stop: bool,
    pub no_persist_to_workspace: bool,
}

impl EffectivePolicy {
    /// Open policy for callers that explicitly run without an org policy
    pub fn permissive() -> Self {
        let mut policy = Self {
            version: String::new(),
            network: EffectiveNetwork {
                mode: NetworkMode::AllowAll,
                allow: Vec::new(),
            },
            filesystem: EffectiveFilesystem::default(),
            rules: Vec::new(),
            resources: ResourceLimits::default(),
            runtime: EffectiveRuntime::default(),
            credentials: EffectiveCredentials::default(),
        };
        policy.version = integrity::policy_version(&policy);
        policy
    }
}

/// Merge a loaded hierarchy
pub fn merge_hierarchy(hierarchy: &PolicyHierarchy) -> Result<EffectivePolicy, MergeError> {
    merge(
        &hierarchy.org,
        hierarchy.team.as_ref(),
        hierarchy.project.as_ref(),
    )
}

/// Merge org, team and project documents into one effective policy
pub fn merge(
    org: &PolicyDocument,
    team: Option<&PolicyDocument>,
    project: Option<&PolicyDocument>,
) -> Result<EffectivePolicy, MergeError> {
    let mut merger = Merger::default();

    merger.apply(PolicyLevel::Org, org)?;
    if let Some(team) = team {
        merger.apply(PolicyLevel::Team, team)?;
    }
    if let Some(project) = project {
        merger.apply(PolicyLevel::Project, project)?;
    }

    merger.finish()
}

/// A numeric ceiling and the text it was written as
#[derive(Debug, Clone)]
struct Ceiling<T> {
    value: T,
    raw: String,
}

#[derive(Default)]
struct Merger {
    mode: Option<NetworkMode>,
    allow: Option<Vec<AllowRule>>,
    workspace_root: Option<String>,
    deny: Vec<String>,
    /// Rules in evaluation order, tagged with the level that introduced them
    rules: Vec<(PolicyLevel, ToolRule)>,
    cpu: Option<Ceiling<u64>>,
    memory: Option<Ceiling<u64>>,
    disk: Option<Ceiling<u64>>,
    engine: Option<String>,
    rootless: Option<bool>,
    ttls: [Option<Ceiling<Duration>>; 3],
    revoke_on_stop: Option<bool>,
    no_persist_to_workspace: Option<bool>,
    violations: Vec<Violation>,
}

impl Merger {
    fn apply(&mut self, level: PolicyLevel, doc: &PolicyDocument) -> Result<(), MergeError> {
        if let Some(network) = &doc.network {
            if let Some(raw) = &network.mode {
                let mode: NetworkMode = parse_value(level, "network.mode", raw, |s| s.parse())?;
                self.merge_mode(level, mode);
            }
            if let Some(allow) = &network.allow {
                self.allow = Some(match self.allow.take() {
                    None => allow.clone(),
                    Some(parent) => intersect_allow(level, &parent, allow),
                });
            }
        }

        if let Some(fs) = &doc.filesystem {
            if let Some(root) = &fs.workspace_root {
                self.workspace_root = Some(root.clone());
            }
            for path in &fs.deny {
                if !self.deny.contains(path) {
                    self.deny.push(path.clone());
                }
            }
        }

        if let Some(tools) = &doc.tools {
            let mut seen_in_level = HashSet::new();
            for config in &tools.rules {
                let rule = ToolRule::try_from(config).map_err(|message| {
                    MergeError::InvalidValue {
                        level,
                        field: format!("tools.rules[{}].risk", config.pattern.join(" ")),
                        message,
                    }
                })?;
                if !seen_in_level.insert(rule.key()) {
                    tracing::debug!(
                        "{} policy repeats rule '{}'; only the first is reachable",
                        level,
                        rule.key()
                    );
                    continue;
                }
                self.merge_rule(level, rule);
            }
        }

        if let Some(resources) = &doc.resources {
            self.merge_resources(level, resources)?;
        }

        if let Some(runtime) = &doc.runtime {
            self.merge_runtime(level, runtime);
        }

        if let Some(credentials) = &doc.credentials {
            self.merge_credentials(level, credentials)?;
        }

        Ok(())
    }

    fn merge_mode(&mut self, level: PolicyLevel, mode: NetworkMode) {
        match self.mode {
            Some(NetworkMode::DenyByDefault) if mode == NetworkMode::AllowAll => {
                self.violations.push(Violation {
                    field: "network.mode".to_string(),
                    level,
                    inherited: NetworkMode::DenyByDefault.to_string(),
                    attempted: mode.to_string(),
                });
            }
            _ => self.mode = Some(mode),
        }
    }

    fn merge_rule(&mut self, level: PolicyLevel, rule: ToolRule) {
        let key = rule.key();
        let Some(idx) = self.rules.iter().position(|(_, r)| r.pattern == rule.pattern) else {
            self.insert_rule(level, rule);
            return;
        };
        let existing = &mut self.rules[idx].1;

        if rule.risk < existing.risk {
            self.violations.push(Violation {
                field: format!("tools.rules[{}].risk", key),
                level,
                inherited: existing.risk.to_string(),
                attempted: rule.risk.to_string(),
            });
            return;
        }
        if !existing.allow && rule.allow {
            self.violations.push(Violation {
                field: format!("tools.rules[{}].allow", key),
                level,
                inherited: "false".to_string(),
                attempted: "true".to_string(),
            });
            return;
        }

        existing.risk = existing.risk.max(rule.risk);
        existing.allow = existing.allow && rule.allow;
    }

    /// Place a new pattern so first-match never resolves a command to
    /// something looser than the inherited rules did.
    ///
    /// The rule goes ahead of the first inherited rule it overlaps that is
    /// less strict. It must not take precedence over a stricter inherited
    /// rule it overlaps, and a rule fully covered by a stricter inherited
    /// rule is an attempt to loosen that rule.
    fn insert_rule(&mut self, level: PolicyLevel, rule: ToolRule) {
        let strictness = severity(&rule);
        let inherited = |(from, _): &&(PolicyLevel, ToolRule)| *from != level;

        let position = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, entry)| inherited(entry))
            .find(|(_, (_, r))| overlaps(&r.pattern, &rule.pattern) && severity(r) < strictness)
            .map(|(i, _)| i);

        let shadowing = match position {
            // Ahead of a looser rule it must not also jump a stricter one
            Some(at) => self.rules[at..]
                .iter()
                .filter(inherited)
                .find(|(_, r)| overlaps(&r.pattern, &rule.pattern) && severity(r) > strictness),
            None => self
                .rules
                .iter()
                .filter(inherited)
                .find(|(_, r)| {
                    classifier::matches(&r.pattern, &rule.pattern) && severity(r) > strictness
                }),
        };
        if let Some((_, stricter)) = shadowing {
            self.violations.push(Violation {
                field: format!("tools.rules[{}].risk", rule.key()),
                level,
                inherited: format!("{} via '{}'", describe(stricter), stricter.key()),
                attempted: describe(&rule),
            });
            return;
        }

        match position {
            Some(at) => {
                tracing::debug!(
                    "{} policy rule '{}' placed ahead of looser inherited rule '{}'",
                    level,
                    rule.key(),
                    self.rules[at].1.key()
                );
                self.rules.insert(at, (level, rule));
            }
            None => self.rules.push((level, rule)),
        }
    }

    fn merge_resources(
        &mut self,
        level: PolicyLevel,
        resources: &ResourcesPolicy,
    ) -> Result<(), MergeError> {
        if let Some(raw) = &resources.cpu {
            let value = parse_value(level, "resources.cpu", raw, parse_cpu)?;
            lower_ceiling(&mut self.violations, level, "resources.cpu", &mut self.cpu, value, raw);
        }
        if let Some(raw) = &resources.memory {
            let value = parse_value(level, "resources.memory", raw, parse_size)?;
            lower_ceiling(
                &mut self.violations,
                level,
                "resources.memory",
                &mut self.memory,
                value,
                raw,
            );
        }
        if let Some(raw) = &resources.disk {
            let value = parse_value(level, "resources.disk", raw, parse_size)?;
            lower_ceiling(&mut self.violations, level, "resources.disk", &mut self.disk, value, raw);
        }
        Ok(())
    }

    fn merge_runtime(&mut self, level: PolicyLevel, runtime: &RuntimePolicy) {
        if let Some(engine) = &runtime.engine {
            self.engine = Some(engine.clone());
        }
        if let Some(rootless) = runtime.rootless {
            keep_flag_on(
                &mut self.violations,
                level,
                "runtime.rootless",
                &mut self.rootless,
                rootless,
            );
        }
    }

    fn merge_credentials(
        &mut self,
        level: PolicyLevel,
        credentials: &CredentialsPolicy,
    ) -> Result<(), MergeError> {
        for (slot, (name, raw)) in self.ttls.iter_mut().zip(credentials.ttls()) {
            let Some(raw) = raw else { continue };
            let field = format!("credentials.{}", name);
            let ttl = parse_value(level, &field, raw, parse_ttl)?;
            match slot {
                Some(parent) if parent.value <= ttl => {
                    tracing::debug!(
                        "{} policy {} of {} exceeds inherited {}; keeping the shorter TTL",
                        level,
                        field,
                        raw,
                        parent.raw
                    );
                }
                _ => {
                    *slot = Some(Ceiling {
                        value: ttl,
                        raw: raw.clone(),
                    })
                }
            }
        }

        if let Some(flag) = credentials.revoke_on_stop {
            keep_flag_on(
                &mut self.violations,
                level,
                "credentials.revoke_on_stop",
                &mut self.revoke_on_stop,
                flag,
            );
        }
        if let Some(flag) = credentials.no_persist_to_workspace {
            keep_flag_on(
                &mut self.violations,
                level,
                "credentials.no_persist_to_workspace",
                &mut self.no_persist_to_workspace,
                flag,
            );
        }
        Ok(())
    }

    fn finish(self) -> Result<EffectivePolicy, MergeError> {
        if !self.violations.is_empty() {
            return Err(MergeError::Violations(self.violations));
        }

        let [git_ttl, llm_ttl, mirror_ttl] = self.ttls;
        let mut policy = EffectivePolicy {
            version: String::new(),
            network: EffectiveNetwork {
                mode: self.mode.unwrap_or_default(),
                allow: self.allow.unwrap_or_default(),
            },
            filesystem: EffectiveFilesystem {
                workspace_root: self.workspace_root,
                deny: self.deny,
            },
            rules: self.rules.into_iter().map(|(_, rule)| rule).collect(),
            resources: ResourceLimits {
                cpu_millis: self.cpu.map(|c| c.value),
                memory_bytes: self.memory.map(|c| c.value),
                disk_bytes: self.disk.map(|c| c.value),
            },
            runtime: EffectiveRuntime {
                engine: self.engine,
                rootless: self.rootless.unwrap_or(false),
            },
            credentials: EffectiveCredentials {
                git_token_ttl: git_ttl.map(|c| c.value),
                llm_api_key_ttl: llm_ttl.map(|c| c.value),
                mirror_token_ttl: mirror_ttl.map(|c| c.value),
                revoke_on_stop: self.revoke_on_stop.unwrap_or(false),
                no_persist_to_workspace: self.no_persist_to_workspace.unwrap_or(false),
            },
        };
        policy.version = integrity::policy_version(&policy);

        tracing::debug!(
            "Merged effective policy {} ({} rules, network {})",
            policy.version,
            policy.rules.len(),
            policy.network.mode
        );
        Ok(policy)
    }
}

fn parse_value<T, E: ToString>(
    level: PolicyLevel,
    field: &str,
    raw: &str,
    parse: impl FnOnce(&str) -> Result<T, E>,
) -> Result<T, MergeError> {
    parse(raw).map_err(|e| MergeError::InvalidValue {
        level,
        field: field.to_string(),
        message: e.to_string(),
    })
}

/// Take the child ceiling unless it exceeds the inherited one
fn lower_ceiling(
    violations: &mut Vec<Violation>,
    level: PolicyLevel,
    field: &str,
    slot: &mut Option<Ceiling<u64>>,
    value: u64,
    raw: &str,
) {
    match slot {
        Some(parent) if value > parent.value => violations.push(Violation {
            field: field.to_string(),
            level,
            inherited: parent.raw.clone(),
            attempted: raw.to_string(),
        }),
        _ => {
            *slot = Some(Ceiling {
                value,
                raw: raw.to_string(),
            })
        }
    }
}

/// A restrictive flag once enabled cannot be switched off
fn keep_flag_on(
    violations: &mut Vec<Violation>,
    level: PolicyLevel,
    field: &str,
    slot: &mut Option<bool>,
    value: bool,
) {
    if *slot == Some(true) && !value {
        violations.push(Violation {
            field: field.to_string(),
            level,
            inherited: "true".to_string(),
            attempted: "false".to_string(),
        });
    } else {
        *slot = Some(value);
    }
}

/// Strictness of a rule: refusal first, then risk class
fn severity(rule: &ToolRule) -> (bool, RiskClass) {
    let refused = !rule.allow || rule.risk == RiskClass::BlockedByDefault;
    (refused, rule.risk)
}

fn describe(rule: &ToolRule) -> String {
    if rule.allow {
        rule.risk.to_string()
    } else {
        format!("{} (denied)", rule.risk)
    }
}

/// Whether some command matches both patterns
fn overlaps(a: &[String], b: &[String]) -> bool {
    a.iter()
        .zip(b)
        .all(|(x, y)| x == y || x == WILDCARD || y == WILDCARD)
}

/// Intersect a child allow-list with the inherited one.
///
/// A host survives when the other side admits it (so `*.github.com` against
/// `api.github.com` yields `api.github.com`); ports intersect with an empty
/// list meaning any port.
fn intersect_allow(level: PolicyLevel, parent: &[AllowRule], child: &[AllowRule]) -> Vec<AllowRule> {
    let mut out: Vec<AllowRule> = Vec::new();

    for c in child {
        for p in parent {
            let Some(ports) = intersect_ports(&p.ports, &c.ports) else {
                continue;
            };

            let mut hosts: Vec<String> = Vec::new();
            for host in &c.hosts {
                if p.hosts.iter().any(|pat| host_matches(pat, host)) && !hosts.contains(host) {
                    hosts.push(host.clone());
                }
            }
            for host in &p.hosts {
                if c.hosts.iter().any(|pat| host_matches(pat, host)) && !hosts.contains(host) {
                    hosts.push(host.clone());
                }
            }
            if hosts.is_empty() {
                continue;
            }

            match out.iter_mut().find(|r| r.id == c.id && r.ports == ports) {
                Some(existing) => {
                    for host in hosts {
                        if !existing.hosts.contains(&host) {
                            existing.hosts.push(host);
                        }
                    }
                }
                None => out.push(AllowRule {
                    id: c.id.clone(),
                    hosts,
                    ports,
                }),
            }
        }
    }

    let dropped: Vec<&str> = child
        .iter()
        .flat_map(|c| c.hosts.iter())
        .filter(|h| !out.iter().any(|r| r.hosts.contains(h)))
        .map(String::as_str)
        .collect();
    if !dropped.is_empty() {
        tracing::debug!(
            "{} policy allow-list entries outside the inherited list were dropped: {}",
            level,
            dropped.join(", ")
        );
    }

    out
}

fn intersect_ports(a: &[i64], b: &[i64]) -> Option<Vec<i64>> {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => Some(b.to_vec()),
        (false, true) => Some(a.to_vec()),
        (false, false) => {
            let ports: Vec<i64> = a.iter().copied().filter(|p| b.contains(p)).collect();
            (!ports.is_empty()).then_some(ports)
        }
    }
}
