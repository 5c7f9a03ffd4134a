use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::audit::{DecisionContext, DecisionEntry, DecisionLog};
use crate::policy::{
    classifier::{self, Verdict},
    error::PolicyError,
    integrity,
    merge::{self, EffectivePolicy},
    store::PolicyStore,
    types::RiskClass,
};

/// Action names recorded in the decision log
pub mod actions {
    pub const TOOL_EXEC: &str = "tool.exec";
    pub const GIT_PUSH: &str = "git.push";
    pub const CONTAINER_START: &str = "container.start";
    pub const PACK_NETWORK: &str = "pack.network";
}

/// A pack needs hosts the effective policy does not admit
#[derive(Debug, Error)]
#[error("pack '{pack}' requires hosts not allowed by policy: {}", hosts.join(", "))]
pub struct UnmetHosts {
    pub pack: String,
    pub hosts: Vec<String>,
}

/// Policy engine for gate decisions.
///
/// Owns one effective policy and records every decision it makes.
pub struct PolicyEngine {
    policy: EffectivePolicy,
    log: Arc<DecisionLog>,
}

impl PolicyEngine {
    pub fn new(policy: EffectivePolicy, log: Arc<DecisionLog>) -> Self {
        if !integrity::verify(&policy) {
            tracing::warn!("Policy {} does not match its content hash", policy.version);
        }
        tracing::debug!("Policy engine using policy {}", policy.version);
        Self { policy, log }
    }

    /// Load, validate and merge a hierarchy.
    ///
    /// Missing org path, malformed documents, validation errors and merge
    /// violations are all fatal.
    pub fn load(
        org: Option<&Path>,
        team: Option<&Path>,
        project: Option<&Path>,
        log: Arc<DecisionLog>,
    ) -> Result<Self, PolicyError> {
        let policy = Self::effective(org, team, project)?;
        tracing::info!("Effective policy {} loaded", policy.version);
        Ok(Self::new(policy, log))
    }

    /// Load, validate and merge without building an engine
    pub fn effective(
        org: Option<&Path>,
        team: Option<&Path>,
        project: Option<&Path>,
    ) -> Result<EffectivePolicy, PolicyError> {
        let hierarchy = PolicyStore::load_hierarchy(org, team, project)?;

        let errors = hierarchy.validate();
        if !errors.is_empty() {
            return Err(PolicyError::Invalid(errors));
        }

        Ok(merge::merge_hierarchy(&hierarchy)?)
    }

    /// Engine with an open policy. Only for callers that deliberately run
    /// without an org policy configured.
    pub fn permissive(log: Arc<DecisionLog>) -> Self {
        tracing::warn!("No org policy configured; running with a permissive policy");
        Self::new(EffectivePolicy::permissive(), log)
    }

    pub fn policy(&self) -> &EffectivePolicy {
        &self.policy
    }

    /// Version hash recorded with every decision
    pub fn version(&self) -> &str {
        &self.policy.version
    }

    pub fn log(&self) -> &Arc<DecisionLog> {
        &self.log
    }

    /// Classify a command without recording anything
    pub fn classify(&self, command: &[String]) -> Verdict {
        classifier::decide(command, &self.policy.rules)
    }

    /// Classify a command for `action` and record the decision
    pub fn decide(&self, context: &DecisionContext, action: &str, command: &[String]) -> Verdict {
        let verdict = self.classify(command);
        self.record(DecisionEntry::from_verdict(
            action,
            context,
            self.version(),
            &verdict,
        ));
        verdict
    }

    /// Gate a tool or shell command executed inside a sandbox
    pub fn check_command(&self, context: &DecisionContext, command: &[String]) -> Verdict {
        self.decide(context, actions::TOOL_EXEC, command)
    }

    /// Record a container start under the current policy
    pub fn check_container_start(&self, context: &DecisionContext) -> Verdict {
        let verdict = Verdict {
            allowed: true,
            risk: RiskClass::Safe,
            rule: "policy".to_string(),
            reason: format!("sandbox started under policy {}", self.version()),
        };
        self.record(DecisionEntry::from_verdict(
            actions::CONTAINER_START,
            context,
            self.version(),
            &verdict,
        ));
        verdict
    }

    /// Check every host a pack declares against the network allow-list.
    ///
    /// Reports all unmet hosts by name, not just the first.
    pub fn check_pack_network(
        &self,
        context: &DecisionContext,
        pack: &str,
        network_requires: &[String],
    ) -> Result<(), UnmetHosts> {
        let unmet: Vec<String> = self
            .policy
            .unmet_hosts(network_requires)
            .into_iter()
            .map(String::from)
            .collect();

        let verdict = Verdict {
            allowed: unmet.is_empty(),
            risk: RiskClass::Safe,
            rule: format!("network.{}", self.policy.network.mode),
            reason: if unmet.is_empty() {
                format!("pack '{}' network requirements allowed", pack)
            } else {
                format!("pack '{}' requires unlisted hosts: {}", pack, unmet.join(", "))
            },
        };
        self.record(DecisionEntry::from_verdict(
            actions::PACK_NETWORK,
            context,
            self.version(),
            &verdict,
        ));

        if unmet.is_empty() {
            Ok(())
        } else {
            Err(UnmetHosts {
                pack: pack.to_string(),
                hosts: unmet,
            })
        }
    }

    /// Append an entry; failures are warnings and never block the action
    pub fn record(&self, entry: DecisionEntry) {
        if let Err(e) = self.log.log(entry) {
            tracing::warn!("Failed to record decision: {}", e);
        }
    }
}
