use serde::Serialize;

use crate::policy::types::{RiskClass, ToolRule, WILDCARD};

/// Rule name reported when no rule matched
pub const DEFAULT_RULE: &str = "default";

/// Result of classifying a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// Whether the command may run at all
    pub allowed: bool,
    /// Risk class of the matched rule (or `safe` by default)
    pub risk: RiskClass,
    /// Matched rule pattern joined by spaces, or `default`
    pub rule: String,
    /// Rationale for the decision
    pub reason: String,
}

impl Verdict {
    fn default_allow() -> Self {
        Self {
            allowed: true,
            risk: RiskClass::Safe,
            rule: DEFAULT_RULE.to_string(),
            reason: "no rule matched; allowed by default".to_string(),
        }
    }

    /// True when the gate must refuse the action outright
    pub fn is_refused(&self) -> bool {
        !self.allowed || self.risk == RiskClass::BlockedByDefault
    }
}

/// Check whether a rule pattern matches a command.
///
/// The command must be at least as long as the pattern and every pattern
/// token must equal the command token at that index or be `*`. Trailing
/// command tokens beyond the pattern are ignored, so an empty pattern
/// matches every command.
pub fn matches(pattern: &[String], command: &[String]) -> bool {
    if command.len() < pattern.len() {
        return false;
    }
    pattern
        .iter()
        .zip(command)
        .all(|(want, got)| want == WILDCARD || want == got)
}

/// Classify a command against a rule table.
///
/// The first matching rule in declaration order wins, not the most specific
/// one. Total for every input shape.
pub fn decide(command: &[String], rules: &[ToolRule]) -> Verdict {
    let Some(rule) = rules.iter().find(|rule| matches(&rule.pattern, command)) else {
        return Verdict::default_allow();
    };

    let key = rule.key();
    let reason = if rule.allow {
        format!("matched rule '{}' ({})", key, rule.risk)
    } else {
        format!("matched rule '{}' which denies the command", key)
    };

    tracing::debug!("Classified '{}' as {} via '{}'", command.join(" "), rule.risk, key);

    Verdict {
        allowed: rule.allow,
        risk: rule.risk,
        rule: key,
        reason,
    }
}

/// Convenience wrapper for string-slice commands
pub fn decide_str(command: &[&str], rules: &[ToolRule]) -> Verdict {
    let owned: Vec<String> = command.iter().map(|s| s.to_string()).collect();
    decide(&owned, rules)
}

/// Rules whose risk class is `blocked-by-default`
pub fn blocked_commands(rules: &[ToolRule]) -> Vec<&ToolRule> {
    with_risk(rules, RiskClass::BlockedByDefault)
}

/// Rules whose risk class is `review-required`
pub fn review_required_commands(rules: &[ToolRule]) -> Vec<&ToolRule> {
    with_risk(rules, RiskClass::ReviewRequired)
}

fn with_risk(rules: &[ToolRule], risk: RiskClass) -> Vec<&ToolRule> {
    rules.iter().filter(|rule| rule.risk == risk).collect()
}
