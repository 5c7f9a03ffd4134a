//! Network allow-list checks against the effective policy.
//!
//! Tool and MCP packs declare the hosts they need; the sandbox launcher asks
//! the engine which of them the effective policy would not admit.

use glob::{MatchOptions, Pattern};

use super::merge::EffectivePolicy;
use super::types::NetworkMode;

const HOST_MATCH: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Match a host against an allow-list entry (`github.com` or `*.github.com`)
pub fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern.eq_ignore_ascii_case(host) {
        return true;
    }
    if !pattern.starts_with("*.") {
        return false;
    }
    match Pattern::new(pattern) {
        Ok(glob) => glob.matches_with(host, HOST_MATCH),
        Err(_) => false,
    }
}

impl EffectivePolicy {
    /// Whether a host (and optionally a port) may be reached
    pub fn allows_host(&self, host: &str, port: Option<u16>) -> bool {
        if self.network.mode == NetworkMode::AllowAll {
            return true;
        }
        self.network.allow.iter().any(|rule| {
            let port_ok = match port {
                Some(port) => rule.ports.is_empty() || rule.ports.contains(&i64::from(port)),
                None => true,
            };
            port_ok && rule.hosts.iter().any(|pattern| host_matches(pattern, host))
        })
    }

    /// Hosts from `required` that the policy would not admit, in input order
    pub fn unmet_hosts<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .map(String::as_str)
            .filter(|host| !self.allows_host(host, None))
            .collect()
    }
}
