//! Integration tests for the policy hierarchy
//!
//! Loads org/team/project documents from disk and checks the merged result,
//! including property tests for tighten-only monotonicity.

use anyhow::Result;
use proptest::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

use aibox::policy::{self, merge, MergeError, PolicyDocument, PolicyEngine, PolicyError, RiskClass};

fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn doc(src: &str) -> PolicyDocument {
    toml::from_str(src).unwrap()
}

const ORG: &str = r#"
version = 1

[network]
mode = "deny-by-default"

[[network.allow]]
id = "github"
hosts = ["github.com", "*.githubusercontent.com"]
ports = [443]

[filesystem]
deny = ["~/.ssh", "~/.aws"]

[[tools.rules]]
match = ["git", "push"]
risk = "review-required"

[[tools.rules]]
match = ["docker", "*", "run"]
risk = "blocked-by-default"

[resources]
cpu = "4"
memory = "8g"

[runtime]
engine = "podman"
rootless = true

[credentials]
git_token_ttl = "1h"
revoke_on_stop = true
"#;

#[test]
fn test_three_level_hierarchy_from_disk() -> Result<()> {
    let dir = TempDir::new()?;
    let org = write(&dir, "org.toml", ORG);
    let team = write(
        &dir,
        "team.toml",
        r#"
version = 1
[filesystem]
deny = ["/etc/shadow"]
[[tools.rules]]
match = ["npm", "publish"]
risk = "blocked-by-default"
allow = false
[resources]
memory = "4g"
"#,
    );
    let project = write(
        &dir,
        "policy.toml",
        r#"
version = 1
[filesystem]
workspace_root = "/work/app"
[credentials]
git_token_ttl = "15m"
"#,
    );

    let policy = PolicyEngine::effective(Some(&org), Some(&team), Some(&project))?;

    assert_eq!(policy.resources.memory_bytes, Some(4 << 30));
    assert_eq!(policy.resources.cpu_millis, Some(4000));
    assert_eq!(policy.filesystem.deny, vec!["~/.ssh", "~/.aws", "/etc/shadow"]);
    assert_eq!(policy.filesystem.workspace_root.as_deref(), Some("/work/app"));
    assert!(policy.runtime.rootless);
    assert_eq!(
        policy.credentials.git_token_ttl,
        Some(std::time::Duration::from_secs(15 * 60))
    );
    assert!(policy.credentials.revoke_on_stop);
    assert!(policy.version.starts_with("sha256:"));

    let verdict = policy::decide(&["git".to_string(), "push".to_string()], &policy.rules);
    assert_eq!(verdict.risk, RiskClass::ReviewRequired);
    let verdict = policy::decide(&["npm".to_string(), "publish".to_string()], &policy.rules);
    assert!(verdict.is_refused());
    Ok(())
}

#[test]
fn test_missing_org_is_fatal() {
    let dir = TempDir::new().unwrap();
    let team = write(&dir, "team.toml", "version = 1\n");
    let err = PolicyEngine::effective(None, Some(&team), None).unwrap_err();
    assert!(matches!(err, PolicyError::OrgPolicyRequired));
    assert_eq!(err.to_string(), "org policy required");
}

#[test]
fn test_missing_file_is_reported_by_path() {
    let dir = TempDir::new().unwrap();
    let org = dir.path().join("nope.toml");
    let err = PolicyEngine::effective(Some(&org), None, None).unwrap_err();
    assert!(matches!(err, PolicyError::NotFound(ref p) if p == &org));
}

#[test]
fn test_unknown_keys_are_rejected() {
    let dir = TempDir::new().unwrap();
    let org = write(&dir, "org.toml", "version = 1\n[network]\nmdoe = \"allow-all\"\n");
    let err = PolicyEngine::effective(Some(&org), None, None).unwrap_err();
    assert!(matches!(err, PolicyError::Parse { .. }));
}

#[test]
fn test_project_loosening_is_rejected_with_every_violation() {
    let dir = TempDir::new().unwrap();
    let org = write(&dir, "org.toml", ORG);
    let project = write(
        &dir,
        "policy.toml",
        r#"
version = 1
[network]
mode = "allow-all"
[[tools.rules]]
match = ["docker", "*", "run"]
risk = "safe"
[resources]
memory = "32g"
[runtime]
rootless = false
"#,
    );

    let err = PolicyEngine::effective(Some(&org), None, Some(&project)).unwrap_err();
    let violations = match err {
        PolicyError::Merge(MergeError::Violations(violations)) => violations,
        other => panic!("Expected merge violations, got {:?}", other),
    };
    let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
    assert!(fields.contains(&"network.mode"));
    assert!(fields.contains(&"resources.memory"));
    assert!(fields.contains(&"runtime.rootless"));
    assert!(fields.contains(&"tools.rules[docker * run].risk"));
}

#[test]
fn test_same_inputs_same_version() {
    let a = merge(&doc(ORG), None, None).unwrap();
    let b = merge(&doc(ORG), None, None).unwrap();
    assert_eq!(a.version, b.version);

    let tighter = merge(&doc(ORG), Some(&doc("version = 1\n[resources]\ncpu = \"2\"\n")), None).unwrap();
    assert_ne!(a.version, tighter.version);
}

const HOSTS: &[&str] = &[
    "github.com",
    "gitlab.com",
    "pypi.org",
    "crates.io",
    "registry.npmjs.org",
];

const PATHS: &[&str] = &["~/.ssh", "~/.aws", "/etc", ".env", "~/.kube"];

fn subset(pool: &'static [&'static str]) -> impl Strategy<Value = Vec<String>> {
    proptest::sample::subsequence(pool, 0..=pool.len())
        .prop_map(|items| items.into_iter().map(String::from).collect())
}

fn toml_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|i| format!("{:?}", i)).collect();
    format!("[{}]", quoted.join(", "))
}

proptest! {
    #[test]
    fn prop_memory_ceiling_never_rises(org_gb in 1u64..64, child_gb in 1u64..64) {
        let org = doc(&format!("version = 1\n[resources]\nmemory = \"{}g\"\n", org_gb));
        let team = doc(&format!("version = 1\n[resources]\nmemory = \"{}g\"\n", child_gb));

        match merge(&org, Some(&team), None) {
            Ok(policy) => {
                prop_assert!(child_gb <= org_gb);
                prop_assert_eq!(policy.resources.memory_bytes, Some(child_gb << 30));
            }
            Err(err) => {
                prop_assert!(child_gb > org_gb);
                prop_assert_eq!(err.violations().len(), 1);
            }
        }
    }

    #[test]
    fn prop_deny_set_is_superset(org_deny in subset(PATHS), team_deny in subset(PATHS)) {
        let org = doc(&format!("version = 1\n[filesystem]\ndeny = {}\n", toml_list(&org_deny)));
        let team = doc(&format!("version = 1\n[filesystem]\ndeny = {}\n", toml_list(&team_deny)));
        let policy = merge(&org, Some(&team), None).unwrap();

        for path in org_deny.iter().chain(team_deny.iter()) {
            prop_assert!(policy.filesystem.deny.contains(path));
        }
    }

    #[test]
    fn prop_allow_set_is_subset(org_hosts in subset(HOSTS), team_hosts in subset(HOSTS)) {
        prop_assume!(!org_hosts.is_empty() && !team_hosts.is_empty());
        let org = doc(&format!(
            "version = 1\n[[network.allow]]\nid = \"org\"\nhosts = {}\n",
            toml_list(&org_hosts)
        ));
        let team = doc(&format!(
            "version = 1\n[[network.allow]]\nid = \"team\"\nhosts = {}\n",
            toml_list(&team_hosts)
        ));
        let policy = merge(&org, Some(&team), None).unwrap();

        for rule in &policy.network.allow {
            for host in &rule.hosts {
                prop_assert!(org_hosts.contains(host));
                prop_assert!(team_hosts.contains(host));
            }
        }
    }

    #[test]
    fn prop_classifier_is_total(tokens in proptest::collection::vec("[a-z*-]{0,6}", 0..5)) {
        let policy = merge(&doc(ORG), None, None).unwrap();
        let first = policy::decide(&tokens, &policy.rules);
        let second = policy::decide(&tokens, &policy.rules);
        prop_assert_eq!(first, second);
    }
}
