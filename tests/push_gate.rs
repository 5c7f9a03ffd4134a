//! Integration tests for the push gate
//!
//! Drives full helper sessions against an in-memory remote and checks the
//! replies, the remote refs, the stored approval requests and the decision
//! log.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use aibox::audit::{Decision, DecisionContext, DecisionLog};
use aibox::gate::{
    ApprovalError, ApprovalRequest, ApprovalStatus, ApprovalStore, FileApprovalStore, GitTransport,
    Notifier, ProtocolError, PushGate, Refspec,
};
use aibox::policy::{actions, EffectivePolicy, PolicyEngine, RiskClass, ToolRule};

const REMOTE_URL: &str = "https://git.example.com/team/app.git";

/// Remote that keeps refs in memory
#[derive(Clone, Default)]
struct FakeRemote {
    refs: Arc<Mutex<BTreeMap<String, String>>>,
    pushes: Arc<Mutex<Vec<String>>>,
    reject: Arc<Mutex<Vec<String>>>,
}

impl FakeRemote {
    fn refs(&self) -> BTreeMap<String, String> {
        self.refs.lock().unwrap().clone()
    }

    fn pushes(&self) -> Vec<String> {
        self.pushes.lock().unwrap().clone()
    }

    /// Fail pushes whose destination starts with `prefix`
    fn reject(&self, prefix: &str) {
        self.reject.lock().unwrap().push(prefix.to_string());
    }
}

impl GitTransport for FakeRemote {
    fn push(&self, remote_url: &str, refspec: &Refspec) -> Result<()> {
        assert_eq!(remote_url, REMOTE_URL);
        self.pushes.lock().unwrap().push(refspec.to_string());
        if self
            .reject
            .lock()
            .unwrap()
            .iter()
            .any(|prefix| refspec.dst.starts_with(prefix.as_str()))
        {
            anyhow::bail!("remote rejected {}", refspec.dst);
        }
        self.refs
            .lock()
            .unwrap()
            .insert(refspec.dst.clone(), refspec.src.clone());
        Ok(())
    }

    fn delete_remote_ref(&self, _remote_url: &str, refname: &str) -> Result<()> {
        self.refs
            .lock()
            .unwrap()
            .remove(refname)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("no such ref {}", refname))
    }

    fn commit_range(&self, _remote_name: &str, refspec: &Refspec) -> Result<String> {
        anyhow::bail!("no tracking ref for {}", refspec.dst)
    }
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    sent: Arc<Mutex<Vec<ApprovalRequest>>>,
    fail: bool,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, request: &ApprovalRequest) -> Result<()> {
        self.sent.lock().unwrap().push(request.clone());
        if self.fail {
            anyhow::bail!("webhook returned 500");
        }
        Ok(())
    }
}

/// Store whose writes always fail
#[derive(Clone)]
struct ReadOnlyStore(FileApprovalStore);

impl ApprovalStore for ReadOnlyStore {
    fn get(&self, id: &str) -> Result<ApprovalRequest, ApprovalError> {
        self.0.get(id)
    }

    fn put(&self, request: &ApprovalRequest) -> Result<(), ApprovalError> {
        Err(ApprovalError::Io {
            path: self.0.dir().join(format!("{}.json", request.id)),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        })
    }

    fn delete(&self, id: &str) -> Result<(), ApprovalError> {
        self.0.delete(id)
    }

    fn list(&self) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        self.0.list()
    }
}

struct Harness {
    _dir: TempDir,
    remote: FakeRemote,
    store: FileApprovalStore,
    log: Arc<DecisionLog>,
    gate: PushGate,
}

fn fixed_clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 14, 5, 9).unwrap()
}

fn harness(push_risk: RiskClass, allow: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(DecisionLog::open(&dir.path().join("audit"), Duration::from_secs(3600)).unwrap());

    let mut policy = EffectivePolicy::permissive();
    policy.rules = vec![ToolRule::new(&["git", "push"], allow, push_risk)];
    let engine = Arc::new(PolicyEngine::new(policy, Arc::clone(&log)));

    let remote = FakeRemote::default();
    let store = FileApprovalStore::new(dir.path().join("approvals"), "alice");
    let gate = PushGate::new(
        engine,
        DecisionContext::new("alice", "/work/app").with_sandbox("sb-7"),
        "origin",
        REMOTE_URL,
        Box::new(remote.clone()),
        Box::new(store.clone()),
    )
    .with_clock(Box::new(fixed_clock));

    Harness {
        _dir: dir,
        remote,
        store,
        log,
        gate,
    }
}

fn session(gate: &PushGate, input: &str) -> Result<String, ProtocolError> {
    let mut output = Vec::new();
    gate.run(input.as_bytes(), &mut output)?;
    Ok(String::from_utf8(output).unwrap())
}

#[test]
fn test_capabilities() {
    let h = harness(RiskClass::Safe, true);
    assert_eq!(session(&h.gate, "capabilities\n\n").unwrap(), "push\n\n");
}

#[test]
fn test_safe_push_is_delegated_verbatim() {
    let h = harness(RiskClass::Safe, true);
    let output = session(&h.gate, "push +main:main\n\n").unwrap();

    assert_eq!(output, "ok main\n\n");
    assert_eq!(h.remote.pushes(), vec!["+main:main"]);
    assert_eq!(h.remote.refs().get("main").map(String::as_str), Some("main"));
    assert!(h.store.list().unwrap().is_empty());
}

#[test]
fn test_safe_push_failure() {
    let h = harness(RiskClass::Safe, true);
    h.remote.reject("main");
    let output = session(&h.gate, "push main:main\n").unwrap();
    assert_eq!(output, "error main push failed\n\n");
}

#[test]
fn test_review_required_push_is_staged() {
    let h = harness(RiskClass::ReviewRequired, true);
    let output = session(&h.gate, "capabilities\n\npush main:main\n\n").unwrap();

    assert_eq!(output, "push\n\nok main\n\n");

    let refs = h.remote.refs();
    assert!(!refs.contains_key("main"), "real branch must stay untouched");
    assert_eq!(refs.len(), 1);
    let staging = refs.keys().next().unwrap();
    let layout = Regex::new(r"^refs/aibox/staging/alice/\d{14}$").unwrap();
    assert!(layout.is_match(staging), "unexpected staging ref {}", staging);
    assert_eq!(staging, "refs/aibox/staging/alice/20261019140509");

    let requests = h.store.list().unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.status, ApprovalStatus::Pending);
    assert_eq!(request.user, "alice");
    assert_eq!(request.source_branch, "main");
    assert_eq!(request.target_branch, "main");
    assert_eq!(&request.staging_ref, staging);
    assert_eq!(request.remote_url, REMOTE_URL);
    // Commit range falls back to the source ref name
    assert_eq!(request.commit_range, "main");
}

#[test]
fn test_pushes_in_one_second_get_distinct_staging_refs() {
    let h = harness(RiskClass::ReviewRequired, true);
    let output = session(&h.gate, "push main:main\npush feature:release\n\n").unwrap();
    assert_eq!(output, "ok main\n\nok release\n\n");

    let requests = h.store.list().unwrap();
    assert_eq!(requests.len(), 2);
    assert_ne!(requests[0].staging_ref, requests[1].staging_ref);
    assert_eq!(h.remote.refs().len(), 2);
}

#[test]
fn test_staging_failure_creates_no_request() {
    let h = harness(RiskClass::ReviewRequired, true);
    h.remote.reject("refs/aibox/staging/");
    let output = session(&h.gate, "push main:main\n").unwrap();

    assert_eq!(output, "error main staging push failed\n\n");
    assert!(h.store.list().unwrap().is_empty());
}

#[test]
fn test_blocked_push_never_reaches_remote() {
    for (risk, allow) in [
        (RiskClass::BlockedByDefault, true),
        (RiskClass::Safe, false),
    ] {
        let h = harness(risk, allow);
        let output = session(&h.gate, "push main:main\n").unwrap();
        assert_eq!(output, "error main push blocked by policy\n\n");
        assert!(h.remote.pushes().is_empty());
    }
}

#[test]
fn test_reviewer_is_notified_and_failures_do_not_block() {
    for fail in [false, true] {
        let mut h = harness(RiskClass::ReviewRequired, true);
        let notifier = RecordingNotifier {
            fail,
            ..Default::default()
        };
        h.gate = h.gate.with_notifier(Box::new(notifier.clone()));

        let output = session(&h.gate, "push main:main\n").unwrap();
        assert_eq!(output, "ok main\n\n");

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], h.store.list().unwrap()[0]);
    }
}

#[test]
fn test_cancel_removes_ref_then_request() {
    let h = harness(RiskClass::ReviewRequired, true);
    session(&h.gate, "push main:main\n").unwrap();
    let id = h.gate.list().unwrap()[0].id.clone();

    let cancelled = h.gate.cancel(&id).unwrap();
    assert_eq!(cancelled.id, id);
    assert!(h.remote.refs().is_empty());
    assert!(h.store.list().unwrap().is_empty());

    assert!(matches!(h.gate.cancel(&id), Err(ApprovalError::NotFound(_))));
}

#[test]
fn test_cancel_requires_pending() {
    let h = harness(RiskClass::ReviewRequired, true);
    session(&h.gate, "push main:main\n").unwrap();
    let mut request = h.store.list().unwrap().remove(0);
    request.status = ApprovalStatus::Approved;
    h.store.put(&request).unwrap();

    let err = h.gate.cancel(&request.id).unwrap_err();
    assert!(matches!(err, ApprovalError::NotPending { status: ApprovalStatus::Approved, .. }));
    assert!(err.to_string().contains("approved"));
    // Nothing was removed
    assert_eq!(h.remote.refs().len(), 1);
    assert_eq!(h.store.list().unwrap().len(), 1);
}

#[test]
fn test_cancel_survives_missing_remote_ref() {
    let h = harness(RiskClass::ReviewRequired, true);
    session(&h.gate, "push main:main\n").unwrap();
    let request = h.store.list().unwrap().remove(0);
    h.remote.refs.lock().unwrap().clear();

    assert!(h.gate.cancel(&request.id).is_ok());
    assert!(h.store.list().unwrap().is_empty());
}

#[test]
fn test_protocol_errors_abort_session() {
    let h = harness(RiskClass::Safe, true);
    assert!(matches!(
        session(&h.gate, "fetch 0000 refs/heads/main\n"),
        Err(ProtocolError::UnknownCommand(_))
    ));
    assert!(matches!(
        session(&h.gate, "push main\n"),
        Err(ProtocolError::MalformedRefspec(_))
    ));
    assert!(h.remote.pushes().is_empty());
}

#[test]
fn test_unsaved_request_removes_staging_ref() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(DecisionLog::open(&dir.path().join("audit"), Duration::from_secs(3600)).unwrap());
    let mut policy = EffectivePolicy::permissive();
    policy.rules = vec![ToolRule::new(&["git", "push"], true, RiskClass::ReviewRequired)];
    let engine = Arc::new(PolicyEngine::new(policy, Arc::clone(&log)));

    let remote = FakeRemote::default();
    let store = FileApprovalStore::new(dir.path().join("approvals"), "alice");
    let gate = PushGate::new(
        engine,
        DecisionContext::new("alice", "/work/app"),
        "origin",
        REMOTE_URL,
        Box::new(remote.clone()),
        Box::new(ReadOnlyStore(store.clone())),
    )
    .with_clock(Box::new(fixed_clock));

    let output = session(&gate, "push main:main\n").unwrap();
    assert_eq!(output, "error main approval request could not be saved\n\n");
    assert_eq!(remote.pushes(), vec!["main:refs/aibox/staging/alice/20261019140509"]);
    assert!(remote.refs().is_empty(), "staging ref must not outlive the request");
    assert!(store.list().unwrap().is_empty());

    log.flush().unwrap();
    let entries = DecisionLog::read_all(log.path()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision, Decision::Deny);
    assert!(entries[0].reason.contains("approval request not saved"));
}

#[test]
fn test_every_push_is_recorded() {
    let h = harness(RiskClass::ReviewRequired, true);
    session(&h.gate, "push main:main\npush :old\n").unwrap();
    h.log.flush().unwrap();

    let entries = DecisionLog::read_all(h.log.path()).unwrap();
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        assert_eq!(entry.action, actions::GIT_PUSH);
        assert_eq!(entry.user, "alice");
        assert_eq!(entry.sandbox_id, "sb-7");
        assert_eq!(entry.risk_class, RiskClass::ReviewRequired);
        assert_eq!(entry.rule, "git push");
    }
    assert_eq!(entries[0].decision, Decision::Allow);
    assert!(entries[0].reason.contains("staged at refs/aibox/staging/alice/"));
    // The gate refused the deletion even though policy allows pushes
    assert_eq!(entries[1].decision, Decision::Deny);
    assert!(entries[1].reason.contains("deletion refused"));
}

#[test]
fn test_policy_refusal_is_recorded_as_deny() {
    let h = harness(RiskClass::BlockedByDefault, true);
    session(&h.gate, "push main:main\n").unwrap();
    h.log.flush().unwrap();

    let entries = DecisionLog::read_all(h.log.path()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision, Decision::Deny);
    assert!(entries[0].reason.ends_with("main:main refused"));
}
