//! Policy-gated push session.
//!
//! Runs as a git remote helper: every `push` line is classified, recorded,
//! and then either refused, delegated to the real remote, or staged under a
//! disposable ref with an approval request for a reviewer.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::io::{BufRead, Write};
use std::sync::Arc;

use super::approval::{self, ApprovalError, ApprovalRequest, ApprovalStore};
use super::git::GitTransport;
use super::notify::Notifier;
use super::protocol::{HelperCommand, ProtocolError, PushReply, Refspec, CAPABILITIES};
use crate::audit::{Decision, DecisionContext, DecisionEntry};
use crate::policy::classifier::Verdict;
use crate::policy::engine::actions;
use crate::policy::{PolicyEngine, RiskClass};

/// Command classified for every push
pub const PUSH_COMMAND: [&str; 2] = ["git", "push"];

pub type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// What the gate did with one push, for the reply and the decision log
struct Outcome {
    reply: PushReply,
    detail: String,
    /// `Deny` when the gate itself refused the push
    decision: Decision,
}

impl Outcome {
    fn allowed(reply: PushReply, detail: impl Into<String>) -> Self {
        Self {
            reply,
            detail: detail.into(),
            decision: Decision::Allow,
        }
    }

    fn refused(dst: &str, reason: &str, detail: impl Into<String>) -> Self {
        Self {
            reply: PushReply::error(dst, reason),
            detail: detail.into(),
            decision: Decision::Deny,
        }
    }
}

pub struct PushGate {
    engine: Arc<PolicyEngine>,
    context: DecisionContext,
    remote_name: String,
    remote_url: String,
    git: Box<dyn GitTransport>,
    store: Box<dyn ApprovalStore>,
    notifier: Option<Box<dyn Notifier>>,
    clock: Clock,
}

impl PushGate {
    pub fn new(
        engine: Arc<PolicyEngine>,
        context: DecisionContext,
        remote_name: impl Into<String>,
        remote_url: impl Into<String>,
        git: Box<dyn GitTransport>,
        store: Box<dyn ApprovalStore>,
    ) -> Self {
        Self {
            engine,
            context,
            remote_name: remote_name.into(),
            remote_url: remote_url.into(),
            git,
            store,
            notifier: None,
            clock: Box::new(Utc::now),
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Serve one helper session until EOF.
    ///
    /// Each push is fully handled before the next line is read. Unknown
    /// commands and malformed refspecs abort the session.
    pub fn run<R: BufRead, W: Write>(&self, input: R, mut output: W) -> Result<(), ProtocolError> {
        for line in input.lines() {
            let line = line?;
            match HelperCommand::parse(&line)? {
                HelperCommand::Capabilities => {
                    for capability in CAPABILITIES {
                        writeln!(output, "{}", capability)?;
                    }
                    writeln!(output)?;
                }
                HelperCommand::Push(refspec) => {
                    let reply = self.handle_push(&refspec);
                    writeln!(output, "{}", reply)?;
                    writeln!(output)?;
                }
                HelperCommand::Blank => continue,
            }
            output.flush()?;
        }
        tracing::debug!("Helper session for {} ended", self.remote_url);
        Ok(())
    }

    /// Decide and carry out one push
    pub fn handle_push(&self, refspec: &Refspec) -> PushReply {
        let command: Vec<String> = PUSH_COMMAND.iter().map(|t| t.to_string()).collect();
        let verdict = self.engine.classify(&command);

        let outcome = if verdict.is_refused() {
            tracing::warn!("Push of {} refused by rule '{}'", refspec, verdict.rule);
            Outcome::refused(&refspec.dst, "push blocked by policy", "refused")
        } else if verdict.risk == RiskClass::ReviewRequired {
            self.stage(refspec)
        } else {
            self.delegate(refspec)
        };

        self.record(&verdict, refspec, &outcome);
        outcome.reply
    }

    fn delegate(&self, refspec: &Refspec) -> Outcome {
        match self.git.push(&self.remote_url, refspec) {
            Ok(()) => {
                tracing::info!("Pushed {} to {}", refspec, self.remote_url);
                Outcome::allowed(PushReply::Ok(refspec.dst.clone()), "pushed")
            }
            Err(e) => {
                tracing::warn!("Push of {} failed: {:#}", refspec, e);
                Outcome::allowed(PushReply::error(&refspec.dst, "push failed"), "push failed")
            }
        }
    }

    fn stage(&self, refspec: &Refspec) -> Outcome {
        if refspec.is_delete() {
            return Outcome::refused(&refspec.dst, "ref deletion requires review", "deletion refused");
        }

        let created_at = match self.free_timestamp() {
            Ok(at) => at,
            Err(e) => {
                tracing::warn!("Approval store unavailable: {}", e);
                return Outcome::refused(
                    &refspec.dst,
                    "staging push failed",
                    "approval store unavailable",
                );
            }
        };

        let staging_ref = approval::staging_ref(&self.context.user, created_at);
        if let Err(e) = self.git.push(&self.remote_url, &refspec.retarget(&staging_ref)) {
            tracing::warn!("Staging push to {} failed: {:#}", staging_ref, e);
            return Outcome::allowed(
                PushReply::error(&refspec.dst, "staging push failed"),
                "staging push failed",
            );
        }

        let commit_range = self
            .git
            .commit_range(&self.remote_name, refspec)
            .unwrap_or_else(|e| {
                tracing::debug!("No commit range for {}: {:#}", refspec.src, e);
                refspec.src.clone()
            });

        let request = ApprovalRequest::pending(
            &self.context.user,
            refspec,
            commit_range,
            self.remote_url.clone(),
            created_at,
        );

        if let Err(e) = self.store.put(&request) {
            tracing::warn!("Could not save approval request {}: {}", request.id, e);
            // No request points at the staging ref any more
            if let Err(e) = self.git.delete_remote_ref(&self.remote_url, &staging_ref) {
                tracing::warn!("Orphaned staging ref {} left on remote: {:#}", staging_ref, e);
            }
            return Outcome::refused(
                &refspec.dst,
                "approval request could not be saved",
                "approval request not saved",
            );
        }

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify(&request) {
                tracing::warn!("Reviewer notification for {} failed: {:#}", request.id, e);
            }
        }

        tracing::info!("Staged {} at {} as {}", refspec, staging_ref, request.id);
        eprintln!(
            "aibox: push to {} requires review.\n  staged at: {}\n  commits:   {}\n  request:   {}",
            request.target_branch, request.staging_ref, request.commit_range, request.id
        );

        Outcome::allowed(
            PushReply::Ok(refspec.dst.clone()),
            format!("staged at {} as {}", staging_ref, request.id),
        )
    }

    /// Current time, moved forward a second at a time past any request
    /// already stored for that stamp
    fn free_timestamp(&self) -> Result<DateTime<Utc>, ApprovalError> {
        let mut at = (self.clock)();
        while self
            .store
            .contains(&approval::request_id(&self.context.user, at))?
        {
            at += ChronoDuration::seconds(1);
        }
        Ok(at)
    }

    fn record(&self, verdict: &Verdict, refspec: &Refspec, outcome: &Outcome) {
        let mut entry =
            DecisionEntry::from_verdict(actions::GIT_PUSH, &self.context, self.engine.version(), verdict);
        entry.decision = outcome.decision;
        entry.reason = format!("{}; {} {}", verdict.reason, refspec, outcome.detail);
        self.engine.record(entry);
    }

    /// Withdraw one of this user's pending requests
    pub fn cancel(&self, id: &str) -> Result<ApprovalRequest, ApprovalError> {
        approval::cancel(self.store.as_ref(), self.git.as_ref(), id)
    }

    /// This user's requests, oldest first
    pub fn list(&self) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        self.store.list()
    }
}
