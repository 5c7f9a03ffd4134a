//! CLI command handlers

use aibox::audit::{DecisionContext, DecisionLog};
use aibox::config::Config;
use aibox::gate::{self, ApprovalStore, FileApprovalStore, GitCli, PushGate, WebhookNotifier};
use aibox::policy::{self, EffectivePolicy, PolicyEngine, RiskClass, ToolRule};
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};

/// Sandbox ID exported by the sandbox launcher
const SANDBOX_ID_ENV: &str = "AIBOX_SANDBOX_ID";

/// Exit status of `policy check` for a refused command
const REFUSED_EXIT_CODE: i32 = 2;

/// Per-invocation overrides of the configured policy paths
#[derive(Args, Debug, Default)]
pub struct PolicyArgs {
    /// Org policy file
    #[arg(long)]
    pub org: Option<PathBuf>,

    /// Team policy file
    #[arg(long)]
    pub team: Option<PathBuf>,

    /// Project policy file (default: .aibox/policy.toml in the workspace)
    #[arg(long)]
    pub project: Option<PathBuf>,
}

/// Who is running, where, and with which configuration
pub struct Session {
    pub config: Config,
    pub user: String,
    pub workspace: PathBuf,
}

impl Session {
    pub fn resolve(config_path: Option<&Path>) -> Result<Self> {
        let config = match config_path {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
        };
        let workspace = std::env::current_dir().context("Failed to resolve working directory")?;
        Ok(Self {
            config,
            user: whoami::username(),
            workspace,
        })
    }

    fn policy_paths(&self, args: &PolicyArgs) -> [Option<PathBuf>; 3] {
        [
            args.org.clone().or_else(|| self.config.policy.org.clone()),
            args.team.clone().or_else(|| self.config.policy.team.clone()),
            args.project
                .clone()
                .or_else(|| self.config.project_policy(&self.workspace)),
        ]
    }

    /// Effective policy, or the permissive one when no org policy is
    /// configured at all
    fn effective_policy(&self, args: &PolicyArgs) -> Result<EffectivePolicy> {
        let [org, team, project] = self.policy_paths(args);
        match org {
            Some(org) => Ok(PolicyEngine::effective(
                Some(&org),
                team.as_deref(),
                project.as_deref(),
            )?),
            None => {
                tracing::warn!("No org policy configured; showing the permissive policy");
                Ok(EffectivePolicy::permissive())
            }
        }
    }

    fn context(&self) -> DecisionContext {
        DecisionContext::new(&self.user, self.workspace.display().to_string())
            .with_sandbox(std::env::var(SANDBOX_ID_ENV).unwrap_or_default())
    }

    fn approval_store(&self) -> FileApprovalStore {
        FileApprovalStore::new(self.config.approvals_dir(), &self.user)
    }
}

/// Validate all levels and the merge; an org policy is required here
pub fn run_policy_validate(session: &Session, args: &PolicyArgs) -> Result<()> {
    let [org, team, project] = session.policy_paths(args);
    let org = org.ok_or(policy::PolicyError::OrgPolicyRequired)?;

    let policy = PolicyEngine::effective(Some(&org), team.as_deref(), project.as_deref())?;

    println!("{} policy valid", "✓".green());
    println!("  org:     {}", org.display());
    if let Some(team) = &team {
        println!("  team:    {}", team.display());
    }
    if let Some(project) = &project {
        println!("  project: {}", project.display());
    }
    println!("  version: {}", policy.version.cyan());
    Ok(())
}

pub fn run_policy_show(session: &Session, args: &PolicyArgs) -> Result<()> {
    let policy = session.effective_policy(args)?;
    println!("{}", serde_json::to_string_pretty(&policy)?);
    Ok(())
}

pub fn run_policy_check(session: &Session, args: &PolicyArgs, command: &[String]) -> Result<()> {
    let policy = session.effective_policy(args)?;
    let verdict = policy::decide(command, &policy.rules);

    let decision = if verdict.is_refused() {
        "deny".red().bold().to_string()
    } else {
        "allow".green().bold().to_string()
    };
    println!("command:  {}", command.join(" "));
    println!("decision: {}", decision);
    println!("risk:     {}", verdict.risk);
    println!("rule:     {}", verdict.rule);
    println!("reason:   {}", verdict.reason);
    println!("policy:   {}", policy.version);

    if verdict.is_refused() {
        std::process::exit(REFUSED_EXIT_CODE);
    }
    Ok(())
}

pub fn run_policy_rules(
    session: &Session,
    args: &PolicyArgs,
    risk: Option<RiskClass>,
) -> Result<()> {
    let policy = session.effective_policy(args)?;

    #[derive(Tabled)]
    struct RuleRow {
        #[tabled(rename = "#")]
        index: usize,
        #[tabled(rename = "Match")]
        pattern: String,
        #[tabled(rename = "Allow")]
        allow: String,
        #[tabled(rename = "Risk")]
        risk: String,
    }

    let rules: Vec<&ToolRule> = match risk {
        None => policy.rules.iter().collect(),
        Some(RiskClass::BlockedByDefault) => policy::blocked_commands(&policy.rules),
        Some(RiskClass::ReviewRequired) => policy::review_required_commands(&policy.rules),
        Some(RiskClass::Safe) => policy
            .rules
            .iter()
            .filter(|rule| rule.risk == RiskClass::Safe)
            .collect(),
    };

    if rules.is_empty() {
        match risk {
            Some(risk) => println!("No {} rules.", risk),
            None => println!("No tool rules; every command is allowed as safe."),
        }
        return Ok(());
    }

    // Index is the evaluation position, so it survives filtering
    let rows: Vec<RuleRow> = policy
        .rules
        .iter()
        .enumerate()
        .filter(|(_, rule)| rules.contains(rule))
        .map(|(i, rule)| RuleRow {
            index: i + 1,
            pattern: rule.key(),
            allow: if rule.allow { "yes" } else { "no" }.to_string(),
            risk: rule.risk.to_string(),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);
    Ok(())
}

pub fn run_approvals_list(session: &Session) -> Result<()> {
    let requests = session.approval_store().list()?;

    if requests.is_empty() {
        println!("No approval requests for {}.", session.user);
        return Ok(());
    }

    #[derive(Tabled)]
    struct RequestRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Target")]
        target: String,
        #[tabled(rename = "Source")]
        source: String,
        #[tabled(rename = "Commits")]
        commits: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "Created")]
        created: String,
    }

    let rows: Vec<RequestRow> = requests
        .into_iter()
        .map(|r| RequestRow {
            id: r.id,
            target: r.target_branch,
            source: r.source_branch,
            commits: r.commit_range,
            status: r.status.to_string(),
            created: r.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);
    Ok(())
}

pub fn run_approvals_cancel(session: &Session, id: &str) -> Result<()> {
    let store = session.approval_store();
    let request = gate::cancel(&store, &GitCli::new(None), id)?;
    println!(
        "{} cancelled {} ({} -> {})",
        "✓".green(),
        request.id,
        request.source_branch,
        request.target_branch
    );
    Ok(())
}

/// Serve git on stdin/stdout until it closes the session
pub fn run_remote_helper(session: &Session, remote: &str, url: &str) -> Result<()> {
    let config = &session.config;
    let audit_dir = config.audit_dir();
    let log = match DecisionLog::open(&audit_dir, config.audit.flush_interval()) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            tracing::warn!("Decisions will not be recorded: {}", e);
            Arc::new(DecisionLog::unavailable(&audit_dir))
        }
    };

    let [org, team, project] = session.policy_paths(&PolicyArgs::default());
    let engine = match org {
        Some(org) => PolicyEngine::load(
            Some(&org),
            team.as_deref(),
            project.as_deref(),
            Arc::clone(&log),
        )?,
        None => PolicyEngine::permissive(Arc::clone(&log)),
    };

    let mut push_gate = PushGate::new(
        Arc::new(engine),
        session.context(),
        remote,
        url,
        Box::new(GitCli::new(None)),
        Box::new(session.approval_store()),
    );

    if let Some(webhook) = &config.push.webhook_url {
        match WebhookNotifier::new(webhook, config.push.webhook_timeout()) {
            Ok(notifier) => push_gate = push_gate.with_notifier(Box::new(notifier)),
            Err(e) => tracing::warn!("Reviewer notifications disabled: {:#}", e),
        }
    }

    let result = push_gate.run(io::stdin().lock(), io::stdout().lock());

    if let Err(e) = log.close() {
        tracing::warn!("Failed to close decision log: {}", e);
    }
    result.context("Remote helper session failed")
}
