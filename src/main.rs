use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use aibox::policy::RiskClass;
use cli::PolicyArgs;

/// Name git looks up for `aibox::<url>` remotes
const HELPER_BINARY: &str = "git-remote-aibox";

#[derive(Parser)]
#[command(name = "aibox")]
#[command(author, version, about = "aibox - policy engine and push gate for AI sandboxes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: $AIBOX_CONFIG or the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and check the effective policy
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },

    /// Manage staged pushes waiting for review
    Approvals {
        #[command(subcommand)]
        command: ApprovalCommands,
    },

    /// Run as a git remote helper on stdin/stdout
    RemoteHelper {
        /// Remote name as given by git
        remote: String,

        /// Underlying remote URL
        url: String,
    },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Validate every configured level and the merged result
    Validate {
        #[command(flatten)]
        paths: PolicyArgs,
    },

    /// Print the effective policy as JSON
    Show {
        #[command(flatten)]
        paths: PolicyArgs,
    },

    /// Classify a command against the effective rules
    Check {
        #[command(flatten)]
        paths: PolicyArgs,

        /// Command tokens, e.g. `git push origin main`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// List the effective tool rules in evaluation order
    Rules {
        #[command(flatten)]
        paths: PolicyArgs,

        /// Only rules of this risk class (safe, review-required, blocked-by-default)
        #[arg(long)]
        risk: Option<RiskClass>,
    },
}

#[derive(Subcommand)]
enum ApprovalCommands {
    /// List your approval requests
    List,

    /// Withdraw a pending request and delete its staging ref
    Cancel {
        /// Request ID as shown by `aibox approvals list`
        id: String,
    },
}

/// Git runs `git-remote-aibox <remote> <url>`; map that onto the subcommand
fn cli_args() -> Vec<OsString> {
    let mut args: Vec<OsString> = std::env::args_os().collect();
    let as_helper = args
        .first()
        .and_then(|arg0| Path::new(arg0).file_name())
        .map(|name| name == HELPER_BINARY)
        .unwrap_or(false);
    if as_helper {
        args.insert(1, OsString::from("remote-helper"));
    }
    args
}

fn main() -> Result<()> {
    let cli = Cli::parse_from(cli_args());

    // stdout carries the helper protocol, so logs go to stderr
    let filter = if cli.verbose { "aibox=debug" } else { "aibox=info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let session = cli::Session::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Policy { command } => match command {
            PolicyCommands::Validate { paths } => cli::run_policy_validate(&session, &paths)?,
            PolicyCommands::Show { paths } => cli::run_policy_show(&session, &paths)?,
            PolicyCommands::Check { paths, command } => {
                cli::run_policy_check(&session, &paths, &command)?
            }
            PolicyCommands::Rules { paths, risk } => {
                cli::run_policy_rules(&session, &paths, risk)?
            }
        },
        Commands::Approvals { command } => match command {
            ApprovalCommands::List => cli::run_approvals_list(&session)?,
            ApprovalCommands::Cancel { id } => cli::run_approvals_cancel(&session, &id)?,
        },
        Commands::RemoteHelper { remote, url } => {
            tracing::debug!("Remote helper for {} ({})", remote, url);
            cli::run_remote_helper(&session, &remote, &url)?;
        }
    }

    Ok(())
}
