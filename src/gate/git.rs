//! Git transport used by the push gate

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::{Command, Output};

use super::protocol::Refspec;

/// Operations the gate needs from git
pub trait GitTransport {
    /// Push `refspec` to the remote at `remote_url`
    fn push(&self, remote_url: &str, refspec: &Refspec) -> Result<()>;

    /// Delete `refname` on the remote
    fn delete_remote_ref(&self, remote_url: &str, refname: &str) -> Result<()>;

    /// Describe the commits `refspec` would add on top of the remote's
    /// current destination, e.g. `1a2b3c4..5d6e7f8 (3 commits)`
    fn commit_range(&self, remote_name: &str, refspec: &Refspec) -> Result<String>;
}

/// `GitTransport` backed by the `git` executable.
///
/// When run as a remote helper, git exports `GIT_DIR` so the child
/// processes operate on the pushing repository.
pub struct GitCli {
    working_dir: Option<PathBuf>,
}

impl GitCli {
    pub fn new(working_dir: Option<PathBuf>) -> Self {
        Self { working_dir }
    }

    fn git(&self, args: &[&str]) -> Result<Output> {
        let mut command = Command::new("git");
        command.args(args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
            .output()
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    fn git_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(anyhow::anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }

    fn short_rev(&self, rev: &str) -> Result<String> {
        self.git_ok(&["rev-parse", "--short", "--verify", "--quiet", rev])
    }
}

impl GitTransport for GitCli {
    fn push(&self, remote_url: &str, refspec: &Refspec) -> Result<()> {
        let spec = refspec.to_string();
        // Hooks already ran for the outer push
        self.git_ok(&["push", "--no-verify", remote_url, &spec])?;
        Ok(())
    }

    fn delete_remote_ref(&self, remote_url: &str, refname: &str) -> Result<()> {
        self.git_ok(&["push", "--no-verify", remote_url, "--delete", refname])?;
        Ok(())
    }

    fn commit_range(&self, remote_name: &str, refspec: &Refspec) -> Result<String> {
        let tip = self.short_rev(&refspec.src)?;

        let branch = refspec
            .dst
            .strip_prefix("refs/heads/")
            .unwrap_or(&refspec.dst);
        let tracking = format!("refs/remotes/{}/{}", remote_name, branch);
        let Ok(base) = self.short_rev(&tracking) else {
            return Ok(tip);
        };

        let range = format!("{}..{}", base, tip);
        let count = self.git_ok(&["rev-list", "--count", &range])?;
        Ok(format!("{} ({} commits)", range, count))
    }
}
