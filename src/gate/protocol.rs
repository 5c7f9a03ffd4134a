//! Line protocol spoken between git and a remote helper.
//!
//! Only the subset the gate needs: `capabilities` and `push <refspec>`.

use std::fmt;
use thiserror::Error;

/// Capabilities advertised in reply to `capabilities`
pub const CAPABILITIES: &[&str] = &["push"];

/// Errors that abort a helper session
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("push without a refspec")]
    MissingRefspec,

    #[error("malformed refspec (expected src:dst): {0}")]
    MalformedRefspec(String),

    #[error("transport stream error: {0}")]
    Io(#[from] std::io::Error),
}

/// One parsed input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperCommand {
    Capabilities,
    Push(Refspec),
    /// Blank line terminating a batch
    Blank,
}

impl HelperCommand {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(HelperCommand::Blank);
        }

        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "capabilities" => Ok(HelperCommand::Capabilities),
            "push" => {
                if rest.is_empty() {
                    return Err(ProtocolError::MissingRefspec);
                }
                Ok(HelperCommand::Push(Refspec::parse(rest)?))
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// `[+]src:dst`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refspec {
    pub force: bool,
    pub src: String,
    pub dst: String,
}

impl Refspec {
    /// Parse a refspec. A leading `+` marks a force push; the rest splits at
    /// the first `:`.
    pub fn parse(spec: &str) -> Result<Self, ProtocolError> {
        let (force, rest) = match spec.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };

        let (src, dst) = rest
            .split_once(':')
            .ok_or_else(|| ProtocolError::MalformedRefspec(spec.to_string()))?;

        if dst.is_empty() {
            return Err(ProtocolError::MalformedRefspec(spec.to_string()));
        }

        Ok(Self {
            force,
            src: src.to_string(),
            dst: dst.to_string(),
        })
    }

    /// Same source and force flag, different destination
    pub fn retarget(&self, dst: impl Into<String>) -> Self {
        Self {
            force: self.force,
            src: self.src.clone(),
            dst: dst.into(),
        }
    }

    /// An empty source deletes the destination ref
    pub fn is_delete(&self) -> bool {
        self.src.is_empty()
    }
}

impl fmt::Display for Refspec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.force {
            write!(f, "+")?;
        }
        write!(f, "{}:{}", self.src, self.dst)
    }
}

/// Per-ref result line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushReply {
    Ok(String),
    Error { dst: String, reason: String },
}

impl PushReply {
    pub fn error(dst: &str, reason: &str) -> Self {
        PushReply::Error {
            dst: dst.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, PushReply::Ok(_))
    }
}

impl fmt::Display for PushReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushReply::Ok(dst) => write!(f, "ok {}", dst),
            PushReply::Error { dst, reason } => write!(f, "error {} {}", dst, reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            HelperCommand::parse("capabilities\n").unwrap(),
            HelperCommand::Capabilities
        );
        assert_eq!(HelperCommand::parse("").unwrap(), HelperCommand::Blank);
        assert_eq!(
            HelperCommand::parse("push refs/heads/main:refs/heads/main").unwrap(),
            HelperCommand::Push(Refspec {
                force: false,
                src: "refs/heads/main".to_string(),
                dst: "refs/heads/main".to_string(),
            })
        );
    }

    #[test]
    fn test_unknown_command() {
        let err = HelperCommand::parse("fetch abc refs/heads/main").unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownCommand(c) if c == "fetch"));
        assert!(matches!(
            HelperCommand::parse("list for-push"),
            Err(ProtocolError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_refspec_force_and_split() {
        let spec = Refspec::parse("+feature:refs/heads/a:b").unwrap();
        assert!(spec.force);
        assert_eq!(spec.src, "feature");
        assert_eq!(spec.dst, "refs/heads/a:b");
        assert_eq!(spec.to_string(), "+feature:refs/heads/a:b");
    }

    #[test]
    fn test_refspec_errors() {
        assert!(matches!(
            Refspec::parse("main"),
            Err(ProtocolError::MalformedRefspec(_))
        ));
        assert!(matches!(
            Refspec::parse("main:"),
            Err(ProtocolError::MalformedRefspec(_))
        ));
        assert!(matches!(
            HelperCommand::parse("push"),
            Err(ProtocolError::MissingRefspec)
        ));
    }

    #[test]
    fn test_delete_refspec() {
        let spec = Refspec::parse(":refs/heads/old").unwrap();
        assert!(spec.is_delete());
    }

    #[test]
    fn test_reply_format() {
        assert_eq!(PushReply::Ok("main".to_string()).to_string(), "ok main");
        assert_eq!(
            PushReply::error("main", "push failed").to_string(),
            "error main push failed"
        );
    }
}
