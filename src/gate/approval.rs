//! Approval requests for staged pushes and their on-disk store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::git::GitTransport;
use super::protocol::Refspec;

/// Prefix of every staging ref
pub const STAGING_REF_PREFIX: &str = "refs/aibox/staging";

/// Timestamp layout used in staging refs and request IDs
pub const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval request not found: {0}")]
    NotFound(String),

    #[error("approval request {id} is {status}, only pending requests can be cancelled")]
    NotPending { id: String, status: ApprovalStatus },

    #[error("invalid approval request id: {0:?}")]
    InvalidId(String),

    #[error("approval store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed approval request {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// One staged push waiting on a reviewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub user: String,
    pub source_branch: String,
    pub target_branch: String,
    pub staging_ref: String,
    pub commit_range: String,
    pub remote_url: String,
    pub created_at: DateTime<Utc>,
    pub status: ApprovalStatus,
}

impl ApprovalRequest {
    /// New pending request for `refspec` staged at the ref derived from
    /// `user` and `created_at`
    pub fn pending(
        user: &str,
        refspec: &Refspec,
        commit_range: impl Into<String>,
        remote_url: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: request_id(user, created_at),
            user: user.to_string(),
            source_branch: refspec.src.clone(),
            target_branch: refspec.dst.clone(),
            staging_ref: staging_ref(user, created_at),
            commit_range: commit_range.into(),
            remote_url: remote_url.into(),
            created_at,
            status: ApprovalStatus::Pending,
        }
    }

    /// One-line summary for notifications and listings
    pub fn summary(&self) -> String {
        format!(
            "{} requests review: push {} to {} ({}), staged at {}",
            self.user, self.source_branch, self.target_branch, self.commit_range, self.staging_ref
        )
    }
}

/// Reduce a user name to something safe in a ref and a file name
pub fn ref_component(user: &str) -> String {
    let cleaned: String = user
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim_end_matches(".lock");
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned.to_string()
    }
}

/// `refs/aibox/staging/<user>/<YYYYMMDDHHMMSS>`
pub fn staging_ref(user: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}/{}/{}",
        STAGING_REF_PREFIX,
        ref_component(user),
        at.format(STAMP_FORMAT)
    )
}

pub fn request_id(user: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}", ref_component(user), at.format(STAMP_FORMAT))
}

/// Persistence for approval requests
pub trait ApprovalStore {
    fn get(&self, id: &str) -> Result<ApprovalRequest, ApprovalError>;
    fn put(&self, request: &ApprovalRequest) -> Result<(), ApprovalError>;
    fn delete(&self, id: &str) -> Result<(), ApprovalError>;
    /// All requests, oldest first
    fn list(&self) -> Result<Vec<ApprovalRequest>, ApprovalError>;

    fn contains(&self, id: &str) -> Result<bool, ApprovalError> {
        match self.get(id) {
            Ok(_) => Ok(true),
            Err(ApprovalError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// One JSON file per request under `<root>/<user>/`.
///
/// The user directory is created on the first write.
#[derive(Debug, Clone)]
pub struct FileApprovalStore {
    dir: PathBuf,
}

impl FileApprovalStore {
    pub fn new(root: impl AsRef<Path>, user: &str) -> Self {
        Self {
            dir: root.as_ref().join(ref_component(user)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, ApprovalError> {
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid {
            return Err(ApprovalError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    fn read(path: &Path) -> Result<ApprovalRequest, ApprovalError> {
        let content = fs::read_to_string(path).map_err(|source| ApprovalError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ApprovalError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl ApprovalStore for FileApprovalStore {
    fn get(&self, id: &str) -> Result<ApprovalRequest, ApprovalError> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Err(ApprovalError::NotFound(id.to_string()));
        }
        Self::read(&path)
    }

    fn put(&self, request: &ApprovalRequest) -> Result<(), ApprovalError> {
        let path = self.path_for(&request.id)?;
        let io_err = |source| ApprovalError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let content = serde_json::to_string_pretty(request).map_err(|source| ApprovalError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, content).map_err(io_err)
    }

    fn delete(&self, id: &str) -> Result<(), ApprovalError> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ApprovalError::NotFound(id.to_string()))
            }
            Err(source) => Err(ApprovalError::Io { path, source }),
        }
    }

    fn list(&self) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(|source| ApprovalError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut requests = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(request) => requests.push(request),
                Err(e) => tracing::warn!("Skipping unreadable approval request: {}", e),
            }
        }
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(requests)
    }
}

/// Withdraw a pending request.
///
/// The remote staging ref is removed best-effort; the stored request is
/// removed only after the status check passes.
pub fn cancel(
    store: &dyn ApprovalStore,
    git: &dyn GitTransport,
    id: &str,
) -> Result<ApprovalRequest, ApprovalError> {
    let request = store.get(id)?;
    if request.status != ApprovalStatus::Pending {
        return Err(ApprovalError::NotPending {
            id: id.to_string(),
            status: request.status,
        });
    }

    if let Err(e) = git.delete_remote_ref(&request.remote_url, &request.staging_ref) {
        tracing::warn!(
            "Could not delete staging ref {} on {}: {:#}",
            request.staging_ref,
            request.remote_url,
            e
        );
    }

    store.delete(id)?;
    tracing::info!("Cancelled approval request {}", id);
    Ok(request)
}
