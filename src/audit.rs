//! Append-only audit trail of gate decisions
//!
//! Provides a buffered JSON Lines log with:
//! - Non-blocking `log()` (entries are buffered in memory)
//! - Periodic background flush plus explicit `flush()`
//! - Fallback to a user-writable directory when the configured one is not
//! - A terminal `Closed` state where `log()` fails instead of dropping entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

use crate::policy::classifier::Verdict;
use crate::policy::RiskClass;

/// Log file name inside the audit directory
pub const LOG_FILE_NAME: &str = "decisions.jsonl";

/// Default interval between background flushes
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Outcome of a gate decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Allow => write!(f, "allow"),
            Decision::Deny => write!(f, "deny"),
        }
    }
}

/// One immutable row of the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub timestamp: DateTime<Utc>,
    /// Version hash of the effective policy used
    pub policy_ver: String,
    /// What was gated, e.g. `git.push`, `tool.exec`, `container.start`
    pub action: String,
    pub user: String,
    pub workspace: String,
    pub sandbox_id: String,
    pub decision: Decision,
    pub risk_class: RiskClass,
    pub rule: String,
    pub reason: String,
}

impl DecisionEntry {
    /// Build an entry from a classifier verdict, stamped with the current time
    pub fn from_verdict(
        action: impl Into<String>,
        context: &DecisionContext,
        policy_ver: impl Into<String>,
        verdict: &Verdict,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            policy_ver: policy_ver.into(),
            action: action.into(),
            user: context.user.clone(),
            workspace: context.workspace.clone(),
            sandbox_id: context.sandbox_id.clone(),
            decision: if verdict.is_refused() {
                Decision::Deny
            } else {
                Decision::Allow
            },
            risk_class: verdict.risk,
            rule: verdict.rule.clone(),
            reason: verdict.reason.clone(),
        }
    }

    fn validate(&self) -> Result<(), AuditError> {
        if self.timestamp.timestamp() <= 0 {
            return Err(AuditError::InvalidEntry("timestamp is not set"));
        }
        if self.action.trim().is_empty() {
            return Err(AuditError::InvalidEntry("action is empty"));
        }
        if self.user.trim().is_empty() {
            return Err(AuditError::InvalidEntry("user is empty"));
        }
        Ok(())
    }
}

/// Who and where a decision was made for, supplied by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionContext {
    pub user: String,
    pub workspace: String,
    pub sandbox_id: String,
}

impl DecisionContext {
    pub fn new(user: impl Into<String>, workspace: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            workspace: workspace.into(),
            sandbox_id: String::new(),
        }
    }

    pub fn with_sandbox(mut self, sandbox_id: impl Into<String>) -> Self {
        self.sandbox_id = sandbox_id.into();
        self
    }
}

/// Errors from the decision log
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("decision log is closed")]
    Closed,

    #[error("decision log unavailable; no writable audit directory")]
    Unavailable,

    #[error("invalid decision entry: {0}")]
    InvalidEntry(&'static str),

    #[error("no writable audit directory (tried {})", .0.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    NoWritableDir(Vec<PathBuf>),

    #[error("failed to write decision log: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode decision entry: {0}")]
    Encode(#[from] serde_json::Error),
}

struct LogState {
    buffer: Vec<DecisionEntry>,
    closed: bool,
    /// Opened without a file; every `log()` reports `Unavailable`
    unavailable: bool,
}

/// Buffer and file sit behind separate locks so a slow write or fsync
/// never holds up `log()`
struct Shared {
    state: Mutex<LogState>,
    file: Mutex<Option<File>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        lock(&self.state)
    }

    fn flush(&self) -> Result<usize, AuditError> {
        // Held for the whole write so batches land in order
        let mut file = lock(&self.file);

        let pending = std::mem::take(&mut self.lock().buffer);
        if pending.is_empty() {
            return Ok(0);
        }

        let result = match file.as_mut() {
            Some(file) => write_batch(file, &pending),
            None => Err(AuditError::Io(std::io::Error::other(
                "log file handle released",
            ))),
        };

        match result {
            Ok(()) => Ok(pending.len()),
            Err(e) => {
                // Retry on the next flush, ahead of anything logged meanwhile
                let mut state = self.lock();
                let newer = std::mem::replace(&mut state.buffer, pending);
                state.buffer.extend(newer);
                Err(e)
            }
        }
    }
}

/// Append one batch. On failure the file is cut back to its previous length
/// so a retry never leaves a torn or duplicated line behind.
fn write_batch(file: &mut File, entries: &[DecisionEntry]) -> Result<(), AuditError> {
    let mut payload = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut payload, entry)?;
        payload.push(b'\n');
    }

    let before = file.metadata()?.len();
    if let Err(e) = file.write_all(&payload).and_then(|_| file.sync_data()) {
        if let Err(truncate) = file.set_len(before) {
            tracing::warn!(
                "Could not roll back partial decision log write: {}",
                truncate
            );
        }
        return Err(AuditError::Io(e));
    }
    Ok(())
}

/// Buffered, append-only decision log shared by every gate in a host process
pub struct DecisionLog {
    shared: Arc<Shared>,
    path: PathBuf,
    stop_tx: Mutex<Option<Sender<()>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl DecisionLog {
    /// Open the log in `dir`, falling back to user-writable locations.
    ///
    /// Starts a background thread that flushes every `flush_interval`.
    pub fn open(dir: &Path, flush_interval: Duration) -> Result<Self, AuditError> {
        let (path, file) = open_with_fallback(dir)?;
        tracing::debug!("Decision log opened at {}", path.display());

        let shared = Arc::new(Shared {
            state: Mutex::new(LogState {
                buffer: Vec::new(),
                closed: false,
                unavailable: false,
            }),
            file: Mutex::new(Some(file)),
        });

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let worker = Arc::clone(&shared);
        let flusher = std::thread::Builder::new()
            .name("aibox-audit-flush".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(flush_interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = worker.flush() {
                            tracing::warn!("Periodic decision log flush failed: {}", e);
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Self {
            shared,
            path,
            stop_tx: Mutex::new(Some(stop_tx)),
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Log that records nothing, for when no directory is writable.
    ///
    /// Every `log()` returns `AuditError::Unavailable` so callers keep
    /// warning while the audited actions proceed.
    pub fn unavailable(dir: &Path) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LogState {
                    buffer: Vec::new(),
                    closed: false,
                    unavailable: true,
                }),
                file: Mutex::new(None),
            }),
            path: dir.join(LOG_FILE_NAME),
            stop_tx: Mutex::new(None),
            flusher: Mutex::new(None),
        }
    }

    /// Path of the log file actually in use
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffer an entry. Never performs I/O.
    ///
    /// Callers treat an error as a warning; the audited action proceeds.
    pub fn log(&self, entry: DecisionEntry) -> Result<(), AuditError> {
        entry.validate()?;
        let mut state = self.shared.lock();
        if state.closed {
            return Err(AuditError::Closed);
        }
        if state.unavailable {
            return Err(AuditError::Unavailable);
        }
        state.buffer.push(entry);
        Ok(())
    }

    /// Write all buffered entries and sync them to disk
    pub fn flush(&self) -> Result<(), AuditError> {
        let written = self.shared.flush()?;
        if written > 0 {
            tracing::trace!("Flushed {} decision entries", written);
        }
        Ok(())
    }

    /// Stop the flush timer, flush what is left and release the file.
    ///
    /// Idempotent; later `log()` calls return `AuditError::Closed`.
    pub fn close(&self) -> Result<(), AuditError> {
        if let Some(tx) = lock(&self.stop_tx).take() {
            let _ = tx.send(());
        }
        if let Some(handle) = lock(&self.flusher).take() {
            if handle.join().is_err() {
                tracing::warn!("Decision log flush thread panicked");
            }
        }

        let result = self.shared.flush();

        {
            let mut state = self.shared.lock();
            if state.closed {
                return result.map(|_| ());
            }
            state.closed = true;
            if !state.buffer.is_empty() {
                tracing::warn!(
                    "{} decision entries could not be written before close",
                    state.buffer.len()
                );
            }
        }
        *lock(&self.shared.file) = None;
        result.map(|_| ())
    }

    /// Whether `close()` has run
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Read every entry from a log file
    pub fn read_all(path: &Path) -> Result<Vec<DecisionEntry>, AuditError> {
        let file = File::open(path)?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

impl Drop for DecisionLog {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close decision log: {}", e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Candidate directories, configured one first
fn fallback_dirs(configured: &Path) -> Vec<PathBuf> {
    let mut dirs_to_try = vec![configured.to_path_buf()];
    if let Some(data) = dirs::data_local_dir() {
        dirs_to_try.push(data.join("aibox").join("audit"));
    }
    dirs_to_try.push(std::env::temp_dir().join("aibox-audit"));
    dirs_to_try.dedup();
    dirs_to_try
}

fn open_with_fallback(configured: &Path) -> Result<(PathBuf, File), AuditError> {
    let candidates = fallback_dirs(configured);
    for (i, dir) in candidates.iter().enumerate() {
        let path = dir.join(LOG_FILE_NAME);
        let opened = std::fs::create_dir_all(dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));
        match opened {
            Ok(file) => {
                if i > 0 {
                    tracing::warn!(
                        "Audit directory {} is not writable; logging decisions to {}",
                        configured.display(),
                        path.display()
                    );
                }
                return Ok((path, file));
            }
            Err(e) => {
                tracing::debug!("Cannot open decision log in {}: {}", dir.display(), e);
            }
        }
    }
    Err(AuditError::NoWritableDir(candidates))
}
