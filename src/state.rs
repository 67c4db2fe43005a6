//! Persisted watchdog state: the outcome of the last remediation and the
//! cooldown ledger that keeps consecutive runs from double-triggering a fix.
//!
//! Written atomically (temp file in the same directory, then rename) and
//! guarded by an advisory lock held for the whole check-cooldown-to-write
//! span of a remediation.

use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Outcome recorded by the last remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixStatus {
    Ok,
    Failed,
    NoRepairAgent,
}

impl std::fmt::Display for FixStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FixStatus::Ok => "ok",
            FixStatus::Failed => "failed",
            FixStatus::NoRepairAgent => "no-repair-agent",
        };
        f.write_str(s)
    }
}

/// The JSON payload of the state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogState {
    pub last_fix_epoch: i64,
    pub status: FixStatus,
    pub message: String,
    /// ISO-8601 rendering of `last_fix_epoch`.
    pub timestamp: String,
}

impl WatchdogState {
    pub fn new(status: FixStatus, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            last_fix_epoch: now.timestamp(),
            status,
            message: message.into(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Time left before another remediation may start. Absent state means none.
pub fn cooldown_remaining(
    state: Option<&WatchdogState>,
    cooldown_secs: u64,
    now: DateTime<Utc>,
) -> Duration {
    let Some(state) = state else {
        return Duration::ZERO;
    };
    let elapsed = now.timestamp().saturating_sub(state.last_fix_epoch).max(0) as u64;
    Duration::from_secs(cooldown_secs.saturating_sub(elapsed))
}

/// Errors from reading, writing or locking the state file.
#[derive(Debug)]
pub enum StateError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::Read { path, source } => {
                write!(f, "failed to read state file {}: {}", path.display(), source)
            }
            StateError::Corrupt { path, source } => {
                write!(f, "state file {} is not valid JSON: {}", path.display(), source)
            }
            StateError::Serialize { source } => {
                write!(f, "failed to serialize state: {}", source)
            }
            StateError::Write { path, source } => {
                write!(f, "failed to write state file {}: {}", path.display(), source)
            }
            StateError::Lock { path, source } => {
                write!(f, "failed to lock {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StateError::Read { source, .. } => Some(source),
            StateError::Corrupt { source, .. } => Some(source),
            StateError::Serialize { source } => Some(source),
            StateError::Write { source, .. } => Some(source),
            StateError::Lock { source, .. } => Some(source),
        }
    }
}

/// Reads and atomically replaces the state file.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state, `None` if no remediation has ever been recorded.
    pub fn load(&self) -> Result<Option<WatchdogState>, StateError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| StateError::Corrupt {
                path: self.path.clone(),
                source: e,
            })
    }

    /// Overwrite the state file wholesale.
    pub fn save(&self, state: &WatchdogState) -> Result<(), StateError> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::Serialize { source: e })?;
        atomic_write(&self.path, json.as_bytes()).map_err(|e| StateError::Write {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Remove the state file, clearing any cooldown. Missing is fine.
    pub fn clear(&self) -> Result<bool, StateError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::Write {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}

/// Replace `path` with `bytes` so readers never observe a partial write.
///
/// The temp file lives in the destination directory so the final rename
/// stays on one filesystem.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    if let Ok(meta) = std::fs::metadata(path) {
        // Keep the original permissions on replace.
        if let Err(e) = tmp.as_file().set_permissions(meta.permissions()) {
            tracing::debug!(path = %path.display(), error = %e, "could not copy permissions");
        }
    }
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Exclusive advisory lock on the run lock file, released on drop.
#[derive(Debug)]
pub struct StateLock {
    file: std::fs::File,
    path: PathBuf,
}

impl StateLock {
    /// Try to take the lock without blocking. `Ok(None)` means another run holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<StateLock>, StateError> {
        let lock_err = |e: std::io::Error| StateError::Lock {
            path: path.to_path_buf(),
            source: e,
        };
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(lock_err)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(lock_err)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "acquired run lock");
                Ok(Some(StateLock {
                    file,
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(lock_err(e)),
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}
