//! Guards the gateway's configuration file around a fix attempt: structural
//! validation, and a pre-attempt snapshot that can be restored atomically
//! when the repair agent leaves the file malformed.

use crate::config::ValidatorConfig;
use crate::exec::{render_args, run_command};
use crate::state::atomic_write;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Structural check over the gateway config file.
#[async_trait]
pub trait ConfigValidator: Send + Sync {
    /// `Err` carries a short human-readable reason, used in the next prompt.
    async fn validate(&self, path: &Path) -> Result<(), String>;
}

/// Checks that the file parses as JSON.
pub struct JsonValidator;

#[async_trait]
impl ConfigValidator for JsonValidator {
    async fn validate(&self, path: &Path) -> Result<(), String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        serde_json::from_str::<serde_json::Value>(&contents)
            .map(|_| ())
            .map_err(|e| format!("invalid JSON in {}: {e}", path.display()))
    }
}

/// Runs an external validator; exit code 0 means valid.
pub struct CommandValidator {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandValidator {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }
}

#[async_trait]
impl ConfigValidator for CommandValidator {
    async fn validate(&self, path: &Path) -> Result<(), String> {
        let Some((program, template)) = self.argv.split_first() else {
            return Err("validator command is empty".to_string());
        };
        let config = path.to_string_lossy();
        let args = render_args(template, &[("config", config.as_ref())]);
        match run_command(program, &args, self.timeout).await {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(format!(
                "{program} rejected the config (exit {:?}): {}",
                out.exit_code,
                last_lines(&out.output, 10)
            )),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Build the validator selected by config.
pub fn validator_from_config(config: &ValidatorConfig) -> Box<dyn ConfigValidator> {
    match &config.command {
        Some(argv) if !argv.is_empty() => Box::new(CommandValidator::new(
            argv.clone(),
            Duration::from_secs(config.timeout_secs.unwrap_or(30)),
        )),
        _ => Box::new(JsonValidator),
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

/// Errors from snapshotting or restoring the gateway config.
#[derive(Debug)]
pub enum GuardError {
    Snapshot {
        path: PathBuf,
        source: std::io::Error,
    },
    Restore {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for GuardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardError::Snapshot { path, source } => {
                write!(f, "failed to snapshot {}: {}", path.display(), source)
            }
            GuardError::Restore { path, source } => {
                write!(f, "failed to restore {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for GuardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GuardError::Snapshot { source, .. } => Some(source),
            GuardError::Restore { source, .. } => Some(source),
        }
    }
}

/// The config file's bytes as they were before a fix attempt.
#[derive(Debug)]
pub struct ConfigSnapshot {
    path: PathBuf,
    /// `None` when the file did not exist.
    contents: Option<Vec<u8>>,
}

impl ConfigSnapshot {
    pub fn take(path: &Path) -> Result<Self, GuardError> {
        let contents = match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(GuardError::Snapshot {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            contents,
        })
    }

    /// Whether the file on disk differs from the snapshot.
    pub fn changed(&self) -> bool {
        std::fs::read(&self.path).ok() != self.contents
    }

    /// Put the snapshot back, atomically. A file that did not exist is removed.
    pub fn restore(&self) -> Result<(), GuardError> {
        let result = match &self.contents {
            Some(bytes) => atomic_write(&self.path, bytes),
            None => match std::fs::remove_file(&self.path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        result.map_err(|e| GuardError::Restore {
            path: self.path.clone(),
            source: e,
        })?;
        tracing::info!(path = %self.path.display(), "restored config from pre-attempt snapshot");
        Ok(())
    }
}
