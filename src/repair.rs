//! The repair agent capability: hand an external coding agent a prompt
//! describing the broken gateway and let it edit the configuration.
//!
//! The agent never restarts the gateway itself; the orchestrator owns that.

use crate::config::RepairAgentConfig;
use crate::exec::{render_args, run_command, CommandError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// Diagnostics captured fresh before each fix attempt.
#[derive(Debug, Clone)]
pub struct FixContext {
    pub attempt: u32,
    pub max_attempts: u32,
    pub label: String,
    pub config_file: PathBuf,
    /// `Err` holds the validator's complaint.
    pub config_check: Result<(), String>,
    pub running: bool,
    pub crash_count: u32,
    /// `(log path, tail lines)` per context log.
    pub log_tails: Vec<(PathBuf, Vec<String>)>,
    /// Why the previous attempt in this run did not fix the gateway.
    pub previous_failure: Option<String>,
}

impl FixContext {
    /// Render the prompt handed to the repair agent.
    pub fn prompt(&self) -> String {
        let mut p = String::new();
        p.push_str(&format!(
            "The gateway service `{}` keeps crashing ({} crash signals in the detection window) \
             and a watchdog has asked you to repair it. This is attempt {} of {}.\n\n",
            self.label, self.crash_count, self.attempt, self.max_attempts
        ));

        p.push_str("## Current state\n\n");
        p.push_str(&format!(
            "- Process running: {}\n",
            if self.running { "yes" } else { "no" }
        ));
        p.push_str(&format!("- Config file: {}\n", self.config_file.display()));
        match &self.config_check {
            Ok(()) => p.push_str("- Config check: passes structural validation\n"),
            Err(reason) => p.push_str(&format!("- Config check: FAILS ({reason})\n")),
        }
        if let Some(prev) = &self.previous_failure {
            p.push_str(&format!("- Previous attempt failed: {prev}\n"));
        }
        p.push('\n');

        for (path, lines) in &self.log_tails {
            p.push_str(&format!("## Last {} lines of {}\n\n```\n", lines.len(), path.display()));
            for line in lines {
                p.push_str(line);
                p.push('\n');
            }
            p.push_str("```\n\n");
        }

        p.push_str(
            "## Rules\n\n\
             1. Diagnose the crash from the logs above and fix the root cause.\n\
             2. Make the smallest edit that fixes the problem.\n\
             3. Do not remove existing baseline configuration (channels, credentials, ports, plugins).\n\
             4. After editing, verify the config file is still well-formed and parses cleanly.\n\
             5. Do NOT restart, stop or kill the gateway service. The watchdog restarts it after you finish.\n\
             6. Finish with a one-paragraph summary of what you changed.\n",
        );
        p
    }
}

/// What the repair agent returned.
#[derive(Debug, Clone)]
pub struct FixResult {
    pub exit_code: Option<i32>,
    pub output: String,
}

impl FixResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Errors from invoking the repair agent.
#[derive(Debug)]
pub enum RepairError {
    Command(CommandError),
}

impl std::fmt::Display for RepairError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepairError::Command(e) => write!(f, "repair agent: {e}"),
        }
    }
}

impl std::error::Error for RepairError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RepairError::Command(e) => Some(e),
        }
    }
}

impl From<CommandError> for RepairError {
    fn from(e: CommandError) -> Self {
        RepairError::Command(e)
    }
}

/// Something that can propose a fix for a broken gateway.
#[async_trait]
pub trait RepairAgent: Send + Sync {
    fn name(&self) -> &str;

    async fn propose_fix(&self, context: &FixContext) -> Result<FixResult, RepairError>;
}

/// Repair agent driven through a coding-agent CLI.
pub struct CommandRepairAgent {
    config: RepairAgentConfig,
}

impl CommandRepairAgent {
    pub fn new(config: RepairAgentConfig) -> Self {
        Self { config }
    }

    /// Locate the agent on `PATH`; `None` means the capability is missing.
    pub fn detect(config: &RepairAgentConfig) -> Option<Self> {
        match which::which(&config.command) {
            Ok(path) => {
                tracing::debug!(path = %path.display(), "repair agent found");
                Some(Self::new(config.clone()))
            }
            Err(e) => {
                tracing::warn!(command = %config.command, error = %e, "repair agent not found");
                None
            }
        }
    }

    fn build_args(&self, prompt: &str) -> Vec<String> {
        let max_turns = self.config.max_turns.to_string();
        let tools = self.config.allowed_tools.join(",");
        render_args(
            &self.config.args,
            &[
                ("prompt", prompt),
                ("max_turns", max_turns.as_str()),
                ("allowed_tools", tools.as_str()),
            ],
        )
    }
}

#[async_trait]
impl RepairAgent for CommandRepairAgent {
    fn name(&self) -> &str {
        &self.config.command
    }

    async fn propose_fix(&self, context: &FixContext) -> Result<FixResult, RepairError> {
        let prompt = context.prompt();
        let args = self.build_args(&prompt);
        tracing::info!(
            command = %self.config.command,
            attempt = context.attempt,
            prompt_bytes = prompt.len(),
            timeout_secs = self.config.timeout_secs,
            "invoking repair agent"
        );
        let out = run_command(
            &self.config.command,
            &args,
            Duration::from_secs(self.config.timeout_secs),
        )
        .await?;
        tracing::info!(
            exit_code = ?out.exit_code,
            duration_secs = out.duration.as_secs(),
            "repair agent finished"
        );
        Ok(FixResult {
            exit_code: out.exit_code,
            output: out.output,
        })
    }
}
