//! Init-system primitives: query whether the gateway service is running and
//! ask the init system to restart it.

use crate::config::{SupervisorConfig, SupervisorKind};
use crate::exec::{run_command, CommandError};
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

/// What the init system reports about a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceStatus {
    pub running: bool,
    pub pid: Option<u32>,
}

/// Errors produced by supervisor operations.
#[derive(Debug)]
pub enum SupervisorError {
    Command(CommandError),
    /// The init system rejected the request.
    Failed { action: String, output: String },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Command(e) => write!(f, "{e}"),
            SupervisorError::Failed { action, output } => {
                write!(f, "{action} failed: {}", output.trim())
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Command(e) => Some(e),
            SupervisorError::Failed { .. } => None,
        }
    }
}

impl From<CommandError> for SupervisorError {
    fn from(e: CommandError) -> Self {
        SupervisorError::Command(e)
    }
}

/// Status and restart primitives of the process supervisor.
///
/// Both operations are expected to be idempotent: restarting a stopped
/// service starts it, querying never changes anything.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Backend name for logs (e.g. "launchctl").
    fn name(&self) -> &str;

    async fn status(&self, label: &str) -> Result<ServiceStatus, SupervisorError>;

    async fn restart(&self, label: &str) -> Result<(), SupervisorError>;
}

/// Build the supervisor backend selected by config.
pub fn from_config(config: &SupervisorConfig) -> Box<dyn Supervisor> {
    let timeout = Duration::from_secs(config.command_timeout_secs);
    let kind = match config.kind {
        SupervisorKind::Auto if cfg!(target_os = "macos") => SupervisorKind::Launchctl,
        SupervisorKind::Auto => SupervisorKind::Systemd,
        other => other,
    };
    match kind {
        SupervisorKind::Launchctl => Box::new(Launchctl::new(timeout)),
        _ => Box::new(Systemd::new(config.systemd_user, timeout)),
    }
}

/// launchd backend (`launchctl list` / `launchctl kickstart -k`).
pub struct Launchctl {
    timeout: Duration,
}

impl Launchctl {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Supervisor for Launchctl {
    fn name(&self) -> &str {
        "launchctl"
    }

    async fn status(&self, label: &str) -> Result<ServiceStatus, SupervisorError> {
        let out = run_command("launchctl", &["list".to_string(), label.to_string()], self.timeout)
            .await?;
        if !out.success() {
            // Not loaded at all.
            return Ok(ServiceStatus::default());
        }
        Ok(verify_pid(parse_launchctl_list(&out.output)))
    }

    async fn restart(&self, label: &str) -> Result<(), SupervisorError> {
        let uid = nix::unistd::getuid();
        let target = format!("gui/{uid}/{label}");
        let args = vec!["kickstart".to_string(), "-k".to_string(), target];
        let out = run_command("launchctl", &args, self.timeout).await?;
        if !out.success() {
            return Err(SupervisorError::Failed {
                action: format!("launchctl kickstart {label}"),
                output: out.output,
            });
        }
        tracing::info!(label, "launchctl kickstart issued");
        Ok(())
    }
}

/// systemd backend (`systemctl show` / `systemctl restart`).
pub struct Systemd {
    user: bool,
    timeout: Duration,
}

impl Systemd {
    pub fn new(user: bool, timeout: Duration) -> Self {
        Self { user, timeout }
    }

    fn args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = Vec::new();
        if self.user {
            args.push("--user".to_string());
        }
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }
}

#[async_trait]
impl Supervisor for Systemd {
    fn name(&self) -> &str {
        "systemd"
    }

    async fn status(&self, label: &str) -> Result<ServiceStatus, SupervisorError> {
        let args = self.args(&["show", label, "--property=ActiveState,MainPID"]);
        let out = run_command("systemctl", &args, self.timeout).await?;
        if !out.success() {
            return Ok(ServiceStatus::default());
        }
        Ok(verify_pid(parse_systemctl_show(&out.output)))
    }

    async fn restart(&self, label: &str) -> Result<(), SupervisorError> {
        let args = self.args(&["restart", label]);
        let out = run_command("systemctl", &args, self.timeout).await?;
        if !out.success() {
            return Err(SupervisorError::Failed {
                action: format!("systemctl restart {label}"),
                output: out.output,
            });
        }
        tracing::info!(label, "systemctl restart issued");
        Ok(())
    }
}

static LAUNCHCTL_PID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""PID"\s*=\s*(\d+)\s*;"#).unwrap());

/// Parse `launchctl list <label>` output. The job is running iff a PID is present.
fn parse_launchctl_list(output: &str) -> ServiceStatus {
    let pid = LAUNCHCTL_PID
        .captures(output)
        .and_then(|c| c[1].parse::<u32>().ok())
        .filter(|pid| *pid > 0);
    ServiceStatus {
        running: pid.is_some(),
        pid,
    }
}

/// Parse `systemctl show --property=ActiveState,MainPID` output.
fn parse_systemctl_show(output: &str) -> ServiceStatus {
    let mut active = false;
    let mut pid = None;
    for line in output.lines() {
        if let Some(state) = line.strip_prefix("ActiveState=") {
            active = matches!(state.trim(), "active" | "reloading" | "activating");
        } else if let Some(value) = line.strip_prefix("MainPID=") {
            pid = value.trim().parse::<u32>().ok().filter(|p| *p > 0);
        }
    }
    ServiceStatus {
        running: active && pid.is_some(),
        pid,
    }
}

/// Downgrade a reported PID that no longer exists in the process table.
fn verify_pid(status: ServiceStatus) -> ServiceStatus {
    match status.pid {
        Some(pid) if !pid_alive(pid) => {
            tracing::debug!(pid, "supervisor reported a pid that is not alive");
            ServiceStatus {
                running: false,
                pid: None,
            }
        }
        _ => status,
    }
}

/// Null-signal probe of a PID. EPERM still means the process exists.
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_launchctl_running() {
        let output = r#"{
	"StandardOutPath" = "/Users/ops/.openclaw/logs/gateway.log";
	"LimitLoadToSessionType" = "Aqua";
	"Label" = "ai.openclaw.gateway";
	"OnDemand" = false;
	"LastExitStatus" = 0;
	"PID" = 4821;
	"Program" = "/usr/local/bin/openclaw";
};"#;
        let status = parse_launchctl_list(output);
        assert!(status.running);
        assert_eq!(status.pid, Some(4821));
    }

    #[test]
    fn test_parse_launchctl_loaded_but_stopped() {
        let output = r#"{
	"Label" = "ai.openclaw.gateway";
	"LastExitStatus" = 256;
};"#;
        let status = parse_launchctl_list(output);
        assert!(!status.running);
        assert_eq!(status.pid, None);
    }

    #[test]
    fn test_parse_systemctl_active() {
        let status = parse_systemctl_show("ActiveState=active\nMainPID=913\n");
        assert!(status.running);
        assert_eq!(status.pid, Some(913));
    }

    #[test]
    fn test_parse_systemctl_failed() {
        let status = parse_systemctl_show("MainPID=0\nActiveState=failed\n");
        assert!(!status.running);
        assert_eq!(status.pid, None);
    }

    #[test]
    fn test_parse_systemctl_active_without_pid_is_not_running() {
        let status = parse_systemctl_show("ActiveState=active\nMainPID=0\n");
        assert!(!status.running);
    }

    #[test]
    fn test_pid_alive_for_self() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn test_verify_pid_drops_dead_pid() {
        // Spawn and reap a short-lived child so its PID is known to be gone.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let status = verify_pid(ServiceStatus {
            running: true,
            pid: Some(pid),
        });
        assert!(!status.running);
    }

    #[test]
    fn test_from_config_honours_explicit_kind() {
        let config = SupervisorConfig {
            kind: SupervisorKind::Launchctl,
            ..Default::default()
        };
        assert_eq!(from_config(&config).name(), "launchctl");

        let config = SupervisorConfig {
            kind: SupervisorKind::Systemd,
            ..Default::default()
        };
        assert_eq!(from_config(&config).name(), "systemd");
    }
}
