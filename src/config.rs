use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from `config.toml`.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct WatchdogConfig {
    pub gateway: GatewayConfig,
    pub supervisor: SupervisorConfig,
    pub crash: CrashConfig,
    pub remediation: RemediationConfig,
    pub repair_agent: RepairAgentConfig,
    pub validator: ValidatorConfig,
    pub notify: NotifyConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Service label known to the init system.
    pub label: String,
    pub health_port: u16,
    pub health_path: String,
    pub health_timeout_secs: u64,
    /// The gateway's own configuration file, edited by the repair agent.
    pub config_file: PathBuf,
    /// Glob patterns of error logs scanned for crash signatures.
    pub error_logs: Vec<String>,
    /// Glob patterns of logs whose tails are handed to the repair agent.
    pub context_logs: Vec<String>,
    /// Lines read from the end of each error log when counting crashes.
    pub tail_lines: usize,
    /// Lines per log included in the repair prompt.
    pub context_lines: usize,
}

/// Which init system owns the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorKind {
    Auto,
    Launchctl,
    Systemd,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub kind: SupervisorKind,
    /// Use `systemctl --user` rather than the system manager.
    pub systemd_user: bool,
    pub command_timeout_secs: u64,
    /// Delay between a restart and the liveness re-check.
    pub stabilize_secs: u64,
    /// Also require the health endpoint to answer after a restart.
    pub verify_health: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CrashConfig {
    pub threshold: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemediationConfig {
    pub max_fix_attempts: u32,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RepairAgentConfig {
    pub command: String,
    /// Argument template; `{prompt}`, `{max_turns}` and `{allowed_tools}` are substituted.
    pub args: Vec<String>,
    pub max_turns: u32,
    pub allowed_tools: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ValidatorConfig {
    /// External validator command; `{config}` is replaced by the config path.
    /// When unset the config file is checked for well-formed JSON.
    pub command: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyKind {
    None,
    Command,
    Webhook,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub kind: NotifyKind,
    /// Recipient handed to the channel. Notifications are skipped when unset.
    pub target: Option<String>,
    pub command: String,
    /// Argument template; `{target}` and `{message}` are substituted.
    pub args: Vec<String>,
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Holds the state file and the run lock.
    pub data_dir: PathBuf,
}

// --- Default implementations ---

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            label: "ai.openclaw.gateway".to_string(),
            health_port: 18789,
            health_path: "/health".to_string(),
            health_timeout_secs: 5,
            config_file: PathBuf::from("~/.openclaw/openclaw.json"),
            error_logs: vec!["~/.openclaw/logs/gateway.err.log".to_string()],
            context_logs: vec![
                "~/.openclaw/logs/gateway.err.log".to_string(),
                "~/.openclaw/logs/gateway.log".to_string(),
            ],
            tail_lines: 200,
            context_lines: 40,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            kind: SupervisorKind::Auto,
            systemd_user: true,
            command_timeout_secs: 30,
            stabilize_secs: 10,
            verify_health: false,
        }
    }
}

impl Default for CrashConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            window_secs: 300,
        }
    }
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            max_fix_attempts: 2,
            cooldown_secs: 600,
        }
    }
}

impl Default for RepairAgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                "{prompt}".to_string(),
                "--max-turns".to_string(),
                "{max_turns}".to_string(),
                "--allowedTools".to_string(),
                "{allowed_tools}".to_string(),
            ],
            max_turns: 15,
            allowed_tools: vec![
                "Read".to_string(),
                "Write".to_string(),
                "Edit".to_string(),
                "Bash".to_string(),
            ],
            timeout_secs: 300,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            kind: NotifyKind::Command,
            target: None,
            command: "openclaw".to_string(),
            args: vec![
                "message".to_string(),
                "send".to_string(),
                "--target".to_string(),
                "{target}".to_string(),
                "--message".to_string(),
                "{message}".to_string(),
            ],
            webhook_url: None,
            timeout_secs: 15,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.gateway-watchdog"),
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Env {
        name: String,
        value: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Env { name, value } => {
                write!(f, "invalid value for {name}: {value:?}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Env { .. } => None,
        }
    }
}

impl WatchdogConfig {
    /// Load the config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Apply `WATCHDOG_*` overrides using the given variable lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, value: String) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::Env {
                name: name.to_string(),
                value,
            })
        }

        if let Some(v) = lookup("WATCHDOG_CRASH_THRESHOLD") {
            self.crash.threshold = parse("WATCHDOG_CRASH_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("WATCHDOG_WINDOW_SECONDS") {
            self.crash.window_secs = parse("WATCHDOG_WINDOW_SECONDS", v)?;
        }
        if let Some(v) = lookup("WATCHDOG_MAX_FIX_ATTEMPTS") {
            self.remediation.max_fix_attempts = parse("WATCHDOG_MAX_FIX_ATTEMPTS", v)?;
        }
        if let Some(v) = lookup("WATCHDOG_REPAIR_TIMEOUT_SECONDS") {
            self.repair_agent.timeout_secs = parse("WATCHDOG_REPAIR_TIMEOUT_SECONDS", v)?;
        }
        if let Some(v) = lookup("WATCHDOG_COOLDOWN_SECONDS") {
            self.remediation.cooldown_secs = parse("WATCHDOG_COOLDOWN_SECONDS", v)?;
        }
        if let Some(v) = lookup("WATCHDOG_NOTIFY_TARGET") {
            let v = v.trim().to_string();
            self.notify.target = if v.is_empty() { None } else { Some(v) };
        }
        Ok(())
    }

    /// Expand `~` in every configured path against `home`.
    pub fn expand_paths(&mut self, home: &Path) {
        self.gateway.config_file = expand_home(&self.gateway.config_file, home);
        self.storage.data_dir = expand_home(&self.storage.data_dir, home);
        for pattern in self
            .gateway
            .error_logs
            .iter_mut()
            .chain(self.gateway.context_logs.iter_mut())
        {
            *pattern = expand_home(Path::new(pattern.as_str()), home)
                .to_string_lossy()
                .into_owned();
        }
    }
}

/// Replace a leading `~` component with `home`.
pub fn expand_home(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// The invoking user's home directory, or `.` when `$HOME` is unset.
pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
