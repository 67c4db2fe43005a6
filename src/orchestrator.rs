//! The remediation state machine run once per scheduler tick.
//!
//! ```text
//! HEALTHY ──► exit 0
//!   │ not running or not healthy
//!   ▼
//! count crashes ──► BELOW_THRESHOLD ──► exit 0
//!   │ count >= threshold
//!   ▼
//! lock ──► BUSY ──► exit 0
//!   ▼
//! cooldown ──► IN_COOLDOWN ──► exit 0
//!   ▼
//! repair agent? ──► NO_REPAIR_AGENT ──► persist, notify, exit 1
//!   ▼
//! FIXING (1..=max_fix_attempts) ──► FIXED ──► persist, notify, exit 0
//!                               └─► EXHAUSTED ──► persist, notify, exit 1
//! ```

use crate::config::WatchdogConfig;
use crate::crash::{crash_window, tail_logs, CrashWindow};
use crate::data_dir::DataDir;
use crate::guard::{ConfigSnapshot, ConfigValidator};
use crate::notify::Notifier;
use crate::probe::LivenessProbe;
use crate::repair::{FixContext, RepairAgent};
use crate::restart::{restart_and_verify, RestartPolicy};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::state::{cooldown_remaining, FixStatus, StateLock, StateStore, WatchdogState};
use crate::supervisor::Supervisor;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for one run, resolved from config.
#[derive(Debug, Clone)]
pub struct RemediationSettings {
    pub label: String,
    pub crash_threshold: u32,
    pub window_secs: u64,
    pub max_fix_attempts: u32,
    pub cooldown_secs: u64,
    pub restart: RestartPolicy,
    pub config_file: PathBuf,
    pub error_logs: Vec<String>,
    pub context_logs: Vec<String>,
    pub tail_lines: usize,
    pub context_lines: usize,
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
}

impl RemediationSettings {
    pub fn from_config(config: &WatchdogConfig, data_dir: &DataDir) -> Self {
        Self {
            label: config.gateway.label.clone(),
            crash_threshold: config.crash.threshold,
            window_secs: config.crash.window_secs,
            max_fix_attempts: config.remediation.max_fix_attempts,
            cooldown_secs: config.remediation.cooldown_secs,
            restart: RestartPolicy {
                stabilize: Duration::from_secs(config.supervisor.stabilize_secs),
                verify_health: config.supervisor.verify_health,
            },
            config_file: config.gateway.config_file.clone(),
            error_logs: config.gateway.error_logs.clone(),
            context_logs: config.gateway.context_logs.clone(),
            tail_lines: config.gateway.tail_lines,
            context_lines: config.gateway.context_lines,
            state_file: data_dir.state(),
            lock_file: data_dir.lock(),
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Healthy,
    BelowThreshold { count: u32 },
    /// Another run holds the remediation lock.
    Busy,
    InCooldown { remaining: Duration },
    NoRepairAgent,
    Fixed { attempts: u32 },
    Exhausted { attempts: u32 },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::NoRepairAgent | RunOutcome::Exhausted { .. } => 1,
            _ => 0,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Healthy => write!(f, "healthy"),
            RunOutcome::BelowThreshold { count } => write!(f, "below threshold ({count} crashes)"),
            RunOutcome::Busy => write!(f, "another run is remediating"),
            RunOutcome::InCooldown { remaining } => {
                write!(f, "in cooldown ({}s remaining)", remaining.as_secs())
            }
            RunOutcome::NoRepairAgent => write!(f, "no repair agent available"),
            RunOutcome::Fixed { attempts } => write!(f, "fixed after {attempts} attempt(s)"),
            RunOutcome::Exhausted { attempts } => {
                write!(f, "not fixed after {attempts} attempt(s)")
            }
        }
    }
}

/// One cycle of diagnose, edit, validate, restart. Lives only for the run.
#[derive(Debug, Clone)]
pub struct FixAttempt {
    pub attempt_number: u32,
    pub prompt: String,
    pub raw_output: String,
    pub config_valid: bool,
    pub restart_succeeded: bool,
    /// Why the attempt did not fix the gateway, fed into the next prompt.
    pub failure: Option<String>,
}

/// Read-only view of what a run would decide, for `check`.
#[derive(Debug, Clone)]
pub struct Assessment {
    pub running: bool,
    pub healthy: bool,
    pub window: Option<CrashWindow>,
    pub last_state: Option<WatchdogState>,
    pub cooldown: Duration,
    pub repair_available: bool,
}

impl Assessment {
    /// The state the orchestrator would end in, short of actually fixing.
    pub fn decision(&self) -> &'static str {
        if self.running && self.healthy {
            return "HEALTHY";
        }
        match self.window {
            Some(w) if !w.exceeded() => "BELOW_THRESHOLD",
            _ if !self.cooldown.is_zero() => "IN_COOLDOWN",
            _ if !self.repair_available => "NO_REPAIR_AGENT",
            _ => "FIXING",
        }
    }
}

/// Drives one watchdog run against its collaborators.
pub struct Orchestrator<'a> {
    settings: RemediationSettings,
    /// Wall clock read when the outcome is persisted.
    clock: Box<dyn Fn() -> DateTime<Utc> + Send + Sync + 'a>,
    probe: &'a dyn LivenessProbe,
    supervisor: &'a dyn Supervisor,
    repair: Option<&'a dyn RepairAgent>,
    validator: &'a dyn ConfigValidator,
    notifier: &'a dyn Notifier,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        settings: RemediationSettings,
        probe: &'a dyn LivenessProbe,
        supervisor: &'a dyn Supervisor,
        repair: Option<&'a dyn RepairAgent>,
        validator: &'a dyn ConfigValidator,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            settings,
            clock: Box::new(Utc::now),
            probe,
            supervisor,
            repair,
            validator,
            notifier,
        }
    }

    fn store(&self) -> StateStore {
        StateStore::new(&self.settings.state_file)
    }

    /// Replace the clock used to stamp persisted outcomes.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'a) -> Self {
        self.clock = Box::new(clock);
        self
    }

    fn load_state(&self) -> Option<WatchdogState> {
        match self.store().load() {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable watchdog state");
                None
            }
        }
    }

    fn measure(&self, running: bool, now: DateTime<Utc>) -> CrashWindow {
        let lines = tail_logs(&self.settings.error_logs, self.settings.tail_lines);
        crash_window(
            &lines,
            running,
            now,
            self.settings.crash_threshold,
            self.settings.window_secs,
        )
    }

    /// Everything `run` would look at, without locking, writing or notifying.
    pub async fn assess(&self, now: DateTime<Utc>) -> Assessment {
        let running = self.probe.is_running().await;
        let healthy = running && self.probe.is_healthy().await;
        let window = (!(running && healthy)).then(|| self.measure(running, now));
        let last_state = self.load_state();
        let cooldown = cooldown_remaining(last_state.as_ref(), self.settings.cooldown_secs, now);
        Assessment {
            running,
            healthy,
            window,
            last_state,
            cooldown,
            repair_available: self.repair.is_some(),
        }
    }

    /// Run the state machine once. `now` anchors crash counting and the
    /// cooldown check; the persisted outcome is stamped when it is written.
    pub async fn run(&self, now: DateTime<Utc>) -> RunOutcome {
        let label = &self.settings.label;

        let running = self.probe.is_running().await;
        if running && self.probe.is_healthy().await {
            tracing::debug!(label = %label, "gateway healthy");
            return RunOutcome::Healthy;
        }

        let window = self.measure(running, now);
        tracing::info!(
            label = %label,
            running,
            crashes = window.observed_count,
            threshold = window.threshold,
            window_secs = window.window_secs,
            "gateway unhealthy"
        );
        if !window.exceeded() {
            return RunOutcome::BelowThreshold {
                count: window.observed_count,
            };
        }

        let _lock = match StateLock::try_acquire(&self.settings.lock_file) {
            Ok(Some(lock)) => Some(lock),
            Ok(None) => {
                tracing::info!("another watchdog run holds the remediation lock");
                return RunOutcome::Busy;
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "could not take remediation lock, continuing without it"
                );
                None
            }
        };

        let last_state = self.load_state();
        let remaining = cooldown_remaining(last_state.as_ref(), self.settings.cooldown_secs, now);
        if !remaining.is_zero() {
            tracing::info!(remaining_secs = remaining.as_secs(), "in cooldown, not fixing");
            return RunOutcome::InCooldown { remaining };
        }

        let Some(repair) = self.repair else {
            let message = format!(
                "Gateway {label} crashed {} times in {}s but no repair agent is available. Manual intervention needed.",
                window.observed_count, window.window_secs
            );
            tracing::error!("{message}");
            self.record(FixStatus::NoRepairAgent, &message);
            self.notifier.notify(&message).await;
            return RunOutcome::NoRepairAgent;
        };

        self.notifier
            .notify(&format!(
                "Gateway {label} crashed {} times in {}s. Starting automatic repair (up to {} attempts).",
                window.observed_count, window.window_secs, self.settings.max_fix_attempts
            ))
            .await;

        self.fix_loop(repair, window).await
    }

    async fn fix_loop(&self, repair: &dyn RepairAgent, window: CrashWindow) -> RunOutcome {
        let label = &self.settings.label;
        let mut policy = RetryPolicy::new(self.settings.max_fix_attempts);
        let mut next = policy.first();
        let mut previous_failure: Option<String> = None;

        while let Some(number) = next {
            let outcome = self
                .attempt(repair, number, window, previous_failure.take())
                .await;
            tracing::debug!(
                attempt = outcome.attempt_number,
                prompt_bytes = outcome.prompt.len(),
                config_valid = outcome.config_valid,
                restart_succeeded = outcome.restart_succeeded,
                agent_output = %outcome.raw_output.trim(),
                "fix attempt finished"
            );
            previous_failure = outcome
                .failure
                .as_ref()
                .map(|reason| format!("attempt {number} failed: {reason}"));
            next = match policy.evaluate(outcome.config_valid, outcome.restart_succeeded) {
                RetryDecision::Fixed => {
                    let message =
                        format!("Gateway {label} repaired and restarted on attempt {number}.");
                    tracing::info!(attempt = number, "gateway fixed");
                    self.record(FixStatus::Ok, &message);
                    self.notifier.notify(&message).await;
                    return RunOutcome::Fixed { attempts: number };
                }
                RetryDecision::Retry { attempt } => Some(attempt),
                RetryDecision::Exhausted => None,
            };
        }

        let attempts = policy.current_attempt();
        let mut message = format!(
            "Gateway {label} is still down after {attempts} repair attempt(s). Manual intervention needed."
        );
        if let Some(reason) = previous_failure {
            message.push_str(&format!(" Last failure: {reason}"));
        }
        tracing::error!(attempts, "{message}");
        self.record(FixStatus::Failed, &message);
        self.notifier.notify(&message).await;
        RunOutcome::Exhausted { attempts }
    }

    /// Capture fresh diagnostics for the next attempt.
    async fn gather_context(
        &self,
        number: u32,
        window: CrashWindow,
        previous_failure: Option<String>,
    ) -> FixContext {
        let config_check = self.validator.validate(&self.settings.config_file).await;
        let running = self.probe.is_running().await;
        let log_tails = crate::crash::resolve_logs(&self.settings.context_logs)
            .into_iter()
            .filter_map(|path| {
                match crate::crash::tail_lines(&path, self.settings.context_lines) {
                    Ok(lines) => Some((path, lines)),
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "skipping context log");
                        None
                    }
                }
            })
            .collect();
        FixContext {
            attempt: number,
            max_attempts: self.settings.max_fix_attempts,
            label: self.settings.label.clone(),
            config_file: self.settings.config_file.clone(),
            config_check,
            running,
            crash_count: window.observed_count,
            log_tails,
            previous_failure,
        }
    }

    async fn attempt(
        &self,
        repair: &dyn RepairAgent,
        number: u32,
        window: CrashWindow,
        previous_failure: Option<String>,
    ) -> FixAttempt {
        let context = self.gather_context(number, window, previous_failure).await;
        let mut attempt = FixAttempt {
            attempt_number: number,
            prompt: context.prompt(),
            raw_output: String::new(),
            config_valid: false,
            restart_succeeded: false,
            failure: None,
        };

        let snapshot = match ConfigSnapshot::take(&self.settings.config_file) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(error = %e, "could not snapshot config before fix attempt");
                None
            }
        };
        let discard = |reason: &str| {
            if let Some(snapshot) = &snapshot {
                if snapshot.changed() {
                    if let Err(e) = snapshot.restore() {
                        tracing::error!(error = %e, "failed to discard fix attempt edits");
                    }
                }
            }
            tracing::warn!(attempt = number, reason, "discarding fix attempt");
        };

        tracing::info!(attempt = number, agent = repair.name(), "fix attempt started");
        match repair.propose_fix(&context).await {
            Ok(result) if result.succeeded() => {
                attempt.raw_output = result.output;
            }
            Ok(result) => {
                let reason = format!("repair agent exited with {:?}", result.exit_code);
                attempt.raw_output = result.output;
                discard(&reason);
                attempt.failure = Some(reason);
                return attempt;
            }
            Err(e) => {
                let reason = e.to_string();
                discard(&reason);
                attempt.failure = Some(reason);
                return attempt;
            }
        }

        if let Err(reason) = self.validator.validate(&self.settings.config_file).await {
            let reason = format!("config invalid after fix: {reason}");
            discard(&reason);
            attempt.failure = Some(reason);
            return attempt;
        }
        attempt.config_valid = true;

        match restart_and_verify(
            self.supervisor,
            self.probe,
            &self.settings.label,
            self.settings.restart,
        )
        .await
        {
            Ok(()) => attempt.restart_succeeded = true,
            Err(reason) => attempt.failure = Some(reason),
        }
        attempt
    }

    /// Persist the outcome, stamped now. A write failure is logged, never fatal.
    fn record(&self, status: FixStatus, message: &str) {
        let state = WatchdogState::new(status, message, (self.clock)());
        if let Err(e) = self.store().save(&state) {
            tracing::error!(error = %e, "failed to persist watchdog state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::JsonValidator;
    use crate::repair::{FixResult, RepairError};
    use crate::supervisor::{ServiceStatus, SupervisorError};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    const VALID_CONFIG: &str = r#"{"gateway": {"port": 18789}, "channels": ["telegram"]}"#;

    /// Supervisor and probe over one simulated gateway.
    struct FakeGateway {
        running: AtomicBool,
        healthy: AtomicBool,
        comes_up_after_restart: bool,
        restarts: AtomicU32,
    }

    impl FakeGateway {
        fn new(running: bool, healthy: bool) -> Self {
            Self {
                running: AtomicBool::new(running),
                healthy: AtomicBool::new(healthy),
                comes_up_after_restart: true,
                restarts: AtomicU32::new(0),
            }
        }

        fn restarts(&self) -> u32 {
            self.restarts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Supervisor for FakeGateway {
        fn name(&self) -> &str {
            "fake"
        }

        async fn status(&self, _label: &str) -> Result<ServiceStatus, SupervisorError> {
            Ok(ServiceStatus {
                running: self.running.load(Ordering::SeqCst),
                pid: None,
            })
        }

        async fn restart(&self, _label: &str) -> Result<(), SupervisorError> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            self.running.store(self.comes_up_after_restart, Ordering::SeqCst);
            self.healthy.store(self.comes_up_after_restart, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl LivenessProbe for FakeGateway {
        async fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    /// What the fake agent does on a given call.
    #[derive(Clone, Copy)]
    enum Step {
        WriteValid,
        WriteInvalid,
        ExitNonZero,
        TimeOut,
    }

    struct FakeRepair {
        config_file: PathBuf,
        steps: Vec<Step>,
        prompts: Mutex<Vec<String>>,
    }

    impl FakeRepair {
        fn new(config_file: &Path, steps: Vec<Step>) -> Self {
            Self {
                config_file: config_file.to_path_buf(),
                steps,
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RepairAgent for FakeRepair {
        fn name(&self) -> &str {
            "fake-agent"
        }

        async fn propose_fix(&self, context: &FixContext) -> Result<FixResult, RepairError> {
            let call = {
                let mut prompts = self.prompts.lock().unwrap();
                prompts.push(context.prompt());
                prompts.len() - 1
            };
            let step = self.steps[call.min(self.steps.len() - 1)];
            let ok = |output: &str| FixResult {
                exit_code: Some(0),
                output: output.to_string(),
            };
            match step {
                Step::WriteValid => {
                    let fixed = r#"{"gateway": {"port": 18790}, "channels": ["telegram"]}"#;
                    std::fs::write(&self.config_file, fixed).unwrap();
                    Ok(ok("moved gateway to a free port"))
                }
                Step::WriteInvalid => {
                    std::fs::write(&self.config_file, r#"{"gateway": {"port": 18790,}"#).unwrap();
                    Ok(ok("edited config"))
                }
                Step::ExitNonZero => {
                    std::fs::write(&self.config_file, "half written").unwrap();
                    Ok(FixResult {
                        exit_code: Some(2),
                        output: "agent crashed".to_string(),
                    })
                }
                Step::TimeOut => Err(RepairError::Command(crate::exec::CommandError::Timeout {
                    program: "fake-agent".to_string(),
                    timeout: Duration::from_secs(300),
                })),
            }
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    struct Env {
        dir: tempfile::TempDir,
        settings: RemediationSettings,
    }

    impl Env {
        fn new(threshold: u32, max_fix_attempts: u32) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config_file = dir.path().join("openclaw.json");
            std::fs::write(&config_file, VALID_CONFIG).unwrap();
            std::fs::write(dir.path().join("gateway.err.log"), "").unwrap();
            let settings = RemediationSettings {
                label: "ai.openclaw.gateway".to_string(),
                crash_threshold: threshold,
                window_secs: 300,
                max_fix_attempts,
                cooldown_secs: 600,
                restart: RestartPolicy {
                    stabilize: Duration::ZERO,
                    verify_health: false,
                },
                config_file,
                error_logs: vec![dir.path().join("*.err.log").to_string_lossy().into_owned()],
                context_logs: vec![dir.path().join("*.log").to_string_lossy().into_owned()],
                tail_lines: 200,
                context_lines: 20,
                state_file: dir.path().join("state/state.json"),
                lock_file: dir.path().join("state/run.lock"),
            };
            Self { dir, settings }
        }

        /// Write `n` crash lines stamped within the last minute.
        fn crashes(&self, n: usize, now: DateTime<Utc>) {
            let lines: String = (0..n)
                .map(|i| {
                    let ts = now - chrono::Duration::seconds(i as i64 + 1);
                    format!(
                        "{} Error: listen EADDRINUSE: address already in use :::18789\n",
                        ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                    )
                })
                .collect();
            std::fs::write(self.dir.path().join("gateway.err.log"), lines).unwrap();
        }

        fn store(&self) -> StateStore {
            StateStore::new(&self.settings.state_file)
        }

        fn config_contents(&self) -> String {
            std::fs::read_to_string(&self.settings.config_file).unwrap()
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-19T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn run(
        env: &Env,
        gateway: &FakeGateway,
        repair: Option<&dyn RepairAgent>,
        notifier: &RecordingNotifier,
    ) -> RunOutcome {
        let validator = JsonValidator;
        let outcome = Orchestrator::new(
            env.settings.clone(),
            gateway,
            gateway,
            repair,
            &validator,
            notifier,
        )
        .with_clock(now)
        .run(now())
        .await;
        outcome
    }

    #[tokio::test]
    async fn test_healthy_gateway_does_nothing() {
        let env = Env::new(1, 2);
        env.crashes(10, now());
        let gateway = FakeGateway::new(true, true);
        let repair = FakeRepair::new(&env.settings.config_file, vec![Step::WriteValid]);
        let notifier = RecordingNotifier::default();

        let outcome = run(&env, &gateway, Some(&repair), &notifier).await;

        assert_eq!(outcome, RunOutcome::Healthy);
        assert_eq!(outcome.exit_code(), 0);
        assert!(!env.settings.state_file.exists());
        assert!(notifier.messages().is_empty());
        assert_eq!(repair.calls(), 0);
    }

    #[tokio::test]
    async fn test_not_running_without_crash_lines_defers() {
        // Not running, empty log, threshold 5: 1 signal < 5.
        let env = Env::new(5, 2);
        let gateway = FakeGateway::new(false, false);
        let repair = FakeRepair::new(&env.settings.config_file, vec![Step::WriteValid]);
        let notifier = RecordingNotifier::default();

        let outcome = run(&env, &gateway, Some(&repair), &notifier).await;

        assert_eq!(outcome, RunOutcome::BelowThreshold { count: 1 });
        assert_eq!(outcome.exit_code(), 0);
        assert!(!env.settings.state_file.exists());
        assert_eq!(repair.calls(), 0);
        assert!(notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn test_not_running_signal_can_reach_threshold() {
        let env = Env::new(1, 1);
        let gateway = FakeGateway::new(false, false);
        let repair = FakeRepair::new(&env.settings.config_file, vec![Step::WriteValid]);
        let notifier = RecordingNotifier::default();

        let outcome = run(&env, &gateway, Some(&repair), &notifier).await;
        assert_eq!(outcome, RunOutcome::Fixed { attempts: 1 });
    }

    #[tokio::test]
    async fn test_over_threshold_without_state_goes_straight_to_fixing() {
        let env = Env::new(5, 2);
        env.crashes(7, now());
        let gateway = FakeGateway::new(true, false);
        let repair = FakeRepair::new(&env.settings.config_file, vec![Step::WriteValid]);
        let notifier = RecordingNotifier::default();

        let outcome = run(&env, &gateway, Some(&repair), &notifier).await;

        assert_eq!(outcome, RunOutcome::Fixed { attempts: 1 });
        assert_eq!(repair.calls(), 1);
        assert_eq!(gateway.restarts(), 1);

        let state = env.store().load().unwrap().unwrap();
        assert_eq!(state.status, FixStatus::Ok);
        assert_eq!(state.last_fix_epoch, now().timestamp());
        assert_eq!(state.timestamp, "2026-10-19T12:00:00Z");

        let messages = notifier.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("Starting automatic repair"));
        assert!(messages[1].contains("repaired"));
    }

    #[tokio::test]
    async fn test_cooldown_leaves_state_untouched() {
        let env = Env::new(5, 2);
        env.crashes(7, now());
        let previous = WatchdogState::new(
            FixStatus::Failed,
            "earlier failure",
            now() - chrono::Duration::seconds(30),
        );
        env.store().save(&previous).unwrap();
        let before = std::fs::read(&env.settings.state_file).unwrap();

        let gateway = FakeGateway::new(false, false);
        let repair = FakeRepair::new(&env.settings.config_file, vec![Step::WriteValid]);
        let notifier = RecordingNotifier::default();

        let outcome = run(&env, &gateway, Some(&repair), &notifier).await;

        assert_eq!(
            outcome,
            RunOutcome::InCooldown {
                remaining: Duration::from_secs(570)
            }
        );
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(repair.calls(), 0);
        assert!(notifier.messages().is_empty());
        assert_eq!(std::fs::read(&env.settings.state_file).unwrap(), before);
    }

    #[tokio::test]
    async fn test_expired_cooldown_allows_fix() {
        let env = Env::new(5, 2);
        env.crashes(7, now());
        env.store()
            .save(&WatchdogState::new(
                FixStatus::Ok,
                "old fix",
                now() - chrono::Duration::seconds(601),
            ))
            .unwrap();
        let gateway = FakeGateway::new(false, false);
        let repair = FakeRepair::new(&env.settings.config_file, vec![Step::WriteValid]);
        let notifier = RecordingNotifier::default();

        let outcome = run(&env, &gateway, Some(&repair), &notifier).await;
        assert_eq!(outcome, RunOutcome::Fixed { attempts: 1 });
    }

    #[tokio::test]
    async fn test_missing_repair_agent_is_fatal() {
        let env = Env::new(5, 2);
        env.crashes(7, now());
        let gateway = FakeGateway::new(false, false);
        let notifier = RecordingNotifier::default();

        let outcome = run(&env, &gateway, None, &notifier).await;

        assert_eq!(outcome, RunOutcome::NoRepairAgent);
        assert_eq!(outcome.exit_code(), 1);
        let state = env.store().load().unwrap().unwrap();
        assert_eq!(state.status, FixStatus::NoRepairAgent);
        assert_eq!(state.last_fix_epoch, now().timestamp());
        assert_eq!(notifier.messages().len(), 1);
        assert!(notifier.messages()[0].contains("no repair agent"));
        assert_eq!(gateway.restarts(), 0);
    }

    #[tokio::test]
    async fn test_invalid_then_valid_fixes_on_second_attempt() {
        let env = Env::new(5, 2);
        env.crashes(7, now());
        let gateway = FakeGateway::new(false, false);
        let repair = FakeRepair::new(
            &env.settings.config_file,
            vec![Step::WriteInvalid, Step::WriteValid],
        );
        let notifier = RecordingNotifier::default();

        let outcome = run(&env, &gateway, Some(&repair), &notifier).await;

        assert_eq!(outcome, RunOutcome::Fixed { attempts: 2 });
        assert_eq!(repair.calls(), 2);
        // The invalid attempt never reached the restart primitive.
        assert_eq!(gateway.restarts(), 1);
        assert_eq!(env.store().load().unwrap().unwrap().status, FixStatus::Ok);
    }

    #[tokio::test]
    async fn test_failed_restarts_exhaust_attempts() {
        let env = Env::new(5, 2);
        env.crashes(7, now());
        let mut gateway = FakeGateway::new(false, false);
        gateway.comes_up_after_restart = false;
        let repair = FakeRepair::new(&env.settings.config_file, vec![Step::WriteValid]);
        let notifier = RecordingNotifier::default();

        let outcome = run(&env, &gateway, Some(&repair), &notifier).await;

        assert_eq!(outcome, RunOutcome::Exhausted { attempts: 2 });
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(repair.calls(), 2);
        assert_eq!(gateway.restarts(), 2);

        let state = env.store().load().unwrap().unwrap();
        assert_eq!(state.status, FixStatus::Failed);
        assert_eq!(state.last_fix_epoch, now().timestamp());
        assert!(state.message.contains("not running after restart"));

        let messages = notifier.messages();
        assert!(messages.last().unwrap().contains("Manual intervention needed"));
    }

    #[tokio::test]
    async fn test_invalid_output_is_never_restarted_and_is_rolled_back() {
        let env = Env::new(5, 3);
        env.crashes(7, now());
        let gateway = FakeGateway::new(false, false);
        let repair = FakeRepair::new(&env.settings.config_file, vec![Step::WriteInvalid]);
        let notifier = RecordingNotifier::default();

        let outcome = run(&env, &gateway, Some(&repair), &notifier).await;

        assert_eq!(outcome, RunOutcome::Exhausted { attempts: 3 });
        assert_eq!(repair.calls(), 3);
        assert_eq!(gateway.restarts(), 0);
        assert_eq!(env.config_contents(), VALID_CONFIG);
    }

    #[tokio::test]
    async fn test_agent_failures_count_against_budget() {
        let env = Env::new(5, 3);
        env.crashes(7, now());
        let gateway = FakeGateway::new(false, false);
        let repair = FakeRepair::new(
            &env.settings.config_file,
            vec![Step::TimeOut, Step::ExitNonZero, Step::TimeOut],
        );
        let notifier = RecordingNotifier::default();

        let outcome = run(&env, &gateway, Some(&repair), &notifier).await;

        assert_eq!(outcome, RunOutcome::Exhausted { attempts: 3 });
        assert_eq!(repair.calls(), 3);
        assert_eq!(gateway.restarts(), 0);
        // The half-written file from the failed agent was discarded.
        assert_eq!(env.config_contents(), VALID_CONFIG);
    }

    #[tokio::test]
    async fn test_each_attempt_gets_fresh_context() {
        let env = Env::new(5, 2);
        env.crashes(7, now());
        let gateway = FakeGateway::new(false, false);
        let repair = FakeRepair::new(
            &env.settings.config_file,
            vec![Step::WriteInvalid, Step::WriteValid],
        );
        let notifier = RecordingNotifier::default();

        run(&env, &gateway, Some(&repair), &notifier).await;

        let prompts = repair.prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("attempt 1 of 2"));
        assert!(!prompts[0].contains("Previous attempt failed"));
        assert!(prompts[0].contains("EADDRINUSE"));
        assert!(prompts[1].contains("attempt 2 of 2"));
        assert!(prompts[1]
            .contains("Previous attempt failed: attempt 1 failed: config invalid after fix"));
    }

    #[tokio::test]
    async fn test_zero_attempt_budget_exhausts_without_calls() {
        let env = Env::new(5, 0);
        env.crashes(7, now());
        let gateway = FakeGateway::new(false, false);
        let repair = FakeRepair::new(&env.settings.config_file, vec![Step::WriteValid]);
        let notifier = RecordingNotifier::default();

        let outcome = run(&env, &gateway, Some(&repair), &notifier).await;

        assert_eq!(outcome, RunOutcome::Exhausted { attempts: 0 });
        assert_eq!(repair.calls(), 0);
        assert_eq!(env.store().load().unwrap().unwrap().status, FixStatus::Failed);
    }

    #[tokio::test]
    async fn test_concurrent_run_is_busy() {
        let env = Env::new(5, 2);
        env.crashes(7, now());
        let _held = StateLock::try_acquire(&env.settings.lock_file).unwrap().unwrap();
        let gateway = FakeGateway::new(false, false);
        let repair = FakeRepair::new(&env.settings.config_file, vec![Step::WriteValid]);
        let notifier = RecordingNotifier::default();

        let outcome = run(&env, &gateway, Some(&repair), &notifier).await;

        assert_eq!(outcome, RunOutcome::Busy);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(repair.calls(), 0);
        assert!(!env.settings.state_file.exists());
    }

    #[tokio::test]
    async fn test_second_tick_after_fix_is_in_cooldown() {
        let env = Env::new(5, 2);
        env.crashes(7, now());
        let mut gateway = FakeGateway::new(false, false);
        gateway.comes_up_after_restart = false;
        let repair = FakeRepair::new(&env.settings.config_file, vec![Step::WriteValid]);
        let notifier = RecordingNotifier::default();

        assert_eq!(
            run(&env, &gateway, Some(&repair), &notifier).await,
            RunOutcome::Exhausted { attempts: 2 }
        );
        let outcome = run(&env, &gateway, Some(&repair), &notifier).await;
        assert!(matches!(outcome, RunOutcome::InCooldown { .. }));
        assert_eq!(repair.calls(), 2);
    }

    /// Agent that leaves the config alone but takes `secs` of wall clock per call.
    struct SlowRepair {
        elapsed: Arc<AtomicI64>,
        secs: i64,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RepairAgent for SlowRepair {
        fn name(&self) -> &str {
            "slow-agent"
        }

        async fn propose_fix(&self, _context: &FixContext) -> Result<FixResult, RepairError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.elapsed.fetch_add(self.secs, Ordering::SeqCst);
            Ok(FixResult {
                exit_code: Some(0),
                output: "nothing to change".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_cooldown_starts_when_remediation_ends() {
        // Two slow attempts outlast the 600s cooldown measured from run start.
        let env = Env::new(5, 2);
        env.crashes(7, now());
        let mut gateway = FakeGateway::new(false, false);
        gateway.comes_up_after_restart = false;
        let elapsed = Arc::new(AtomicI64::new(0));
        let repair = SlowRepair {
            elapsed: elapsed.clone(),
            secs: 305,
            calls: AtomicU32::new(0),
        };
        let validator = JsonValidator;
        let notifier = RecordingNotifier::default();
        let clock = {
            let elapsed = elapsed.clone();
            move || now() + chrono::Duration::seconds(elapsed.load(Ordering::SeqCst))
        };
        let orchestrator = Orchestrator::new(
            env.settings.clone(),
            &gateway,
            &gateway,
            Some(&repair),
            &validator,
            &notifier,
        )
        .with_clock(clock.clone());

        let first = orchestrator.run(now()).await;
        assert_eq!(first, RunOutcome::Exhausted { attempts: 2 });
        let state = env.store().load().unwrap().unwrap();
        assert_eq!(state.last_fix_epoch, now().timestamp() + 610);

        // Next scheduler tick, shortly after the run finished.
        env.crashes(7, clock());
        let next_tick = clock() + chrono::Duration::seconds(5);
        let second = orchestrator.run(next_tick).await;
        assert_eq!(
            second,
            RunOutcome::InCooldown {
                remaining: Duration::from_secs(595)
            }
        );
        assert_eq!(repair.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_outcome_independent_of_notifier() {
        let env = Env::new(5, 2);
        env.crashes(7, now());
        let gateway = FakeGateway::new(false, false);
        let repair = FakeRepair::new(&env.settings.config_file, vec![Step::WriteValid]);
        let validator = JsonValidator;
        let silent = crate::notify::NullNotifier;

        let outcome = Orchestrator::new(
            env.settings.clone(),
            &gateway,
            &gateway,
            Some(&repair),
            &validator,
            &silent,
        )
        .run(now())
        .await;
        assert_eq!(outcome, RunOutcome::Fixed { attempts: 1 });
    }

    #[tokio::test]
    async fn test_assess_reports_decision_without_side_effects() {
        let env = Env::new(5, 2);
        env.crashes(7, now());
        let gateway = FakeGateway::new(false, false);
        let repair = FakeRepair::new(&env.settings.config_file, vec![Step::WriteValid]);
        let validator = JsonValidator;
        let notifier = RecordingNotifier::default();
        let orchestrator = Orchestrator::new(
            env.settings.clone(),
            &gateway,
            &gateway,
            Some(&repair),
            &validator,
            &notifier,
        );

        let assessment = orchestrator.assess(now()).await;
        assert_eq!(assessment.window.unwrap().observed_count, 8);
        assert_eq!(assessment.decision(), "FIXING");
        assert_eq!(repair.calls(), 0);
        assert!(!env.settings.state_file.exists());
        assert!(!env.settings.lock_file.exists());
    }

    #[test]
    fn test_assessment_decisions() {
        let base = Assessment {
            running: true,
            healthy: true,
            window: None,
            last_state: None,
            cooldown: Duration::ZERO,
            repair_available: true,
        };
        assert_eq!(base.decision(), "HEALTHY");

        let window = |count| {
            Some(CrashWindow {
                threshold: 3,
                window_secs: 300,
                observed_count: count,
            })
        };
        let below = Assessment {
            healthy: false,
            window: window(1),
            ..base.clone()
        };
        assert_eq!(below.decision(), "BELOW_THRESHOLD");

        let cooling = Assessment {
            healthy: false,
            window: window(4),
            cooldown: Duration::from_secs(10),
            ..base.clone()
        };
        assert_eq!(cooling.decision(), "IN_COOLDOWN");

        let no_agent = Assessment {
            healthy: false,
            window: window(4),
            repair_available: false,
            ..base.clone()
        };
        assert_eq!(no_agent.decision(), "NO_REPAIR_AGENT");
    }
}
