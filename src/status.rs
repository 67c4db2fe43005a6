//! Human-readable reports for the `status` and `check` subcommands.

use crate::orchestrator::Assessment;
use crate::state::WatchdogState;
use std::fmt::Write;
use std::path::Path;
use std::time::Duration;

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

/// Render the persisted state and its cooldown.
pub fn render_state(path: &Path, state: Option<&WatchdogState>, cooldown: Duration) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "State file: {}", path.display());
    match state {
        None => {
            let _ = writeln!(out, "No remediation recorded.");
        }
        Some(state) => {
            let _ = writeln!(out, "Last remediation: {} ({})", state.timestamp, state.status);
            let _ = writeln!(out, "Message: {}", state.message);
        }
    }
    if cooldown.is_zero() {
        let _ = writeln!(out, "Cooldown: none");
    } else {
        let _ = writeln!(out, "Cooldown: {}s remaining", cooldown.as_secs());
    }
    out
}

/// Render what a run would decide right now.
pub fn render_assessment(label: &str, assessment: &Assessment) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Gateway: {label}");
    let _ = writeln!(out, "Running: {}", yes_no(assessment.running));
    let _ = writeln!(out, "Healthy: {}", yes_no(assessment.healthy));
    if let Some(window) = assessment.window {
        let _ = writeln!(
            out,
            "Crashes: {} in the last {}s (threshold {})",
            window.observed_count, window.window_secs, window.threshold
        );
    }
    if !assessment.cooldown.is_zero() {
        let _ = writeln!(out, "Cooldown: {}s remaining", assessment.cooldown.as_secs());
    }
    let _ = writeln!(
        out,
        "Repair agent: {}",
        if assessment.repair_available {
            "available"
        } else {
            "missing"
        }
    );
    let _ = writeln!(out, "Decision: {}", assessment.decision());
    out
}
