//! Restart the gateway through its supervisor and confirm it came back.

use crate::probe::LivenessProbe;
use crate::supervisor::Supervisor;
use std::time::Duration;

/// How a restart is judged.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Wait between issuing the restart and probing.
    pub stabilize: Duration,
    /// Also require the health endpoint to answer.
    pub verify_health: bool,
}

/// Issue a restart, wait for it to settle, then probe.
///
/// `Err` holds the reason the gateway is not considered back up.
pub async fn restart_and_verify(
    supervisor: &dyn Supervisor,
    probe: &dyn LivenessProbe,
    label: &str,
    policy: RestartPolicy,
) -> Result<(), String> {
    tracing::info!(label, backend = supervisor.name(), "restarting gateway");
    supervisor
        .restart(label)
        .await
        .map_err(|e| format!("restart request failed: {e}"))?;

    if !policy.stabilize.is_zero() {
        tracing::debug!(secs = policy.stabilize.as_secs(), "waiting for gateway to stabilize");
        tokio::time::sleep(policy.stabilize).await;
    }

    if !probe.is_running().await {
        return Err("gateway is not running after restart".to_string());
    }
    if policy.verify_health && !probe.is_healthy().await {
        return Err("gateway is running but its health check fails after restart".to_string());
    }
    tracing::info!(label, "gateway is back up");
    Ok(())
}
