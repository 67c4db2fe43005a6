//! Liveness and health checks for the gateway.
//!
//! Liveness asks the init system whether the process exists; health asks the
//! process itself over HTTP. Neither check ever fails: an unreachable
//! endpoint or an unanswered supervisor query is simply "not running" or
//! "not healthy".

use crate::supervisor::Supervisor;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_running(&self) -> bool;

    async fn is_healthy(&self) -> bool;
}

/// Probe backed by a supervisor status query and an HTTP health endpoint.
pub struct GatewayProbe<'a> {
    supervisor: &'a dyn Supervisor,
    label: String,
    health_url: String,
    client: reqwest::Client,
}

impl<'a> GatewayProbe<'a> {
    pub fn new(
        supervisor: &'a dyn Supervisor,
        label: &str,
        port: u16,
        path: &str,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to build http client, using defaults");
                reqwest::Client::new()
            });
        Self {
            supervisor,
            label: label.to_string(),
            health_url: health_url(port, path),
            client,
        }
    }

    pub fn health_url(&self) -> &str {
        &self.health_url
    }
}

/// `http://127.0.0.1:<port><path>`, tolerating a path without a leading slash.
fn health_url(port: u16, path: &str) -> String {
    if path.starts_with('/') {
        format!("http://127.0.0.1:{port}{path}")
    } else {
        format!("http://127.0.0.1:{port}/{path}")
    }
}

#[async_trait]
impl LivenessProbe for GatewayProbe<'_> {
    async fn is_running(&self) -> bool {
        match self.supervisor.status(&self.label).await {
            Ok(status) => {
                tracing::debug!(
                    label = %self.label,
                    running = status.running,
                    pid = ?status.pid,
                    "supervisor status"
                );
                status.running
            }
            Err(e) => {
                tracing::warn!(label = %self.label, error = %e, "supervisor status query failed");
                false
            }
        }
    }

    async fn is_healthy(&self) -> bool {
        match self.client.get(&self.health_url).send().await {
            Ok(resp) => {
                let ok = resp.status().is_success();
                tracing::debug!(
                    url = %self.health_url,
                    status = %resp.status(),
                    ok,
                    "health check"
                );
                ok
            }
            Err(e) => {
                tracing::debug!(url = %self.health_url, error = %e, "health check unreachable");
                false
            }
        }
    }
}
