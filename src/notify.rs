//! Best-effort status notifications. Delivery failures are logged and
//! swallowed; nothing the orchestrator decides depends on them.

use crate::config::{NotifyConfig, NotifyKind};
use crate::exec::{render_args, run_command};
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Logs the message and sends nothing.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, message: &str) {
        tracing::debug!(message, "notification skipped, no target configured");
    }
}

/// Sends through a messaging CLI, e.g. `openclaw message send`.
pub struct CommandNotifier {
    command: String,
    args: Vec<String>,
    target: String,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(command: String, args: Vec<String>, target: String, timeout: Duration) -> Self {
        Self {
            command,
            args,
            target,
            timeout,
        }
    }

    async fn send(&self, message: &str) -> Result<(), String> {
        let args = render_args(
            &self.args,
            &[("target", self.target.as_str()), ("message", message)],
        );
        let out = run_command(&self.command, &args, self.timeout)
            .await
            .map_err(|e| e.to_string())?;
        if out.success() {
            Ok(())
        } else {
            Err(format!(
                "{} exited with {:?}: {}",
                self.command,
                out.exit_code,
                out.output.trim()
            ))
        }
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, message: &str) {
        match self.send(message).await {
            Ok(()) => tracing::info!(target_id = %self.target, "notification sent"),
            Err(e) => tracing::warn!(error = %e, "notification failed"),
        }
    }
}

/// POSTs `{"target": ..., "text": ...}` to a webhook.
pub struct WebhookNotifier {
    url: String,
    target: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String, target: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to build http client, using defaults");
                reqwest::Client::new()
            });
        Self {
            url,
            target,
            client,
        }
    }

    async fn send(&self, message: &str) -> Result<(), String> {
        let body = serde_json::json!({ "target": self.target, "text": message });
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook returned {}", resp.status()))
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) {
        match self.send(message).await {
            Ok(()) => tracing::info!(url = %self.url, "notification sent"),
            Err(e) => tracing::warn!(url = %self.url, error = %e, "notification failed"),
        }
    }
}

/// Build the notifier selected by config. Without a target nothing is sent.
pub fn from_config(config: &NotifyConfig) -> Box<dyn Notifier> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let Some(target) = config.target.clone() else {
        return Box::new(NullNotifier);
    };
    match config.kind {
        NotifyKind::None => Box::new(NullNotifier),
        NotifyKind::Command => Box::new(CommandNotifier::new(
            config.command.clone(),
            config.args.clone(),
            target,
            timeout,
        )),
        NotifyKind::Webhook => match &config.webhook_url {
            Some(url) => Box::new(WebhookNotifier::new(url.clone(), target, timeout)),
            None => {
                tracing::warn!("notify.kind is webhook but notify.webhook_url is unset");
                Box::new(NullNotifier)
            }
        },
    }
}
