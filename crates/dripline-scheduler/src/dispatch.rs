//! Message dispatch — hands fired steps to the outbound sending layer.
//! Supports: log-only (default) and HTTP webhook (POST with JSON body).

use async_trait::async_trait;
use dripline_core::config::DispatchConfig;
use dripline_core::error::{DriplineError, Result};
use serde::Serialize;

use crate::model::{Channel, PendingTask};

/// Payload sent for one task.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    pub task_id: String,
    pub workspace_id: String,
    pub lead_id: String,
    pub channel: Channel,
    pub subject: Option<String>,
    pub body: String,
}

impl From<&PendingTask> for OutboundMessage {
    fn from(task: &PendingTask) -> Self {
        Self {
            task_id: task.id.clone(),
            workspace_id: task.workspace_id.clone(),
            lead_id: task.lead_id.clone(),
            channel: task.channel,
            subject: task.subject.clone(),
            body: task.message.clone(),
        }
    }
}

/// Outbound sending layer.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, message: &OutboundMessage) -> Result<()>;
}

/// Writes every message to the log and reports success.
pub struct LogDispatcher;

#[async_trait]
impl Dispatcher for LogDispatcher {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        tracing::info!(
            "📤 [{}] {} → lead {}: {}",
            message.channel,
            message.task_id,
            message.lead_id,
            message.body
        );
        Ok(())
    }
}

/// Generic HTTP webhook.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
    timeout: std::time::Duration,
}

impl WebhookDispatcher {
    pub fn new(url: &str, headers: Vec<(String, String)>, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            headers,
            timeout: std::time::Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl Dispatcher for WebhookDispatcher {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .json(message)
            .timeout(self.timeout);

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| DriplineError::Dispatch(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::debug!("✅ Webhook accepted task {}", message.task_id);
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(DriplineError::Dispatch(format!("Webhook error {status}: {body}")))
        }
    }
}

/// Build the dispatcher from config: webhook when a URL is set, log otherwise.
pub fn from_config(config: &DispatchConfig) -> Box<dyn Dispatcher> {
    match config.webhook_url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => {
            tracing::info!("🔗 Dispatching via webhook: {url}");
            Box::new(WebhookDispatcher::new(
                url,
                config.headers.clone(),
                config.timeout_secs,
            ))
        }
        None => Box::new(LogDispatcher),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskStatus;
    use chrono::Utc;

    #[test]
    fn test_from_config_picks_webhook_only_with_url() {
        let mut config = DispatchConfig::default();
        assert_eq!(from_config(&config).name(), "log");
        config.webhook_url = Some(String::new());
        assert_eq!(from_config(&config).name(), "log");
        config.webhook_url = Some("http://localhost:9/hook".into());
        assert_eq!(from_config(&config).name(), "webhook");
    }

    #[test]
    fn test_outbound_payload() {
        let task = PendingTask {
            id: "task-1".into(),
            instance_id: Some("inst-1".into()),
            step_order: Some(2),
            lead_id: "lead-1".into(),
            workspace_id: "ws-1".into(),
            channel: Channel::Sms,
            status: TaskStatus::Queued,
            message: "Hi Mai".into(),
            subject: None,
            due_at: Utc::now(),
            created_at: Utc::now(),
            sent_at: None,
            error: None,
        };
        let json = serde_json::to_value(OutboundMessage::from(&task)).unwrap();
        assert_eq!(json["channel"], "sms");
        assert_eq!(json["body"], "Hi Mai");
        assert_eq!(json["task_id"], "task-1");
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_dispatch_error() {
        let hook = WebhookDispatcher::new("http://127.0.0.1:9/hook", Vec::new(), 1);
        let msg = OutboundMessage {
            task_id: "t".into(),
            workspace_id: "w".into(),
            lead_id: "l".into(),
            channel: Channel::Email,
            subject: None,
            body: "b".into(),
        };
        assert!(matches!(hook.send(&msg).await, Err(DriplineError::Dispatch(_))));
    }
}
