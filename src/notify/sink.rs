//! Alert destinations

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use super::{Alert, AlertLevel};
use crate::common::errors::{Result, TraderError};
use crate::common::traits::AlertSink;
use crate::config::types::NotifyConfig;

/// Writes alerts to the log only
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        match alert.level {
            AlertLevel::Info => info!(alert = %alert.text, "Alert"),
            AlertLevel::Warning => warn!(alert = %alert.text, "Alert"),
            AlertLevel::Critical => error!(alert = %alert.text, "Alert"),
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_id: Option<&'a str>,
    text: String,
}

/// Posts alerts as `{chat_id, text}` JSON to a chat webhook
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: Client,
    url: String,
    chat_id: Option<String>,
    prefix: Option<String>,
}

impl WebhookSink {
    pub fn new(url: &str, chat_id: Option<String>, timeout: Duration) -> Result<Self> {
        url::Url::parse(url)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TraderError::Internal(e.to_string()))?;

        Ok(Self {
            client,
            url: url.to_string(),
            chat_id,
            prefix: None,
        })
    }

    /// Build from configuration; `None` when no webhook is configured.
    pub fn from_config(config: &NotifyConfig) -> Result<Option<Self>> {
        let Some(url) = config.webhook_url.as_deref() else {
            return Ok(None);
        };
        let sink = Self::new(
            url,
            config.chat_id.clone(),
            Duration::from_secs(config.timeout_secs),
        )?
        .with_prefix(config.process_name.clone());
        Ok(Some(sink))
    }

    pub fn with_prefix(mut self, prefix: Option<String>) -> Self {
        self.prefix = prefix.filter(|p| !p.trim().is_empty());
        self
    }

    fn format(&self, alert: &Alert) -> String {
        let marker = match alert.level {
            AlertLevel::Info => "",
            AlertLevel::Warning => "[WARN] ",
            AlertLevel::Critical => "[CRITICAL] ",
        };
        match &self.prefix {
            Some(prefix) => format!("[{}] {}{}", prefix, marker, alert.text),
            None => format!("{}{}", marker, alert.text),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    #[instrument(skip(self, alert))]
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        let payload = WebhookPayload {
            chat_id: self.chat_id.as_deref(),
            text: self.format(alert),
        };
        let response = self.client.post(&self.url).json(&payload).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TraderError::InvalidResponse(format!(
                "Webhook returned status {}: {}",
                status, body
            )));
        }
        Ok(())
    }
}
