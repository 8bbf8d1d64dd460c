//! Best-effort operator alerts
//!
//! Trading code hands alerts to a [`Notifier`], which never blocks: alerts
//! go into a bounded queue that an independent dispatcher task drains into
//! an [`AlertSink`]. A full queue or a failing sink costs an alert, never a
//! trading cycle.

pub mod sink;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::common::channels::create_alert_channel_with_size;
use crate::common::traits::AlertSink;

pub use sink::{LogSink, WebhookSink};

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// A message for the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

/// Cloneable handle for enqueueing alerts
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: mpsc::Sender<Alert>,
}

impl Notifier {
    /// Create a notifier and the dispatcher task draining it into `sink`.
    pub fn spawn(queue_size: usize, sink: Arc<dyn AlertSink>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = create_alert_channel_with_size(queue_size);
        let handle = tokio::spawn(dispatch(receiver, sink));
        (Self { sender }, handle)
    }

    /// Wrap an existing queue; the caller owns the receiving side.
    pub fn from_sender(sender: mpsc::Sender<Alert>) -> Self {
        Self { sender }
    }

    /// Enqueue without waiting. Returns false when the alert was dropped.
    pub fn send(&self, alert: Alert) -> bool {
        match self.sender.try_send(alert) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(alert)) => {
                warn!(text = %alert.text, "Alert queue full, dropping alert");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Alert dispatcher stopped, dropping alert");
                false
            }
        }
    }

    pub fn info(&self, text: impl Into<String>) -> bool {
        self.send(Alert::new(AlertLevel::Info, text))
    }

    pub fn warning(&self, text: impl Into<String>) -> bool {
        self.send(Alert::new(AlertLevel::Warning, text))
    }

    pub fn critical(&self, text: impl Into<String>) -> bool {
        self.send(Alert::new(AlertLevel::Critical, text))
    }
}

async fn dispatch(mut receiver: mpsc::Receiver<Alert>, sink: Arc<dyn AlertSink>) {
    while let Some(alert) = receiver.recv().await {
        if let Err(e) = sink.deliver(&alert).await {
            warn!(error = %e, "Failed to deliver alert");
        }
    }
    debug!("Alert queue closed, dispatcher exiting");
}
