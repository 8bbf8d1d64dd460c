//! Channel type definitions for inter-task communication

use tokio::sync::{mpsc, watch};

use super::types::ConnectionState;
use crate::notify::Alert;

/// Default alert queue size
pub const DEFAULT_ALERT_QUEUE_SIZE: usize = 256;

/// Create a new alert queue with the default buffer size
pub fn create_alert_channel() -> (mpsc::Sender<Alert>, mpsc::Receiver<Alert>) {
    mpsc::channel(DEFAULT_ALERT_QUEUE_SIZE)
}

/// Create a new alert queue with a custom buffer size
pub fn create_alert_channel_with_size(size: usize) -> (mpsc::Sender<Alert>, mpsc::Receiver<Alert>) {
    mpsc::channel(size.max(1))
}

/// Shutdown flag shared by long-running tasks; `true` means stop
pub fn create_shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Published feed connection state
pub fn create_state_channel() -> (watch::Sender<ConnectionState>, watch::Receiver<ConnectionState>) {
    watch::channel(ConnectionState::Disconnected)
}
