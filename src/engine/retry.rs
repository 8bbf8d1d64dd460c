//! Bounded retry for broker calls

use backoff::ExponentialBackoff;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::common::errors::{Result, TraderError};
use crate::config::types::BrokerConfig;

/// Per-call timeout plus a small number of retries with exponential backoff.
///
/// Only [`TraderError::is_transient`] failures are retried. A rate-limit
/// error carrying a retry-after hint waits that long instead.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.retry_backoff_ms.max(1)),
            call_timeout: Duration::from_millis(config.request_timeout_ms.max(1)),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            max_interval: self.initial_backoff * 8,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Run `op` until it succeeds, fails permanently or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = AtomicU32::new(0);
        let call_timeout = self.call_timeout;
        let max_retries = self.max_retries;

        backoff::future::retry(self.backoff(), || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            let call = op();
            async move {
                let outcome = match tokio::time::timeout(call_timeout, call).await {
                    Ok(result) => result,
                    Err(elapsed) => Err(TraderError::from(elapsed)),
                };
                outcome.map_err(|e| {
                    if !e.is_transient() || attempt >= max_retries {
                        if attempt > 0 {
                            warn!(label, attempts = attempt + 1, error = %e, "Giving up");
                        }
                        return backoff::Error::permanent(e);
                    }
                    debug!(label, attempt = attempt + 1, error = %e, "Retrying");
                    let wait = match &e {
                        TraderError::RateLimit {
                            retry_after_seconds: Some(secs),
                            ..
                        } => Some(Duration::from_secs(*secs)),
                        _ => None,
                    };
                    match wait {
                        Some(wait) => backoff::Error::retry_after(e, wait),
                        None => backoff::Error::transient(e),
                    }
                })
            }
        })
        .await
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}
