//! Candidate feed
//!
//! Keeps one condition-search subscription alive and ranks what it streams.
//!
//! ```text
//! Disconnected ──► Connecting ──► Subscribed ◄──► Degraded
//!       ▲               │              │              │
//!       │               ▼              ▼              ▼
//!       └──────────── Reconnecting (exponential backoff) ◄─┘
//! ```
//!
//! A session is: authenticate, connect, `LOGIN`, `CNSRLST`, `CNSRREQ` for
//! the configured condition index. `PING` frames are echoed. Half the
//! liveness timeout without traffic marks the session Degraded; the full
//! timeout tears it down and reconnects.

mod buffer;

pub use buffer::{CandidateBuffer, RankedBuffer};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::websocket::{
    condition_list_frame, condition_request_frame, login_frame, parse_frame, StreamFrame,
    StreamSession,
};
use crate::common::channels::create_state_channel;
use crate::common::errors::{Result, TraderError};
use crate::common::traits::BrokerGateway;
use crate::common::types::{ConnectionState, SUCCESS_CODE};
use crate::config::types::FeedConfig;

/// How a session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
}

/// Streaming listener feeding a [`CandidateBuffer`]
pub struct CandidateFeed {
    config: FeedConfig,
    gateway: Arc<dyn BrokerGateway>,
    buffer: CandidateBuffer,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl CandidateFeed {
    pub fn new(config: FeedConfig, gateway: Arc<dyn BrokerGateway>, buffer: CandidateBuffer) -> Self {
        let (state_tx, state_rx) = create_state_channel();
        Self {
            config,
            gateway,
            buffer,
            state_tx,
            state_rx,
        }
    }

    /// Watch connection state changes
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn buffer(&self) -> CandidateBuffer {
        self.buffer.clone()
    }

    /// Run on its own task until `shutdown` flips to true
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() != state {
            debug!(%state, "Feed state");
            let _ = self.state_tx.send(state);
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.config.reconnect_delay_ms.max(1));
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: Duration::from_millis(
                self.config.max_reconnect_delay_ms.max(self.config.reconnect_delay_ms),
            ),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.config.liveness_timeout_secs.max(1))
    }

    /// Reconnect loop
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.backoff();
        info!(url = %self.config.websocket_url, "Candidate feed started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.session(&mut shutdown, &mut backoff).await {
                Ok(SessionEnd::Shutdown) => break,
                Err(e) => {
                    self.set_state(ConnectionState::Reconnecting);
                    let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "Feed session ended, reconnecting");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Candidate feed stopped");
    }

    #[instrument(skip_all)]
    async fn session(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
    ) -> Result<SessionEnd> {
        self.set_state(ConnectionState::Connecting);

        let token = self.gateway.authenticate().await?;
        let mut session = StreamSession::connect(&self.config.websocket_url).await?;
        session.send_text(login_frame(&token)?).await?;

        let liveness = self.liveness_timeout();
        let degraded_after = liveness / 2;
        let mut last_seen = Instant::now();
        let mut subscribed = false;

        let outcome = loop {
            let silence = last_seen.elapsed();
            if silence >= liveness {
                break Err(TraderError::Timeout(format!(
                    "no frames for {}s",
                    silence.as_secs()
                )));
            }
            let wait = if silence < degraded_after {
                degraded_after - silence
            } else {
                liveness - silence
            };

            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(SessionEnd::Shutdown);
                    }
                    continue;
                }
                next = tokio::time::timeout(wait, session.next_text()) => next,
            };

            let text = match next {
                Err(_) => {
                    if subscribed && last_seen.elapsed() >= degraded_after {
                        self.set_state(ConnectionState::Degraded);
                    }
                    continue;
                }
                Ok(None) => {
                    break Err(TraderError::WebSocketConnection("closed by server".into()))
                }
                Ok(Some(Err(e))) => break Err(e),
                Ok(Some(Ok(text))) => text,
            };

            last_seen = Instant::now();
            if subscribed {
                self.set_state(ConnectionState::Subscribed);
            }

            let frame = match parse_frame(&text, Utc::now()) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Dropping unparseable frame");
                    continue;
                }
            };

            match frame {
                StreamFrame::Login { code, message } => {
                    if code != SUCCESS_CODE {
                        break Err(TraderError::Handshake(format!(
                            "login refused [{}]: {}",
                            code, message
                        )));
                    }
                    info!("Stream login accepted");
                    session.send_text(condition_list_frame()?).await?;
                }
                StreamFrame::Ping(raw) => {
                    session.send_text(raw).await?;
                }
                StreamFrame::ConditionList(conditions) => {
                    let Some((index, name)) = conditions.get(self.config.condition_index) else {
                        break Err(TraderError::Handshake(format!(
                            "condition index {} not in list of {}",
                            self.config.condition_index,
                            conditions.len()
                        )));
                    };
                    info!(index = %index, name = %name, "Subscribing to condition");
                    session.send_text(condition_request_frame(index)?).await?;
                    subscribed = true;
                    backoff.reset();
                    self.set_state(ConnectionState::Subscribed);
                }
                StreamFrame::Signals(candidates) => {
                    let received = candidates.len();
                    let kept = self.buffer.extend(candidates).await;
                    debug!(received, kept, "Candidates buffered");
                }
                StreamFrame::Other(trnm) => {
                    debug!(trnm = %trnm, "Ignoring frame");
                }
            }
        };

        session.close().await;
        if let Err(e) = &outcome {
            if !e.is_transient() {
                error!(error = %e, "Feed session failed");
            }
        }
        outcome
    }
}
