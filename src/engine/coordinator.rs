//! Per-symbol locks, the candidate batch lock, submission throttling and
//! the risk-state table.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::common::types::RiskState;
use crate::config::types::AppConfig;

/// Timing windows enforced by the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Minimum spacing between two order submissions
    pub order_interval: Duration,
    /// Post-exit wait before re-entry
    pub reentry_cooldown: ChronoDuration,
    /// Wait after a buy attempt before trying the same symbol again
    pub retry_cooldown: ChronoDuration,
    /// How long a submitted sell blocks new buys
    pub sell_settlement: ChronoDuration,
    /// How long a sold symbol stays "recently sold"
    pub sold_grace: ChronoDuration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            order_interval: Duration::from_millis(config.broker.order_interval_ms),
            reentry_cooldown: secs(config.trading.reentry_cooldown_secs),
            retry_cooldown: secs(config.trading.entry_retry_cooldown_secs),
            sell_settlement: secs(config.exits.sell_settlement_secs),
            sold_grace: secs(config.reconcile.ghost_grace_secs),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

fn secs(value: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

#[derive(Debug, Default)]
struct SymbolSlot {
    lock: Arc<Mutex<()>>,
    risk: RiskState,
}

/// Exclusive hold on one symbol; released on drop
#[derive(Debug)]
pub struct SymbolGuard {
    symbol: String,
    _guard: OwnedMutexGuard<()>,
}

impl SymbolGuard {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

/// Owner of every piece of per-symbol shared state
///
/// Decisions for one symbol never run concurrently: entry and exit both
/// take the symbol lock with [`try_lock_symbol`](Self::try_lock_symbol)
/// and give up instead of waiting.
#[derive(Debug)]
pub struct ConcurrencyCoordinator {
    slots: Mutex<HashMap<String, SymbolSlot>>,
    batch: Arc<Mutex<()>>,
    last_submission: Mutex<Option<Instant>>,
    settings: CoordinatorSettings,
}

impl ConcurrencyCoordinator {
    pub fn new(settings: CoordinatorSettings) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            batch: Arc::new(Mutex::new(())),
            last_submission: Mutex::new(None),
            settings,
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Take the symbol lock, or `None` if another decision holds it.
    pub async fn try_lock_symbol(&self, symbol: &str) -> Option<SymbolGuard> {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(symbol.to_string()).or_default();
        match Arc::clone(&slot.lock).try_lock_owned() {
            Ok(guard) => Some(SymbolGuard {
                symbol: symbol.to_string(),
                _guard: guard,
            }),
            Err(_) => {
                debug!(symbol = %symbol, "Symbol lock busy");
                None
            }
        }
    }

    pub async fn is_locked(&self, symbol: &str) -> bool {
        let slots = self.slots.lock().await;
        slots
            .get(symbol)
            .map_or(false, |slot| slot.lock.try_lock().is_err())
    }

    /// Symbols with a decision in progress
    pub async fn locked_symbols(&self) -> HashSet<String> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .filter(|(_, slot)| slot.lock.try_lock().is_err())
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    /// Serializes candidate batches so two batches never both see a free slot.
    pub fn try_lock_batch(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.batch).try_lock_owned().ok()
    }

    /// Wait until at least `order_interval` has passed since the last submission.
    ///
    /// The wait happens while holding the throttle lock, so concurrent callers
    /// are released one interval apart.
    pub async fn throttle(&self) {
        let mut last = self.last_submission.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.settings.order_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Run `f` against the risk state of `symbol`.
    pub async fn with_risk<R>(&self, symbol: &str, f: impl FnOnce(&mut RiskState) -> R) -> R {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(symbol.to_string()).or_default();
        f(&mut slot.risk)
    }

    pub async fn risk_state(&self, symbol: &str) -> RiskState {
        let slots = self.slots.lock().await;
        slots
            .get(symbol)
            .map(|slot| slot.risk.clone())
            .unwrap_or_default()
    }

    /// Time left on the post-exit cooldown, if it is still running.
    pub async fn cooldown_remaining(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Option<ChronoDuration> {
        let last_exit = self.risk_state(symbol).await.last_exit_at?;
        let remaining = last_exit + self.settings.reentry_cooldown - now;
        (remaining > ChronoDuration::zero()).then_some(remaining)
    }

    pub async fn in_retry_cooldown(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.risk_state(symbol)
            .await
            .last_entry_attempt_at
            .map_or(false, |at| now - at < self.settings.retry_cooldown)
    }

    pub async fn is_being_sold(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.risk_state(symbol)
            .await
            .being_sold_until
            .map_or(false, |until| now < until)
    }

    pub async fn recently_sold(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.risk_state(symbol)
            .await
            .recently_sold_at
            .map_or(false, |at| now - at < self.settings.sold_grace)
    }

    /// Symbols sold within the ghost grace window
    pub async fn recently_sold_symbols(&self, now: DateTime<Utc>) -> HashSet<String> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .filter(|(_, slot)| {
                slot.risk
                    .recently_sold_at
                    .map_or(false, |at| now - at < self.settings.sold_grace)
            })
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    pub async fn record_entry_attempt(&self, symbol: &str, now: DateTime<Utc>) {
        self.with_risk(symbol, |risk| risk.last_entry_attempt_at = Some(now))
            .await;
    }

    /// Full exit submitted: reset the position and start every post-exit window.
    pub async fn record_full_exit(&self, symbol: &str, now: DateTime<Utc>) {
        let settlement = self.settings.sell_settlement;
        self.with_risk(symbol, |risk| {
            risk.reset_position();
            risk.last_exit_at = Some(now);
            risk.recently_sold_at = Some(now);
            risk.being_sold_until = Some(now + settlement);
        })
        .await;
    }

    pub async fn record_partial_exit(&self, symbol: &str, now: DateTime<Utc>) {
        let settlement = self.settings.sell_settlement;
        self.with_risk(symbol, |risk| {
            risk.last_partial_exit_at = Some(now);
            risk.being_sold_until = Some(now + settlement);
        })
        .await;
    }

    /// The broker has nothing left to sell; treat the symbol as sold.
    pub async fn mark_sold(&self, symbol: &str, now: DateTime<Utc>) {
        self.with_risk(symbol, |risk| {
            risk.reset_position();
            risk.last_exit_at = Some(now);
            risk.recently_sold_at = Some(now);
        })
        .await;
    }

    pub async fn reset_position(&self, symbol: &str) {
        self.with_risk(symbol, RiskState::reset_position).await;
    }

    /// Drop expired timestamps and forget idle, unlocked symbols.
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let settings = &self.settings;
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, slot| {
            let risk = &mut slot.risk;
            if risk.last_exit_at.map_or(false, |at| now - at >= settings.reentry_cooldown) {
                risk.last_exit_at = None;
            }
            if risk.recently_sold_at.map_or(false, |at| now - at >= settings.sold_grace) {
                risk.recently_sold_at = None;
            }
            if risk.last_entry_attempt_at.map_or(false, |at| now - at >= settings.retry_cooldown) {
                risk.last_entry_attempt_at = None;
            }
            if risk.being_sold_until.map_or(false, |until| now >= until) {
                risk.being_sold_until = None;
            }
            !(risk.is_idle() && slot.lock.try_lock().is_ok())
        });
        before - slots.len()
    }

    /// Wait up to `timeout` for in-flight decisions to release their locks.
    ///
    /// Returns `false` if some symbols were still locked when time ran out.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                if self.locked_symbols().await.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => true,
            Err(_) => {
                let stuck = self.locked_symbols().await;
                warn!(symbols = ?stuck, "Decision locks still held at shutdown");
                false
            }
        }
    }
}

impl Default for ConcurrencyCoordinator {
    fn default() -> Self {
        Self::new(CoordinatorSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> ConcurrencyCoordinator {
        ConcurrencyCoordinator::new(CoordinatorSettings {
            order_interval: Duration::from_millis(20),
            reentry_cooldown: ChronoDuration::seconds(60),
            retry_cooldown: ChronoDuration::seconds(5),
            sell_settlement: ChronoDuration::seconds(5),
            sold_grace: ChronoDuration::seconds(60),
        })
    }

    #[tokio::test]
    async fn test_symbol_lock_is_exclusive() {
        let coord = coordinator();
        let guard = coord.try_lock_symbol("005930").await;
        assert!(guard.is_some());
        assert!(coord.try_lock_symbol("005930").await.is_none());
        assert!(coord.try_lock_symbol("000660").await.is_some());
        assert!(coord.is_locked("005930").await);

        drop(guard);
        assert!(!coord.is_locked("005930").await);
        assert!(coord.try_lock_symbol("005930").await.is_some());
    }

    #[tokio::test]
    async fn test_batch_lock() {
        let coord = coordinator();
        let batch = coord.try_lock_batch();
        assert!(batch.is_some());
        assert!(coord.try_lock_batch().is_none());
        drop(batch);
        assert!(coord.try_lock_batch().is_some());
    }

    #[tokio::test]
    async fn test_cooldown_window() {
        let coord = coordinator();
        let now = Utc::now();

        coord
            .with_risk("A", |r| r.last_exit_at = Some(now - ChronoDuration::seconds(30)))
            .await;
        let remaining = coord.cooldown_remaining("A", now).await;
        assert_eq!(remaining.map(|d| d.num_seconds()), Some(30));

        coord
            .with_risk("A", |r| r.last_exit_at = Some(now - ChronoDuration::seconds(61)))
            .await;
        assert!(coord.cooldown_remaining("A", now).await.is_none());
    }

    #[tokio::test]
    async fn test_full_exit_sets_windows() {
        let coord = coordinator();
        let now = Utc::now();
        coord.with_risk("A", |r| r.high_water_mark = Some(1.into())).await;

        coord.record_full_exit("A", now).await;
        let risk = coord.risk_state("A").await;
        assert_eq!(risk.high_water_mark, None);
        assert!(coord.is_being_sold("A", now).await);
        assert!(!coord.is_being_sold("A", now + ChronoDuration::seconds(6)).await);
        assert!(coord.recently_sold_symbols(now).await.contains("A"));
    }

    #[tokio::test]
    async fn test_prune_keeps_locked_and_active() {
        let coord = coordinator();
        let now = Utc::now();
        coord.record_entry_attempt("old", now - ChronoDuration::seconds(600)).await;
        coord.record_full_exit("fresh", now).await;
        let _guard = coord.try_lock_symbol("busy").await;

        let removed = coord.prune(now).await;
        assert_eq!(removed, 1);
        assert!(coord.cooldown_remaining("fresh", now).await.is_some());
        assert!(coord.is_locked("busy").await);
    }

    #[tokio::test]
    async fn test_drain_times_out_while_locked() {
        let coord = coordinator();
        let guard = coord.try_lock_symbol("A").await;
        assert!(!coord.drain(Duration::from_millis(120)).await);
        drop(guard);
        assert!(coord.drain(Duration::from_millis(120)).await);
    }

    #[tokio::test]
    async fn test_throttle_spaces_submissions() {
        let coord = coordinator();
        let start = Instant::now();
        coord.throttle().await;
        coord.throttle().await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
