//! Local holdings book reconciled against broker snapshots

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::common::types::{BrokerHolding, Holding, PendingOrder, PendingStatus, Side};
use crate::config::types::ReconcileConfig;

/// State that lives outside the reconciler but shapes a pass
#[derive(Debug, Clone, Default)]
pub struct ReconcileContext {
    pub now: DateTime<Utc>,
    /// Symbols with a decision in progress
    pub locked: HashSet<String>,
    /// Symbols whose sale was confirmed within the ghost grace window
    pub recently_sold: HashSet<String>,
}

impl ReconcileContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            ..Default::default()
        }
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Pending orders the snapshot now reflects
    pub newly_confirmed: Vec<PendingOrder>,
    /// Holdings dropped after staying absent for enough passes
    pub newly_missing: Vec<Holding>,
    /// Pending orders that timed out unconfirmed
    pub expired: Vec<PendingOrder>,
    /// Recently sold symbols the snapshot still listed
    pub suppressed: Vec<String>,
    /// Symbols that appeared without a local order
    pub adopted: Vec<String>,
    /// The snapshot was empty while local holdings exist
    pub suspect: bool,
}

impl ReconcileReport {
    pub fn is_quiet(&self) -> bool {
        self.newly_confirmed.is_empty()
            && self.newly_missing.is_empty()
            && self.expired.is_empty()
            && self.adopted.is_empty()
            && !self.suspect
    }
}

#[derive(Debug, Default)]
struct Book {
    holdings: HashMap<String, Holding>,
    pending: Vec<PendingOrder>,
    missing_counts: HashMap<String, u32>,
    /// Held-since stamps restored from storage for positions not yet seen
    known_since: HashMap<String, DateTime<Utc>>,
}

impl Book {
    fn has_pending(&self, symbol: &str, side: Side) -> bool {
        self.pending
            .iter()
            .any(|p| p.symbol == symbol && p.side == side)
    }
}

/// Sole owner of the local holdings view
///
/// Entry and exit record what they submit here; each cycle the broker's
/// snapshot confirms or expires those pending orders and refreshes
/// quantities and prices.
#[derive(Debug)]
pub struct HoldingsReconciler {
    book: Mutex<Book>,
    pending_timeout: ChronoDuration,
    missing_threshold: u32,
}

impl HoldingsReconciler {
    pub fn new(config: &ReconcileConfig) -> Self {
        Self {
            book: Mutex::new(Book::default()),
            pending_timeout: ChronoDuration::seconds(
                i64::try_from(config.pending_timeout_secs).unwrap_or(i64::MAX / 1000),
            ),
            missing_threshold: config.missing_threshold.max(1),
        }
    }

    /// Seed held-since stamps persisted by a previous run.
    pub async fn restore_held_since(&self, stamps: HashMap<String, DateTime<Utc>>) {
        let mut book = self.book.lock().await;
        for (symbol, since) in stamps {
            match book.holdings.get_mut(&symbol) {
                Some(holding) => holding.held_since = Some(since),
                None => {
                    book.known_since.insert(symbol, since);
                }
            }
        }
    }

    pub async fn holdings(&self) -> Vec<Holding> {
        let book = self.book.lock().await;
        let mut holdings: Vec<Holding> = book.holdings.values().cloned().collect();
        holdings.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        holdings
    }

    pub async fn holding(&self, symbol: &str) -> Option<Holding> {
        self.book.lock().await.holdings.get(symbol).cloned()
    }

    pub async fn held_symbols(&self) -> HashSet<String> {
        self.book.lock().await.holdings.keys().cloned().collect()
    }

    pub async fn pending_orders(&self) -> Vec<PendingOrder> {
        self.book.lock().await.pending.clone()
    }

    pub async fn has_pending(&self, symbol: &str, side: Side) -> bool {
        self.book.lock().await.has_pending(symbol, side)
    }

    /// Symbols with an unresolved buy; they occupy a slot like a holding
    pub async fn pending_buy_symbols(&self) -> HashSet<String> {
        let book = self.book.lock().await;
        book.pending
            .iter()
            .filter(|p| p.side == Side::Buy)
            .map(|p| p.symbol.clone())
            .collect()
    }

    /// Notional of buys submitted at or after `since`
    pub async fn pending_buy_notional_since(&self, since: DateTime<Utc>) -> Decimal {
        let book = self.book.lock().await;
        book.pending
            .iter()
            .filter(|p| p.side == Side::Buy && p.submitted_at >= since)
            .map(PendingOrder::notional)
            .sum()
    }

    /// Track an accepted order until the broker reflects it.
    pub async fn record_submission(&self, order: PendingOrder) {
        debug!(
            symbol = %order.symbol,
            side = %order.side,
            quantity = order.quantity,
            id = %order.correlation_id,
            "Pending order recorded"
        );
        self.book.lock().await.pending.push(order);
    }

    /// Remove and return every unresolved buy for `symbol`.
    pub async fn withdraw_pending_buys(&self, symbol: &str) -> Vec<PendingOrder> {
        let mut book = self.book.lock().await;
        let (withdrawn, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut book.pending)
            .into_iter()
            .partition(|p| p.symbol == symbol && p.side == Side::Buy);
        book.pending = kept;
        withdrawn
    }

    /// A full sell went out: the holding leaves the book and the sell is
    /// tracked until the broker stops listing the shares.
    pub async fn record_full_exit(&self, order: PendingOrder) -> Option<Holding> {
        let mut book = self.book.lock().await;
        let removed = book.holdings.remove(&order.symbol);
        book.missing_counts.remove(&order.symbol);
        book.known_since.remove(&order.symbol);
        book.pending.push(order);
        removed
    }

    /// A partial sell went out: decrement locally, keep tranche and age.
    pub async fn record_partial_exit(&self, order: PendingOrder) -> Option<Holding> {
        let mut book = self.book.lock().await;
        let sold = order.quantity;
        let updated = book.holdings.get_mut(&order.symbol).map(|holding| {
            holding.quantity = holding.quantity.saturating_sub(sold);
            holding.clone()
        });
        if updated.as_ref().map_or(false, |h| h.quantity == 0) {
            book.holdings.remove(&order.symbol);
        }
        book.pending.push(order);
        updated
    }

    /// Discard a restored held-since stamp that no holding claimed.
    pub async fn forget_restored(&self, symbol: &str) -> bool {
        self.book.lock().await.known_since.remove(symbol).is_some()
    }

    /// Forget a holding the broker says does not exist.
    pub async fn drop_holding(&self, symbol: &str) -> Option<Holding> {
        let mut book = self.book.lock().await;
        book.missing_counts.remove(symbol);
        book.known_since.remove(symbol);
        book.pending.retain(|p| p.symbol != symbol);
        book.holdings.remove(symbol)
    }

    /// Record the tranche a holding has reached. The stored index only
    /// moves up; the value in effect is returned.
    pub async fn raise_tranche(&self, symbol: &str, tranche: usize) -> usize {
        match self.book.lock().await.holdings.get_mut(symbol) {
            Some(holding) => {
                holding.tranche_index = holding.tranche_index.max(tranche);
                holding.tranche_index
            }
            None => tranche,
        }
    }

    pub async fn set_held_since(&self, symbol: &str, since: DateTime<Utc>) {
        if let Some(holding) = self.book.lock().await.holdings.get_mut(symbol) {
            holding.held_since = Some(since);
        }
    }

    /// Merge a broker snapshot into the local book.
    pub async fn reconcile(
        &self,
        snapshot: &[BrokerHolding],
        ctx: &ReconcileContext,
    ) -> ReconcileReport {
        let now = ctx.now;
        let reported: HashMap<&str, &BrokerHolding> = snapshot
            .iter()
            .filter(|h| h.quantity > 0)
            .map(|h| (h.symbol.as_str(), h))
            .collect();

        let mut book = self.book.lock().await;
        let mut report = ReconcileReport {
            suspect: reported.is_empty() && !book.holdings.is_empty(),
            ..Default::default()
        };
        if report.suspect {
            warn!(
                local = book.holdings.len(),
                "Broker reported no holdings while positions are open"
            );
        }

        // Pending orders first so confirmed buys can seed the tranche index.
        let mut still_pending = Vec::with_capacity(book.pending.len());
        for mut order in std::mem::take(&mut book.pending) {
            let reported_qty = reported.get(order.symbol.as_str()).map_or(0, |h| h.quantity);
            let sell_blind = report.suspect && order.side == Side::Sell;
            if !sell_blind && order.is_reflected_by(reported_qty) {
                order.status = PendingStatus::Confirmed;
                report.newly_confirmed.push(order);
            } else if now - order.submitted_at >= self.pending_timeout {
                order.status = PendingStatus::Expired;
                warn!(
                    symbol = %order.symbol,
                    side = %order.side,
                    quantity = order.quantity,
                    "Pending order expired unconfirmed"
                );
                report.expired.push(order);
            } else {
                still_pending.push(order);
            }
        }
        book.pending = still_pending;

        let confirmed_tranches: HashMap<&str, usize> = report
            .newly_confirmed
            .iter()
            .filter(|o| o.side == Side::Buy)
            .map(|o| (o.symbol.as_str(), o.target_tranche))
            .collect();
        let confirmed_buys: HashSet<&str> = confirmed_tranches.keys().copied().collect();

        for (symbol, broker) in &reported {
            let pending_buy = book.has_pending(symbol, Side::Buy);
            if ctx.recently_sold.contains(*symbol) && !pending_buy && !confirmed_buys.contains(symbol)
            {
                debug!(symbol = %symbol, "Ignoring recently sold symbol in snapshot");
                report.suppressed.push(symbol.to_string());
                continue;
            }
            book.missing_counts.remove(*symbol);
            let pending_sell = book.has_pending(symbol, Side::Sell);

            if let Some(holding) = book.holdings.get_mut(*symbol) {
                holding.quantity = if pending_sell {
                    holding.quantity.min(broker.quantity)
                } else {
                    broker.quantity
                };
                holding.avg_cost = broker.avg_cost;
                holding.current_price = broker.current_price;
                if let Some(target) = confirmed_tranches.get(symbol) {
                    holding.tranche_index = holding.tranche_index.max(*target);
                }
                continue;
            }

            let since = book.known_since.remove(*symbol).unwrap_or(now);
            let mut holding = Holding::from_broker(broker, Some(since));
            match confirmed_tranches.get(symbol) {
                Some(target) => holding.tranche_index = *target,
                None if !pending_buy => {
                    info!(symbol = %symbol, quantity = broker.quantity, "Adopted holding");
                    report.adopted.push(symbol.to_string());
                }
                None => {}
            }
            book.holdings.insert(symbol.to_string(), holding);
        }

        let absent: Vec<String> = book
            .holdings
            .keys()
            .filter(|symbol| !reported.contains_key(symbol.as_str()))
            .cloned()
            .collect();
        for symbol in absent {
            if book.has_pending(&symbol, Side::Buy)
                || book.has_pending(&symbol, Side::Sell)
                || ctx.locked.contains(&symbol)
            {
                continue;
            }
            let count = book.missing_counts.entry(symbol.clone()).or_insert(0);
            *count += 1;
            if *count >= self.missing_threshold {
                book.missing_counts.remove(&symbol);
                if let Some(holding) = book.holdings.remove(&symbol) {
                    info!(symbol = %symbol, "Holding gone from broker, treating as exited");
                    report.newly_missing.push(holding);
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::OrderRequest;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn reconciler() -> HoldingsReconciler {
        HoldingsReconciler::new(&ReconcileConfig::default())
    }

    fn broker(symbol: &str, quantity: u64) -> BrokerHolding {
        BrokerHolding {
            symbol: symbol.into(),
            quantity,
            avg_cost: dec!(1000),
            current_price: dec!(1010),
        }
    }

    #[tokio::test]
    async fn test_adopts_unknown_holding() {
        let rec = reconciler();
        let report = rec
            .reconcile(&[broker("A", 5)], &ReconcileContext::at(Utc::now()))
            .await;
        assert_eq!(report.adopted, vec!["A".to_string()]);
        assert_eq!(rec.holding("A").await.map(|h| h.quantity), Some(5));
    }

    #[tokio::test]
    async fn test_buy_confirmation_sets_tranche() {
        let rec = reconciler();
        let now = Utc::now();
        let order = PendingOrder::new(&OrderRequest::limit_buy("A", 5, dec!(1000)), 0, now)
            .with_target_tranche(1);
        rec.record_submission(order).await;

        let report = rec.reconcile(&[], &ReconcileContext::at(now)).await;
        assert!(report.newly_confirmed.is_empty());
        assert!(!report.suspect);

        let report = rec.reconcile(&[broker("A", 5)], &ReconcileContext::at(now)).await;
        assert_eq!(report.newly_confirmed.len(), 1);
        assert!(report.adopted.is_empty());
        let holding = rec.holding("A").await.unwrap();
        assert_eq!(holding.tranche_index, 1);
        assert!(rec.pending_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_pending_expires_after_timeout() {
        let rec = reconciler();
        let then = Utc::now() - ChronoDuration::seconds(61);
        rec.record_submission(PendingOrder::new(
            &OrderRequest::limit_buy("A", 5, dec!(1000)),
            0,
            then,
        ))
        .await;

        let report = rec.reconcile(&[], &ReconcileContext::at(Utc::now())).await;
        assert_eq!(report.expired.len(), 1);
        assert_eq!(report.expired[0].status, PendingStatus::Expired);
        assert!(!rec.has_pending("A", Side::Buy).await);
    }

    #[tokio::test]
    async fn test_missing_needs_consecutive_passes() {
        let rec = reconciler();
        let now = Utc::now();
        rec.reconcile(&[broker("A", 5), broker("B", 1)], &ReconcileContext::at(now))
            .await;

        for _ in 0..2 {
            let report = rec.reconcile(&[broker("B", 1)], &ReconcileContext::at(now)).await;
            assert!(report.newly_missing.is_empty());
        }
        // reappearing resets the count
        rec.reconcile(&[broker("A", 5), broker("B", 1)], &ReconcileContext::at(now))
            .await;
        for _ in 0..2 {
            rec.reconcile(&[broker("B", 1)], &ReconcileContext::at(now)).await;
        }
        let report = rec.reconcile(&[broker("B", 1)], &ReconcileContext::at(now)).await;
        assert_eq!(report.newly_missing.len(), 1);
        assert_eq!(report.newly_missing[0].symbol, "A");
    }

    #[tokio::test]
    async fn test_locked_symbol_never_counted_missing() {
        let rec = reconciler();
        let now = Utc::now();
        rec.reconcile(&[broker("A", 5), broker("B", 1)], &ReconcileContext::at(now))
            .await;

        let mut ctx = ReconcileContext::at(now);
        ctx.locked.insert("A".into());
        for _ in 0..5 {
            let report = rec.reconcile(&[broker("B", 1)], &ctx).await;
            assert!(report.newly_missing.is_empty());
        }
        assert!(rec.holding("A").await.is_some());
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_suspect_and_keeps_sells_open() {
        let rec = reconciler();
        let now = Utc::now();
        rec.reconcile(&[broker("A", 5), broker("B", 2)], &ReconcileContext::at(now))
            .await;
        let sell = PendingOrder::new(&OrderRequest::market_sell("A", 5, dec!(1010)), 5, now);
        rec.record_full_exit(sell).await;

        let report = rec.reconcile(&[], &ReconcileContext::at(now)).await;
        assert!(report.suspect);
        assert!(report.newly_confirmed.is_empty());
        assert!(rec.has_pending("A", Side::Sell).await);
    }

    #[tokio::test]
    async fn test_recently_sold_symbol_not_readopted() {
        let rec = reconciler();
        let now = Utc::now();
        rec.reconcile(&[broker("A", 5)], &ReconcileContext::at(now)).await;
        let sell = PendingOrder::new(&OrderRequest::market_sell("A", 5, dec!(1010)), 5, now);
        rec.record_full_exit(sell).await;
        assert!(rec.holding("A").await.is_none());

        let mut ctx = ReconcileContext::at(now + ChronoDuration::seconds(10));
        ctx.recently_sold.insert("A".into());
        let report = rec.reconcile(&[broker("A", 5)], &ctx).await;
        assert_eq!(report.suppressed, vec!["A".to_string()]);
        assert!(report.adopted.is_empty());
        assert!(rec.holding("A").await.is_none());
    }

    #[tokio::test]
    async fn test_partial_exit_not_undone_by_stale_snapshot() {
        let rec = reconciler();
        let now = Utc::now();
        rec.reconcile(&[broker("A", 10)], &ReconcileContext::at(now)).await;
        let sell = PendingOrder::new(&OrderRequest::market_sell("A", 5, dec!(1010)), 10, now);
        rec.record_partial_exit(sell).await;

        rec.reconcile(&[broker("A", 10)], &ReconcileContext::at(now)).await;
        assert_eq!(rec.holding("A").await.map(|h| h.quantity), Some(5));

        let report = rec.reconcile(&[broker("A", 5)], &ReconcileContext::at(now)).await;
        assert_eq!(report.newly_confirmed.len(), 1);
        assert_eq!(rec.holding("A").await.map(|h| h.quantity), Some(5));
    }

    #[tokio::test]
    async fn test_restored_held_since_used_on_adoption() {
        let rec = reconciler();
        let since = Utc::now() - ChronoDuration::minutes(45);
        rec.restore_held_since(HashMap::from([("A".to_string(), since)]))
            .await;
        rec.reconcile(&[broker("A", 3)], &ReconcileContext::at(Utc::now()))
            .await;
        assert_eq!(rec.holding("A").await.and_then(|h| h.held_since), Some(since));
    }
}
