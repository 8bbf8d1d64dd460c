//! Layered exit triggers and sell execution

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::size_calculator::PositionSizer;
use super::traits::BoxedIndicator;
use super::types::{ExitOutcome, ExitReason, ExitSignal};
use crate::common::traits::BrokerGateway;
use crate::common::types::{AccessToken, Holding, OpenOrder, OrderRequest, PendingOrder, RiskState, Side};
use crate::config::types::{ExitConfig, TradingConfig, TrancheStrategy};
use crate::engine::coordinator::ConcurrencyCoordinator;
use crate::engine::reconciler::HoldingsReconciler;
use crate::notify::Notifier;
use crate::store::{Store, TradeRecord};

/// Broker code for "no sellable quantity"
pub const NO_SELLABLE_QUANTITY: &str = "800033";

/// Pure trigger evaluation
///
/// Triggers are checked in priority order and the first that fires wins:
/// ceiling, time exit, trailing stop, tiered stop, momentum fade, then
/// ordinary take-profit and stop-loss.
#[derive(Debug, Clone)]
pub struct ExitRules {
    config: ExitConfig,
    strategy: TrancheStrategy,
    max_tranche: usize,
}

impl ExitRules {
    pub fn new(config: ExitConfig, trading: &TradingConfig) -> Self {
        let max_tranche = config.max_tranche(trading.split_count);
        Self {
            config,
            strategy: trading.strategy,
            max_tranche,
        }
    }

    pub fn max_tranche(&self) -> usize {
        self.max_tranche
    }

    fn partial_allowed(&self, risk: &RiskState, quantity: u64, now: DateTime<Utc>) -> bool {
        let cooldown = ChronoDuration::seconds(
            i64::try_from(self.config.partial_exit_cooldown_secs).unwrap_or(i64::MAX / 1000),
        );
        quantity >= 2
            && risk
                .last_partial_exit_at
                .map_or(true, |at| now - at >= cooldown)
    }

    /// Evaluate one holding. `tranche` is the position's current tranche
    /// index, `filled_pct` its cost basis as a percentage of the ceiling and
    /// `exhausted` the momentum indicator's verdict.
    ///
    /// Updates the trailing high-water mark in `risk` as a side effect.
    pub fn evaluate(
        &self,
        holding: &Holding,
        tranche: usize,
        filled_pct: Decimal,
        risk: &mut RiskState,
        exhausted: bool,
        now: DateTime<Utc>,
    ) -> Option<ExitSignal> {
        let cfg = &self.config;
        let ret = holding.return_pct();
        let price = holding.current_price;

        if cfg.trailing_enabled && (ret >= cfg.trailing_activation_pct || risk.high_water_mark.is_some()) {
            let high = risk.high_water_mark.map_or(price, |h| h.max(price));
            risk.high_water_mark = Some(high);
        }

        if ret >= cfg.upper_limit_pct {
            return Some(ExitSignal::full(ExitReason::Ceiling));
        }

        // no time cut while the position is still being accumulated
        if cfg.time_exit_minutes > 0 && filled_pct >= cfg.time_exit_min_fill_pct {
            let limit = ChronoDuration::minutes(i64::try_from(cfg.time_exit_minutes).unwrap_or(i64::MAX / 60_000));
            let aged = holding.held_since.map_or(false, |since| now - since >= limit);
            if aged && ret < cfg.time_exit_min_return_pct {
                return Some(ExitSignal::full(ExitReason::TimeExit));
            }
        }

        if cfg.trailing_enabled {
            if let Some(high) = risk.high_water_mark.filter(|h| *h > Decimal::ZERO) {
                let retrace = (high - price) / high * Decimal::ONE_HUNDRED;
                if retrace >= cfg.trailing_callback_pct && ret > Decimal::ZERO {
                    return Some(ExitSignal::full(ExitReason::TrailingStop));
                }
            }
        }

        if tranche >= self.max_tranche {
            if ret <= cfg.hard_stop_pct {
                return Some(ExitSignal::full(ExitReason::HardStop));
            }
            if ret <= cfg.soft_stop_pct && self.partial_allowed(risk, holding.quantity, now) {
                return Some(ExitSignal::partial(ExitReason::RiskReduction, holding.quantity / 2));
            }
        }

        if cfg.momentum_exit_enabled
            && exhausted
            && ret > Decimal::ZERO
            && self.partial_allowed(risk, holding.quantity, now)
        {
            return Some(ExitSignal::partial(ExitReason::MomentumFade, holding.quantity / 2));
        }

        if ret >= cfg.take_profit_pct {
            return Some(ExitSignal::full(ExitReason::TakeProfit));
        }
        if self.strategy == TrancheStrategy::BuyOnStrength && ret <= cfg.stop_loss_pct {
            return Some(ExitSignal::full(ExitReason::StopLoss));
        }

        None
    }
}

/// Account view for one exit pass
#[derive(Debug, Clone)]
pub struct ExitContext {
    pub token: AccessToken,
    pub open_orders: Vec<OpenOrder>,
    /// Per-symbol ceiling used to estimate tranche indices
    pub ceiling: Decimal,
    pub now: DateTime<Utc>,
}

impl ExitContext {
    pub fn new(token: AccessToken, ceiling: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            token,
            open_orders: Vec::new(),
            ceiling,
            now,
        }
    }

    pub fn with_open_orders(mut self, orders: Vec<OpenOrder>) -> Self {
        self.open_orders = orders;
        self
    }
}

/// Evaluates every holding once per cycle and sells what triggers
pub struct ExitDecisionEngine {
    gateway: Arc<dyn BrokerGateway>,
    rules: ExitRules,
    sizer: PositionSizer,
    coordinator: Arc<ConcurrencyCoordinator>,
    reconciler: Arc<HoldingsReconciler>,
    indicator: Mutex<BoxedIndicator>,
    store: Option<Store>,
    notifier: Option<Notifier>,
}

impl ExitDecisionEngine {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        rules: ExitRules,
        sizer: PositionSizer,
        coordinator: Arc<ConcurrencyCoordinator>,
        reconciler: Arc<HoldingsReconciler>,
        indicator: BoxedIndicator,
    ) -> Self {
        Self {
            gateway,
            rules,
            sizer,
            coordinator,
            reconciler,
            indicator: Mutex::new(indicator),
            store: None,
            notifier: None,
        }
    }

    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn rules(&self) -> &ExitRules {
        &self.rules
    }

    /// Drop indicator history for a position that went away
    pub async fn forget(&self, symbol: &str) {
        self.indicator.lock().await.forget(symbol);
    }

    /// Evaluate every holding and execute the triggers that fire.
    pub async fn run_cycle(&self, ctx: &ExitContext) -> Vec<ExitOutcome> {
        let mut outcomes = Vec::new();
        for holding in self.reconciler.holdings().await {
            if let Some(signal) = self.check(&holding, ctx).await {
                outcomes.push(self.execute(&holding, signal, ctx).await);
            }
        }
        outcomes
    }

    /// Full exit of every holding, used for end-of-day and the loss guard.
    pub async fn liquidate_all(&self, reason: ExitReason, ctx: &ExitContext) -> Vec<ExitOutcome> {
        let mut outcomes = Vec::new();
        for holding in self.reconciler.holdings().await {
            outcomes.push(self.execute(&holding, ExitSignal::full(reason), ctx).await);
        }
        outcomes
    }

    async fn check(&self, holding: &Holding, ctx: &ExitContext) -> Option<ExitSignal> {
        let symbol = holding.symbol.as_str();
        let exhausted = {
            let mut indicator = self.indicator.lock().await;
            indicator.record(symbol, holding.current_price);
            indicator.is_exhausted(symbol)
        };
        let tranche = self
            .reconciler
            .raise_tranche(symbol, self.sizer.current_tranche(holding, ctx.ceiling))
            .await;
        let filled = if ctx.ceiling > Decimal::ZERO {
            holding.cost_basis() / ctx.ceiling * Decimal::ONE_HUNDRED
        } else {
            Decimal::ONE_HUNDRED
        };

        let (signal, previous_high, high) = self
            .coordinator
            .with_risk(symbol, |risk| {
                let previous = risk.high_water_mark;
                let signal = self.rules.evaluate(holding, tranche, filled, risk, exhausted, ctx.now);
                (signal, previous, risk.high_water_mark)
            })
            .await;

        if high != previous_high {
            if let (Some(store), Some(high)) = (&self.store, high) {
                if let Err(e) = store.save_high_price(symbol, high).await {
                    warn!(symbol = %symbol, error = %e, "Failed to persist high-water mark");
                }
            }
        }
        if let Some(signal) = &signal {
            debug!(
                symbol = %symbol,
                reason = %signal.reason,
                return_pct = %holding.return_pct().round_dp(2),
                "Exit triggered"
            );
        }
        signal
    }

    /// Sell according to `signal`, withdrawing unresolved buys first.
    #[instrument(skip(self, holding, ctx), fields(symbol = %holding.symbol, reason = %signal.reason))]
    pub async fn execute(&self, holding: &Holding, signal: ExitSignal, ctx: &ExitContext) -> ExitOutcome {
        let symbol = holding.symbol.as_str();
        let Some(_guard) = self.coordinator.try_lock_symbol(symbol).await else {
            return ExitOutcome::Busy {
                symbol: symbol.to_string(),
            };
        };

        self.cancel_unresolved_buys(symbol, ctx).await;

        let quantity = signal.quantity(holding.quantity);
        if quantity == 0 {
            return ExitOutcome::Rejected {
                symbol: symbol.to_string(),
                code: "empty".to_string(),
                message: "nothing to sell".to_string(),
            };
        }

        self.coordinator.throttle().await;
        let request = OrderRequest::market_sell(symbol, quantity, holding.current_price);
        info!(quantity, price = %holding.current_price, "Submitting sell");

        let ack = match self.gateway.submit_order(&request, &ctx.token).await {
            Ok(ack) => ack,
            Err(e) => {
                let message = e.to_string();
                if message.contains(NO_SELLABLE_QUANTITY) {
                    return self.remove_ghost(symbol, ctx.now).await;
                }
                warn!(error = %message, "Sell submission failed");
                return self.rejected(symbol, "error", message);
            }
        };
        if !ack.is_success() {
            if ack.code.trim() == NO_SELLABLE_QUANTITY || ack.message.contains(NO_SELLABLE_QUANTITY) {
                return self.remove_ghost(symbol, ctx.now).await;
            }
            warn!(code = %ack.code, message = %ack.message, "Sell rejected");
            return self.rejected(symbol, &ack.code, ack.message);
        }

        let now = ctx.now;
        let order = PendingOrder::new(&request, holding.quantity, now).with_broker_order_id(ack.order_id);
        if signal.is_full() {
            self.reconciler.record_full_exit(order).await;
            self.coordinator.record_full_exit(symbol, now).await;
            self.indicator.lock().await.forget(symbol);
            if let Some(store) = &self.store {
                if let Err(e) = store.clear_held_since(symbol).await {
                    warn!(error = %e, "Failed to clear held-since");
                }
                if let Err(e) = store.clear_high_price(symbol).await {
                    warn!(error = %e, "Failed to clear high-water mark");
                }
            }
        } else {
            self.reconciler.record_partial_exit(order).await;
            self.coordinator.record_partial_exit(symbol, now).await;
        }

        let return_pct = holding.return_pct();
        if let Some(store) = &self.store {
            let record = TradeRecord::sell(
                symbol,
                quantity,
                holding.current_price,
                holding.avg_cost,
                return_pct,
                signal.reason.as_str(),
                now,
            );
            if let Err(e) = store.append_trade(&record).await {
                warn!(error = %e, "Failed to append sell to ledger");
            }
        }
        if let Some(notifier) = &self.notifier {
            notifier.info(format!(
                "SELL {} x{} @ {} ({}, {:+}%)",
                symbol,
                quantity,
                holding.current_price,
                signal.reason,
                return_pct.round_dp(2)
            ));
        }

        ExitOutcome::Sold {
            symbol: symbol.to_string(),
            signal,
            quantity,
            price: holding.current_price,
        }
    }

    async fn cancel_unresolved_buys(&self, symbol: &str, ctx: &ExitContext) {
        let mut order_ids: Vec<(String, u64)> = ctx
            .open_orders
            .iter()
            .filter(|o| o.symbol == symbol && o.side == Side::Buy)
            .map(|o| (o.order_id.clone(), o.quantity))
            .collect();

        for pending in self.reconciler.withdraw_pending_buys(symbol).await {
            if let Some(id) = pending.broker_order_id {
                if !order_ids.iter().any(|(known, _)| *known == id) {
                    order_ids.push((id, pending.quantity));
                }
            }
        }

        for (order_id, quantity) in order_ids {
            self.coordinator.throttle().await;
            match self
                .gateway
                .cancel_order(symbol, quantity, &order_id, &ctx.token)
                .await
            {
                Ok(ack) if ack.is_success() => {
                    info!(order_id = %order_id, "Cancelled unresolved buy before selling");
                }
                Ok(ack) => {
                    warn!(order_id = %order_id, code = %ack.code, message = %ack.message, "Cancel refused");
                }
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "Cancel failed");
                }
            }
        }
    }

    async fn remove_ghost(&self, symbol: &str, now: DateTime<Utc>) -> ExitOutcome {
        warn!(symbol = %symbol, "Broker has nothing to sell, dropping ghost holding");
        self.reconciler.drop_holding(symbol).await;
        self.coordinator.mark_sold(symbol, now).await;
        self.indicator.lock().await.forget(symbol);
        if let Some(store) = &self.store {
            if let Err(e) = store.clear_held_since(symbol).await {
                warn!(error = %e, "Failed to clear held-since");
            }
            if let Err(e) = store.clear_high_price(symbol).await {
                warn!(error = %e, "Failed to clear high-water mark");
            }
        }
        ExitOutcome::GhostRemoved {
            symbol: symbol.to_string(),
        }
    }

    fn rejected(&self, symbol: &str, code: &str, message: String) -> ExitOutcome {
        if let Some(notifier) = &self.notifier {
            notifier.warning(format!("SELL {} rejected [{}]: {}", symbol, code, message));
        }
        ExitOutcome::Rejected {
            symbol: symbol.to_string(),
            code: code.to_string(),
            message,
        }
    }
}
