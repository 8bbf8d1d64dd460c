//! Entry decisions: guards, tranche targeting and buy submission

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::size_calculator::PositionSizer;
use super::types::{EntryOutcome, SkipReason};
use crate::common::traits::BrokerGateway;
use crate::common::types::{AccessToken, Balance, Candidate, OpenOrder, OrderRequest, PendingOrder, Side};
use crate::config::types::{TradingConfig, TrancheStrategy};
use crate::engine::coordinator::ConcurrencyCoordinator;
use crate::engine::reconciler::HoldingsReconciler;
use crate::notify::Notifier;
use crate::store::{Store, TradeRecord};

/// Account view an entry attempt works against
#[derive(Debug, Clone)]
pub struct EntryContext {
    pub token: AccessToken,
    pub balance: Balance,
    pub open_orders: Vec<OpenOrder>,
    /// When `balance` was fetched
    pub as_of: DateTime<Utc>,
    pub now: DateTime<Utc>,
    /// Set when entries are suspended for the whole account
    pub halt: Option<String>,
}

impl EntryContext {
    pub fn new(token: AccessToken, balance: Balance, now: DateTime<Utc>) -> Self {
        Self {
            token,
            balance,
            open_orders: Vec::new(),
            as_of: now,
            now,
            halt: None,
        }
    }

    pub fn with_open_orders(mut self, orders: Vec<OpenOrder>) -> Self {
        self.open_orders = orders;
        self
    }

    pub fn halted(mut self, reason: impl Into<String>) -> Self {
        self.halt = Some(reason.into());
        self
    }

    fn has_open_order(&self, symbol: &str, side: Side) -> bool {
        self.open_orders
            .iter()
            .any(|o| o.symbol == symbol && o.side == side)
    }
}

/// Decides whether and how much to buy for a candidate
pub struct EntryDecisionEngine {
    gateway: Arc<dyn BrokerGateway>,
    sizer: PositionSizer,
    coordinator: Arc<ConcurrencyCoordinator>,
    reconciler: Arc<HoldingsReconciler>,
    config: TradingConfig,
    store: Option<Store>,
    notifier: Option<Notifier>,
}

impl EntryDecisionEngine {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        sizer: PositionSizer,
        coordinator: Arc<ConcurrencyCoordinator>,
        reconciler: Arc<HoldingsReconciler>,
        config: TradingConfig,
    ) -> Self {
        Self {
            gateway,
            sizer,
            coordinator,
            reconciler,
            config,
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

    pub fn sizer(&self) -> &PositionSizer {
        &self.sizer
    }

    /// Try to open or add to a position in `candidate.symbol`.
    ///
    /// Guards run in a fixed order and the first one that fails decides
    /// the skip reason. Nothing is retried within one call.
    #[instrument(skip(self, candidate, ctx), fields(symbol = %candidate.symbol))]
    pub async fn try_enter(&self, candidate: &Candidate, ctx: &EntryContext) -> EntryOutcome {
        match self.evaluate(candidate, ctx).await {
            Ok(order) => EntryOutcome::Submitted(order),
            Err(reason) => {
                debug!(reason = %reason, "Entry skipped");
                EntryOutcome::Skipped(reason)
            }
        }
    }

    async fn evaluate(
        &self,
        candidate: &Candidate,
        ctx: &EntryContext,
    ) -> std::result::Result<PendingOrder, SkipReason> {
        let symbol = candidate.symbol.as_str();
        let now = ctx.now;

        if let Some(why) = &ctx.halt {
            return Err(SkipReason::TradingHalted(why.clone()));
        }
        if let Some(remaining) = self.coordinator.cooldown_remaining(symbol, now).await {
            return Err(SkipReason::Cooldown {
                remaining_secs: remaining.num_seconds().max(1),
            });
        }
        if self.coordinator.in_retry_cooldown(symbol, now).await {
            return Err(SkipReason::RetryCooldown);
        }
        if self.reconciler.has_pending(symbol, Side::Sell).await
            || self.coordinator.is_being_sold(symbol, now).await
            || ctx.has_open_order(symbol, Side::Sell)
        {
            return Err(SkipReason::PendingSell);
        }

        // Held until this call returns; the pending order is recorded first.
        let _guard = self
            .coordinator
            .try_lock_symbol(symbol)
            .await
            .ok_or(SkipReason::SymbolBusy)?;

        if self.reconciler.has_pending(symbol, Side::Buy).await
            || ctx.has_open_order(symbol, Side::Buy)
        {
            return Err(SkipReason::PendingBuy);
        }

        let holdings = self.reconciler.holdings().await;
        let equity = PositionSizer::cost_basis_equity(ctx.balance.deposit, &holdings);
        let allocation = self.sizer.allocate(equity);
        if !allocation.can_enter() {
            return Err(SkipReason::NoAllocation);
        }
        let ceiling = allocation.ceiling_per_symbol;

        let price = self.resolve_price(candidate, &ctx.token).await?;
        let held = holdings.iter().find(|h| h.symbol == symbol);

        let (current, deployed, baseline) = match held {
            None => {
                let mut occupied = self.reconciler.pending_buy_symbols().await;
                occupied.extend(holdings.iter().map(|h| h.symbol.clone()));
                if occupied.len() >= self.sizer.target_count() as usize {
                    return Err(SkipReason::SlotsFull);
                }
                if price > ceiling / Decimal::TWO {
                    return Err(SkipReason::PriceTooHigh);
                }
                (0, Decimal::ZERO, 0)
            }
            Some(holding) => {
                if self.coordinator.risk_state(symbol).await.last_partial_exit_at.is_some() {
                    return Err(SkipReason::PartiallyExited);
                }
                let current = self
                    .reconciler
                    .raise_tranche(symbol, self.sizer.current_tranche(holding, ceiling))
                    .await;
                let deployed = holding.cost_basis();
                if current >= self.sizer.plan().len()
                    || deployed >= ceiling * self.config.max_fill_ratio_pct / Decimal::ONE_HUNDRED
                {
                    return Err(SkipReason::FullyBuilt);
                }
                (current, deployed, holding.quantity)
            }
        };

        let target = match held {
            None => 1,
            Some(holding) => {
                let mut marked = holding.clone();
                marked.current_price = price;
                self.target_tranche(current, marked.return_pct())
            }
        };
        if target <= current {
            return Err(SkipReason::NoTrancheAdvance);
        }

        let want = allocation.target_notional(target) - deployed;
        if want <= Decimal::ZERO {
            return Err(SkipReason::CeilingReached);
        }
        let min_order = self.config.min_order_amount;
        let room = ceiling - deployed;
        if room < min_order {
            return Err(SkipReason::BelowMinimum);
        }
        let cash = (ctx.balance.orderable_cash
            - self.reconciler.pending_buy_notional_since(ctx.as_of).await)
            .max(Decimal::ZERO);
        let notional = want.max(min_order).min(room).min(cash);
        if notional < min_order || notional <= Decimal::ZERO {
            return Err(SkipReason::InsufficientCash);
        }

        let quantity = (notional / price).floor().to_u64().unwrap_or(0);
        if quantity == 0 {
            return Err(SkipReason::ZeroQuantity);
        }

        self.coordinator.record_entry_attempt(symbol, now).await;
        self.coordinator.throttle().await;

        let request = OrderRequest::limit_buy(symbol, quantity, price);
        info!(
            quantity,
            price = %price,
            tranche = target,
            ceiling = %ceiling.round_dp(0),
            origin = %candidate.origin,
            "Submitting buy"
        );

        let ack = match self.gateway.submit_order(&request, &ctx.token).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(error = %e, "Buy submission failed");
                return Err(self.rejected(symbol, "error", e.to_string()));
            }
        };
        if !ack.is_success() {
            warn!(code = %ack.code, message = %ack.message, "Buy rejected");
            return Err(self.rejected(symbol, &ack.code, ack.message));
        }

        let order = PendingOrder::new(&request, baseline, now)
            .with_target_tranche(target)
            .with_broker_order_id(ack.order_id);
        self.reconciler.record_submission(order.clone()).await;

        if let Some(store) = &self.store {
            let reason = format!("tranche-{}", target);
            let record = TradeRecord::buy(symbol, quantity, price, &reason, now);
            if let Err(e) = store.append_trade(&record).await {
                warn!(error = %e, "Failed to append buy to ledger");
            }
        }
        if let Some(notifier) = &self.notifier {
            notifier.info(format!(
                "BUY {} x{} @ {} (tranche {}/{})",
                symbol,
                quantity,
                price,
                target,
                self.sizer.plan().len()
            ));
        }

        Ok(order)
    }

    async fn resolve_price(
        &self,
        candidate: &Candidate,
        token: &AccessToken,
    ) -> std::result::Result<Decimal, SkipReason> {
        if let Some(price) = candidate.last_price.filter(|p| *p > Decimal::ZERO) {
            return Ok(price);
        }
        match self.gateway.get_current_price(&candidate.symbol, token).await {
            Ok(price) if price > Decimal::ZERO => Ok(price),
            Ok(_) => Err(SkipReason::NoPrice),
            Err(e) => {
                debug!(error = %e, "Price lookup failed");
                Err(SkipReason::NoPrice)
            }
        }
    }

    /// Tranche index the position should reach at `return_pct`.
    ///
    /// Buy-on-weakness adds one tranche per full step of loss, buy-on-strength
    /// one per full step of gain. Capped at the plan length.
    pub fn target_tranche(&self, current: usize, return_pct: Decimal) -> usize {
        let step = self.config.step_rate_pct;
        if step <= Decimal::ZERO {
            return current;
        }
        let steps = match self.config.strategy {
            TrancheStrategy::BuyOnWeakness if return_pct < Decimal::ZERO => {
                (return_pct.abs() / step).floor()
            }
            TrancheStrategy::BuyOnStrength if return_pct >= step => (return_pct / step).floor(),
            _ => Decimal::ZERO,
        };
        let steps = steps.to_usize().unwrap_or(0);
        current.saturating_add(steps).min(self.sizer.plan().len())
    }

    fn rejected(&self, symbol: &str, code: &str, message: String) -> SkipReason {
        if let Some(notifier) = &self.notifier {
            notifier.warning(format!("BUY {} rejected [{}]: {}", symbol, code, message));
        }
        SkipReason::OrderRejected {
            code: code.to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperBroker;
    use crate::config::types::ReconcileConfig;
    use crate::engine::coordinator::CoordinatorSettings;
    use crate::strategy::size_calculator::TranchePlan;
    use rust_decimal_macros::dec;

    fn engine(strategy: TrancheStrategy, step: Decimal) -> EntryDecisionEngine {
        let config = TradingConfig {
            strategy,
            step_rate_pct: step,
            ..TradingConfig::default()
        };
        let sizer = PositionSizer::new(dec!(0.7), 2, TranchePlan::geometric(5).unwrap());
        EntryDecisionEngine::new(
            Arc::new(PaperBroker::new(dec!(1000000))),
            sizer,
            Arc::new(ConcurrencyCoordinator::new(CoordinatorSettings::default())),
            Arc::new(HoldingsReconciler::new(&ReconcileConfig::default())),
            config,
        )
    }

    #[test]
    fn test_weakness_advances_on_loss() {
        let engine = engine(TrancheStrategy::BuyOnWeakness, dec!(3));
        assert_eq!(engine.target_tranche(1, dec!(-9)), 4);
        assert_eq!(engine.target_tranche(1, dec!(-2.9)), 1);
        assert_eq!(engine.target_tranche(1, dec!(5)), 1);
        // capped at plan length
        assert_eq!(engine.target_tranche(3, dec!(-30)), 5);
    }

    #[test]
    fn test_strength_advances_on_gain() {
        let engine = engine(TrancheStrategy::BuyOnStrength, dec!(3));
        assert_eq!(engine.target_tranche(1, dec!(3)), 2);
        assert_eq!(engine.target_tranche(1, dec!(7)), 3);
        assert_eq!(engine.target_tranche(1, dec!(2.99)), 1);
        assert_eq!(engine.target_tranche(1, dec!(-9)), 1);
    }
}
