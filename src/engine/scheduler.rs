//! Periodic trading cycle
//!
//! One cycle: refresh account → reconcile → exits → entries → housekeeping.
//! A failing step skips the rest of the cycle; nothing here terminates the
//! process.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::coordinator::{ConcurrencyCoordinator, CoordinatorSettings};
use super::reconciler::{HoldingsReconciler, ReconcileContext, ReconcileReport};
use super::retry::RetryPolicy;
use super::session::SessionClock;
use crate::common::errors::{Result, TraderError};
use crate::common::traits::BrokerGateway;
use crate::common::types::{
    AccessToken, Balance, BrokerHolding, Candidate, Holding, OpenOrder, OriginTag, Side,
};
use crate::config::types::AppConfig;
use crate::feed::CandidateBuffer;
use crate::notify::Notifier;
use crate::store::Store;
use crate::strategy::{
    EntryContext, EntryDecisionEngine, EntryOutcome, ExitContext, ExitDecisionEngine,
    ExitOutcome, ExitReason, ExitRules, PositionSizer, RsiGauge,
};

/// What one cycle did
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Why the cycle stopped early, if it did
    pub skipped: Option<String>,
    pub reconcile: ReconcileReport,
    pub exits: Vec<ExitOutcome>,
    pub entries: Vec<EntryOutcome>,
    /// Why entries were suspended this cycle
    pub halted: Option<String>,
    pub pruned: usize,
}

impl CycleReport {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skipped: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn submitted_entries(&self) -> usize {
        self.entries.iter().filter(|o| o.is_submitted()).count()
    }

    fn is_quiet(&self) -> bool {
        self.skipped.is_none()
            && self.reconcile.is_quiet()
            && self.exits.is_empty()
            && self.submitted_entries() == 0
    }
}

struct AccountSnapshot {
    balance: Balance,
    holdings: Vec<BrokerHolding>,
    open_orders: Vec<OpenOrder>,
}

/// Drives the decision engines on a fixed period
pub struct TradingEngine {
    config: AppConfig,
    gateway: Arc<dyn BrokerGateway>,
    candidates: CandidateBuffer,
    coordinator: Arc<ConcurrencyCoordinator>,
    reconciler: Arc<HoldingsReconciler>,
    entry: EntryDecisionEngine,
    exit: ExitDecisionEngine,
    session: SessionClock,
    retry: RetryPolicy,
    store: Option<Store>,
    notifier: Option<Notifier>,
    token: Mutex<Option<AccessToken>>,
    /// Day the liquidation alert was last sent
    liquidated_on: Mutex<Option<NaiveDate>>,
    /// Restored symbols not yet seen held, with the passes they were absent
    restored: Mutex<HashMap<String, u32>>,
}

impl TradingEngine {
    pub fn new(
        config: AppConfig,
        gateway: Arc<dyn BrokerGateway>,
        candidates: CandidateBuffer,
        store: Option<Store>,
        notifier: Option<Notifier>,
    ) -> Result<Self> {
        config.validate()?;

        let coordinator = Arc::new(ConcurrencyCoordinator::new(CoordinatorSettings::from_config(
            &config,
        )));
        let reconciler = Arc::new(HoldingsReconciler::new(&config.reconcile));
        let sizer = PositionSizer::from_config(&config.trading)?;

        let mut entry = EntryDecisionEngine::new(
            gateway.clone(),
            sizer.clone(),
            coordinator.clone(),
            reconciler.clone(),
            config.trading.clone(),
        );
        let indicator = Box::new(RsiGauge::new(
            config.exits.momentum_period,
            config.exits.momentum_overbought,
        ));
        let mut exit = ExitDecisionEngine::new(
            gateway.clone(),
            ExitRules::new(config.exits.clone(), &config.trading),
            sizer,
            coordinator.clone(),
            reconciler.clone(),
            indicator,
        );
        if let Some(store) = &store {
            entry = entry.with_store(store.clone());
            exit = exit.with_store(store.clone());
        }
        if let Some(notifier) = &notifier {
            entry = entry.with_notifier(notifier.clone());
            exit = exit.with_notifier(notifier.clone());
        }

        Ok(Self {
            session: SessionClock::from_config(&config.session)?,
            retry: RetryPolicy::from_config(&config.broker),
            config,
            gateway,
            candidates,
            coordinator,
            reconciler,
            entry,
            exit,
            store,
            notifier,
            token: Mutex::new(None),
            liquidated_on: Mutex::new(None),
            restored: Mutex::new(HashMap::new()),
        })
    }

    pub fn coordinator(&self) -> &Arc<ConcurrencyCoordinator> {
        &self.coordinator
    }

    pub fn reconciler(&self) -> &Arc<HoldingsReconciler> {
        &self.reconciler
    }

    pub fn candidates(&self) -> &CandidateBuffer {
        &self.candidates
    }

    /// Load held-since stamps and high-water marks saved by a previous run.
    pub async fn restore(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let held_since = store.load_held_since().await?;
        let high_prices = store.load_high_prices().await?;
        info!(
            held_since = held_since.len(),
            high_prices = high_prices.len(),
            "Restored persisted position state"
        );
        {
            let mut restored = self.restored.lock().await;
            for symbol in held_since.keys().chain(high_prices.keys()) {
                restored.insert(symbol.clone(), 0);
            }
        }
        self.reconciler.restore_held_since(held_since).await;
        for (symbol, price) in high_prices {
            self.coordinator
                .with_risk(&symbol, |risk| risk.high_water_mark = Some(price))
                .await;
        }
        Ok(())
    }

    /// Age restored state against the reconciled holdings. Symbols absent
    /// for `missing_threshold` passes lose their high-water mark and
    /// held-since stamp.
    async fn prune_restored(&self) {
        let held = self.reconciler.held_symbols().await;
        let threshold = self.config.reconcile.missing_threshold.max(1);
        let stale: Vec<String> = {
            let mut restored = self.restored.lock().await;
            if restored.is_empty() {
                return;
            }
            restored.retain(|symbol, _| !held.contains(symbol));
            let mut stale = Vec::new();
            restored.retain(|symbol, passes| {
                *passes += 1;
                if *passes >= threshold {
                    stale.push(symbol.clone());
                    false
                } else {
                    true
                }
            });
            stale
        };

        for symbol in stale {
            info!(symbol = %symbol, "Discarding restored state, position not held");
            self.coordinator.reset_position(&symbol).await;
            self.reconciler.forget_restored(&symbol).await;
            self.exit.forget(&symbol).await;
            if let Some(store) = &self.store {
                if let Err(e) = store.clear_held_since(&symbol).await {
                    warn!(symbol = %symbol, error = %e, "Failed to clear held-since");
                }
                if let Err(e) = store.clear_high_price(&symbol).await {
                    warn!(symbol = %symbol, error = %e, "Failed to clear high-water mark");
                }
            }
        }
    }

    async fn token(&self) -> Result<AccessToken> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let gateway = self.gateway.clone();
        let token = self
            .retry
            .run("authenticate", || {
                let gateway = gateway.clone();
                async move { gateway.authenticate().await }
            })
            .await?;
        info!("Authenticated with broker");
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn refresh(&self, token: &AccessToken) -> Result<AccountSnapshot> {
        let gateway = &self.gateway;
        let balance = self
            .retry
            .run("balance", move || gateway.get_balance(token))
            .await?;
        let holdings = self
            .retry
            .run("holdings", move || gateway.get_holdings(token))
            .await?;
        let open_orders = self
            .retry
            .run("open orders", move || gateway.get_open_orders(token))
            .await?;
        Ok(AccountSnapshot {
            balance,
            holdings,
            open_orders,
        })
    }

    /// Run one cycle as of `now`.
    #[instrument(skip(self))]
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleReport {
        if !self.session.is_market_open(now) {
            return CycleReport::skipped("market closed");
        }

        let token = match self.token().await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Authentication failed");
                return CycleReport::skipped(format!("authentication failed: {}", e));
            }
        };

        let snapshot = match self.refresh(&token).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if matches!(e, TraderError::Authentication(_)) {
                    self.invalidate_token().await;
                }
                warn!(error = %e, "Account refresh failed, skipping cycle");
                return CycleReport::skipped(format!("refresh failed: {}", e));
            }
        };

        if snapshot.balance.is_empty() && !self.reconciler.holdings().await.is_empty() {
            let reason = TraderError::SuspectData("empty balance with open positions".into());
            warn!(error = %reason, "Skipping cycle");
            return CycleReport::skipped(reason.to_string());
        }

        let reconcile_ctx = ReconcileContext {
            now,
            locked: self.coordinator.locked_symbols().await,
            recently_sold: self.coordinator.recently_sold_symbols(now).await,
        };
        let reconcile = self.reconciler.reconcile(&snapshot.holdings, &reconcile_ctx).await;
        self.after_reconcile(&reconcile).await;
        if reconcile.suspect {
            return CycleReport {
                skipped: Some("suspect holdings snapshot".to_string()),
                reconcile,
                ..Default::default()
            };
        }
        self.prune_restored().await;

        let mut report = CycleReport {
            reconcile,
            ..Default::default()
        };

        let holdings = self.reconciler.holdings().await;
        let equity = PositionSizer::cost_basis_equity(snapshot.balance.deposit, &holdings);
        let ceiling = self.entry.sizer().allocate(equity).ceiling_per_symbol;

        let exit_ctx = ExitContext::new(token.clone(), ceiling, now)
            .with_open_orders(snapshot.open_orders.clone());
        let account_return = account_return_pct(&holdings);

        if self.session.is_liquidation_time(now) {
            report.halted = Some("daily liquidation".to_string());
            if !holdings.is_empty() {
                report.exits = self.exit.liquidate_all(ExitReason::Liquidation, &exit_ctx).await;
            }
            self.announce_liquidation(now).await;
        } else if !holdings.is_empty() && account_return <= self.config.trading.global_loss_rate_pct
        {
            let reason = format!("account return {}% at global loss limit", account_return.round_dp(2));
            error!(%reason, "Liquidating all positions");
            if let Some(notifier) = &self.notifier {
                notifier.critical(format!("Global loss guard: {}", reason));
            }
            report.exits = self.exit.liquidate_all(ExitReason::GlobalLoss, &exit_ctx).await;
            report.halted = Some(reason);
        } else {
            report.exits = self.exit.run_cycle(&exit_ctx).await;
            report.halted = self.profit_target_halt(now).await;
        }

        if report.halted.is_none() {
            let entry_ctx = EntryContext::new(token, snapshot.balance, now)
                .with_open_orders(snapshot.open_orders);
            report.entries = self.run_entries(&entry_ctx).await;
        }

        report.pruned = self.coordinator.prune(now).await;
        report
    }

    /// Persist and announce what reconciliation changed.
    async fn after_reconcile(&self, report: &ReconcileReport) {
        let mut stamped: HashSet<&str> = report.adopted.iter().map(String::as_str).collect();
        stamped.extend(
            report
                .newly_confirmed
                .iter()
                .filter(|o| o.side == Side::Buy)
                .map(|o| o.symbol.as_str()),
        );
        if let Some(store) = &self.store {
            for symbol in stamped {
                if let Some(since) = self.reconciler.holding(symbol).await.and_then(|h| h.held_since) {
                    if let Err(e) = store.save_held_since(symbol, since).await {
                        warn!(symbol = %symbol, error = %e, "Failed to persist held-since");
                    }
                }
            }
        }

        for holding in &report.newly_missing {
            self.coordinator.reset_position(&holding.symbol).await;
            self.exit.forget(&holding.symbol).await;
            if let Some(store) = &self.store {
                if let Err(e) = store.clear_held_since(&holding.symbol).await {
                    warn!(symbol = %holding.symbol, error = %e, "Failed to clear held-since");
                }
                if let Err(e) = store.clear_high_price(&holding.symbol).await {
                    warn!(symbol = %holding.symbol, error = %e, "Failed to clear high-water mark");
                }
            }
            if let Some(notifier) = &self.notifier {
                notifier.info(format!(
                    "{} no longer held at broker (x{} dropped)",
                    holding.symbol, holding.quantity
                ));
            }
        }

        if let Some(notifier) = &self.notifier {
            for order in &report.expired {
                notifier.warning(format!(
                    "{} {} x{} unconfirmed after timeout",
                    order.side, order.symbol, order.quantity
                ));
            }
        }
    }

    async fn announce_liquidation(&self, now: DateTime<Utc>) {
        let today = self.session.local(now).date_naive();
        let mut last = self.liquidated_on.lock().await;
        if *last != Some(today) {
            *last = Some(today);
            info!("Liquidation time reached, entries stopped for the day");
            if let Some(notifier) = &self.notifier {
                notifier.info("Daily liquidation started");
            }
        }
    }

    async fn profit_target_halt(&self, now: DateTime<Utc>) -> Option<String> {
        let target = self.config.trading.target_profit_amount;
        if target <= Decimal::ZERO {
            return None;
        }
        let store = self.store.as_ref()?;
        match store.realized_profit_since(self.session.session_start(now)).await {
            Ok(profit) if profit >= target => Some(format!("daily profit target reached ({})", profit)),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Could not read realized profit");
                None
            }
        }
    }

    async fn run_entries(&self, ctx: &EntryContext) -> Vec<EntryOutcome> {
        let mut outcomes = Vec::new();

        // Add-on tranches for what is already held
        for holding in self.reconciler.holdings().await {
            let candidate = Candidate::new(holding.symbol.clone(), Decimal::ZERO, OriginTag::Rule)
                .with_price(holding.current_price)
                .arrived_at(ctx.now);
            outcomes.push(self.entry.try_enter(&candidate, ctx).await);
        }

        let Some(_batch) = self.coordinator.try_lock_batch() else {
            debug!("Candidate batch already running");
            return outcomes;
        };

        let mut occupied = self.reconciler.held_symbols().await;
        occupied.extend(self.reconciler.pending_buy_symbols().await);
        let free = (self.entry.sizer().target_count() as usize).saturating_sub(occupied.len());
        if free == 0 {
            return outcomes;
        }

        let mut exclude = occupied;
        exclude.extend(self.coordinator.locked_symbols().await);
        let drained = self.candidates.drain_top_n(free, ctx.now, &exclude).await;
        if !drained.is_empty() {
            debug!(count = drained.len(), free, "Evaluating candidates");
        }
        for candidate in drained {
            outcomes.push(self.entry.try_enter(&candidate, ctx).await);
        }
        outcomes
    }

    /// Tick until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.settings.cycle_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_ms = period.as_millis() as u64, "Trading engine started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle_at(Utc::now()).await;
                    if !report.is_quiet() {
                        info!(
                            skipped = ?report.skipped,
                            confirmed = report.reconcile.newly_confirmed.len(),
                            missing = report.reconcile.newly_missing.len(),
                            expired = report.reconcile.expired.len(),
                            exits = report.exits.len(),
                            entries = report.submitted_entries(),
                            "Cycle complete"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Trading engine stopped");
    }

    /// Drain in-flight decisions, then close the gateway and the store.
    pub async fn shutdown(&self) {
        let grace = Duration::from_secs(self.config.settings.shutdown_grace_secs);
        if !self.coordinator.drain(grace).await {
            warn!("In-flight decisions still running at shutdown");
        }
        if let Err(e) = self.gateway.close().await {
            warn!(error = %e, "Gateway close failed");
        }
        if let Some(store) = &self.store {
            store.close().await;
        }
    }
}

/// Unrealized return of all open positions, in percent
pub fn account_return_pct(holdings: &[Holding]) -> Decimal {
    let cost: Decimal = holdings.iter().map(Holding::cost_basis).sum();
    if cost <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let value: Decimal = holdings.iter().map(Holding::market_value).sum();
    (value - cost) / cost * Decimal::ONE_HUNDRED
}
