//! In-memory simulated brokerage account
//!
//! Orders fill at the submitted (limit) or quoted (market) price. With
//! immediate settlement the fill lands in holdings right away; with manual
//! settlement it waits in the open-order book until [`PaperBroker::settle_all`],
//! which is how tests reproduce a broker that reports fills late.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::common::errors::{Result, TraderError};
use crate::common::traits::BrokerGateway;
use crate::common::types::{
    AccessToken, Balance, BrokerHolding, OpenOrder, OrderAck, OrderKind, OrderRequest, Side,
    SIMULATED_SUCCESS_CODE,
};

/// Code returned when a sell exceeds the sellable quantity
pub const NO_SELLABLE_QUANTITY_CODE: &str = "800033";

/// Code returned when cash does not cover a buy
pub const INSUFFICIENT_CASH_CODE: &str = "2000";

#[derive(Debug, Clone)]
struct PaperPosition {
    quantity: u64,
    avg_cost: Decimal,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order_id: String,
    symbol: String,
    side: Side,
    quantity: u64,
    price: Decimal,
}

#[derive(Debug, Default)]
struct Account {
    cash: Decimal,
    positions: HashMap<String, PaperPosition>,
    quotes: HashMap<String, Decimal>,
    open_orders: Vec<PaperOrder>,
    /// Holdings report stays at this snapshot while set
    frozen: Option<Vec<BrokerHolding>>,
    /// Next submission is refused with this code and message
    fail_next: Option<(String, String)>,
    submissions: Vec<OrderRequest>,
}

impl Account {
    fn quote(&self, symbol: &str) -> Option<Decimal> {
        self.quotes.get(symbol).copied()
    }

    fn apply_fill(&mut self, order: &PaperOrder) {
        let notional = order.price * Decimal::from(order.quantity);
        match order.side {
            Side::Buy => {
                let position = self
                    .positions
                    .entry(order.symbol.clone())
                    .or_insert(PaperPosition {
                        quantity: 0,
                        avg_cost: Decimal::ZERO,
                    });
                let cost = position.avg_cost * Decimal::from(position.quantity) + notional;
                position.quantity += order.quantity;
                position.avg_cost = cost / Decimal::from(position.quantity);
                self.quotes.entry(order.symbol.clone()).or_insert(order.price);
            }
            Side::Sell => {
                self.cash += notional;
                if let Some(position) = self.positions.get_mut(&order.symbol) {
                    position.quantity = position.quantity.saturating_sub(order.quantity);
                    if position.quantity == 0 {
                        self.positions.remove(&order.symbol);
                    }
                }
            }
        }
    }

    /// Quantity not already committed to resting sells
    fn sellable(&self, symbol: &str) -> u64 {
        let held = self.positions.get(symbol).map_or(0, |p| p.quantity);
        let resting: u64 = self
            .open_orders
            .iter()
            .filter(|o| o.symbol == symbol && o.side == Side::Sell)
            .map(|o| o.quantity)
            .sum();
        held.saturating_sub(resting)
    }

    fn holdings(&self) -> Vec<BrokerHolding> {
        let mut holdings: Vec<BrokerHolding> = self
            .positions
            .iter()
            .map(|(symbol, p)| BrokerHolding {
                symbol: symbol.clone(),
                quantity: p.quantity,
                avg_cost: p.avg_cost,
                current_price: self.quote(symbol).unwrap_or(p.avg_cost),
            })
            .collect();
        holdings.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        holdings
    }
}

/// Simulated gateway used for paper trading and tests
#[derive(Debug)]
pub struct PaperBroker {
    account: Mutex<Account>,
    initial_cash: Decimal,
    auto_settle: bool,
    next_order_id: AtomicU64,
}

impl PaperBroker {
    /// Account with `cash` and immediate settlement
    pub fn new(cash: Decimal) -> Self {
        Self {
            account: Mutex::new(Account {
                cash,
                ..Default::default()
            }),
            initial_cash: cash,
            auto_settle: true,
            next_order_id: AtomicU64::new(1),
        }
    }

    /// Keep fills in the open-order book until [`settle_all`](Self::settle_all)
    pub fn with_manual_settlement(mut self) -> Self {
        self.auto_settle = false;
        self
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.account.lock().await.quotes.insert(symbol.to_string(), price);
    }

    /// Place a position directly; cash is not charged.
    pub async fn seed_holding(&self, symbol: &str, quantity: u64, avg_cost: Decimal) {
        let mut account = self.account.lock().await;
        account
            .positions
            .insert(symbol.to_string(), PaperPosition { quantity, avg_cost });
        account.quotes.entry(symbol.to_string()).or_insert(avg_cost);
    }

    pub async fn set_cash(&self, cash: Decimal) {
        self.account.lock().await.cash = cash;
    }

    /// Refuse the next submit with `code`.
    pub async fn fail_next_submission(&self, code: &str, message: &str) {
        self.account.lock().await.fail_next = Some((code.to_string(), message.to_string()));
    }

    /// Report the current holdings on every query until [`unfreeze`](Self::unfreeze).
    pub async fn freeze_holdings(&self) {
        let mut account = self.account.lock().await;
        account.frozen = Some(account.holdings());
    }

    pub async fn unfreeze(&self) {
        self.account.lock().await.frozen = None;
    }

    /// Fill every resting order
    pub async fn settle_all(&self) -> usize {
        let mut account = self.account.lock().await;
        let orders = std::mem::take(&mut account.open_orders);
        for order in &orders {
            account.apply_fill(order);
        }
        orders.len()
    }

    /// Every order accepted or refused so far
    pub async fn submissions(&self) -> Vec<OrderRequest> {
        self.account.lock().await.submissions.clone()
    }

    pub async fn cash(&self) -> Decimal {
        self.account.lock().await.cash
    }

    fn next_id(&self) -> String {
        format!("P{:07}", self.next_order_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    async fn authenticate(&self) -> Result<AccessToken> {
        Ok(AccessToken::new("paper-token"))
    }

    async fn get_balance(&self, _token: &AccessToken) -> Result<Balance> {
        let account = self.account.lock().await;
        let market_value: Decimal = account
            .holdings()
            .iter()
            .map(|h| h.current_price * Decimal::from(h.quantity))
            .sum();
        Ok(Balance {
            orderable_cash: account.cash,
            total_eval_amount: account.cash + market_value,
            deposit: account.cash,
        })
    }

    async fn get_holdings(&self, _token: &AccessToken) -> Result<Vec<BrokerHolding>> {
        let account = self.account.lock().await;
        Ok(match &account.frozen {
            Some(snapshot) => snapshot.clone(),
            None => account.holdings(),
        })
    }

    async fn get_open_orders(&self, _token: &AccessToken) -> Result<Vec<OpenOrder>> {
        let account = self.account.lock().await;
        Ok(account
            .open_orders
            .iter()
            .map(|o| OpenOrder {
                symbol: o.symbol.clone(),
                side: o.side,
                quantity: o.quantity,
                order_id: o.order_id.clone(),
            })
            .collect())
    }

    async fn submit_order(&self, order: &OrderRequest, _token: &AccessToken) -> Result<OrderAck> {
        if order.quantity == 0 {
            return Err(TraderError::Internal("order quantity is zero".into()));
        }

        let mut account = self.account.lock().await;
        account.submissions.push(order.clone());

        if let Some((code, message)) = account.fail_next.take() {
            return Ok(OrderAck::failure(code, message));
        }

        let price = match order.kind {
            OrderKind::Limit => order.price,
            OrderKind::Market => account.quote(&order.symbol).unwrap_or(order.price),
        };
        let notional = price * Decimal::from(order.quantity);

        match order.side {
            Side::Buy => {
                if notional > account.cash {
                    return Ok(OrderAck::failure(
                        INSUFFICIENT_CASH_CODE,
                        format!("[{}] insufficient orderable cash", INSUFFICIENT_CASH_CODE),
                    ));
                }
                account.cash -= notional;
            }
            Side::Sell => {
                if order.quantity > account.sellable(&order.symbol) {
                    return Ok(OrderAck::failure(
                        NO_SELLABLE_QUANTITY_CODE,
                        format!("[{}] no sellable quantity", NO_SELLABLE_QUANTITY_CODE),
                    ));
                }
            }
        }

        let paper_order = PaperOrder {
            order_id: self.next_id(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price,
        };
        debug!(
            symbol = %order.symbol,
            side = %order.side,
            quantity = order.quantity,
            price = %price,
            "Paper order accepted"
        );

        let order_id = paper_order.order_id.clone();
        if self.auto_settle {
            account.apply_fill(&paper_order);
        } else {
            account.open_orders.push(paper_order);
        }

        Ok(OrderAck::failure(SIMULATED_SUCCESS_CODE, "paper order accepted").with_order_id(order_id))
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        quantity: u64,
        order_id: &str,
        _token: &AccessToken,
    ) -> Result<OrderAck> {
        let mut account = self.account.lock().await;
        let Some(index) = account
            .open_orders
            .iter()
            .position(|o| o.order_id == order_id && o.symbol == symbol)
        else {
            return Ok(OrderAck::failure("404", format!("order {} not found", order_id)));
        };

        let order = &mut account.open_orders[index];
        let cancelled = quantity.min(order.quantity);
        order.quantity -= cancelled;
        let refund = if order.side == Side::Buy {
            order.price * Decimal::from(cancelled)
        } else {
            Decimal::ZERO
        };
        if order.quantity == 0 {
            account.open_orders.remove(index);
        }
        account.cash += refund;

        Ok(OrderAck::success(format!("cancelled {}", cancelled)))
    }

    async fn get_current_price(&self, symbol: &str, _token: &AccessToken) -> Result<Decimal> {
        self.account
            .lock()
            .await
            .quote(symbol)
            .ok_or_else(|| TraderError::InvalidResponse(format!("no quote for {}", symbol)))
    }

    async fn close(&self) -> Result<()> {
        let account = self.account.lock().await;
        info!(
            cash = %account.cash,
            initial_cash = %self.initial_cash,
            positions = account.positions.len(),
            "Paper account closed"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "paper"
    }
}
