//! Domain types shared by the feed, the decision engines and the gateways

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status code the broker returns for an accepted request
pub const SUCCESS_CODE: &str = "0";

/// Alternate success code emitted by simulated brokers
pub const SIMULATED_SUCCESS_CODE: &str = "SUCCESS";

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Where a candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OriginTag {
    /// Broker-side condition search
    #[default]
    Rule,
    /// Externally scored recommendation
    Model,
}

impl std::fmt::Display for OriginTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OriginTag::Rule => write!(f, "rule"),
            OriginTag::Model => write!(f, "model"),
        }
    }
}

/// A symbol proposed for entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub symbol: String,
    /// Momentum % combined with execution strength
    pub rank_score: Decimal,
    /// Last traded price reported alongside the signal, if any
    #[serde(default)]
    pub last_price: Option<Decimal>,
    pub arrived_at: DateTime<Utc>,
    #[serde(default)]
    pub origin: OriginTag,
}

impl Candidate {
    pub fn new(symbol: impl Into<String>, rank_score: Decimal, origin: OriginTag) -> Self {
        Self {
            symbol: symbol.into(),
            rank_score,
            last_price: None,
            arrived_at: Utc::now(),
            origin,
        }
    }

    /// Rank score from a change rate and an execution strength.
    ///
    /// Strength is quoted around 100 (buyers == sellers); a missing value
    /// counts as neutral.
    pub fn score(change_pct: Decimal, strength_pct: Option<Decimal>) -> Decimal {
        let strength = strength_pct.unwrap_or(Decimal::ONE_HUNDRED);
        change_pct + strength / Decimal::ONE_HUNDRED
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.last_price = Some(price);
        self
    }

    pub fn arrived_at(mut self, at: DateTime<Utc>) -> Self {
        self.arrived_at = at;
        self
    }
}

/// Bearer token issued by the broker
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AccessToken(***)")
    }
}

/// Account cash view
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Balance {
    /// Cash available for new orders
    pub orderable_cash: Decimal,
    /// Mark-to-market value of the whole account
    pub total_eval_amount: Decimal,
    /// Deposited cash
    pub deposit: Decimal,
}

impl Balance {
    /// All-zero responses are what a failing account endpoint returns.
    pub fn is_empty(&self) -> bool {
        self.orderable_cash.is_zero() && self.total_eval_amount.is_zero() && self.deposit.is_zero()
    }
}

/// One position as reported by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerHolding {
    pub symbol: String,
    pub quantity: u64,
    pub avg_cost: Decimal,
    pub current_price: Decimal,
}

/// An order resting at the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub order_id: String,
}

/// How the order is priced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Limit,
    Market,
}

/// Order submission payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    /// Limit price; market orders carry the reference price for bookkeeping
    pub price: Decimal,
    pub kind: OrderKind,
}

impl OrderRequest {
    pub fn limit_buy(symbol: impl Into<String>, quantity: u64, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side: Side::Buy,
            quantity,
            price,
            kind: OrderKind::Limit,
        }
    }

    pub fn market_sell(symbol: impl Into<String>, quantity: u64, reference_price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side: Side::Sell,
            quantity,
            price: reference_price,
            kind: OrderKind::Market,
        }
    }

    pub fn notional(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }
}

/// Broker reply to submit/cancel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub code: String,
    pub message: String,
    /// Order number assigned by the broker, when returned
    #[serde(default)]
    pub order_id: Option<String>,
}

impl OrderAck {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            code: SUCCESS_CODE.to_string(),
            message: message.into(),
            order_id: None,
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            order_id: None,
        }
    }

    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn is_success(&self) -> bool {
        let code = self.code.trim();
        code == SUCCESS_CODE || code.eq_ignore_ascii_case(SIMULATED_SUCCESS_CODE)
    }
}

/// Local view of an open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub quantity: u64,
    pub avg_cost: Decimal,
    pub current_price: Decimal,
    /// Entry tranches executed since the last full exit
    pub tranche_index: usize,
    pub held_since: Option<DateTime<Utc>>,
}

impl Holding {
    pub fn from_broker(report: &BrokerHolding, held_since: Option<DateTime<Utc>>) -> Self {
        Self {
            symbol: report.symbol.clone(),
            quantity: report.quantity,
            avg_cost: report.avg_cost,
            current_price: report.current_price,
            tranche_index: 0,
            held_since,
        }
    }

    /// Purchase cost of the open quantity
    pub fn cost_basis(&self) -> Decimal {
        self.avg_cost * Decimal::from(self.quantity)
    }

    pub fn market_value(&self) -> Decimal {
        self.current_price * Decimal::from(self.quantity)
    }

    /// Unrealized return in percent
    pub fn return_pct(&self) -> Decimal {
        if self.avg_cost <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.current_price - self.avg_cost) / self.avg_cost * Decimal::ONE_HUNDRED
    }
}

/// Lifecycle of a locally tracked order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Submitted,
    Confirmed,
    Expired,
    Rejected,
}

/// Order submitted but not yet reflected in the broker's holdings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub correlation_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub price: Decimal,
    pub submitted_at: DateTime<Utc>,
    pub status: PendingStatus,
    /// Quantity held when the order went out
    pub baseline_quantity: u64,
    /// Tranche index the symbol reaches once this buy fills
    pub target_tranche: usize,
    pub broker_order_id: Option<String>,
}

impl PendingOrder {
    pub fn new(request: &OrderRequest, baseline_quantity: u64, submitted_at: DateTime<Utc>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            price: request.price,
            submitted_at,
            status: PendingStatus::Submitted,
            baseline_quantity,
            target_tranche: 0,
            broker_order_id: None,
        }
    }

    pub fn with_target_tranche(mut self, tranche: usize) -> Self {
        self.target_tranche = tranche;
        self
    }

    pub fn with_broker_order_id(mut self, order_id: Option<String>) -> Self {
        self.broker_order_id = order_id;
        self
    }

    pub fn notional(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }

    /// Whether the reported quantity shows this order as filled
    pub fn is_reflected_by(&self, reported_quantity: u64) -> bool {
        match self.side {
            Side::Buy => reported_quantity >= self.baseline_quantity + self.quantity,
            Side::Sell => reported_quantity + self.quantity <= self.baseline_quantity,
        }
    }
}

/// Per-symbol exit bookkeeping
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RiskState {
    /// Highest price seen since the trailing stop was armed
    pub high_water_mark: Option<Decimal>,
    /// Last full exit, start of the re-entry cooldown
    pub last_exit_at: Option<DateTime<Utc>>,
    /// Sale confirmed at this time; broker snapshots may still list it
    pub recently_sold_at: Option<DateTime<Utc>>,
    pub last_partial_exit_at: Option<DateTime<Utc>>,
    /// Last buy submission attempt
    pub last_entry_attempt_at: Option<DateTime<Utc>>,
    /// Sell in flight until this instant
    pub being_sold_until: Option<DateTime<Utc>>,
}

impl RiskState {
    /// Nothing left worth keeping
    pub fn is_idle(&self) -> bool {
        *self == RiskState::default()
    }

    /// Forget position-scoped fields after a full exit.
    pub fn reset_position(&mut self) {
        self.high_water_mark = None;
        self.last_partial_exit_at = None;
    }
}

/// Streaming connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    /// Connected but quiet for longer than expected
    Degraded,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn holding(qty: u64, avg: Decimal, cur: Decimal) -> Holding {
        Holding {
            symbol: "005930".into(),
            quantity: qty,
            avg_cost: avg,
            current_price: cur,
            tranche_index: 1,
            held_since: None,
        }
    }

    #[test]
    fn test_candidate_score_defaults_strength() {
        assert_eq!(Candidate::score(dec!(5.2), None), dec!(6.2));
        assert_eq!(Candidate::score(dec!(5.2), Some(dec!(150))), dec!(6.7));
    }

    #[test]
    fn test_holding_return_pct() {
        let h = holding(10, dec!(100), dec!(102));
        assert_eq!(h.return_pct(), dec!(2));
        assert_eq!(h.cost_basis(), dec!(1000));

        let flat = holding(10, Decimal::ZERO, dec!(102));
        assert_eq!(flat.return_pct(), Decimal::ZERO);
    }

    #[test]
    fn test_ack_success_sentinels() {
        assert!(OrderAck::success("ok").is_success());
        assert!(OrderAck::failure("SUCCESS", "mock").is_success());
        assert!(!OrderAck::failure("800033", "no qty").is_success());
    }

    #[test]
    fn test_pending_reflection() {
        let buy = OrderRequest::limit_buy("005930", 5, dec!(70000));
        let pending = PendingOrder::new(&buy, 10, Utc::now());
        assert!(!pending.is_reflected_by(12));
        assert!(pending.is_reflected_by(15));

        let sell = OrderRequest::market_sell("005930", 10, dec!(70000));
        let pending = PendingOrder::new(&sell, 10, Utc::now());
        assert!(!pending.is_reflected_by(5));
        assert!(pending.is_reflected_by(0));
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = AccessToken::new("secret-token");
        assert_eq!(format!("{:?}", token), "AccessToken(***)");
    }
}
