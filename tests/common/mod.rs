//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::mock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use tranche_trader::common::errors::Result;
use tranche_trader::config::types::{BrokerMode, TrancheStrategy};
use tranche_trader::engine::{CoordinatorSettings, ReconcileContext, ReconcileReport};
use tranche_trader::strategy::RsiGauge;
use tranche_trader::{
    AccessToken, AppConfig, Balance, BrokerGateway, BrokerHolding, Candidate,
    ConcurrencyCoordinator, EntryContext, EntryDecisionEngine, ExitContext, ExitDecisionEngine,
    ExitRules, Holding, HoldingsReconciler, OpenOrder, OrderAck, OrderRequest, OriginTag,
    PaperBroker, PositionSizer,
};

mock! {
    pub Broker {}

    #[async_trait]
    impl BrokerGateway for Broker {
        async fn authenticate(&self) -> Result<AccessToken>;
        async fn get_balance(&self, token: &AccessToken) -> Result<Balance>;
        async fn get_holdings(&self, token: &AccessToken) -> Result<Vec<BrokerHolding>>;
        async fn get_open_orders(&self, token: &AccessToken) -> Result<Vec<OpenOrder>>;
        async fn submit_order(&self, order: &OrderRequest, token: &AccessToken) -> Result<OrderAck>;
        async fn cancel_order(
            &self,
            symbol: &str,
            quantity: u64,
            order_id: &str,
            token: &AccessToken,
        ) -> Result<OrderAck>;
        async fn get_current_price(&self, symbol: &str, token: &AccessToken) -> Result<Decimal>;
        async fn close(&self) -> Result<()>;
        fn name(&self) -> &'static str;
    }
}

/// Starting cash used by most scenarios
pub const CASH: Decimal = dec!(1000000);

/// Two symbols, four tranches, weights 1:1:2:2.
///
/// With [`CASH`] and 70% capital the per-symbol ceiling is 350,000.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.broker.mode = BrokerMode::Paper;
    config.broker.order_interval_ms = 0;
    config.broker.max_retries = 0;
    config.broker.retry_backoff_ms = 10;
    config.feed.enabled = false;
    config.session.enforce_market_hours = false;

    config.trading.capital_ratio_pct = dec!(70);
    config.trading.target_symbol_count = 2;
    config.trading.split_count = 4;
    config.trading.strategy = TrancheStrategy::BuyOnWeakness;
    config.trading.step_rate_pct = dec!(3);
    config.trading.min_order_amount = dec!(10000);
    config.trading.reentry_cooldown_secs = 60;
    config.trading.entry_retry_cooldown_secs = 5;

    config.exits.time_exit_minutes = 0;
    config.exits.momentum_exit_enabled = false;
    config.exits.trailing_activation_pct = dec!(1.5);
    config.exits.trailing_callback_pct = dec!(0.7);
    config
}

pub fn token() -> AccessToken {
    AccessToken::new("test-token")
}

pub fn candidate(symbol: &str, score: Decimal, price: Decimal) -> Candidate {
    Candidate::new(symbol, score, OriginTag::Rule).with_price(price)
}

pub fn broker_holding(symbol: &str, quantity: u64, avg: Decimal, price: Decimal) -> BrokerHolding {
    BrokerHolding {
        symbol: symbol.to_string(),
        quantity,
        avg_cost: avg,
        current_price: price,
    }
}

pub fn holding(symbol: &str, quantity: u64, avg: Decimal, price: Decimal) -> Holding {
    Holding {
        symbol: symbol.to_string(),
        quantity,
        avg_cost: avg,
        current_price: price,
        tranche_index: 1,
        held_since: None,
    }
}

/// Decision engines wired to a paper account, without the scheduler
pub struct Harness {
    pub config: AppConfig,
    pub broker: Arc<PaperBroker>,
    pub coordinator: Arc<ConcurrencyCoordinator>,
    pub reconciler: Arc<HoldingsReconciler>,
    pub entry: EntryDecisionEngine,
    pub exit: ExitDecisionEngine,
}

impl Harness {
    pub fn new(config: AppConfig, broker: PaperBroker) -> Self {
        let broker = Arc::new(broker);
        Self::with_gateway(config, broker.clone(), broker)
    }

    pub fn paper() -> Self {
        Self::new(test_config(), PaperBroker::new(CASH))
    }

    /// `broker` stays reachable for seeding while `gateway` takes the orders.
    pub fn with_gateway(
        config: AppConfig,
        broker: Arc<PaperBroker>,
        gateway: Arc<dyn BrokerGateway>,
    ) -> Self {
        let coordinator = Arc::new(ConcurrencyCoordinator::new(CoordinatorSettings::from_config(
            &config,
        )));
        let reconciler = Arc::new(HoldingsReconciler::new(&config.reconcile));
        let sizer = PositionSizer::from_config(&config.trading).expect("valid sizing config");

        let entry = EntryDecisionEngine::new(
            gateway.clone(),
            sizer.clone(),
            coordinator.clone(),
            reconciler.clone(),
            config.trading.clone(),
        );
        let exit = ExitDecisionEngine::new(
            gateway,
            ExitRules::new(config.exits.clone(), &config.trading),
            sizer,
            coordinator.clone(),
            reconciler.clone(),
            Box::new(RsiGauge::new(
                config.exits.momentum_period,
                config.exits.momentum_overbought,
            )),
        );

        Self {
            config,
            broker,
            coordinator,
            reconciler,
            entry,
            exit,
        }
    }

    /// Reconcile the local book against the paper account as of `now`.
    pub async fn sync(&self, now: DateTime<Utc>) -> ReconcileReport {
        let snapshot = self
            .broker
            .get_holdings(&token())
            .await
            .expect("paper holdings");
        let ctx = ReconcileContext {
            now,
            locked: self.coordinator.locked_symbols().await,
            recently_sold: self.coordinator.recently_sold_symbols(now).await,
        };
        self.reconciler.reconcile(&snapshot, &ctx).await
    }

    pub async fn entry_ctx(&self, now: DateTime<Utc>) -> EntryContext {
        let balance = self.broker.get_balance(&token()).await.expect("paper balance");
        let open_orders = self
            .broker
            .get_open_orders(&token())
            .await
            .expect("paper open orders");
        EntryContext::new(token(), balance, now).with_open_orders(open_orders)
    }

    pub async fn exit_ctx(&self, now: DateTime<Utc>) -> ExitContext {
        let balance = self.broker.get_balance(&token()).await.expect("paper balance");
        let holdings = self.reconciler.holdings().await;
        let equity = PositionSizer::cost_basis_equity(balance.deposit, &holdings);
        let ceiling = self.entry.sizer().allocate(equity).ceiling_per_symbol;
        let open_orders = self
            .broker
            .get_open_orders(&token())
            .await
            .expect("paper open orders");
        ExitContext::new(token(), ceiling, now).with_open_orders(open_orders)
    }
}

/// Sample stream frames for testing
pub mod ws_messages {
    pub const LOGIN_OK: &str = r#"{"trnm":"LOGIN","return_code":0,"return_msg":"login ok"}"#;

    pub const LOGIN_REFUSED: &str =
        r#"{"trnm":"LOGIN","return_code":100013,"return_msg":"invalid token"}"#;

    pub const PING: &str = r#"{"trnm":"PING"}"#;

    pub const CONDITION_LIST: &str =
        r#"{"trnm":"CNSRLST","return_code":0,"data":[["0","volume surge"],["1","breakout"]]}"#;

    /// Initial match list for the subscribed condition
    pub const CONDITION_SNAPSHOT: &str = r#"{"trnm":"CNSRREQ","return_code":0,"seq":"1","data":[
        {"jmcode":"A000660","11":"+2.10","10":"150000"}
    ]}"#;

    pub const REAL: &str = r#"{"trnm":"REAL","data":[
        {"type":"02","item":"005930","values":{"9001":"A005930","12":"+5.20","10":"-71,000","15":"150.00"}},
        {"type":"02","item":"035720","values":{"9001":"A035720","12":"+0.80","10":"48,500","15":"90.00"}}
    ]}"#;
}
