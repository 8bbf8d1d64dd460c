//! TrancheTrader Library
//!
//! Equities trading engine: a streaming candidate feed, tranche-based
//! position sizing, layered exit triggers and reconciliation of local
//! holdings against the broker's account view.

pub mod broker;
pub mod common;
pub mod config;
pub mod engine;
pub mod feed;
pub mod notify;
pub mod store;
pub mod strategy;

// Re-export commonly used types
pub use broker::{build_gateway, PaperBroker, RestBroker};
pub use common::errors::{Result, TraderError};
pub use common::traits::{AlertSink, BrokerGateway};
pub use common::types::{
    AccessToken, Balance, BrokerHolding, Candidate, ConnectionState, Holding, OpenOrder, OrderAck,
    OrderKind, OrderRequest, OriginTag, PendingOrder, PendingStatus, RiskState, Side,
};
pub use config::types::AppConfig;
pub use engine::{ConcurrencyCoordinator, HoldingsReconciler, TradingEngine};
pub use feed::{CandidateBuffer, CandidateFeed};
pub use notify::{Alert, AlertLevel, Notifier};
pub use store::{Store, TradeRecord};

// Strategy types
pub use strategy::{
    EntryContext, EntryDecisionEngine, EntryOutcome, ExitContext, ExitDecisionEngine,
    ExitOutcome, ExitReason, ExitRules, ExitSignal, PositionSizer, SkipReason, TranchePlan,
};
