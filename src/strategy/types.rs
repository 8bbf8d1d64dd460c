use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::common::types::PendingOrder;

/// Why an entry attempt did nothing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Entries halted for the account (profit target, loss guard, liquidation)
    TradingHalted(String),
    /// Post-exit cooldown still running
    Cooldown { remaining_secs: i64 },
    /// A buy for this symbol was attempted moments ago
    RetryCooldown,
    /// A sell for this symbol is unresolved
    PendingSell,
    /// A buy for this symbol is unresolved
    PendingBuy,
    /// Another decision holds the symbol lock
    SymbolBusy,
    /// Already holding the target number of symbols
    SlotsFull,
    /// One share costs more than half the ceiling
    PriceTooHigh,
    /// Equity yields no ceiling
    NoAllocation,
    /// No usable price
    NoPrice,
    /// Every tranche has executed
    FullyBuilt,
    /// Position was reduced by a partial exit and takes no more tranches
    PartiallyExited,
    /// Return has not moved far enough for another tranche
    NoTrancheAdvance,
    /// Deployed notional already meets the tranche target
    CeilingReached,
    /// Remaining room under the ceiling is below the minimum order
    BelowMinimum,
    /// Not enough orderable cash for the minimum order
    InsufficientCash,
    /// Notional buys less than one share
    ZeroQuantity,
    /// Broker refused the order
    OrderRejected { code: String, message: String },
}

impl SkipReason {
    /// Stable code for logs and alerts
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::TradingHalted(_) => "halted",
            SkipReason::Cooldown { .. } => "cooldown",
            SkipReason::RetryCooldown => "retry-cooldown",
            SkipReason::PendingSell => "pending-sell",
            SkipReason::PendingBuy => "pending-buy",
            SkipReason::SymbolBusy => "busy",
            SkipReason::SlotsFull => "slots-full",
            SkipReason::PriceTooHigh => "price-too-high",
            SkipReason::NoAllocation => "no-allocation",
            SkipReason::NoPrice => "no-price",
            SkipReason::FullyBuilt => "fully-built",
            SkipReason::PartiallyExited => "partially-exited",
            SkipReason::NoTrancheAdvance => "no-advance",
            SkipReason::CeilingReached => "ceiling-reached",
            SkipReason::BelowMinimum => "below-minimum",
            SkipReason::InsufficientCash => "insufficient-cash",
            SkipReason::ZeroQuantity => "zero-quantity",
            SkipReason::OrderRejected { .. } => "rejected",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::TradingHalted(why) => write!(f, "halted: {}", why),
            SkipReason::Cooldown { remaining_secs } => {
                write!(f, "cooldown ({}s left)", remaining_secs)
            }
            SkipReason::OrderRejected { code, message } => {
                write!(f, "rejected [{}]: {}", code, message)
            }
            other => f.write_str(other.code()),
        }
    }
}

/// Result of one entry attempt
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Submitted(PendingOrder),
    Skipped(SkipReason),
}

impl EntryOutcome {
    pub fn is_submitted(&self) -> bool {
        matches!(self, EntryOutcome::Submitted(_))
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            EntryOutcome::Skipped(reason) => Some(reason),
            EntryOutcome::Submitted(_) => None,
        }
    }
}

/// Exit trigger, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitReason {
    Ceiling,
    TimeExit,
    TrailingStop,
    HardStop,
    RiskReduction,
    MomentumFade,
    TakeProfit,
    StopLoss,
    Liquidation,
    GlobalLoss,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Ceiling => "ceiling",
            ExitReason::TimeExit => "time-exit",
            ExitReason::TrailingStop => "trailing-stop",
            ExitReason::HardStop => "hard-stop",
            ExitReason::RiskReduction => "risk-reduction",
            ExitReason::MomentumFade => "momentum-fade",
            ExitReason::TakeProfit => "take-profit",
            ExitReason::StopLoss => "stop-loss",
            ExitReason::Liquidation => "liquidation",
            ExitReason::GlobalLoss => "global-loss",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much of the position to sell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSize {
    Full,
    /// Sell this many shares and keep the rest
    Partial(u64),
}

/// A fired exit trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSignal {
    pub reason: ExitReason,
    pub size: ExitSize,
}

impl ExitSignal {
    pub fn full(reason: ExitReason) -> Self {
        Self {
            reason,
            size: ExitSize::Full,
        }
    }

    pub fn partial(reason: ExitReason, quantity: u64) -> Self {
        Self {
            reason,
            size: ExitSize::Partial(quantity),
        }
    }

    pub fn is_full(&self) -> bool {
        self.size == ExitSize::Full
    }

    /// Shares to sell out of `held`
    pub fn quantity(&self, held: u64) -> u64 {
        match self.size {
            ExitSize::Full => held,
            ExitSize::Partial(qty) => qty.min(held),
        }
    }
}

/// What happened to one exit attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Sold {
        symbol: String,
        signal: ExitSignal,
        quantity: u64,
        price: Decimal,
    },
    /// Broker reports nothing to sell; the holding was dropped locally
    GhostRemoved { symbol: String },
    Rejected {
        symbol: String,
        code: String,
        message: String,
    },
    /// Another decision held the symbol lock
    Busy { symbol: String },
}
