//! Trade decision making
//!
//! Sizing, entry guards and exit triggers. Network I/O stays behind the
//! [`BrokerGateway`](crate::common::traits::BrokerGateway) trait; shared
//! state lives in the engine's coordinator and reconciler.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SIZING (pure)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  PositionSizer                                              │
//! │    - Cost-basis equity → ceiling per symbol                 │
//! │    - Geometric tranche plan → cumulative ratio table        │
//! │    - Tranche index estimate for open positions              │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PER CYCLE                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ExitDecisionEngine (runs first)                            │
//! │    ceiling → time → trailing → tiered stop → momentum → TP/SL│
//! │       │                                                     │
//! │       ▼                                                     │
//! │  EntryDecisionEngine                                        │
//! │    cooldown → pending sell → lock → slots/price → tranche   │
//! │       │                                                     │
//! │       ▼                                                     │
//! │  BrokerGateway.submit_order → HoldingsReconciler (pending)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`PositionSizer`] and [`TranchePlan`]: allocation math
//! - [`EntryDecisionEngine`]: `try_enter` returning an [`EntryOutcome`]
//! - [`ExitRules`]: pure trigger evaluation producing an [`ExitSignal`]
//! - [`ExitDecisionEngine`]: per-cycle evaluation and sell execution
//! - [`StrengthIndicator`]: pluggable exhaustion signal, [`RsiGauge`] by default

mod entry;
mod exit;
mod momentum;
mod size_calculator;
mod traits;
mod types;

pub use entry::{EntryContext, EntryDecisionEngine};
pub use exit::{ExitContext, ExitDecisionEngine, ExitRules, NO_SELLABLE_QUANTITY};
pub use momentum::RsiGauge;
pub use size_calculator::{allocate, Allocation, PositionSizer, TranchePlan};
pub use traits::{BoxedIndicator, StrengthIndicator};
pub use types::{EntryOutcome, ExitOutcome, ExitReason, ExitSignal, ExitSize, SkipReason};
