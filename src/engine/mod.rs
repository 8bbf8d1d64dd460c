//! Shared state owners and the cycle scheduler
//!
//! - [`ConcurrencyCoordinator`]: symbol locks, batch lock, throttle, risk state
//! - [`HoldingsReconciler`]: local holdings and pending orders
//! - [`RetryPolicy`]: timeout and bounded retry for broker calls
//! - [`SessionClock`]: market hours and liquidation cut-off
//! - [`TradingEngine`]: refresh → reconcile → exit → entry, once per tick

pub mod coordinator;
pub mod reconciler;
pub mod retry;
pub mod scheduler;
pub mod session;

pub use coordinator::{ConcurrencyCoordinator, CoordinatorSettings, SymbolGuard};
pub use reconciler::{HoldingsReconciler, ReconcileContext, ReconcileReport};
pub use retry::RetryPolicy;
pub use scheduler::{account_return_pct, CycleReport, TradingEngine};
pub use session::SessionClock;
