//! Entry decisions against a paper account
//!
//! ```
//! cargo test --test entry_engine
//! ```

mod common;

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use std::sync::Arc;

use common::{candidate, test_config, Harness, CASH};
use tranche_trader::{
    BrokerGateway, EntryOutcome, OpenOrder, PaperBroker, Side, SkipReason,
};

fn skip_reason(outcome: &EntryOutcome) -> SkipReason {
    outcome
        .skip_reason()
        .cloned()
        .unwrap_or_else(|| panic!("expected a skip, got {:?}", outcome))
}

// ============================================================================
// First tranche
// ============================================================================

#[tokio::test]
async fn test_first_tranche_sized_from_plan() {
    let h = Harness::paper();
    let now = Utc::now();
    let ctx = h.entry_ctx(now).await;

    let outcome = h.entry.try_enter(&candidate("005930", dec!(6.7), dec!(10000)), &ctx).await;

    // ceiling 350,000; first tranche is 1/6 of it, 58,333 → 5 shares
    let EntryOutcome::Submitted(order) = outcome else {
        panic!("expected submission, got {:?}", outcome);
    };
    assert_eq!(order.symbol, "005930");
    assert_eq!(order.side, Side::Buy);
    assert_eq!(order.quantity, 5);
    assert_eq!(order.target_tranche, 1);
    assert_eq!(order.baseline_quantity, 0);
    assert!(order.broker_order_id.is_some());

    assert!(h.reconciler.has_pending("005930", Side::Buy).await);
    assert!(!h.coordinator.is_locked("005930").await);
    assert_eq!(h.broker.cash().await, CASH - dec!(50000));
}

#[tokio::test]
async fn test_second_attempt_blocked_while_pending() {
    let h = Harness::paper();
    let now = Utc::now();
    let ctx = h.entry_ctx(now).await;
    let c = candidate("005930", dec!(6.7), dec!(10000));

    assert!(h.entry.try_enter(&c, &ctx).await.is_submitted());

    // Within the retry window the attempt stamp blocks first
    let again = h.entry.try_enter(&c, &ctx).await;
    assert_eq!(skip_reason(&again), SkipReason::RetryCooldown);

    // Past it, the unconfirmed buy still blocks
    let later = h.entry_ctx(now + Duration::seconds(10)).await;
    let again = h.entry.try_enter(&c, &later).await;
    assert_eq!(skip_reason(&again), SkipReason::PendingBuy);
    assert_eq!(h.broker.submissions().await.len(), 1);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_attempts_submit_once() {
    let h = Arc::new(Harness::paper());
    let now = Utc::now();
    let ctx = Arc::new(h.entry_ctx(now).await);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            h.entry
                .try_enter(&candidate("005930", dec!(6.7), dec!(10000)), &ctx)
                .await
        }));
    }

    let mut submitted = 0;
    for task in tasks {
        let outcome = task.await.expect("task panicked");
        match &outcome {
            EntryOutcome::Submitted(_) => submitted += 1,
            EntryOutcome::Skipped(reason) => assert!(
                matches!(
                    reason,
                    SkipReason::RetryCooldown | SkipReason::SymbolBusy | SkipReason::PendingBuy
                ),
                "unexpected skip: {:?}",
                reason
            ),
        }
    }

    assert_eq!(submitted, 1);
    assert_eq!(h.broker.submissions().await.len(), 1);
    assert_eq!(h.reconciler.pending_orders().await.len(), 1);
}

// ============================================================================
// Guards
// ============================================================================

#[tokio::test]
async fn test_reentry_cooldown_after_full_exit() {
    let h = Harness::paper();
    let now = Utc::now();
    let c = candidate("005930", dec!(6.7), dec!(10000));

    h.coordinator
        .record_full_exit("005930", now - Duration::seconds(30))
        .await;
    let outcome = h.entry.try_enter(&c, &h.entry_ctx(now).await).await;
    match skip_reason(&outcome) {
        SkipReason::Cooldown { remaining_secs } => assert!((29..=30).contains(&remaining_secs)),
        other => panic!("expected cooldown, got {:?}", other),
    }

    let h = Harness::paper();
    h.coordinator
        .record_full_exit("005930", now - Duration::seconds(61))
        .await;
    let outcome = h.entry.try_enter(&c, &h.entry_ctx(now).await).await;
    assert!(outcome.is_submitted(), "got {:?}", outcome);
}

#[tokio::test]
async fn test_open_sell_blocks_entry() {
    let h = Harness::paper();
    let ctx = h.entry_ctx(Utc::now()).await.with_open_orders(vec![OpenOrder {
        symbol: "005930".to_string(),
        side: Side::Sell,
        quantity: 3,
        order_id: "0000123".to_string(),
    }]);

    let outcome = h
        .entry
        .try_enter(&candidate("005930", dec!(6.7), dec!(10000)), &ctx)
        .await;

    assert_eq!(skip_reason(&outcome), SkipReason::PendingSell);
    assert!(h.broker.submissions().await.is_empty());
}

#[tokio::test]
async fn test_halt_checked_first() {
    let h = Harness::paper();
    let ctx = h.entry_ctx(Utc::now()).await.halted("daily profit target reached");

    let outcome = h
        .entry
        .try_enter(&candidate("005930", dec!(6.7), dec!(10000)), &ctx)
        .await;

    assert_eq!(
        skip_reason(&outcome),
        SkipReason::TradingHalted("daily profit target reached".to_string())
    );
}

#[tokio::test]
async fn test_slots_full() {
    let h = Harness::paper();
    let now = Utc::now();
    h.broker.seed_holding("000660", 3, dec!(150000)).await;
    h.broker.seed_holding("035720", 10, dec!(48000)).await;
    let report = h.sync(now).await;
    assert_eq!(report.adopted.len(), 2);

    let outcome = h
        .entry
        .try_enter(&candidate("005930", dec!(6.7), dec!(10000)), &h.entry_ctx(now).await)
        .await;

    assert_eq!(skip_reason(&outcome), SkipReason::SlotsFull);
}

#[tokio::test]
async fn test_pending_buys_occupy_slots() {
    let h = Harness::paper();
    let now = Utc::now();
    let ctx = h.entry_ctx(now).await;

    assert!(h.entry.try_enter(&candidate("000660", dec!(3), dec!(10000)), &ctx).await.is_submitted());
    assert!(h.entry.try_enter(&candidate("035720", dec!(2), dec!(10000)), &ctx).await.is_submitted());

    let outcome = h.entry.try_enter(&candidate("005930", dec!(9), dec!(10000)), &ctx).await;
    assert_eq!(skip_reason(&outcome), SkipReason::SlotsFull);
}

#[tokio::test]
async fn test_price_above_half_ceiling() {
    let h = Harness::paper();

    // ceiling 350,000: anything above 175,000 a share cannot be split
    let outcome = h
        .entry
        .try_enter(&candidate("005930", dec!(6.7), dec!(200000)), &h.entry_ctx(Utc::now()).await)
        .await;

    assert_eq!(skip_reason(&outcome), SkipReason::PriceTooHigh);
}

#[tokio::test]
async fn test_missing_price_falls_back_to_quote() {
    let h = Harness::paper();
    h.broker.set_price("005930", dec!(10000)).await;
    let c = tranche_trader::Candidate::new("005930", dec!(6.7), tranche_trader::OriginTag::Model);

    let outcome = h.entry.try_enter(&c, &h.entry_ctx(Utc::now()).await).await;
    assert!(outcome.is_submitted(), "got {:?}", outcome);

    let unquoted = tranche_trader::Candidate::new("999999", dec!(1), tranche_trader::OriginTag::Model);
    let outcome = h.entry.try_enter(&unquoted, &h.entry_ctx(Utc::now()).await).await;
    assert_eq!(skip_reason(&outcome), SkipReason::NoPrice);
}

// ============================================================================
// Add-on tranches
// ============================================================================

#[tokio::test]
async fn test_add_on_jumps_by_loss_steps() {
    let h = Harness::paper();
    let now = Utc::now();
    h.broker.seed_holding("005930", 5, dec!(10000)).await;
    h.broker.set_price("005930", dec!(9100)).await;
    h.sync(now).await;

    // -9% at a 3% step from tranche 1 targets tranche 4 (the whole ceiling).
    // Equity 1,050,000 → ceiling 367,500; 50,000 already deployed.
    let outcome = h
        .entry
        .try_enter(&candidate("005930", dec!(0), dec!(9100)), &h.entry_ctx(now).await)
        .await;

    let EntryOutcome::Submitted(order) = outcome else {
        panic!("expected add-on, got {:?}", outcome);
    };
    assert_eq!(order.target_tranche, 4);
    assert_eq!(order.baseline_quantity, 5);
    assert_eq!(order.quantity, 34);
}

#[tokio::test]
async fn test_flat_holding_does_not_advance() {
    let h = Harness::paper();
    let now = Utc::now();
    h.broker.seed_holding("005930", 5, dec!(10000)).await;
    h.sync(now).await;

    let outcome = h
        .entry
        .try_enter(&candidate("005930", dec!(0), dec!(10000)), &h.entry_ctx(now).await)
        .await;

    assert_eq!(skip_reason(&outcome), SkipReason::NoTrancheAdvance);
}

#[tokio::test]
async fn test_fully_built_position_skipped() {
    let h = Harness::paper();
    let now = Utc::now();
    // 35 x 10,000 on equity 1,350,000 deploys 350,000 of a 472,500 ceiling,
    // which is past the third cumulative target; history says tranche 4.
    h.broker.seed_holding("005930", 35, dec!(10000)).await;
    h.broker.set_price("005930", dec!(8000)).await;
    h.sync(now).await;
    h.reconciler
        .record_submission(
            tranche_trader::PendingOrder::new(
                &tranche_trader::OrderRequest::limit_buy("005930", 1, dec!(8000)),
                0,
                now,
            )
            .with_target_tranche(4),
        )
        .await;
    // the seeded 35 shares already reflect the pending buy
    let report = h.sync(now).await;
    assert_eq!(report.newly_confirmed.len(), 1);
    assert_eq!(h.reconciler.holding("005930").await.unwrap().tranche_index, 4);

    let outcome = h
        .entry
        .try_enter(&candidate("005930", dec!(0), dec!(8000)), &h.entry_ctx(now).await)
        .await;

    assert_eq!(skip_reason(&outcome), SkipReason::FullyBuilt);
}

// ============================================================================
// Broker refusals
// ============================================================================

#[tokio::test]
async fn test_rejection_releases_symbol_and_starts_retry_window() {
    let h = Harness::paper();
    let now = Utc::now();
    let c = candidate("005930", dec!(6.7), dec!(10000));
    h.broker.fail_next_submission("2000", "insufficient orderable cash").await;

    let outcome = h.entry.try_enter(&c, &h.entry_ctx(now).await).await;
    match skip_reason(&outcome) {
        SkipReason::OrderRejected { code, .. } => assert_eq!(code, "2000"),
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(!h.coordinator.is_locked("005930").await);
    assert!(h.reconciler.pending_orders().await.is_empty());

    let outcome = h.entry.try_enter(&c, &h.entry_ctx(now).await).await;
    assert_eq!(skip_reason(&outcome), SkipReason::RetryCooldown);

    let later = now + Duration::seconds(6);
    let outcome = h.entry.try_enter(&c, &h.entry_ctx(later).await).await;
    assert!(outcome.is_submitted(), "got {:?}", outcome);
}

#[tokio::test]
async fn test_ceiling_below_minimum_order() {
    let broker = PaperBroker::new(dec!(5000));
    let h = Harness::new(test_config(), broker);

    let outcome = h
        .entry
        .try_enter(&candidate("005930", dec!(6.7), dec!(500)), &h.entry_ctx(Utc::now()).await)
        .await;

    // ceiling 1,750 is below the 10,000 minimum order
    assert_eq!(skip_reason(&outcome), SkipReason::BelowMinimum);
    assert!(h.broker.get_open_orders(&common::token()).await.unwrap().is_empty());
}
