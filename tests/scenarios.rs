//! End-to-end scenario tests wiring sizing, order quantization, the
//! portfolio transaction, and the exit manager together — the same
//! concrete numbers spec'd examples use to pin down the whole chain, not
//! just each module in isolation.

use ledgerbot::config::TpLadderLevel;
use ledgerbot::exit_manager::{evaluate_exit, LadderState, OpenPosition};
use ledgerbot::money::SymbolRules;
use ledgerbot::order_builder::build_order;
use ledgerbot::pricing::Side;
use ledgerbot::portfolio::{EntryLevels, Fill, Portfolio};
use ledgerbot::risk::ExitReason;
use ledgerbot::sizing::{plan_slices, target_notional, SizingInputs, SlicingParams};
use ledgerbot::store::memory::MemoryStateStore;
use rust_decimal::prelude::*;

fn dec(m: i64, s: u32) -> Decimal {
    Decimal::new(m, s)
}

fn btc_rules() -> SymbolRules {
    SymbolRules { price_tick: dec(1, 2), qty_step: dec(1, 4), min_qty: dec(1, 4), min_notional: dec(10, 0), supports_short: false, allow_short: false }
}

/// Long entry, partial TP via a two-level ladder, full exit — the
/// concrete walkthrough: equity=10000, risk_per_trade_pct=0.01,
/// BTC @ 50000 sl=49000 tp=52000, ladders at +0.8%/+1.5% each selling
/// half. Each ladder sell credits full notional to cash, so cash ends up
/// above the original 10000 by exactly the realized gain (57.5); final
/// equity 10057.5, realized P&L = 20 + 37.5 = 57.5.
#[test]
fn long_entry_partial_tp_ladder_then_full_exit() {
    let equity = dec(10000, 0);
    let entry_price = dec(50000, 0);
    let stop_loss = dec(49000, 0);
    let take_profit = dec(52000, 0);
    let stop_frac = (entry_price - stop_loss) / entry_price; // 0.02

    let target = target_notional(&SizingInputs {
        equity,
        risk_per_trade_pct: dec(1, 2),
        stop_frac,
        per_symbol_cap_pct: dec(100, 2),
        session_cap_pct: dec(100, 2),
        deployed_capital: Decimal::ZERO,
    });
    assert_eq!(target, dec(5000, 0)); // 100 risk dollars / 0.02 stop_frac

    let slices = plan_slices(target, &SlicingParams { default_slice_notional: dec(5000, 0), min_slice_notional: dec(10, 0), max_slices_per_order: 5 });
    assert_eq!(slices, vec![target]);

    let built = build_order(entry_price, target, &btc_rules(), 1).unwrap();
    assert_eq!(built.quantity, dec(1, 1)); // 5000 / 50000 = 0.1 BTC

    let mut store = MemoryStateStore::new();
    let mut portfolio = Portfolio::new(equity);
    let entry_levels = EntryLevels { stop_loss, take_profit, entry_time: 0, entry_qty: built.quantity };
    let open_fill = Fill { side: Side::Long, qty: built.quantity, price: built.price, fee: Decimal::ZERO };
    portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "open", open_fill, equity, 0, Some(entry_levels)).unwrap();
    assert_eq!(portfolio.cash(), dec(5000, 0));

    let ladders = vec![
        TpLadderLevel { profit_pct: dec(8, 3), pct_of_position: dec(5, 1) },
        TpLadderLevel { profit_pct: dec(15, 3), pct_of_position: dec(5, 1) },
    ];
    let mut ladder_state = LadderState::new();

    // Rebuilt fresh from the portfolio before each check, the same way
    // `run_exit_manager` re-derives it every cycle — `entry_qty` comes from
    // `position_levels` (fixed at entry) while `qty` reflects however much
    // the position has already shrunk from earlier ladder fires.
    let open_position = |portfolio: &Portfolio| {
        let (qty, _) = portfolio.position("BTC/USDT", "composite");
        let levels = portfolio.position_levels("BTC/USDT", "composite").unwrap();
        OpenPosition { symbol: "BTC/USDT".into(), side: Side::Long, qty, entry_price: built.price, stop_loss: levels.stop_loss, take_profit: levels.take_profit, entry_time: chrono::Utc::now(), entry_qty: levels.entry_qty }
    };

    // Mark moves to 50400 (+0.8%): first ladder level sells half at +20.
    let mark1 = dec(50400, 0);
    let position1 = open_position(&portfolio);
    let exit1 = evaluate_exit(&position1, mark1, chrono::Utc::now(), 72, &ladders, &mut ladder_state).unwrap();
    assert_eq!(exit1.reason, ExitReason::ProfitLadder(0));
    assert_eq!(exit1.qty, dec(5, 2));

    let equity_before_1 = portfolio.equity(|_| mark1);
    let sell1 = Fill { side: Side::Short, qty: exit1.qty, price: mark1, fee: Decimal::ZERO };
    let outcome1 = portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "ladder1", sell1, equity_before_1, 1, None).unwrap();
    assert_eq!(outcome1.realized_pnl, dec(20, 0));
    assert_eq!(portfolio.position("BTC/USDT", "composite").0, dec(5, 2));

    // Mark moves to 50750 (+1.5%): second ladder level sells the rest at
    // +37.5 — 50% of the *original* 0.1 BTC, even though the live position
    // has already shrunk to 0.05.
    let mark2 = dec(50750, 0);
    let position2 = open_position(&portfolio);
    let exit2 = evaluate_exit(&position2, mark2, chrono::Utc::now(), 72, &ladders, &mut ladder_state).unwrap();
    assert_eq!(exit2.reason, ExitReason::ProfitLadder(1));
    assert_eq!(exit2.qty, dec(5, 2));

    let equity_before_2 = portfolio.equity(|_| mark2);
    let sell2 = Fill { side: Side::Short, qty: exit2.qty, price: mark2, fee: Decimal::ZERO };
    let outcome2 = portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "ladder2", sell2, equity_before_2, 2, None).unwrap();
    assert_eq!(outcome2.realized_pnl, dec(375, 1)); // 37.5

    // Position fully closed; cash sits above the original 10000 by exactly
    // the realized gain, total realized P&L 57.5.
    assert_eq!(portfolio.position("BTC/USDT", "composite"), (Decimal::ZERO, Decimal::ZERO));
    assert_eq!(portfolio.cash(), dec(100575, 1));
    assert_eq!(portfolio.total_realized_pnl(), dec(575, 1));
    let final_equity = portfolio.equity(|_| mark2);
    assert_eq!(final_equity, dec(100575, 1)); // 10057.5
}

/// Precision rejection then bump: min_notional=10, qty_step=0.001,
/// price=0.1234. A target of 8 bumps to notional=10 on the one retry and
/// clears the floor; the same target with `max_retries=0` is rejected
/// outright instead of silently bumped.
#[test]
fn precision_rejection_then_bump_on_retry() {
    let rules = SymbolRules { price_tick: dec(1, 4), qty_step: dec(1, 3), min_qty: dec(1, 3), min_notional: dec(10, 0), supports_short: false, allow_short: false };

    let bumped = build_order(dec(1234, 4), dec(8, 0), &rules, 1).unwrap();
    assert!(bumped.notional >= rules.min_notional);

    let rejected = build_order(dec(1234, 4), dec(5, 0), &rules, 0).unwrap_err();
    assert_eq!(rejected, ledgerbot::errors::RejectReason::MinNotional);
}

/// Daily loss halt: session_start_equity=10000, daily_loss_limit_pct=0.05.
/// Equity dropping to 9490 (5.1% drawdown) breaches the halt; a lesser
/// drawdown at the same limit does not.
#[test]
fn daily_loss_halt_breaches_at_spec_numbers() {
    assert!(ledgerbot::risk::daily_loss_limit_breached(dec(10000, 0), dec(9490, 0), dec(5, 2)));
    assert!(!ledgerbot::risk::daily_loss_limit_breached(dec(10000, 0), dec(9600, 0), dec(5, 2)));
}

/// Rollback on invariant failure: an equity-jump check failure must leave
/// cash, positions, and the store entirely untouched — no new trade, lot,
/// or position row, and the portfolio proceeds to the next fill as if the
/// rejected one never happened.
#[test]
fn rollback_on_invariant_failure_leaves_no_trace_and_next_fill_still_works() {
    let mut store = MemoryStateStore::new();
    let mut portfolio = Portfolio::new(dec(10000, 0));

    let bad_fill = Fill { side: Side::Long, qty: dec(1, 1), price: dec(50000, 0), fee: Decimal::ZERO };
    let err = portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "bad", bad_fill, dec(1, 0), 0, None).unwrap_err();
    assert!(matches!(err, ledgerbot::errors::EngineError::InvariantViolation(_)));
    assert_eq!(portfolio.cash(), dec(10000, 0));
    assert!(store.get_positions("s1").unwrap().is_empty());
    assert!(store.load_lots("s1", "BTC/USDT").unwrap().is_empty());

    // The cycle proceeds to the next fill unaffected by the rejected one.
    let good_fill = Fill { side: Side::Long, qty: dec(1, 1), price: dec(50000, 0), fee: Decimal::ZERO };
    let outcome = portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "good", good_fill, dec(10000, 0), 1, None).unwrap();
    assert_eq!(outcome.cash_after, dec(5000, 0));
    assert_eq!(portfolio.position("BTC/USDT", "composite"), (dec(1, 1), dec(50000, 0)));
}
