//! Exit manager: stop/take-profit/time-stop/profit-ladder checks in
//! priority order over every open position.
//!
//! Ladder-taken-level state is persisted in `session_metadata` rather than
//! held only in memory, so a restart mid-ladder does not re-fire an
//! already-taken level (see DESIGN.md).

use crate::config::TpLadderLevel;
use crate::pricing::Side;
use crate::risk::{check_stop_take_profit, ExitReason, SuggestedExit};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;

#[derive(Debug, Clone)]
pub struct OpenPosition {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub entry_time: DateTime<Utc>,
    /// Quantity the position opened with, fixed at entry. Ladder levels
    /// are a percentage of this, not of `qty` (which shrinks as earlier
    /// levels fire).
    pub entry_qty: Decimal,
}

/// Which ladder levels (`symbol x level_index`) have already fired. Stored
/// as a flat set of `(symbol, level_index)` pairs so it serializes directly
/// into the `session_metadata` JSON blob.
#[derive(Debug, Clone, Default)]
pub struct LadderState {
    taken: std::collections::HashSet<(String, usize)>,
}

impl LadderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, usize)>) -> Self {
        Self { taken: pairs.into_iter().collect() }
    }

    pub fn pairs(&self) -> impl Iterator<Item = &(String, usize)> {
        self.taken.iter()
    }

    fn is_taken(&self, symbol: &str, level: usize) -> bool {
        self.taken.contains(&(symbol.to_string(), level))
    }

    fn mark_taken(&mut self, symbol: &str, level: usize) {
        self.taken.insert((symbol.to_string(), level));
    }

    /// A fresh entry into a symbol clears any stale ladder state for it
    /// (the previous position's ladder levels don't apply to a new one).
    pub fn reset_symbol(&mut self, symbol: &str) {
        self.taken.retain(|(s, _)| s != symbol);
    }
}

fn current_profit_pct(position: &OpenPosition, mark: Decimal) -> Decimal {
    if position.entry_price.is_zero() {
        return Decimal::ZERO;
    }
    match position.side {
        Side::Long => (mark - position.entry_price) / position.entry_price,
        Side::Short => (position.entry_price - mark) / position.entry_price,
    }
}

/// Evaluates one open position against stop/TP/time-stop/ladder triggers,
/// in that priority order, returning the first that fires. Ladder hits
/// mutate `ladder` to mark the level taken.
pub fn evaluate_exit(
    position: &OpenPosition,
    mark: Decimal,
    now: DateTime<Utc>,
    time_stop_hours: i64,
    tp_ladders: &[TpLadderLevel],
    ladder: &mut LadderState,
) -> Option<SuggestedExit> {
    if let Some(exit) = check_stop_take_profit(position.side, mark, position.stop_loss, position.take_profit, position.qty) {
        return Some(exit);
    }

    let elapsed_hours = (now - position.entry_time).num_seconds() as f64 / 3600.0;
    if elapsed_hours >= time_stop_hours as f64 {
        return Some(SuggestedExit { qty: position.qty, price_hint: mark, reason: ExitReason::TimeStop });
    }

    let profit_pct = current_profit_pct(position, mark);
    for (idx, level) in tp_ladders.iter().enumerate() {
        if ladder.is_taken(&position.symbol, idx) {
            continue;
        }
        if profit_pct >= level.profit_pct {
            ladder.mark_taken(&position.symbol, idx);
            let qty = (position.entry_qty * level.pct_of_position).min(position.qty);
            return Some(SuggestedExit { qty, price_hint: mark, reason: ExitReason::ProfitLadder(idx) });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn position(entry: Decimal, sl: Decimal, tp: Decimal, hours_ago: i64) -> OpenPosition {
        OpenPosition {
            symbol: "BTC/USDT".into(),
            side: Side::Long,
            qty: Decimal::new(1, 1),
            entry_price: entry,
            stop_loss: sl,
            take_profit: tp,
            entry_time: Utc::now() - Duration::hours(hours_ago),
            entry_qty: Decimal::new(1, 1),
        }
    }

    #[test]
    fn stop_loss_takes_priority_over_ladder() {
        let pos = position(Decimal::new(50000, 0), Decimal::new(49000, 0), Decimal::new(52000, 0), 1);
        let ladders = vec![TpLadderLevel { profit_pct: Decimal::new(-50, 3), pct_of_position: Decimal::new(5, 1) }];
        let mut ladder = LadderState::new();
        let exit = evaluate_exit(&pos, Decimal::new(48900, 0), Utc::now(), 72, &ladders, &mut ladder).unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);
    }

    #[test]
    fn time_stop_fires_after_configured_hours() {
        let pos = position(Decimal::new(50000, 0), Decimal::new(40000, 0), Decimal::new(60000, 0), 100);
        let ladders = vec![];
        let mut ladder = LadderState::new();
        let exit = evaluate_exit(&pos, Decimal::new(50100, 0), Utc::now(), 72, &ladders, &mut ladder).unwrap();
        assert_eq!(exit.reason, ExitReason::TimeStop);
    }

    #[test]
    fn ladder_level_fires_once_then_stays_taken() {
        let pos = position(Decimal::new(50000, 0), Decimal::new(40000, 0), Decimal::new(60000, 0), 1);
        let ladders = vec![TpLadderLevel { profit_pct: Decimal::new(8, 3), pct_of_position: Decimal::new(5, 1) }];
        let mut ladder = LadderState::new();
        let first = evaluate_exit(&pos, Decimal::new(50400, 0), Utc::now(), 72, &ladders, &mut ladder).unwrap();
        assert_eq!(first.reason, ExitReason::ProfitLadder(0));
        assert_eq!(first.qty, Decimal::new(5, 2));

        let second = evaluate_exit(&pos, Decimal::new(50500, 0), Utc::now(), 72, &ladders, &mut ladder);
        assert!(second.is_none());
    }

    /// Level 2 must sell half of the *original* 0.1 BTC (0.05), not half of
    /// whatever remains after level 1 already shrank the live position to
    /// 0.05 — the later `OpenPosition` here models a fresh re-derivation
    /// from the (already-reduced) live position, the same as
    /// `run_exit_manager` rebuilds it between cycles.
    #[test]
    fn second_ladder_level_sizes_against_original_entry_qty_not_live_qty() {
        let mut pos = position(Decimal::new(50000, 0), Decimal::new(40000, 0), Decimal::new(60000, 0), 1);
        let ladders = vec![
            TpLadderLevel { profit_pct: Decimal::new(8, 3), pct_of_position: Decimal::new(5, 1) },
            TpLadderLevel { profit_pct: Decimal::new(15, 3), pct_of_position: Decimal::new(5, 1) },
        ];
        let mut ladder = LadderState::new();

        let first = evaluate_exit(&pos, Decimal::new(50400, 0), Utc::now(), 72, &ladders, &mut ladder).unwrap();
        assert_eq!(first.qty, Decimal::new(5, 2));

        // Live quantity shrinks to 0.05 after level 1 fills; entry_qty stays 0.1.
        pos.qty -= first.qty;

        let second = evaluate_exit(&pos, Decimal::new(50750, 0), Utc::now(), 72, &ladders, &mut ladder).unwrap();
        assert_eq!(second.reason, ExitReason::ProfitLadder(1));
        assert_eq!(second.qty, Decimal::new(5, 2));
    }
}
