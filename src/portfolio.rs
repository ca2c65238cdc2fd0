//! Portfolio transaction: the all-or-nothing multi-step fill application,
//! cash/position/lot-book bookkeeping, and the equity invariant check,
//! staged so any validation failure rolls back cash, positions, and
//! realized P&L to their pre-fill values.
//!
//! `apply_fill` is the single authoritative cash-mutation path: nothing
//! else in this crate calls `StateStore::save_cash` directly (see
//! DESIGN.md).

use crate::errors::EngineError;
use crate::lot_book::LotBook;
use crate::pricing::Side;
use crate::store::{CashEquityRow, PositionRow, StateStore, TradeRow};
use rust_decimal::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct Fill {
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
}

/// SL/TP chosen by the three-tier derivation for a fill that opens a
/// position from flat. Ignored on adds/reduces, which keep the levels set
/// when the position was first opened.
#[derive(Debug, Clone, Copy)]
pub struct EntryLevels {
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub entry_time: i64,
    /// Quantity this position opened with. Fixed at the moment it opens
    /// from flat, same as `stop_loss`/`take_profit`/`entry_time` — the
    /// Exit Manager sizes TP-ladder levels against this, not the live
    /// (shrinking) position quantity.
    pub entry_qty: Decimal,
}

#[derive(Debug, Clone, Copy, Default)]
struct PositionState {
    qty: Decimal,
    entry_price: Decimal,
    stop_loss: Decimal,
    take_profit: Decimal,
    entry_time: i64,
    entry_qty: Decimal,
}

pub struct Portfolio {
    cash: Decimal,
    positions: HashMap<(String, String), PositionState>,
    total_realized_pnl: Decimal,
    pub lot_book: LotBook,
    applied_trade_ids: std::collections::HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct FillOutcome {
    pub realized_pnl: Decimal,
    pub cash_after: Decimal,
    pub equity_after: Decimal,
    pub crossed_zero: bool,
}

impl Portfolio {
    pub fn new(initial_cash: Decimal) -> Self {
        Self { cash: initial_cash, positions: HashMap::new(), total_realized_pnl: Decimal::ZERO, lot_book: LotBook::new(), applied_trade_ids: std::collections::HashSet::new() }
    }

    /// Rebuilds a `Portfolio` from persisted state at orchestrator startup.
    /// `total_realized_pnl` is a session-lifetime counter for reporting only
    /// — it plays no part in `equity()` — and has no dedicated persisted
    /// column, so it restarts at zero on every hydrate. `last_equity` is
    /// accepted for the caller's own reconciliation logging but unused here.
    pub fn hydrate(cash: Decimal, positions: Vec<PositionRow>, _last_equity: Option<Decimal>) -> Self {
        let mut map = HashMap::new();
        for row in &positions {
            map.insert(
                (row.symbol.clone(), row.strategy.clone()),
                PositionState { qty: row.qty, entry_price: row.entry_price, stop_loss: row.stop_loss, take_profit: row.take_profit, entry_time: row.entry_time, entry_qty: row.entry_qty },
            );
        }
        Self { cash, positions: map, total_realized_pnl: Decimal::ZERO, lot_book: LotBook::new(), applied_trade_ids: std::collections::HashSet::new() }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn position(&self, symbol: &str, strategy: &str) -> (Decimal, Decimal) {
        self.positions.get(&(symbol.to_string(), strategy.to_string())).map(|p| (p.qty, p.entry_price)).unwrap_or((Decimal::ZERO, Decimal::ZERO))
    }

    /// The SL/TP/entry-time chosen when the position was opened, for the
    /// Exit Manager to check against instead of re-deriving a fallback
    /// every cycle. `None` when there is no open position for the key.
    pub fn position_levels(&self, symbol: &str, strategy: &str) -> Option<EntryLevels> {
        self.positions
            .get(&(symbol.to_string(), strategy.to_string()))
            .filter(|p| !p.qty.is_zero())
            .map(|p| EntryLevels { stop_loss: p.stop_loss, take_profit: p.take_profit, entry_time: p.entry_time, entry_qty: p.entry_qty })
    }

    pub fn total_realized_pnl(&self) -> Decimal {
        self.total_realized_pnl
    }

    /// `total_equity = cash + sum(qty * mark)`. `cash` already carries every
    /// realized gain or loss — a sell credits full notional, not just cost
    /// basis — so adding `total_realized_pnl` on top would double-count it;
    /// that counter is kept only as a separate reporting figure via
    /// `total_realized_pnl()`. `mark_price` should fall back to stored entry
    /// price and log a warning when the pricing snapshot has no mark for a
    /// symbol — that fallback is the caller's responsibility (it owns the
    /// snapshot).
    pub fn equity(&self, mark_price: impl Fn(&str) -> Decimal) -> Decimal {
        let positions_value: Decimal = self.positions.iter().map(|((symbol, _), p)| p.qty * mark_price(symbol)).sum();
        self.cash + positions_value
    }

    /// Staged so any validation failure rolls back cash, positions, and
    /// realized P&L to their pre-fill values.
    pub fn apply_fill(
        &mut self,
        store: &mut dyn StateStore,
        session_id: &str,
        symbol: &str,
        strategy: &str,
        trade_id: &str,
        fill: Fill,
        equity_before: Decimal,
        now_ts: i64,
        entry_levels: Option<EntryLevels>,
    ) -> Result<FillOutcome, EngineError> {
        if fill.price <= Decimal::ZERO {
            return Err(EngineError::InvariantViolation(format!("fill price must be positive for {symbol}")));
        }

        // Idempotency: a replayed fill (e.g. after a crash-restart re-delivers
        // the same trade_id) must produce zero additional cash impact, zero
        // additional realized P&L, and no duplicate lot/trade row.
        if self.applied_trade_ids.contains(trade_id) || store.trade_exists(session_id, trade_id).map_err(EngineError::Store)? {
            self.applied_trade_ids.insert(trade_id.to_string());
            return Ok(FillOutcome { realized_pnl: Decimal::ZERO, cash_after: self.cash, equity_after: equity_before, crossed_zero: false });
        }

        // Everything below mutates only in-memory state and is staged for
        // rollback; nothing touches the store until the equity invariant
        // below has passed, so an invariant failure never leaves a partial
        // write (new cash/position/trade/lot row) behind.
        let staged_cash = self.cash;
        let staged_positions = self.positions.clone();
        let staged_realized = self.total_realized_pnl;
        let staged_lot_book = self.lot_book.clone();

        let notional = fill.qty * fill.price;
        let cash_impact = match fill.side {
            Side::Long => -(notional + fill.fee),
            Side::Short => notional - fill.fee,
        };
        let new_cash = self.cash + cash_impact;

        if fill.side == Side::Long && new_cash < Decimal::ZERO {
            return Err(EngineError::BudgetExhausted(format!("insufficient cash for {symbol}: would go to {new_cash}")));
        }

        self.cash = new_cash;

        let key = (symbol.to_string(), strategy.to_string());
        let old = self.positions.get(&key).copied().unwrap_or_default();
        let (old_qty, old_entry) = (old.qty, old.entry_price);
        let signed_qty = match fill.side {
            Side::Long => fill.qty,
            Side::Short => -fill.qty,
        };
        let new_qty = old_qty + signed_qty;
        let crossed_zero = old_qty.signum() != Decimal::ZERO && new_qty.signum() != Decimal::ZERO && old_qty.signum() != new_qty.signum()
            || (old_qty.is_zero() && !new_qty.is_zero());
        let opened_from_flat = old_qty.is_zero() && !new_qty.is_zero();

        let new_entry = if old_qty.is_zero() || old_qty.signum() == signed_qty.signum() {
            // Adding to (or opening) a position: weighted-average entry.
            if new_qty.is_zero() {
                Decimal::ZERO
            } else {
                (old_qty * old_entry + signed_qty * fill.price) / new_qty
            }
        } else {
            // Reducing: entry price is unchanged for the remainder.
            old_entry
        };

        // SL/TP/entry_time/entry_qty are fixed at the moment a position
        // opens from flat and carried unchanged through adds and reduces;
        // only a fresh open re-derives them.
        let (new_sl, new_tp, new_entry_time, new_entry_qty) = if opened_from_flat {
            match entry_levels {
                Some(levels) => (levels.stop_loss, levels.take_profit, levels.entry_time, levels.entry_qty),
                None => (old.stop_loss, old.take_profit, old.entry_time, old.entry_qty),
            }
        } else {
            (old.stop_loss, old.take_profit, old.entry_time, old.entry_qty)
        };

        if new_qty.is_zero() {
            self.positions.remove(&key);
        } else {
            self.positions.insert(key, PositionState { qty: new_qty, entry_price: new_entry, stop_loss: new_sl, take_profit: new_tp, entry_time: new_entry_time, entry_qty: new_entry_qty });
        }

        let realized_pnl = match fill.side {
            Side::Long => Decimal::ZERO, // buys open/add to lots, no realization.
            Side::Short => {
                let consumption = self.lot_book.consume(symbol, fill.qty, fill.price, fill.fee);
                consumption.realized_pnl
            }
        };
        if fill.side == Side::Long {
            self.lot_book.add_lot(symbol, fill.qty, fill.price, fill.fee, trade_id);
        }
        self.total_realized_pnl += realized_pnl;

        // Step 8 tolerance is a tight per-fill epsilon; the looser
        // whole-cycle reconciliation budget lives in the orchestrator. This
        // check runs before any store write: on failure nothing below has
        // touched cash/positions/trades/lots, so there is nothing to undo
        // there — only the in-memory staging needs restoring.
        let eps = Decimal::new(1, 2);
        let equity_after = self.equity(|_| fill.price);
        if (equity_before - equity_after).abs() > fill.fee + eps {
            self.cash = staged_cash;
            self.positions = staged_positions;
            self.total_realized_pnl = staged_realized;
            self.lot_book = staged_lot_book;
            return Err(EngineError::InvariantViolation(format!("equity jumped implausibly for {symbol}: before={equity_before} after={equity_after}")));
        }

        store.save_cash(session_id, self.cash).map_err(EngineError::Store)?;
        let verified = store.get_cash(session_id).map_err(EngineError::Store)?;
        if verified != self.cash {
            self.cash = staged_cash;
            self.positions = staged_positions;
            self.total_realized_pnl = staged_realized;
            self.lot_book = staged_lot_book;
            return Err(EngineError::InvariantViolation(format!("CASH_SAVE_VERIFIED mismatch for {symbol}: saved {} read back {}", self.cash, verified)));
        }

        if new_qty.is_zero() {
            store.remove_position(session_id, symbol, strategy).map_err(EngineError::Store)?;
        } else {
            store
                .upsert_position(
                    session_id,
                    &PositionRow {
                        symbol: symbol.to_string(),
                        strategy: strategy.to_string(),
                        qty: new_qty,
                        entry_price: new_entry,
                        stop_loss: new_sl,
                        take_profit: new_tp,
                        entry_time: new_entry_time,
                        entry_qty: new_entry_qty,
                    },
                )
                .map_err(EngineError::Store)?;
        }

        store.save_lots(session_id, symbol, &self.lot_book.export_rows(symbol)).map_err(EngineError::Store)?;

        store
            .append_trade(
                session_id,
                &TradeRow {
                    trade_id: trade_id.to_string(),
                    symbol: symbol.to_string(),
                    side: if fill.side == Side::Long { "buy".into() } else { "sell".into() },
                    qty: fill.qty,
                    price: fill.price,
                    fee: fill.fee,
                    realized_pnl,
                    ts: now_ts,
                },
            )
            .map_err(EngineError::Store)?;

        store
            .append_cash_equity(session_id, &CashEquityRow { ts: now_ts, cash: self.cash, equity: equity_after })
            .map_err(EngineError::Store)?;

        self.applied_trade_ids.insert(trade_id.to_string());
        Ok(FillOutcome { realized_pnl, cash_after: self.cash, equity_after, crossed_zero })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStateStore;

    fn dec(m: i64, s: u32) -> Decimal {
        Decimal::new(m, s)
    }

    #[test]
    fn buy_fill_debits_cash_and_opens_position() {
        let mut store = MemoryStateStore::new();
        let mut portfolio = Portfolio::new(dec(10000, 0));
        let fill = Fill { side: Side::Long, qty: dec(1, 1), price: dec(50000, 0), fee: Decimal::ZERO };
        let outcome = portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "t1", fill, dec(10000, 0), 0, None).unwrap();
        assert_eq!(portfolio.cash(), dec(5000, 0));
        assert_eq!(outcome.realized_pnl, Decimal::ZERO);
        assert_eq!(portfolio.position("BTC/USDT", "composite"), (dec(1, 1), dec(50000, 0)));
    }

    #[test]
    fn buy_rejected_when_it_would_overdraw_cash() {
        let mut store = MemoryStateStore::new();
        let mut portfolio = Portfolio::new(dec(100, 0));
        let fill = Fill { side: Side::Long, qty: dec(1, 0), price: dec(50000, 0), fee: Decimal::ZERO };
        let err = portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "t1", fill, dec(100, 0), 0, None).unwrap_err();
        assert!(matches!(err, EngineError::BudgetExhausted(_)));
        assert_eq!(portfolio.cash(), dec(100, 0)); // rolled back
    }

    #[test]
    fn sell_fill_realizes_pnl_via_lot_book() {
        let mut store = MemoryStateStore::new();
        let mut portfolio = Portfolio::new(dec(10000, 0));
        let buy = Fill { side: Side::Long, qty: dec(1, 1), price: dec(50000, 0), fee: Decimal::ZERO };
        portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "t1", buy, dec(10000, 0), 0, None).unwrap();

        let equity_before = portfolio.equity(|_| dec(52000, 0));
        let sell = Fill { side: Side::Short, qty: dec(1, 1), price: dec(52000, 0), fee: Decimal::ZERO };
        let outcome = portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "t2", sell, equity_before, 1, None).unwrap();
        assert_eq!(outcome.realized_pnl, dec(1, 1) * (dec(52000, 0) - dec(50000, 0)));
        assert_eq!(portfolio.position("BTC/USDT", "composite"), (Decimal::ZERO, Decimal::ZERO));
    }

    #[test]
    fn replaying_a_trade_id_is_a_no_op() {
        let mut store = MemoryStateStore::new();
        let mut portfolio = Portfolio::new(dec(10000, 0));
        let fill = Fill { side: Side::Long, qty: dec(1, 1), price: dec(50000, 0), fee: Decimal::ZERO };
        portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "dup", fill, dec(10000, 0), 0, None).unwrap();
        let cash_after_first = portfolio.cash();
        let realized_after_first = portfolio.total_realized_pnl();

        let replay = portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "dup", fill, dec(10000, 0), 1, None).unwrap();
        assert_eq!(replay.realized_pnl, Decimal::ZERO);
        assert_eq!(portfolio.cash(), cash_after_first);
        assert_eq!(portfolio.total_realized_pnl(), realized_after_first);
        assert_eq!(portfolio.position("BTC/USDT", "composite"), (dec(1, 1), dec(50000, 0)));
    }

    #[test]
    fn replaying_a_trade_id_not_yet_seen_in_memory_but_persisted_is_also_a_no_op() {
        // Simulates a fresh `Portfolio` rebuilt after a restart where the
        // store still has the trade row from before the crash.
        let mut store = MemoryStateStore::new();
        let mut portfolio = Portfolio::new(dec(10000, 0));
        let fill = Fill { side: Side::Long, qty: dec(1, 1), price: dec(50000, 0), fee: Decimal::ZERO };
        portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "restart-replay", fill, dec(10000, 0), 0, None).unwrap();

        let mut fresh_portfolio = Portfolio::new(dec(5000, 0)); // pretend it already debited cash before crash
        let replay = fresh_portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "restart-replay", fill, dec(5000, 0), 1, None).unwrap();
        assert_eq!(replay.realized_pnl, Decimal::ZERO);
        assert_eq!(fresh_portfolio.cash(), dec(5000, 0));
    }

    #[test]
    fn entry_levels_are_set_on_open_and_survive_an_add() {
        let mut store = MemoryStateStore::new();
        let mut portfolio = Portfolio::new(dec(10000, 0));
        let levels = EntryLevels { stop_loss: dec(49000, 0), take_profit: dec(52000, 0), entry_time: 1000, entry_qty: dec(1, 1) };
        let open = Fill { side: Side::Long, qty: dec(1, 1), price: dec(50000, 0), fee: Decimal::ZERO };
        portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "t1", open, dec(10000, 0), 1000, Some(levels)).unwrap();

        let got = portfolio.position_levels("BTC/USDT", "composite").unwrap();
        assert_eq!(got.stop_loss, dec(49000, 0));
        assert_eq!(got.take_profit, dec(52000, 0));
        assert_eq!(got.entry_time, 1000);
        assert_eq!(got.entry_qty, dec(1, 1));

        // Adding to the position with different (ignored) levels must not
        // move the SL/TP/entry_qty set at the original entry.
        let add = Fill { side: Side::Long, qty: dec(5, 2), price: dec(51000, 0), fee: Decimal::ZERO };
        let other_levels = EntryLevels { stop_loss: dec(50000, 0), take_profit: dec(53000, 0), entry_time: 2000, entry_qty: dec(5, 2) };
        let equity_before = portfolio.equity(|_| dec(51000, 0));
        portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "t2", add, equity_before, 2000, Some(other_levels)).unwrap();
        let still = portfolio.position_levels("BTC/USDT", "composite").unwrap();
        assert_eq!(still.stop_loss, dec(49000, 0));
        assert_eq!(still.entry_time, 1000);
        assert_eq!(still.entry_qty, dec(1, 1));
    }

    #[test]
    fn equity_jump_invariant_failure_rolls_back_everything_and_writes_nothing() {
        let mut store = MemoryStateStore::new();
        let mut portfolio = Portfolio::new(dec(10000, 0));
        // A wildly wrong equity_before (as if a caller passed a stale or
        // corrupted mark) trips the per-fill equity-jump check.
        let fill = Fill { side: Side::Long, qty: dec(1, 1), price: dec(50000, 0), fee: Decimal::ZERO };
        let err = portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "bad-fill", fill, dec(999_999, 0), 0, None).unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));

        assert_eq!(portfolio.cash(), dec(10000, 0));
        assert_eq!(portfolio.position("BTC/USDT", "composite"), (Decimal::ZERO, Decimal::ZERO));
        assert_eq!(portfolio.total_realized_pnl(), Decimal::ZERO);
        assert!(!store.trade_exists("s1", "bad-fill").unwrap());
        assert!(store.get_positions("s1").unwrap().is_empty());
        assert!(store.load_lots("s1", "BTC/USDT").unwrap().is_empty());
        assert!(store.last_cash_equity("s1").unwrap().is_none());
    }

    #[test]
    fn lots_are_persisted_after_every_fill_that_touches_a_symbol() {
        let mut store = MemoryStateStore::new();
        let mut portfolio = Portfolio::new(dec(10000, 0));
        let buy = Fill { side: Side::Long, qty: dec(1, 1), price: dec(50000, 0), fee: Decimal::ZERO };
        portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "t1", buy, dec(10000, 0), 0, None).unwrap();

        let rows = store.load_lots("s1", "BTC/USDT").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].quantity, dec(1, 1));
        assert_eq!(rows[0].trade_id, "t1");

        let equity_before = portfolio.equity(|_| dec(52000, 0));
        let sell = Fill { side: Side::Short, qty: dec(1, 1), price: dec(52000, 0), fee: Decimal::ZERO };
        portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "t2", sell, equity_before, 1, None).unwrap();
        assert!(store.load_lots("s1", "BTC/USDT").unwrap().is_empty());
    }

    #[test]
    fn position_levels_is_none_once_closed() {
        let mut store = MemoryStateStore::new();
        let mut portfolio = Portfolio::new(dec(10000, 0));
        let levels = EntryLevels { stop_loss: dec(49000, 0), take_profit: dec(52000, 0), entry_time: 0, entry_qty: dec(1, 1) };
        let buy = Fill { side: Side::Long, qty: dec(1, 1), price: dec(50000, 0), fee: Decimal::ZERO };
        portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "t1", buy, dec(10000, 0), 0, Some(levels)).unwrap();

        let equity_before = portfolio.equity(|_| dec(52000, 0));
        let sell = Fill { side: Side::Short, qty: dec(1, 1), price: dec(52000, 0), fee: Decimal::ZERO };
        portfolio.apply_fill(&mut store, "s1", "BTC/USDT", "composite", "t2", sell, equity_before, 1, None).unwrap();
        assert!(portfolio.position_levels("BTC/USDT", "composite").is_none());
    }
}
