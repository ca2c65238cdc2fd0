//! FIFO lot book: `Decimal` arithmetic throughout, a `VecDeque<Lot>` per
//! symbol, and `trade_id`-keyed idempotency on `add_lot` so a replayed fill
//! never double-books a lot.
//!
//! Short sells with no lot on deposit do not raise — the remainder is
//! treated as an opening short at zero realized P&L, so the lot book can
//! represent a long-to-short flip in one fill (see DESIGN.md).

use crate::store::LotRow;
use rust_decimal::prelude::*;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone)]
pub struct Lot {
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub trade_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConsumptionResult {
    pub realized_pnl: Decimal,
    pub total_fees: Decimal,
    /// Quantity that exceeded available long lots and was treated as an
    /// opening short (zero realized P&L contribution).
    pub opened_short_qty: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct LotBook {
    lots: std::collections::HashMap<String, VecDeque<Lot>>,
    seen_trade_ids: HashSet<String>,
}

impl LotBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a lot on a buy fill. A repeated `trade_id` (e.g. a replayed
    /// fill after a crash-restart) is a no-op.
    pub fn add_lot(&mut self, symbol: &str, quantity: Decimal, price: Decimal, fee: Decimal, trade_id: &str) {
        if !self.seen_trade_ids.insert(trade_id.to_string()) {
            return;
        }
        self.lots.entry(symbol.to_string()).or_default().push_back(Lot { quantity, price, fee, trade_id: trade_id.to_string() });
    }

    pub fn available_quantity(&self, symbol: &str) -> Decimal {
        self.lots.get(symbol).map(|lots| lots.iter().map(|l| l.quantity).sum()).unwrap_or(Decimal::ZERO)
    }

    pub fn lots(&self, symbol: &str) -> &[Lot] {
        self.lots.get(symbol).map(|d| d.as_slices().0).unwrap_or(&[])
    }

    /// Snapshot of a symbol's remaining lots as store rows, for persisting
    /// the FIFO queue after every fill that touches it.
    pub fn export_rows(&self, symbol: &str) -> Vec<LotRow> {
        self.lots(symbol).iter().map(|l| LotRow { symbol: symbol.to_string(), quantity: l.quantity, price: l.price, fee: l.fee, trade_id: l.trade_id.clone() }).collect()
    }

    /// FIFO consumption on a sell fill. `lot.fee_portion = lot.fee *
    /// consumed_qty / lot.quantity`; `lot_realized_pnl = exit_proceeds -
    /// entry_cost - lot_fee_portion`.
    pub fn consume(&mut self, symbol: &str, quantity: Decimal, fill_price: Decimal, fee: Decimal) -> ConsumptionResult {
        let mut remaining = quantity;
        let mut realized_pnl = Decimal::ZERO;
        let mut total_fees = fee;

        if let Some(deque) = self.lots.get_mut(symbol) {
            while remaining > Decimal::ZERO {
                let Some(front) = deque.front_mut() else { break };
                let consumed = remaining.min(front.quantity);
                let entry_cost = front.price * consumed;
                let exit_proceeds = fill_price * consumed;
                let lot_fee_portion = if front.quantity.is_zero() { Decimal::ZERO } else { front.fee * consumed / front.quantity };

                realized_pnl += exit_proceeds - entry_cost - lot_fee_portion;
                total_fees += lot_fee_portion;

                front.quantity -= consumed;
                front.fee -= lot_fee_portion;
                remaining -= consumed;

                if front.quantity <= Decimal::new(1, 8) {
                    deque.pop_front();
                }
            }
            if deque.is_empty() {
                self.lots.remove(symbol);
            }
        }

        ConsumptionResult { realized_pnl, total_fees, opened_short_qty: remaining }
    }

    pub fn clear_symbol(&mut self, symbol: &str) {
        self.lots.remove(symbol);
    }
}
