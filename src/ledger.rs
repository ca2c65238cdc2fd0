//! Trade ledger and analytics. The append-only fill log is the `trades`
//! table the state store already owns; this module derives the
//! daily/session rollup read off of it: win rate, realized P&L, total fees,
//! drawdown, and trade count.

use crate::store::TradeRow;
use rust_decimal::prelude::*;

#[derive(Debug, Clone)]
pub struct LedgerMetrics {
    pub trade_count: usize,
    pub win_count: usize,
    pub loss_count: usize,
    pub win_rate: Decimal,
    pub total_realized_pnl: Decimal,
    pub total_fees: Decimal,
    pub max_drawdown: Decimal,
}

impl LedgerMetrics {
    fn empty() -> Self {
        Self {
            trade_count: 0,
            win_count: 0,
            loss_count: 0,
            win_rate: Decimal::ZERO,
            total_realized_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
        }
    }
}

/// Append-only record of every accepted fill for this session, mirrored in
/// the `trades` table by `Portfolio::apply_fill`. Kept here as the
/// in-process fallback source of truth tests read from when a durable
/// store round-trip isn't the point of the test.
#[derive(Debug, Default)]
pub struct TradeLedger {
    fills: Vec<TradeRow>,
}

impl TradeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, row: TradeRow) {
        self.fills.push(row);
    }

    pub fn fills(&self) -> &[TradeRow] {
        &self.fills
    }

    /// Computes win rate, realized P&L, fees, and per-sell drawdown purely
    /// from the fills recorded so far. Only sells realize P&L (buys open or
    /// add to a position), so the win/loss tally is over sell fills.
    pub fn metrics(&self) -> LedgerMetrics {
        metrics_from_trades(&self.fills)
    }
}

/// Same computation driven off an arbitrary `trades` slice — used for
/// reporting across process restarts, where the caller has reconstructed the
/// trade history some other way (the State Store's `trades` table has no
/// bulk-read method today; see DESIGN.md).
pub fn metrics_from_trades(trades: &[TradeRow]) -> LedgerMetrics {
    if trades.is_empty() {
        return LedgerMetrics::empty();
    }

    let mut win_count = 0usize;
    let mut loss_count = 0usize;
    let mut total_realized_pnl = Decimal::ZERO;
    let mut total_fees = Decimal::ZERO;
    let mut running_pnl = Decimal::ZERO;
    let mut peak = Decimal::ZERO;
    let mut max_drawdown = Decimal::ZERO;

    for trade in trades {
        total_fees += trade.fee;
        if trade.side == "sell" {
            total_realized_pnl += trade.realized_pnl;
            if trade.realized_pnl > Decimal::ZERO {
                win_count += 1;
            } else if trade.realized_pnl < Decimal::ZERO {
                loss_count += 1;
            }
        }
        running_pnl += trade.realized_pnl;
        peak = peak.max(running_pnl);
        let drawdown = peak - running_pnl;
        max_drawdown = max_drawdown.max(drawdown);
    }

    let decided = win_count + loss_count;
    let win_rate = if decided > 0 {
        Decimal::from(win_count) / Decimal::from(decided)
    } else {
        Decimal::ZERO
    };

    LedgerMetrics {
        trade_count: trades.len(),
        win_count,
        loss_count,
        win_rate,
        total_realized_pnl,
        total_fees,
        max_drawdown,
    }
}
