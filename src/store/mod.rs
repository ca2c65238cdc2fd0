//! State store: the persistence seam. Trait-based so tests can substitute
//! an in-memory double for the `rusqlite`-backed implementation.

pub mod memory;
pub mod sqlite;

use rust_decimal::prelude::*;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct PositionRow {
    pub symbol: String,
    pub strategy: String,
    pub qty: Decimal,
    pub entry_price: Decimal,
    /// SL/TP chosen by the three-tier derivation at entry, carried for the
    /// life of the position so the Exit Manager checks against the levels
    /// actually sized against rather than re-deriving a (possibly
    /// different, if config changed mid-session) fallback every cycle.
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub entry_time: i64,
    /// Quantity the position was opened with, fixed at the moment it opened
    /// from flat and carried unchanged through adds/reduces. Ladder sizing
    /// reads this instead of the live `qty`, which shrinks as levels fire.
    pub entry_qty: Decimal,
}

#[derive(Debug, Clone)]
pub struct TradeRow {
    pub trade_id: String,
    pub symbol: String,
    pub side: String,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub realized_pnl: Decimal,
    pub ts: i64,
}

#[derive(Debug, Clone)]
pub struct CashEquityRow {
    pub ts: i64,
    pub cash: Decimal,
    pub equity: Decimal,
}

#[derive(Debug, Clone)]
pub struct LotRow {
    pub symbol: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub trade_id: String,
}

#[derive(Debug, Clone)]
pub struct SignalWindowRow {
    pub symbol: String,
    pub timeframe: String,
    pub strategy: String,
    pub value: f64,
    pub ts: i64,
}

/// The full persistence contract the orchestrator drives. Every mutating
/// method is expected to be transactional at the storage layer; the
/// `PortfolioTransaction` above it handles cross-table rollback semantics.
///
/// `session_id` is mandatory on every call: it is the partition key of
/// every persisted row, and no call may read or write a row outside its
/// own session.
pub trait StateStore: Send {
    fn get_cash(&mut self, session_id: &str) -> anyhow::Result<Decimal>;
    fn save_cash(&mut self, session_id: &str, cash: Decimal) -> anyhow::Result<()>;

    fn get_positions(&mut self, session_id: &str) -> anyhow::Result<Vec<PositionRow>>;
    fn upsert_position(&mut self, session_id: &str, row: &PositionRow) -> anyhow::Result<()>;
    fn remove_position(&mut self, session_id: &str, symbol: &str, strategy: &str) -> anyhow::Result<()>;

    fn append_trade(&mut self, session_id: &str, row: &TradeRow) -> anyhow::Result<()>;
    fn trade_exists(&mut self, session_id: &str, trade_id: &str) -> anyhow::Result<bool>;

    fn append_cash_equity(&mut self, session_id: &str, row: &CashEquityRow) -> anyhow::Result<()>;
    fn last_cash_equity(&mut self, session_id: &str) -> anyhow::Result<Option<CashEquityRow>>;

    /// Replaces the persisted lot rows for `symbol` wholesale; the in-memory
    /// `LotBook` is the working copy, this is its durable mirror.
    fn save_lots(&mut self, session_id: &str, symbol: &str, lots: &[LotRow]) -> anyhow::Result<()>;
    fn load_lots(&mut self, session_id: &str, symbol: &str) -> anyhow::Result<Vec<LotRow>>;

    fn get_session_metadata(&mut self, session_id: &str) -> anyhow::Result<Value>;
    fn set_session_metadata(&mut self, session_id: &str, value: &Value) -> anyhow::Result<()>;

    /// Appends one sample and prunes the window to at most 200 rows per
    /// `(symbol, timeframe, strategy)`.
    fn push_signal_window(&mut self, session_id: &str, row: &SignalWindowRow) -> anyhow::Result<()>;
    fn load_signal_window(&mut self, session_id: &str, symbol: &str, timeframe: &str, strategy: &str) -> anyhow::Result<Vec<f64>>;
}

pub const SIGNAL_WINDOW_CAP: usize = 200;
