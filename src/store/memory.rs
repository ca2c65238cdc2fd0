//! In-memory `StateStore` test double: tests drive the orchestrator against
//! this rather than a real SQLite file.

use super::{CashEquityRow, LotRow, PositionRow, SignalWindowRow, StateStore, TradeRow, SIGNAL_WINDOW_CAP};
use rust_decimal::prelude::*;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Default)]
struct SessionData {
    cash_equity: Vec<CashEquityRow>,
    positions: HashMap<(String, String), PositionRow>,
    trades: HashMap<String, TradeRow>,
    lots: HashMap<String, Vec<LotRow>>,
    session_metadata: Value,
    signal_windows: HashMap<(String, String, String), Vec<(i64, f64)>>,
}

impl SessionData {
    fn new() -> Self {
        Self { session_metadata: Value::Object(Default::default()), ..Default::default() }
    }
}

/// `HashMap<session_id, SessionData>` — every row lives under its session's
/// bucket, so a bug that mixes up session ids can never silently read or
/// write another session's state.
#[derive(Default)]
pub struct MemoryStateStore {
    sessions: HashMap<String, SessionData>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&mut self, session_id: &str) -> &mut SessionData {
        self.sessions.entry(session_id.to_string()).or_insert_with(SessionData::new)
    }
}

impl StateStore for MemoryStateStore {
    fn get_cash(&mut self, session_id: &str) -> anyhow::Result<Decimal> {
        Ok(self.session(session_id).cash_equity.last().map(|r| r.cash).unwrap_or(Decimal::ZERO))
    }

    fn save_cash(&mut self, session_id: &str, cash: Decimal) -> anyhow::Result<()> {
        self.append_cash_equity(session_id, &CashEquityRow { ts: 0, cash, equity: cash })
    }

    fn get_positions(&mut self, session_id: &str) -> anyhow::Result<Vec<PositionRow>> {
        Ok(self.session(session_id).positions.values().cloned().collect())
    }

    fn upsert_position(&mut self, session_id: &str, row: &PositionRow) -> anyhow::Result<()> {
        self.session(session_id).positions.insert((row.symbol.clone(), row.strategy.clone()), row.clone());
        Ok(())
    }

    fn remove_position(&mut self, session_id: &str, symbol: &str, strategy: &str) -> anyhow::Result<()> {
        self.session(session_id).positions.remove(&(symbol.to_string(), strategy.to_string()));
        Ok(())
    }

    fn append_trade(&mut self, session_id: &str, row: &TradeRow) -> anyhow::Result<()> {
        self.session(session_id).trades.entry(row.trade_id.clone()).or_insert_with(|| row.clone());
        Ok(())
    }

    fn trade_exists(&mut self, session_id: &str, trade_id: &str) -> anyhow::Result<bool> {
        Ok(self.session(session_id).trades.contains_key(trade_id))
    }

    fn append_cash_equity(&mut self, session_id: &str, row: &CashEquityRow) -> anyhow::Result<()> {
        self.session(session_id).cash_equity.push(row.clone());
        Ok(())
    }

    fn last_cash_equity(&mut self, session_id: &str) -> anyhow::Result<Option<CashEquityRow>> {
        Ok(self.session(session_id).cash_equity.last().cloned())
    }

    fn save_lots(&mut self, session_id: &str, symbol: &str, lots: &[LotRow]) -> anyhow::Result<()> {
        self.session(session_id).lots.insert(symbol.to_string(), lots.to_vec());
        Ok(())
    }

    fn load_lots(&mut self, session_id: &str, symbol: &str) -> anyhow::Result<Vec<LotRow>> {
        Ok(self.session(session_id).lots.get(symbol).cloned().unwrap_or_default())
    }

    fn get_session_metadata(&mut self, session_id: &str) -> anyhow::Result<Value> {
        Ok(self.session(session_id).session_metadata.clone())
    }

    fn set_session_metadata(&mut self, session_id: &str, value: &Value) -> anyhow::Result<()> {
        self.session(session_id).session_metadata = value.clone();
        Ok(())
    }

    fn push_signal_window(&mut self, session_id: &str, row: &SignalWindowRow) -> anyhow::Result<()> {
        let key = (row.symbol.clone(), row.timeframe.clone(), row.strategy.clone());
        let window = self.session(session_id).signal_windows.entry(key).or_default();
        window.push((row.ts, row.value));
        if window.len() > SIGNAL_WINDOW_CAP {
            let overflow = window.len() - SIGNAL_WINDOW_CAP;
            window.drain(0..overflow);
        }
        Ok(())
    }

    fn load_signal_window(&mut self, session_id: &str, symbol: &str, timeframe: &str, strategy: &str) -> anyhow::Result<Vec<f64>> {
        let key = (symbol.to_string(), timeframe.to_string(), strategy.to_string());
        Ok(self.session(session_id).signal_windows.get(&key).map(|w| w.iter().map(|(_, v)| *v).collect()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_window_caps_at_200_in_memory_too() {
        let mut store = MemoryStateStore::new();
        for i in 0..250 {
            store.push_signal_window("s1", &SignalWindowRow { symbol: "BTC/USDT".into(), timeframe: "1h".into(), strategy: "ema".into(), value: i as f64, ts: i }).unwrap();
        }
        assert_eq!(store.load_signal_window("s1", "BTC/USDT", "1h", "ema").unwrap().len(), SIGNAL_WINDOW_CAP);
    }

    #[test]
    fn trade_dedup_by_id() {
        let mut store = MemoryStateStore::new();
        let row = TradeRow { trade_id: "t1".into(), symbol: "BTC/USDT".into(), side: "buy".into(), qty: Decimal::ONE, price: Decimal::new(50000, 0), fee: Decimal::ZERO, realized_pnl: Decimal::ZERO, ts: 0 };
        store.append_trade("s1", &row).unwrap();
        store.append_trade("s1", &row).unwrap();
        assert_eq!(store.session("s1").trades.len(), 1);
    }

    #[test]
    fn trade_exists_reflects_appended_rows() {
        let mut store = MemoryStateStore::new();
        assert!(!store.trade_exists("s1", "t1").unwrap());
        let row = TradeRow { trade_id: "t1".into(), symbol: "BTC/USDT".into(), side: "buy".into(), qty: Decimal::ONE, price: Decimal::new(50000, 0), fee: Decimal::ZERO, realized_pnl: Decimal::ZERO, ts: 0 };
        store.append_trade("s1", &row).unwrap();
        assert!(store.trade_exists("s1", "t1").unwrap());
        assert!(!store.trade_exists("s2", "t1").unwrap());
    }

    #[test]
    fn lots_round_trip_and_a_later_save_replaces_the_symbols_queue() {
        let mut store = MemoryStateStore::new();
        let lots = vec![LotRow { symbol: "BTC/USDT".into(), quantity: Decimal::ONE, price: Decimal::new(50000, 0), fee: Decimal::ZERO, trade_id: "t1".into() }];
        store.save_lots("s1", "BTC/USDT", &lots).unwrap();
        assert_eq!(store.load_lots("s1", "BTC/USDT").unwrap().len(), 1);
        store.save_lots("s1", "BTC/USDT", &[]).unwrap();
        assert!(store.load_lots("s1", "BTC/USDT").unwrap().is_empty());
    }

    #[test]
    fn sessions_are_fully_isolated() {
        let mut store = MemoryStateStore::new();
        store.save_cash("session-a", Decimal::new(1000, 0)).unwrap();
        store.save_cash("session-b", Decimal::new(9999, 0)).unwrap();
        assert_eq!(store.get_cash("session-a").unwrap(), Decimal::new(1000, 0));
        assert_eq!(store.get_cash("session-b").unwrap(), Decimal::new(9999, 0));

        let row = PositionRow { symbol: "BTC/USDT".into(), strategy: "composite".into(), qty: Decimal::ONE, entry_price: Decimal::new(50000, 0), stop_loss: Decimal::new(49000, 0), take_profit: Decimal::new(52000, 0), entry_time: 0, entry_qty: Decimal::ONE };
        store.upsert_position("session-a", &row).unwrap();
        assert!(store.get_positions("session-a").unwrap().len() == 1);
        assert!(store.get_positions("session-b").unwrap().is_empty());
    }
}
