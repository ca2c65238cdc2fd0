//! `rusqlite`-backed `StateStore`: bundled SQLite, `Connection::transaction()`
//! for multi-statement writes. `Decimal` values are stored as `TEXT` —
//! SQLite has no fixed-point type, and string round-tripping is exact where
//! `REAL` would reintroduce float error.
//!
//! `session_id` is the leading column of every table and the partition key
//! of every persisted row; every query filters on it explicitly rather than
//! relying on a single-session file per process.

use super::{CashEquityRow, LotRow, PositionRow, SignalWindowRow, StateStore, TradeRow, SIGNAL_WINDOW_CAP};
use rusqlite::{params, Connection};
use rust_decimal::prelude::*;
use serde_json::Value;

pub struct SqliteStateStore {
    conn: Connection,
}

impl SqliteStateStore {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> anyhow::Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS cash_equity (
                session_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                cash TEXT NOT NULL,
                equity TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cash_equity_session ON cash_equity(session_id, ts);
            CREATE TABLE IF NOT EXISTS positions (
                session_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                strategy TEXT NOT NULL,
                qty TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                stop_loss TEXT NOT NULL DEFAULT '0',
                take_profit TEXT NOT NULL DEFAULT '0',
                entry_time INTEGER NOT NULL DEFAULT 0,
                entry_qty TEXT NOT NULL DEFAULT '0',
                PRIMARY KEY (session_id, symbol, strategy)
            );
            CREATE TABLE IF NOT EXISTS trades (
                session_id TEXT NOT NULL,
                trade_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                qty TEXT NOT NULL,
                price TEXT NOT NULL,
                fee TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                ts INTEGER NOT NULL,
                PRIMARY KEY (session_id, trade_id)
            );
            CREATE TABLE IF NOT EXISTS lotbook (
                session_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                fee TEXT NOT NULL,
                trade_id TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_lotbook_session_symbol ON lotbook(session_id, symbol);
            CREATE TABLE IF NOT EXISTS session_metadata (
                session_id TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS signal_windows (
                session_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                strategy TEXT NOT NULL,
                value REAL NOT NULL,
                ts INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signal_windows_key ON signal_windows(session_id, symbol, timeframe, strategy);
            COMMIT;",
        )?;
        Ok(())
    }
}

fn dec_to_sql(d: Decimal) -> String {
    d.to_string()
}

fn sql_to_dec(s: String) -> anyhow::Result<Decimal> {
    Decimal::from_str(&s).map_err(|e| anyhow::anyhow!("invalid decimal {s}: {e}"))
}

impl StateStore for SqliteStateStore {
    fn get_cash(&mut self, session_id: &str) -> anyhow::Result<Decimal> {
        match self.last_cash_equity(session_id)? {
            Some(row) => Ok(row.cash),
            None => Ok(Decimal::ZERO),
        }
    }

    fn save_cash(&mut self, session_id: &str, cash: Decimal) -> anyhow::Result<()> {
        // A bare cash save (no equity figure yet) is recorded with equity
        // mirroring cash; the full cash+equity pair is appended by
        // `append_cash_equity` once the portfolio has recomputed equity.
        self.append_cash_equity(session_id, &CashEquityRow { ts: chrono_now(), cash, equity: cash })
    }

    fn get_positions(&mut self, session_id: &str) -> anyhow::Result<Vec<PositionRow>> {
        let mut stmt =
            self.conn.prepare("SELECT symbol, strategy, qty, entry_price, stop_loss, take_profit, entry_time, entry_qty FROM positions WHERE session_id = ?1")?;
        let rows = stmt.query_map(params![session_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, i64>(6)?,
                r.get::<_, String>(7)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (symbol, strategy, qty, entry_price, stop_loss, take_profit, entry_time, entry_qty) = row?;
            out.push(PositionRow {
                symbol,
                strategy,
                qty: sql_to_dec(qty)?,
                entry_price: sql_to_dec(entry_price)?,
                stop_loss: sql_to_dec(stop_loss)?,
                take_profit: sql_to_dec(take_profit)?,
                entry_time,
                entry_qty: sql_to_dec(entry_qty)?,
            });
        }
        Ok(out)
    }

    fn upsert_position(&mut self, session_id: &str, row: &PositionRow) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO positions (session_id, symbol, strategy, qty, entry_price, stop_loss, take_profit, entry_time, entry_qty) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(session_id, symbol, strategy) DO UPDATE SET qty = excluded.qty, entry_price = excluded.entry_price,
                stop_loss = excluded.stop_loss, take_profit = excluded.take_profit, entry_time = excluded.entry_time, entry_qty = excluded.entry_qty",
            params![
                session_id,
                row.symbol,
                row.strategy,
                dec_to_sql(row.qty),
                dec_to_sql(row.entry_price),
                dec_to_sql(row.stop_loss),
                dec_to_sql(row.take_profit),
                row.entry_time,
                dec_to_sql(row.entry_qty)
            ],
        )?;
        Ok(())
    }

    fn remove_position(&mut self, session_id: &str, symbol: &str, strategy: &str) -> anyhow::Result<()> {
        self.conn.execute(
            "DELETE FROM positions WHERE session_id = ?1 AND symbol = ?2 AND strategy = ?3",
            params![session_id, symbol, strategy],
        )?;
        Ok(())
    }

    fn append_trade(&mut self, session_id: &str, row: &TradeRow) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO trades (session_id, trade_id, symbol, side, qty, price, fee, realized_pnl, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session_id,
                row.trade_id,
                row.symbol,
                row.side,
                dec_to_sql(row.qty),
                dec_to_sql(row.price),
                dec_to_sql(row.fee),
                dec_to_sql(row.realized_pnl),
                row.ts
            ],
        )?;
        Ok(())
    }

    fn trade_exists(&mut self, session_id: &str, trade_id: &str) -> anyhow::Result<bool> {
        let mut stmt = self.conn.prepare("SELECT 1 FROM trades WHERE session_id = ?1 AND trade_id = ?2")?;
        Ok(stmt.exists(params![session_id, trade_id])?)
    }

    fn append_cash_equity(&mut self, session_id: &str, row: &CashEquityRow) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO cash_equity (session_id, ts, cash, equity) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, row.ts, dec_to_sql(row.cash), dec_to_sql(row.equity)],
        )?;
        Ok(())
    }

    fn last_cash_equity(&mut self, session_id: &str) -> anyhow::Result<Option<CashEquityRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT ts, cash, equity FROM cash_equity WHERE session_id = ?1 ORDER BY ts DESC, rowid DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![session_id], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?)))?;
        match rows.next() {
            Some(row) => {
                let (ts, cash, equity) = row?;
                Ok(Some(CashEquityRow { ts, cash: sql_to_dec(cash)?, equity: sql_to_dec(equity)? }))
            }
            None => Ok(None),
        }
    }

    fn save_lots(&mut self, session_id: &str, symbol: &str, lots: &[LotRow]) -> anyhow::Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM lotbook WHERE session_id = ?1 AND symbol = ?2", params![session_id, symbol])?;
        for lot in lots {
            tx.execute(
                "INSERT INTO lotbook (session_id, symbol, quantity, price, fee, trade_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![session_id, lot.symbol, dec_to_sql(lot.quantity), dec_to_sql(lot.price), dec_to_sql(lot.fee), lot.trade_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_lots(&mut self, session_id: &str, symbol: &str) -> anyhow::Result<Vec<LotRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT symbol, quantity, price, fee, trade_id FROM lotbook WHERE session_id = ?1 AND symbol = ?2 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![session_id, symbol], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?, r.get::<_, String>(3)?, r.get::<_, String>(4)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (symbol, quantity, price, fee, trade_id) = row?;
            out.push(LotRow { symbol, quantity: sql_to_dec(quantity)?, price: sql_to_dec(price)?, fee: sql_to_dec(fee)?, trade_id });
        }
        Ok(out)
    }

    fn get_session_metadata(&mut self, session_id: &str) -> anyhow::Result<Value> {
        let mut stmt = self.conn.prepare("SELECT value FROM session_metadata WHERE session_id = ?1")?;
        let mut rows = stmt.query_map(params![session_id], |r| r.get::<_, String>(0))?;
        match rows.next() {
            Some(raw) => Ok(serde_json::from_str(&raw?)?),
            None => Ok(Value::Object(Default::default())),
        }
    }

    fn set_session_metadata(&mut self, session_id: &str, value: &Value) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO session_metadata (session_id, value) VALUES (?1, ?2)
             ON CONFLICT(session_id) DO UPDATE SET value = excluded.value",
            params![session_id, value.to_string()],
        )?;
        Ok(())
    }

    fn push_signal_window(&mut self, session_id: &str, row: &SignalWindowRow) -> anyhow::Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO signal_windows (session_id, symbol, timeframe, strategy, value, ts) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![session_id, row.symbol, row.timeframe, row.strategy, row.value, row.ts],
        )?;
        tx.execute(
            "DELETE FROM signal_windows WHERE session_id = ?1 AND symbol = ?2 AND timeframe = ?3 AND strategy = ?4
             AND rowid NOT IN (
                 SELECT rowid FROM signal_windows WHERE session_id = ?1 AND symbol = ?2 AND timeframe = ?3 AND strategy = ?4
                 ORDER BY ts DESC, rowid DESC LIMIT ?5
             )",
            params![session_id, row.symbol, row.timeframe, row.strategy, SIGNAL_WINDOW_CAP as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn load_signal_window(&mut self, session_id: &str, symbol: &str, timeframe: &str, strategy: &str) -> anyhow::Result<Vec<f64>> {
        let mut stmt = self.conn.prepare(
            "SELECT value FROM signal_windows WHERE session_id = ?1 AND symbol = ?2 AND timeframe = ?3 AND strategy = ?4 ORDER BY ts ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![session_id, symbol, timeframe, strategy], |r| r.get::<_, f64>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn chrono_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> SqliteStateStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sqlite");
        // Leak the tempdir so the file survives for the store's lifetime in this test.
        std::mem::forget(dir);
        SqliteStateStore::open(path.to_str().unwrap()).unwrap()
    }

    #[test]
    fn cash_round_trips_exactly() {
        let mut store = temp_store();
        store.save_cash("s1", Decimal::new(1000050, 2)).unwrap();
        assert_eq!(store.get_cash("s1").unwrap(), Decimal::new(1000050, 2));
    }

    #[test]
    fn position_upsert_then_remove() {
        let mut store = temp_store();
        let row = PositionRow { symbol: "BTC/USDT".into(), strategy: "composite".into(), qty: Decimal::new(1, 1), entry_price: Decimal::new(50000, 0), stop_loss: Decimal::new(49000, 0), take_profit: Decimal::new(52000, 0), entry_time: 0, entry_qty: Decimal::new(1, 1) };
        store.upsert_position("s1", &row).unwrap();
        assert_eq!(store.get_positions("s1").unwrap().len(), 1);
        store.remove_position("s1", "BTC/USDT", "composite").unwrap();
        assert!(store.get_positions("s1").unwrap().is_empty());
    }

    #[test]
    fn signal_window_capped_at_200() {
        let mut store = temp_store();
        for i in 0..250 {
            store.push_signal_window("s1", &SignalWindowRow { symbol: "BTC/USDT".into(), timeframe: "1h".into(), strategy: "ema".into(), value: i as f64, ts: i }).unwrap();
        }
        let window = store.load_signal_window("s1", "BTC/USDT", "1h", "ema").unwrap();
        assert_eq!(window.len(), super::SIGNAL_WINDOW_CAP);
        assert_eq!(*window.last().unwrap(), 249.0);
    }

    #[test]
    fn trade_append_is_idempotent_on_trade_id() {
        let mut store = temp_store();
        let row = TradeRow { trade_id: "t1".into(), symbol: "BTC/USDT".into(), side: "buy".into(), qty: Decimal::new(1, 0), price: Decimal::new(50000, 0), fee: Decimal::ZERO, realized_pnl: Decimal::ZERO, ts: 0 };
        store.append_trade("s1", &row).unwrap();
        store.append_trade("s1", &row).unwrap();
        let count: i64 = store.conn.query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn trade_exists_reflects_appended_rows() {
        let mut store = temp_store();
        assert!(!store.trade_exists("s1", "t1").unwrap());
        let row = TradeRow { trade_id: "t1".into(), symbol: "BTC/USDT".into(), side: "buy".into(), qty: Decimal::new(1, 0), price: Decimal::new(50000, 0), fee: Decimal::ZERO, realized_pnl: Decimal::ZERO, ts: 0 };
        store.append_trade("s1", &row).unwrap();
        assert!(store.trade_exists("s1", "t1").unwrap());
        assert!(!store.trade_exists("s2", "t1").unwrap());
    }

    #[test]
    fn lots_round_trip_in_fifo_order() {
        let mut store = temp_store();
        let lots = vec![
            LotRow { symbol: "BTC/USDT".into(), quantity: Decimal::new(1, 1), price: Decimal::new(49000, 0), fee: Decimal::ZERO, trade_id: "t1".into() },
            LotRow { symbol: "BTC/USDT".into(), quantity: Decimal::new(2, 1), price: Decimal::new(51000, 0), fee: Decimal::ZERO, trade_id: "t2".into() },
        ];
        store.save_lots("s1", "BTC/USDT", &lots).unwrap();
        let loaded = store.load_lots("s1", "BTC/USDT").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].trade_id, "t1");
        assert_eq!(loaded[1].trade_id, "t2");

        // A later save replaces the whole FIFO queue for that symbol.
        store.save_lots("s1", "BTC/USDT", &[lots[1].clone()]).unwrap();
        let replaced = store.load_lots("s1", "BTC/USDT").unwrap();
        assert_eq!(replaced.len(), 1);
        assert_eq!(replaced[0].trade_id, "t2");
    }

    #[test]
    fn rows_are_isolated_between_sessions() {
        let mut store = temp_store();
        let row = PositionRow { symbol: "BTC/USDT".into(), strategy: "composite".into(), qty: Decimal::new(1, 0), entry_price: Decimal::new(50000, 0), stop_loss: Decimal::new(49000, 0), take_profit: Decimal::new(52000, 0), entry_time: 0, entry_qty: Decimal::new(1, 0) };
        store.upsert_position("session-a", &row).unwrap();
        assert!(store.get_positions("session-a").unwrap().len() == 1);
        assert!(store.get_positions("session-b").unwrap().is_empty());
    }
}
