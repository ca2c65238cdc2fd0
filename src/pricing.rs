//! Pricing snapshot manager.
//!
//! An explicit `CycleContext` value the orchestrator owns and threads
//! through every call that needs a price, rather than a process-wide
//! singleton — a stale or mismatched `cycle_id` is a normal `Result::Err`
//! at the call site, not a hidden global check.

use crate::contracts::DataEngine;
use crate::errors::EngineError;
use rust_decimal::prelude::*;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Long,
    Short,
}

#[derive(Debug, Clone)]
pub struct PriceData {
    pub price: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub mid: Option<Decimal>,
    pub last: Option<Decimal>,
    pub source: String,
    pub ts: i64,
}

#[derive(Debug, Clone)]
pub struct Provenance {
    pub venue: String,
    pub price_type: String,
}

/// Immutable once returned by `create_snapshot`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: u64,
    pub ts: i64,
    by_symbol: HashMap<String, PriceData>,
    locked_provenance: HashMap<String, Provenance>,
}

impl Snapshot {
    pub fn get_mark_price(&self, symbol: &str) -> Option<Decimal> {
        let p = self.by_symbol.get(symbol)?;
        p.mid.or(p.last).or(Some(p.price))
    }

    pub fn get_entry_price(&self, symbol: &str) -> Option<Decimal> {
        let p = self.by_symbol.get(symbol)?;
        p.mid.or(Some(p.price))
    }

    pub fn get_exit_value(&self, symbol: &str, side: Side) -> Option<Decimal> {
        let p = self.by_symbol.get(symbol)?;
        match side {
            Side::Long => p.bid.or(p.mid).or(Some(p.price)),
            Side::Short => p.ask.or(p.mid).or(Some(p.price)),
        }
    }

    pub fn price_data(&self, symbol: &str) -> Option<&PriceData> {
        self.by_symbol.get(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &String> {
        self.by_symbol.keys()
    }

    pub fn locked_provenance(&self, symbol: &str) -> Option<&Provenance> {
        self.locked_provenance.get(symbol)
    }
}

/// Owns the sealed snapshot for exactly one cycle plus hit/miss counters.
/// The orchestrator creates one per cycle and discards it at the boundary.
pub struct CycleContext {
    pub cycle_id: u64,
    snapshot: Option<Snapshot>,
    hits: u64,
    misses: u64,
    locked_provenance: HashMap<String, Provenance>,
}

impl CycleContext {
    pub fn new(cycle_id: u64) -> Self {
        Self {
            cycle_id,
            snapshot: None,
            hits: 0,
            misses: 0,
            locked_provenance: HashMap::new(),
        }
    }

    /// Fetch a ticker per symbol with bounded parallel fan-out — the one
    /// place concurrent fetch happens in a cycle. Failures and stale data
    /// never abort the snapshot — the symbol is simply omitted, or tagged
    /// `*_STALE` and kept.
    pub async fn create_snapshot<D: DataEngine + ?Sized>(
        &mut self,
        symbols: &[String],
        data_engine: &D,
        fetch_timeout: Duration,
    ) -> Snapshot {
        let mut by_symbol = HashMap::new();
        let mut fresh = 0usize;
        let mut stale = 0usize;
        let mut failed = 0usize;

        let fetches = symbols.iter().map(|symbol| async move {
            let result = tokio::time::timeout(fetch_timeout, data_engine.get_ticker(symbol)).await;
            (symbol.clone(), result)
        });
        let results = futures_util::future::join_all(fetches).await;

        for (symbol, result) in results {
            match result {
                Ok(Ok(ticker)) if ticker.price > Decimal::ZERO => {
                    let mut source = ticker.provenance_source.clone();
                    if ticker.is_stale {
                        source = format!("{source}_STALE");
                        stale += 1;
                    } else {
                        fresh += 1;
                    }
                    by_symbol.insert(
                        symbol,
                        PriceData {
                            price: ticker.price,
                            bid: ticker.bid,
                            ask: ticker.ask,
                            mid: ticker.mid.or_else(|| match (ticker.bid, ticker.ask) {
                                (Some(b), Some(a)) => Some((b + a) / Decimal::TWO),
                                _ => None,
                            }),
                            last: ticker.last,
                            source,
                            ts: ticker.timestamp,
                        },
                    );
                }
                _ => {
                    failed += 1;
                    crate::logging::json_log(
                        "pricing",
                        "DATA_SKIP",
                        crate::logging::obj(&[("symbol", crate::logging::v_str(&symbol))]),
                    );
                }
            }
        }

        crate::logging::json_log(
            "pricing",
            "SNAPSHOT_COMPLETE",
            crate::logging::obj(&[
                ("cycle_id", crate::logging::v_num(self.cycle_id as f64)),
                ("fresh", crate::logging::v_num(fresh as f64)),
                ("stale", crate::logging::v_num(stale as f64)),
                ("failed", crate::logging::v_num(failed as f64)),
            ]),
        );

        let snapshot = Snapshot {
            id: self.cycle_id,
            ts: chrono::Utc::now().timestamp(),
            by_symbol,
            locked_provenance: self.locked_provenance.clone(),
        };
        self.snapshot = Some(snapshot.clone());
        snapshot
    }

    fn snapshot_for(&mut self, cycle_id: u64) -> Result<&Snapshot, EngineError> {
        if cycle_id != self.cycle_id {
            return Err(EngineError::PricingContext(format!(
                "cycle_id mismatch: context is {}, request was {}",
                self.cycle_id, cycle_id
            )));
        }
        self.snapshot
            .as_ref()
            .ok_or_else(|| EngineError::PricingContext("no snapshot sealed for this cycle".into()))
    }

    pub fn get_mark_price(&mut self, cycle_id: u64, symbol: &str) -> Result<Option<Decimal>, EngineError> {
        let snap = self.snapshot_for(cycle_id)?;
        let v = snap.get_mark_price(symbol);
        if v.is_some() { self.hits += 1 } else { self.misses += 1 }
        Ok(v)
    }

    pub fn get_entry_price(&mut self, cycle_id: u64, symbol: &str) -> Result<Option<Decimal>, EngineError> {
        let snap = self.snapshot_for(cycle_id)?;
        let v = snap.get_entry_price(symbol);
        if v.is_some() { self.hits += 1 } else { self.misses += 1 }
        Ok(v)
    }

    pub fn get_exit_value(&mut self, cycle_id: u64, symbol: &str, side: Side) -> Result<Option<Decimal>, EngineError> {
        let snap = self.snapshot_for(cycle_id)?;
        let v = snap.get_exit_value(symbol, side);
        if v.is_some() { self.hits += 1 } else { self.misses += 1 }
        Ok(v)
    }

    pub fn lock_provenance(&mut self, symbol: &str, venue: &str, price_type: &str) {
        self.locked_provenance.insert(
            symbol.to_string(),
            Provenance { venue: venue.to_string(), price_type: price_type.to_string() },
        );
    }

    pub fn hit_miss(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Clears the sealed snapshot at the cycle boundary.
    pub fn clear(&mut self) {
        self.snapshot = None;
    }
}
