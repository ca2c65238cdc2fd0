//! External collaborator contracts.
//!
//! The data engine, the signal engine, and the exchange connector are all
//! out of scope for this crate — it consumes a supplier of well-typed
//! data. This module only defines the seam: the trait each one must
//! satisfy. Concrete adapters (a real exchange wire protocol, a real
//! indicator pipeline) live outside this crate; `MockDataEngine` /
//! `SimConnector` here exist only to make the core testable in isolation.

use async_trait::async_trait;
use rust_decimal::prelude::*;
use std::collections::HashMap;

use crate::money::SymbolRules;
use crate::signals::Signal;

#[derive(Debug, Clone)]
pub struct Ticker {
    pub price: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub mid: Option<Decimal>,
    pub last: Option<Decimal>,
    pub timestamp: i64,
    pub is_stale: bool,
    pub provenance_source: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Ohlcv {
    pub ts: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorName {
    Ema(u32),
    Adx(u32),
    Atr(u32),
    SmaAtr(u32),
}

#[async_trait]
pub trait DataEngine: Send + Sync {
    async fn get_ticker(&self, symbol: &str) -> anyhow::Result<Ticker>;
    async fn get_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> anyhow::Result<Vec<Ohlcv>>;
    async fn get_indicator(&self, symbol: &str, name: IndicatorName) -> anyhow::Result<Option<f64>>;
}

#[async_trait]
pub trait SignalEngine: Send + Sync {
    async fn composite_signal(&self, symbol: &str) -> anyhow::Result<Signal>;
}

/// Flat, always-neutral `SignalEngine` (composite score 0, no conviction).
/// Every real deployment supplies its own strategy stack; this exists only
/// so `main.rs` has something to compose the orchestrator against when no
/// strategy crate is wired in, the same way a stub adapter stands in for a
/// real one before credentials are configured.
#[derive(Default)]
pub struct NullSignalEngine;

#[async_trait]
impl SignalEngine for NullSignalEngine {
    async fn composite_signal(&self, symbol: &str) -> anyhow::Result<Signal> {
        Ok(Signal { symbol: symbol.to_string(), composite_score: 0.0, confidence: 0.0, per_strategy: HashMap::new() })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FeeInfo {
    pub maker_fee_bps: Decimal,
    pub taker_fee_bps: Decimal,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn get_fee_info(&self, symbol: &str) -> anyhow::Result<FeeInfo>;
    async fn get_supported_order_types(&self) -> anyhow::Result<Vec<String>>;
    async fn get_symbol_rules(&self, symbol: &str) -> anyhow::Result<SymbolRules>;
}

// ---------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct MockDataEngine {
    pub tickers: HashMap<String, Ticker>,
    pub indicators: HashMap<(String, IndicatorName), f64>,
}

#[async_trait]
impl DataEngine for MockDataEngine {
    async fn get_ticker(&self, symbol: &str) -> anyhow::Result<Ticker> {
        self.tickers
            .get(symbol)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no ticker for {symbol}"))
    }

    async fn get_ohlcv(&self, _symbol: &str, _timeframe: &str, _limit: usize) -> anyhow::Result<Vec<Ohlcv>> {
        Ok(Vec::new())
    }

    async fn get_indicator(&self, symbol: &str, name: IndicatorName) -> anyhow::Result<Option<f64>> {
        Ok(self.indicators.get(&(symbol.to_string(), name)).copied())
    }
}

#[derive(Default)]
pub struct SimConnector {
    pub fee: FeeInfo,
    pub supported: Vec<String>,
    pub rules: HashMap<String, SymbolRules>,
}

impl Default for FeeInfo {
    fn default() -> Self {
        Self { maker_fee_bps: Decimal::new(2, 0), taker_fee_bps: Decimal::new(7, 0) }
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn get_fee_info(&self, _symbol: &str) -> anyhow::Result<FeeInfo> {
        Ok(self.fee)
    }

    async fn get_supported_order_types(&self) -> anyhow::Result<Vec<String>> {
        Ok(if self.supported.is_empty() {
            vec!["market".into(), "limit".into(), "stop".into(), "stop_limit".into(), "take_profit".into(), "take_profit_limit".into()]
        } else {
            self.supported.clone()
        })
    }

    async fn get_symbol_rules(&self, symbol: &str) -> anyhow::Result<SymbolRules> {
        Ok(self.rules.get(symbol).copied().unwrap_or_default())
    }
}
