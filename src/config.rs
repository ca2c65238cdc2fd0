//! Validated engine configuration.
//!
//! Parsing a config *file* is out of scope — the core only ever receives an
//! already-validated `EngineConfig`. `from_env` is provided for
//! local/manual runs, but any caller (a CLI, a test) may build one directly
//! and run it through `validate()`.

use crate::money::{PrecisionTable, SymbolRules};
use rust_decimal::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    pub timeframe: String,
    pub initial_capital: Decimal,
    pub cycle_interval_secs: u64,
    pub live_mode: bool,
    pub dry_run: bool,
    pub primary_strategy: String,
    pub max_open_trades: usize,
}

#[derive(Debug, Clone)]
pub struct SizingConfig {
    pub risk_per_trade_pct: Decimal,
    pub per_symbol_cap_pct: Decimal,
    pub session_cap_pct: Decimal,
    pub pilot_multiplier: Decimal,
}

#[derive(Debug, Clone)]
pub struct SlTpConfig {
    pub atr_k_sl: Decimal,
    pub atr_m_tp: Decimal,
    pub enable_fallback: bool,
    pub fallback_sl_pct: Decimal,
    pub fallback_tp_pct: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct TpLadderLevel {
    pub profit_pct: Decimal,
    pub pct_of_position: Decimal,
}

#[derive(Debug, Clone)]
pub struct ExitsConfig {
    pub tp_ladders: Vec<TpLadderLevel>,
    pub time_stop_hours: i64,
    pub min_qty: Decimal,
    pub enable_chandelier: bool,
    pub chandelier_n_atr: Decimal,
}

#[derive(Debug, Clone)]
pub struct EntryGateConfig {
    pub enable_top_k: bool,
    pub top_k_entries: usize,
    pub hard_floor_min: Decimal,
    pub gate_margin: Decimal,
    pub volatility_easing: bool,
}

#[derive(Debug, Clone)]
pub struct RiskOnTrigger {
    pub atr_period: usize,
    pub atr_sma_period: usize,
    pub atr_over_sma: Decimal,
}

#[derive(Debug, Clone)]
pub struct RiskOnConfig {
    pub enabled: bool,
    pub trigger: RiskOnTrigger,
    pub window_cycles: u32,
    pub min_gate_floor: Decimal,
    pub risk_per_trade_pct: Decimal,
}

#[derive(Debug, Clone)]
pub struct ExplorationConfig {
    pub enabled: bool,
    pub budget_pct_per_day: Decimal,
    pub min_score: Decimal,
    pub max_forced_per_day: u32,
    pub size_mult_vs_normal: Decimal,
    pub tighter_stop_mult: Decimal,
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub rr_min: Decimal,
    pub min_stop_frac: Decimal,
    pub short_enabled: bool,
    pub sizing: SizingConfig,
    pub sl_tp: SlTpConfig,
    pub exits: ExitsConfig,
    pub entry_gate: EntryGateConfig,
    pub risk_on: RiskOnConfig,
    pub exploration: ExplorationConfig,
    pub rr_relax_for_pilot: Decimal,
    pub daily_loss_limit_pct: Decimal,
    pub pilot_gate: Decimal,
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub slippage_bps: Decimal,
    pub maker_fee_bps: Decimal,
    pub taker_fee_bps: Decimal,
    pub min_slice_notional: Decimal,
    pub default_slice_notional: Decimal,
    pub max_slices_per_order: usize,
    pub per_symbol_cap_pct: Decimal,
    pub session_cap_pct: Decimal,
    pub calls_per_second: f64,
    pub burst_size: u32,
    pub max_order_retries: u32,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub trading: TradingConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub precision: PrecisionTable,
}

impl EngineConfig {
    /// Validate cross-field invariants the core relies on. Returns a
    /// `FatalInit`-style error description on failure — config validation
    /// failures are startup errors that keep the process out of the cycle
    /// loop entirely.
    pub fn validate(self) -> Result<Self, String> {
        if self.trading.symbols.is_empty() {
            return Err("trading.symbols must not be empty".into());
        }
        if self.trading.initial_capital <= Decimal::ZERO {
            return Err("trading.initial_capital must be positive".into());
        }
        if self.risk.rr_min <= Decimal::ZERO {
            return Err("risk.rr_min must be positive".into());
        }
        if self.risk.min_stop_frac <= Decimal::ZERO {
            return Err("risk.min_stop_frac must be positive".into());
        }
        if self.execution.max_slices_per_order == 0 {
            return Err("execution.max_slices_per_order must be >= 1".into());
        }
        Ok(self)
    }

    /// Defaults for the regime, sizing, and exits parameters.
    pub fn from_env() -> Self {
        let symbols = std::env::var("SYMBOLS")
            .ok()
            .map(|s| s.split(',').map(|x| x.trim().to_string()).collect())
            .unwrap_or_else(|| vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()]);

        EngineConfig {
            trading: TradingConfig {
                symbols,
                timeframe: std::env::var("TIMEFRAME").unwrap_or_else(|_| "1h".to_string()),
                initial_capital: Decimal::new(10_000, 0),
                cycle_interval_secs: std::env::var("CYCLE_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
                live_mode: std::env::var("LIVE_MODE")
                    .map(|v| matches!(v.as_str(), "1" | "true"))
                    .unwrap_or(false),
                dry_run: std::env::var("DRY_RUN")
                    .map(|v| matches!(v.as_str(), "1" | "true"))
                    .unwrap_or(true),
                primary_strategy: std::env::var("PRIMARY_STRATEGY")
                    .unwrap_or_else(|_| "composite".to_string()),
                max_open_trades: std::env::var("MAX_OPEN_TRADES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            },
            risk: RiskConfig {
                rr_min: Decimal::new(12, 1),
                min_stop_frac: Decimal::new(1, 3),
                short_enabled: false,
                sizing: SizingConfig {
                    risk_per_trade_pct: Decimal::new(1, 2),
                    per_symbol_cap_pct: Decimal::new(20, 2),
                    session_cap_pct: Decimal::new(80, 2),
                    pilot_multiplier: Decimal::new(4, 1),
                },
                sl_tp: SlTpConfig {
                    atr_k_sl: Decimal::new(15, 1),
                    atr_m_tp: Decimal::new(3, 0),
                    enable_fallback: true,
                    fallback_sl_pct: Decimal::new(2, 2),
                    fallback_tp_pct: Decimal::new(4, 2),
                },
                exits: ExitsConfig {
                    tp_ladders: vec![
                        TpLadderLevel { profit_pct: Decimal::new(8, 3), pct_of_position: Decimal::new(5, 1) },
                        TpLadderLevel { profit_pct: Decimal::new(15, 3), pct_of_position: Decimal::new(5, 1) },
                    ],
                    time_stop_hours: 72,
                    min_qty: Decimal::new(1, 4),
                    enable_chandelier: false,
                    chandelier_n_atr: Decimal::new(3, 0),
                },
                entry_gate: EntryGateConfig {
                    enable_top_k: true,
                    top_k_entries: 3,
                    hard_floor_min: Decimal::new(30, 2),
                    gate_margin: Decimal::new(5, 2),
                    volatility_easing: true,
                },
                risk_on: RiskOnConfig {
                    enabled: true,
                    trigger: RiskOnTrigger {
                        atr_period: 14,
                        atr_sma_period: 100,
                        atr_over_sma: Decimal::new(115, 2),
                    },
                    window_cycles: 3,
                    min_gate_floor: Decimal::new(35, 2),
                    risk_per_trade_pct: Decimal::new(15, 3),
                },
                exploration: ExplorationConfig {
                    enabled: false,
                    budget_pct_per_day: Decimal::new(2, 2),
                    min_score: Decimal::new(25, 2),
                    max_forced_per_day: 1,
                    size_mult_vs_normal: Decimal::new(5, 1),
                    tighter_stop_mult: Decimal::new(7, 1),
                },
                rr_relax_for_pilot: Decimal::new(11, 1),
                daily_loss_limit_pct: Decimal::new(5, 2),
                pilot_gate: Decimal::new(4, 1),
            },
            execution: ExecutionConfig {
                slippage_bps: Decimal::new(5, 0),
                maker_fee_bps: Decimal::new(2, 0),
                taker_fee_bps: Decimal::new(7, 0),
                min_slice_notional: Decimal::new(10, 0),
                default_slice_notional: Decimal::new(500, 0),
                max_slices_per_order: 5,
                per_symbol_cap_pct: Decimal::new(20, 2),
                session_cap_pct: Decimal::new(80, 2),
                calls_per_second: 10.0,
                burst_size: 20,
                max_order_retries: 1,
            },
            precision: PrecisionTable::new(HashMap::new()),
        }
    }

    pub fn symbol_rules(&self, symbol: &str) -> SymbolRules {
        self.precision.get(symbol)
    }
}
