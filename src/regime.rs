//! Regime detector: EMA50/EMA200 + ADX(14) trend rule, a warmup gate, and
//! regime-specific score/RR floors. Also owns the volatility "risk-on"
//! trigger.

use crate::config::RiskOnTrigger;
use rust_decimal::prelude::ToPrimitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Trend,
    Range,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
pub struct RegimeFloors {
    pub min_score: f64,
    pub min_rr: f64,
}

impl Regime {
    pub fn floors(&self) -> RegimeFloors {
        match self {
            Regime::Trend => RegimeFloors { min_score: 0.50, min_rr: 1.4 },
            Regime::Range => RegimeFloors { min_score: 0.48, min_rr: 1.2 },
            Regime::Unknown => RegimeFloors { min_score: 0.60, min_rr: 1.5 },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Indicators {
    pub ema_fast: Option<f64>, // EMA(50)
    pub ema_slow: Option<f64>, // EMA(200)
    pub adx: Option<f64>,      // ADX(14)
    pub bars_available: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegimeReason {
    EmaFastGtSlowAndAdxGtThreshold,
    EmaFastLeSlow,
    AdxLeThreshold,
    InsufficientDataWarmup,
    MissingIndicators,
    InvalidIndicators,
}

pub const EMA_FAST_PERIOD: u32 = 50;
pub const EMA_SLOW_PERIOD: u32 = 200;
pub const ADX_PERIOD: u32 = 14;
pub const ADX_THRESHOLD: f64 = 20.0;

/// `detect` never panics on missing/invalid data; it degrades to `Unknown`
/// and reports why.
pub fn detect(indicators: &Indicators, atr_sma_period: usize) -> (Regime, RegimeReason) {
    let warmup_needed = EMA_SLOW_PERIOD.max(atr_sma_period as u32).max(ADX_PERIOD) as usize;
    if indicators.bars_available < warmup_needed.max(200) {
        return (Regime::Unknown, RegimeReason::InsufficientDataWarmup);
    }

    let (Some(fast), Some(slow), Some(adx)) = (indicators.ema_fast, indicators.ema_slow, indicators.adx) else {
        return (Regime::Unknown, RegimeReason::MissingIndicators);
    };

    if fast.is_nan() || slow.is_nan() || adx.is_nan() || fast <= 0.0 || slow <= 0.0 || adx < 0.0 {
        return (Regime::Unknown, RegimeReason::InvalidIndicators);
    }

    if fast > slow && adx > ADX_THRESHOLD {
        (Regime::Trend, RegimeReason::EmaFastGtSlowAndAdxGtThreshold)
    } else if fast <= slow {
        (Regime::Range, RegimeReason::EmaFastLeSlow)
    } else {
        (Regime::Range, RegimeReason::AdxLeThreshold)
    }
}

/// Risk-on trigger: `ATR(14) / SMA(ATR,100) >= threshold` opens a window of
/// `window_cycles` cycles during which the hard floor is lowered and
/// `risk_per_trade_pct` is overridden.
#[derive(Debug, Clone, Copy)]
pub struct RiskOnState {
    pub cycles_remaining: u32,
}

impl RiskOnState {
    pub fn inactive() -> Self {
        Self { cycles_remaining: 0 }
    }

    pub fn is_active(&self) -> bool {
        self.cycles_remaining > 0
    }

    /// Call once per cycle with the current ATR/SMA(ATR) ratio. Returns the
    /// updated state; the window re-arms to the full length on a fresh
    /// trigger even mid-window, and decrements by one otherwise.
    pub fn step(self, atr: f64, atr_sma: f64, trigger: &RiskOnTrigger, window_cycles: u32) -> Self {
        let threshold = trigger.atr_over_sma.to_f64().unwrap_or(1.15);
        let triggered = atr_sma > 0.0 && (atr / atr_sma) >= threshold;
        if triggered {
            Self { cycles_remaining: window_cycles }
        } else if self.cycles_remaining > 0 {
            Self { cycles_remaining: self.cycles_remaining - 1 }
        } else {
            self
        }
    }
}
