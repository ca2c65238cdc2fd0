//! Error taxonomy: kinds, not ad-hoc strings.
//!
//! `RejectReason` is the machine-readable code attached to a skipped/rejected
//! candidate and surfaces verbatim in a `DecisionTrace` record. `EngineError`
//! is the cycle-level failure taxonomy; only `PricingContext` and `FatalInit`
//! abort outright, everything else is recovered locally by the caller.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    PriceOutOfRange,
    MinNotional,
    PrecisionFail,
    BudgetExhausted,
    NoAtrNoFallback,
    RrTooLow,
    InvalidStopDistance,
    ShortNotAllowed,
    DailyLossLimitHalt,
    RegimeUnknown,
    BelowGateThreshold,
    Overflow,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::PriceOutOfRange => "price_out_of_range",
            RejectReason::MinNotional => "min_notional",
            RejectReason::PrecisionFail => "precision_fail",
            RejectReason::BudgetExhausted => "budget_exhausted",
            RejectReason::NoAtrNoFallback => "no_atr_no_fallback",
            RejectReason::RrTooLow => "rr_too_low",
            RejectReason::InvalidStopDistance => "invalid_stop_distance",
            RejectReason::ShortNotAllowed => "short_not_allowed",
            RejectReason::DailyLossLimitHalt => "daily_loss_limit_halt",
            RejectReason::RegimeUnknown => "regime_unknown",
            RejectReason::BelowGateThreshold => "below_gate_threshold",
            RejectReason::Overflow => "overflow",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("pricing context error: {0}")]
    PricingContext(String),

    #[error("data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    #[error("preflight rejected: {0:?}")]
    PreflightRejected(RejectReason),

    #[error("precision failure building order for {symbol}")]
    PrecisionFail { symbol: String },

    #[error("order notional below minimum for {symbol}")]
    MinNotional { symbol: String },

    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("daily loss limit halt active for session {0}")]
    DailyLossLimit(String),

    #[error("fatal initialization error: {0}")]
    FatalInit(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
