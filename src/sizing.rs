//! Position sizing and slicing: a bag of pure functions taking an explicit
//! `equity`/`risk` rather than reading a global, over the risk-dollar
//! sizing formula.

use rust_decimal::prelude::*;

#[derive(Debug, Clone, Copy)]
pub struct SizingInputs {
    pub equity: Decimal,
    pub risk_per_trade_pct: Decimal,
    pub stop_frac: Decimal,
    pub per_symbol_cap_pct: Decimal,
    pub session_cap_pct: Decimal,
    pub deployed_capital: Decimal,
}

/// `risk_dollars / stop_frac`, capped by the per-symbol cap and by the
/// remaining session budget. Never negative.
pub fn target_notional(inputs: &SizingInputs) -> Decimal {
    let risk_dollars = inputs.equity * inputs.risk_per_trade_pct;
    let raw = risk_dollars / inputs.stop_frac;

    let per_symbol_cap = inputs.per_symbol_cap_pct * inputs.equity;
    let session_remaining = (inputs.session_cap_pct * inputs.equity - inputs.deployed_capital).max(Decimal::ZERO);

    raw.min(per_symbol_cap).min(session_remaining).max(Decimal::ZERO)
}

#[derive(Debug, Clone, Copy)]
pub struct SlicingParams {
    pub default_slice_notional: Decimal,
    pub min_slice_notional: Decimal,
    pub max_slices_per_order: usize,
}

/// Splits `target` into at most `max_slices_per_order` notional-sized
/// slices; if the whole target is below `min_slice_notional`, a single
/// minimum-sized slice is returned instead.
pub fn plan_slices(target: Decimal, params: &SlicingParams) -> Vec<Decimal> {
    if target <= Decimal::ZERO {
        return Vec::new();
    }
    if target < params.min_slice_notional {
        return vec![params.min_slice_notional];
    }

    let raw_count = (target / params.default_slice_notional).ceil();
    let count = raw_count
        .to_usize()
        .unwrap_or(params.max_slices_per_order)
        .max(1)
        .min(params.max_slices_per_order);

    let mut slices = Vec::with_capacity(count);
    let mut remaining = target;
    for i in 0..count {
        if i == count - 1 {
            slices.push(remaining);
        } else {
            let slice = (target / Decimal::from(count)).max(params.min_slice_notional);
            let slice = slice.min(remaining);
            slices.push(slice);
            remaining -= slice;
        }
    }
    slices
}
