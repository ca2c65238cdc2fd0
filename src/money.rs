//! Fixed-precision decimal money.
//!
//! A 28-digit `Decimal` context, half-up currency rounding, floor rounding
//! for quantities, and a per-asset precision table loaded once at startup.

use rust_decimal::prelude::*;
use rust_decimal::RoundingStrategy;
use std::collections::HashMap;

pub type Px = Decimal;
pub type Qty = Decimal;

/// Per-symbol exchange rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolRules {
    pub price_tick: Decimal,
    pub qty_step: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
    pub supports_short: bool,
    pub allow_short: bool,
}

impl Default for SymbolRules {
    fn default() -> Self {
        Self {
            price_tick: dec(1, 2),
            qty_step: dec(1, 3),
            min_qty: dec(1, 3),
            min_notional: Decimal::new(10, 0),
            supports_short: false,
            allow_short: false,
        }
    }
}

/// `mantissa * 10^-scale`, a small helper for readable literals.
pub fn dec(mantissa: i64, scale: u32) -> Decimal {
    Decimal::new(mantissa, scale)
}

/// Immutable precision table, keyed by canonical symbol.
#[derive(Debug, Clone, Default)]
pub struct PrecisionTable {
    rules: HashMap<String, SymbolRules>,
}

impl PrecisionTable {
    pub fn new(rules: HashMap<String, SymbolRules>) -> Self {
        Self { rules }
    }

    pub fn get(&self, symbol: &str) -> SymbolRules {
        self.rules.get(symbol).copied().unwrap_or_default()
    }
}

/// Round a price to the nearest tick (half-up).
pub fn round_price_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let steps = (price / tick).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    steps * tick
}

/// Round a quantity down to the step size (conservative).
pub fn round_qty_down(qty: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return qty;
    }
    let steps = (qty / step).trunc();
    steps * step
}

/// Quantize a currency amount to 2dp, half-up (USD-like quote assets).
pub fn quantize_currency(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub fn notional(qty: Decimal, price: Decimal) -> Decimal {
    qty.abs() * price
}

pub fn calculate_fees(notional: Decimal, fee_rate: Decimal) -> Decimal {
    notional * fee_rate
}

pub fn calculate_pnl(qty: Decimal, entry_price: Decimal, current_price: Decimal) -> Decimal {
    qty * (current_price - entry_price)
}

/// Idempotent: `quantize_again(quantize(x)) == quantize(x)`.
pub fn safe_divide(numerator: Decimal, denominator: Decimal, default: Decimal) -> Decimal {
    if denominator.is_zero() {
        default
    } else {
        numerator / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_price_half_up() {
        let tick = dec(1, 2); // 0.01
        // 12.345 -> nearest 0.01, half-up -> 12.35
        assert_eq!(round_price_to_tick(dec(12345, 3), tick), dec(1235, 2));
    }

    #[test]
    fn round_qty_never_increases() {
        let step = dec(1, 3);
        let q = dec(1234567, 6); // 1.234567
        let rounded = round_qty_down(q, step);
        assert!(rounded <= q);
        assert_eq!(rounded, dec(1234, 3));
    }

    #[test]
    fn quantize_is_idempotent() {
        let tick = dec(1, 2);
        let p = dec(123456, 4); // 12.3456
        let once = round_price_to_tick(p, tick);
        let twice = round_price_to_tick(once, tick);
        assert_eq!(once, twice);

        let step = dec(1, 3);
        let q = dec(1234567, 6);
        let once_q = round_qty_down(q, step);
        let twice_q = round_qty_down(once_q, step);
        assert_eq!(once_q, twice_q);
    }

    #[test]
    fn notional_is_qty_times_price() {
        assert_eq!(notional(dec(2, 0), dec(5, 0)), Decimal::new(10, 0));
    }
}
