//! Decision trace emission.
//!
//! Every symbol evaluated in a cycle gets exactly one trace record, whether
//! or not it results in a trade, so a rejected entry is as auditable as a
//! filled one. Built atop `logging::json_log`, not a new sink.

use crate::logging::{json_log, obj, v_bool, v_num, v_str};
use rust_decimal::prelude::*;

/// I/O-boundary rounding: prices round to 4dp, scores to 4dp, sizes to 6dp.
/// Internal computation stays at full `Decimal` precision; only the
/// logged/serialized representation is truncated.
fn round_io(value: Decimal, places: u32) -> Decimal {
    value.round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero)
}

/// The action a cycle actually took on a symbol, independent of why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalAction {
    Buy,
    Sell,
    Hold,
    Skip,
}

impl FinalAction {
    fn as_str(&self) -> &'static str {
        match self {
            FinalAction::Buy => "BUY",
            FinalAction::Sell => "SELL",
            FinalAction::Hold => "HOLD",
            FinalAction::Skip => "SKIP",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecisionTrace {
    pub cycle_id: u64,
    pub symbol: String,
    pub regime: String,
    pub composite_score: f64,
    pub gate_floor: f64,
    pub passed_gate: bool,
    pub final_action: FinalAction,
    pub winning_subsignal: Option<String>,
    pub reject_reason: Option<String>,
    pub entry_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub size_qty: Option<Decimal>,
    pub rr: Option<f64>,
}

impl DecisionTrace {
    pub fn emit(&self) {
        let mut fields = vec![
            ("cycle_id", v_num(self.cycle_id as f64)),
            ("symbol", v_str(&self.symbol)),
            ("regime", v_str(&self.regime)),
            ("composite_score", v_num(round4(self.composite_score))),
            ("gate_floor", v_num(round4(self.gate_floor))),
            ("passed_gate", v_bool(self.passed_gate)),
            ("final_action", v_str(self.final_action.as_str())),
        ];
        if let Some(w) = &self.winning_subsignal {
            fields.push(("winning_subsignal", v_str(w)));
        }
        if let Some(r) = &self.reject_reason {
            fields.push(("reject_reason", v_str(r)));
        }
        if let Some(p) = self.entry_price {
            fields.push(("entry_price", v_str(&round_io(p, 4).to_string())));
        }
        if let Some(p) = self.stop_price {
            fields.push(("stop_price", v_str(&round_io(p, 4).to_string())));
        }
        if let Some(p) = self.take_profit {
            fields.push(("take_profit", v_str(&round_io(p, 4).to_string())));
        }
        if let Some(q) = self.size_qty {
            fields.push(("size_qty", v_str(&round_io(q, 6).to_string())));
        }
        if let Some(rr) = self.rr {
            fields.push(("rr", v_num(round4(rr))));
        }
        json_log("decision_trace", "SYMBOL_EVALUATED", obj(&fields));
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_io_is_half_up_at_declared_precision() {
        let p = Decimal::new(123456, 4); // 12.3456... actually exact
        assert_eq!(round_io(Decimal::new(1234565, 5), 4).to_string(), "12.3457");
        let _ = p;
    }

    #[test]
    fn emit_does_not_panic_on_minimal_trace() {
        let trace = DecisionTrace {
            cycle_id: 1,
            symbol: "BTC/USDT".into(),
            regime: "trend".into(),
            composite_score: 0.42,
            gate_floor: 0.30,
            passed_gate: true,
            final_action: FinalAction::Buy,
            winning_subsignal: Some("ema_cross".into()),
            reject_reason: None,
            entry_price: Some(Decimal::new(500001234, 2)),
            stop_price: None,
            take_profit: None,
            size_qty: None,
            rr: Some(1.8),
        };
        trace.emit();
    }
}
